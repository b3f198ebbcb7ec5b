//! Response cache for generation requests.
//!
//! Two tiers share one key space:
//!
//! ```text
//! get:  remote (if configured) ──miss/error──► local (moka) ──miss──► None
//! put:  remote (best effort) + local
//! ```
//!
//! Keys are `heimdall:response:<sha256>` where the digest covers a
//! canonical (sorted-key JSON) rendering of prompt, provider, model,
//! system prompt, tenant, temperature, max_tokens and top_p. Values are
//! serialized [`GenerateResponse`]s; a hit comes back with `cached = true`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::remote::CacheClient;
use crate::telemetry;
use crate::types::{GenerateRequest, GenerateResponse, ProviderId};

/// Namespace shared by every response cache key.
pub const KEY_PREFIX: &str = "heimdall:response:";

/// Configuration for the response cache.
///
/// ```rust
/// # use heimdall::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600));
/// assert!(config.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Global switch. Default: on.
    pub enabled: bool,
    /// Local tier capacity. Default: 10,000.
    pub max_entries: u64,
    /// Fixed time-to-live for every entry. Default: 1 hour.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Two-tier TTL cache of generation responses.
pub struct ResponseCache {
    local: Cache<String, String>,
    remote: RwLock<Option<Arc<dyn CacheClient>>>,
    enabled: AtomicBool,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let local = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();
        Self {
            local,
            remote: RwLock::new(None),
            enabled: AtomicBool::new(config.enabled),
            ttl: config.ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Install or remove the shared tier.
    pub fn set_client(&self, client: Option<Arc<dyn CacheClient>>) {
        match self.remote.write() {
            Ok(mut guard) => *guard = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
    }

    pub fn has_client(&self) -> bool {
        self.client().is_some()
    }

    fn client(&self) -> Option<Arc<dyn CacheClient>> {
        match self.remote.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Look up a response, remote tier first.
    pub async fn get(&self, key: &str) -> Option<GenerateResponse> {
        if let Some(client) = self.client() {
            match client.get(key).await {
                Ok(Some(raw)) => {
                    if let Some(hit) = decode(key, &raw) {
                        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "remote")
                            .increment(1);
                        return Some(hit);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "remote cache read failed, using local tier"),
            }
        }

        if let Some(raw) = self.local.get(key).await
            && let Some(hit) = decode(key, &raw)
        {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "local").increment(1);
            return Some(hit);
        }

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        None
    }

    /// Store a response in both tiers with the fixed TTL.
    pub async fn put(&self, key: &str, response: &GenerateResponse) {
        let mut stored = response.clone();
        stored.cached = false;
        let raw = match serde_json::to_string(&stored) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to serialize response for cache");
                return;
            }
        };

        if let Some(client) = self.client()
            && let Err(e) = client.set_ex(key, &raw, self.ttl).await
        {
            warn!(error = %e, "remote cache write failed, keeping local copy only");
        }
        self.local.insert(key.to_string(), raw).await;
        debug!(key, "response cached");
    }

    /// Drop every entry from both tiers.
    pub async fn clear(&self) {
        self.local.invalidate_all();
        if let Some(client) = self.client()
            && let Err(e) = client.clear_prefix(KEY_PREFIX).await
        {
            warn!(error = %e, "remote cache clear failed");
        }
    }

    /// Entries in the local tier (approximate, per moka).
    pub fn local_entry_count(&self) -> u64 {
        self.local.entry_count()
    }
}

fn decode(key: &str, raw: &str) -> Option<GenerateResponse> {
    match serde_json::from_str::<GenerateResponse>(raw) {
        Ok(mut response) => {
            response.cached = true;
            Some(response)
        }
        Err(e) => {
            warn!(key, error = %e, "discarding undecodable cache entry");
            None
        }
    }
}

/// Deterministic cache key for a request routed to `provider`.
pub fn cache_key(request: &GenerateRequest, provider: ProviderId) -> String {
    let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
    fields.insert("prompt", Value::from(request.prompt.as_str()));
    fields.insert("provider", Value::from(provider.as_str()));
    fields.insert("model", opt_str(request.model.as_deref()));
    fields.insert("system_prompt", opt_str(request.system_prompt.as_deref()));
    fields.insert("tenant", opt_str(request.tenant.as_deref()));
    fields.insert(
        "temperature",
        request
            .options
            .temperature
            .map(|t| Value::from(f64::from(t)))
            .unwrap_or(Value::Null),
    );
    fields.insert(
        "max_tokens",
        request
            .options
            .max_tokens
            .map(|n| Value::from(n as u64))
            .unwrap_or(Value::Null),
    );
    fields.insert(
        "top_p",
        request
            .options
            .top_p
            .map(|p| Value::from(f64::from(p)))
            .unwrap_or(Value::Null),
    );

    // BTreeMap serializes with sorted keys.
    let canonical = serde_json::to_string(&fields).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{KEY_PREFIX}{}", hex::encode(digest))
}

fn opt_str(value: Option<&str>) -> Value {
    value.map(Value::from).unwrap_or(Value::Null)
}
