//! Builder for configuring gateway instances

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::Gateway;
use crate::cache::{CacheClient, CacheConfig, ResponseCache};
use crate::health::{HealthConfig, HealthMonitor};
use crate::providers::{DEFAULT_STREAM_BUFFER, ProviderAdapter};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::switcher::{RetryConfig, Routing, Switcher, SwitcherParts, UsageSink};
use crate::types::ProviderId;
use crate::{HeimdallError, Result};

/// Main entry point for creating gateway instances.
pub struct Heimdall;

impl Heimdall {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> HeimdallBuilder {
        HeimdallBuilder::new()
    }
}

/// Builder for configuring gateway instances.
pub struct HeimdallBuilder {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    default_provider: Option<ProviderId>,
    fallback_provider: Option<ProviderId>,
    enabled: Option<Vec<ProviderId>>,
    rate_limits: HashMap<ProviderId, RateLimitConfig>,
    rate_limiting: bool,
    retry: RetryConfig,
    cache: CacheConfig,
    cache_client: Option<Arc<dyn CacheClient>>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    health: HealthConfig,
    stream_buffer: usize,
}

impl Default for HeimdallBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeimdallBuilder {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            default_provider: None,
            fallback_provider: None,
            enabled: None,
            rate_limits: HashMap::new(),
            rate_limiting: true,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            cache_client: None,
            usage_sink: None,
            health: HealthConfig::default(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Register the adapter that serves `adapter.id()`. A later adapter for
    /// the same provider replaces the earlier one.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.id(), adapter);
        self
    }

    /// Active provider at startup (default: first enabled provider).
    pub fn default_provider(mut self, provider: ProviderId) -> Self {
        self.default_provider = Some(provider);
        self
    }

    pub fn fallback_provider(mut self, provider: ProviderId) -> Self {
        self.fallback_provider = Some(provider);
        self
    }

    /// Restrict routing to these providers (default: every registered
    /// adapter, in `ProviderId` order).
    pub fn enabled_providers(mut self, providers: impl IntoIterator<Item = ProviderId>) -> Self {
        self.enabled = Some(providers.into_iter().collect());
        self
    }

    /// Override the built-in rate limit for one provider.
    pub fn rate_limit(mut self, provider: ProviderId, config: RateLimitConfig) -> Self {
        self.rate_limits.insert(provider, config);
        self
    }

    /// Turn local rate limiting off entirely.
    pub fn disable_rate_limiting(mut self) -> Self {
        self.rate_limiting = false;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Shorthand for the per-attempt deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.retry.attempt_timeout = timeout;
        self
    }

    pub fn response_cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Shared cache tier in front of the in-process one.
    pub fn cache_client(mut self, client: Arc<dyn CacheClient>) -> Self {
        self.cache_client = Some(client);
        self
    }

    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn health(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    /// Chunks buffered per stream (see
    /// [`bounded_stream`](crate::providers::bounded_stream)).
    pub fn stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size.max(1);
        self
    }

    /// Apply every setting a [`Config`](crate::Config) carries. Adapters
    /// that can be built from configuration alone (Ollama) are registered
    /// too; cloud adapters must still be added with [`adapter`](Self::adapter).
    #[cfg(feature = "config")]
    pub fn from_config(config: &crate::Config) -> Result<Self> {
        config.validate()?;
        let mut builder = Self::new()
            .retry(config.retry_config())
            .health(config.health_config())
            .response_cache(config.cache_config())
            .enabled_providers(config.enabled());
        builder.rate_limits = config.rate_limits()?;
        builder.default_provider = config.default_provider;
        builder.fallback_provider = config.fallback_provider;

        #[cfg(feature = "ollama")]
        if config.enabled().contains(&ProviderId::Ollama) {
            let section = config.provider(ProviderId::Ollama);
            let mut ollama = crate::providers::OllamaAdapter::with_base_url(
                section
                    .and_then(|s| s.base_url.clone())
                    .unwrap_or_else(|| crate::providers::ollama::DEFAULT_BASE_URL.to_string()),
            );
            if let Some(model) = section.and_then(|s| s.model.clone()) {
                ollama = ollama.default_model(model);
            }
            if let Some(secs) = section.and_then(|s| s.timeout_secs) {
                ollama = ollama.timeout(Duration::from_secs(secs));
            }
            if let Some(key) = config.api_key(ProviderId::Ollama) {
                ollama = ollama.api_key(key);
            }
            builder = builder.adapter(Arc::new(ollama));
        }

        Ok(builder)
    }

    /// Build the gateway.
    ///
    /// Fails if no adapter is registered, or if an enabled, default or
    /// fallback provider has no adapter.
    pub fn build(self) -> Result<Gateway> {
        if self.adapters.is_empty() {
            return Err(HeimdallError::InvalidConfiguration(
                "No providers configured. Register at least one adapter.".to_string(),
            ));
        }

        let enabled = match self.enabled {
            Some(list) => {
                let mut out: Vec<ProviderId> = Vec::with_capacity(list.len());
                for p in list {
                    if !out.contains(&p) {
                        out.push(p);
                    }
                }
                out
            }
            None => {
                let mut ids: Vec<ProviderId> = self.adapters.keys().copied().collect();
                ids.sort();
                ids
            }
        };
        for p in &enabled {
            if !self.adapters.contains_key(p) {
                return Err(HeimdallError::InvalidConfiguration(format!(
                    "provider {p} is enabled but has no adapter"
                )));
            }
        }

        let current = match self.default_provider {
            Some(p) => p,
            None => *enabled.first().ok_or_else(|| {
                HeimdallError::InvalidConfiguration("enabled provider set is empty".to_string())
            })?,
        };
        for (role, p) in [("default", Some(current)), ("fallback", self.fallback_provider)] {
            if let Some(p) = p
                && !enabled.contains(&p)
            {
                return Err(HeimdallError::InvalidConfiguration(format!(
                    "{role} provider {p} is not enabled"
                )));
            }
        }

        self.health.validate()?;

        for (p, limit) in &self.rate_limits {
            limit.validate().map_err(|e| {
                HeimdallError::InvalidConfiguration(format!("rate limit for {p}: {e}"))
            })?;
        }
        let rate_limiter = Arc::new(RateLimiter::with_configs(self.rate_limits));

        let cache = ResponseCache::new(&self.cache);
        cache.set_client(self.cache_client);

        let switcher = Switcher::new(SwitcherParts {
            adapters: self.adapters.clone(),
            routing: Routing {
                current,
                fallback: self.fallback_provider,
                enabled,
            },
            retry: self.retry,
            cache,
            rate_limiter: self.rate_limiting.then(|| Arc::clone(&rate_limiter)),
            usage_sink: self.usage_sink,
            health_check_timeout: self.health.check_timeout,
            stream_buffer: self.stream_buffer,
        });
        let health = HealthMonitor::new(self.adapters, self.health);

        Ok(Gateway::new(Arc::new(switcher), rate_limiter, Arc::new(health)))
    }
}
