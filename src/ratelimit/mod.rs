//! Per-provider token-bucket admission control.
//!
//! [`RateLimiter`] owns one bucket per [`ProviderId`], created lazily on
//! first access. Refill, debit and statistics for a provider happen in a
//! single critical section guarded by that provider's own mutex, so two
//! concurrent callers can never both spend the last token and unrelated
//! providers never contend.
//!
//! ```text
//! acquire(openai)
//!     │
//!     ├── disabled? ─────────────► allowed (no debit)
//!     ├── refill, tokens >= cost ─► debit, allowed
//!     ├── wait = false ───────────► RateLimitExceeded { retry_after }
//!     └── wait = true ────────────► sleep(deficit / rate), re-check
//!                                   until max_wait is exhausted
//! ```

mod bucket;

pub use bucket::RateLimitConfig;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;
use crate::types::ProviderId;
use crate::{HeimdallError, Result};

use bucket::TokenBucket;

/// Admission counters for one provider.
///
/// `requests == allowed + rejected` holds at every observation point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub requests: u64,
    pub allowed: u64,
    pub rejected: u64,
}

/// Snapshot of one provider's limiter state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub provider: ProviderId,
    pub enabled: bool,
    pub available_tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub tokens_per_request: f64,
}

#[derive(Debug)]
struct ProviderLimiter {
    config: RateLimitConfig,
    bucket: TokenBucket,
    stats: LimiterStats,
}

impl ProviderLimiter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: TokenBucket::full(&config),
            config,
            stats: LimiterStats::default(),
        }
    }

    fn record(&mut self, provider: ProviderId, allowed: bool) {
        self.stats.requests += 1;
        let decision = if allowed {
            self.stats.allowed += 1;
            "allowed"
        } else {
            self.stats.rejected += 1;
            "rejected"
        };
        metrics::counter!(telemetry::RATE_LIMIT_DECISIONS_TOTAL,
            "provider" => provider.as_str(),
            "decision" => decision,
        )
        .increment(1);
    }
}

/// Outcome of one locked admission attempt.
enum Attempt {
    Allowed,
    /// Not yet admitted; re-check after this many seconds.
    Pending(f64),
}

/// Token-bucket rate limiter keyed by provider.
pub struct RateLimiter {
    limiters: RwLock<HashMap<ProviderId, Arc<Mutex<ProviderLimiter>>>>,
    /// Configs applied when a provider's bucket is first created.
    initial: HashMap<ProviderId, RateLimitConfig>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Limiter using [`RateLimitConfig::default_for`] for every provider.
    pub fn new() -> Self {
        Self::with_configs(HashMap::new())
    }

    /// Limiter with explicit per-provider configs; unlisted providers use
    /// their defaults.
    pub fn with_configs(configs: HashMap<ProviderId, RateLimitConfig>) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            initial: configs,
        }
    }

    /// Acquire `cost` tokens (default: the provider's `tokens_per_request`).
    ///
    /// With `wait = false` a shortfall fails immediately with
    /// [`HeimdallError::RateLimitExceeded`]. With `wait = true` the call
    /// sleeps for the deficit and re-checks, giving up once `max_wait`
    /// would be exceeded.
    pub async fn acquire(
        &self,
        provider: ProviderId,
        cost: Option<f64>,
        wait: bool,
        max_wait: Duration,
    ) -> Result<()> {
        let limiter = self.limiter(provider)?;
        // Inner `None`: `max_wait` runs past the clock's range, wait without bound.
        let deadline = wait.then(|| Instant::now().checked_add(max_wait));
        loop {
            let remaining = deadline.map(|d| {
                d.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
            });
            match Self::attempt(&limiter, provider, cost, remaining)? {
                Attempt::Allowed => return Ok(()),
                Attempt::Pending(secs) => {
                    debug!(provider = %provider, wait_secs = secs, "waiting for rate limit tokens");
                    // Floor keeps float rounding from spinning on a zero sleep.
                    let nap = Duration::try_from_secs_f64(secs)
                        .unwrap_or(Duration::MAX)
                        .max(Duration::from_millis(1));
                    tokio::time::sleep(nap).await;
                }
            }
        }
    }

    /// Non-waiting acquire.
    pub fn try_acquire(&self, provider: ProviderId, cost: Option<f64>) -> Result<()> {
        let limiter = self.limiter(provider)?;
        match Self::attempt(&limiter, provider, cost, None)? {
            Attempt::Allowed => Ok(()),
            // Unreachable without a wait budget; treat as rejection.
            Attempt::Pending(secs) => Err(HeimdallError::RateLimitExceeded {
                provider,
                retry_after: secs,
            }),
        }
    }

    /// Whether `cost` tokens are available right now. Never consumes.
    pub fn check_available(&self, provider: ProviderId, cost: Option<f64>) -> Result<bool> {
        Ok(self.get_wait_time(provider, cost)? == 0.0)
    }

    /// Seconds until `cost` tokens are available: 0 when available now,
    /// `f64::INFINITY` when they never will be. Never consumes.
    pub fn get_wait_time(&self, provider: ProviderId, cost: Option<f64>) -> Result<f64> {
        let limiter = self.limiter(provider)?;
        let mut guard = lock(&limiter)?;
        if !guard.config.enabled {
            return Ok(0.0);
        }
        let cost = cost.unwrap_or(guard.config.tokens_per_request);
        let config = guard.config;
        guard.bucket.refill(&config, Instant::now());
        Ok(guard.bucket.wait_time(&config, cost))
    }

    /// Replace a provider's config and reset its bucket to full.
    /// Statistics are kept.
    pub fn configure_provider(&self, provider: ProviderId, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        let limiter = self.limiter(provider)?;
        let mut guard = lock(&limiter)?;
        guard.config = config;
        guard.bucket = TokenBucket::full(&config);
        debug!(provider = %provider, ?config, "rate limit reconfigured");
        Ok(())
    }

    /// Toggle limiting for a provider without touching its other settings.
    pub fn enable_provider(&self, provider: ProviderId, enabled: bool) -> Result<()> {
        let limiter = self.limiter(provider)?;
        lock(&limiter)?.config.enabled = enabled;
        Ok(())
    }

    pub fn get_config(&self, provider: ProviderId) -> Result<RateLimitConfig> {
        let limiter = self.limiter(provider)?;
        Ok(lock(&limiter)?.config)
    }

    pub fn get_status(&self, provider: ProviderId) -> Result<RateLimitStatus> {
        let limiter = self.limiter(provider)?;
        let mut guard = lock(&limiter)?;
        let config = guard.config;
        guard.bucket.refill(&config, Instant::now());
        Ok(RateLimitStatus {
            provider,
            enabled: config.enabled,
            available_tokens: guard.bucket.tokens(),
            max_tokens: config.max_tokens,
            refill_rate: config.refill_rate,
            tokens_per_request: config.tokens_per_request,
        })
    }

    /// Status of every provider.
    pub fn get_all_status(&self) -> Result<Vec<RateLimitStatus>> {
        ProviderId::ALL
            .into_iter()
            .map(|p| self.get_status(p))
            .collect()
    }

    pub fn get_statistics(&self, provider: ProviderId) -> Result<LimiterStats> {
        let limiter = self.limiter(provider)?;
        Ok(lock(&limiter)?.stats)
    }

    /// Statistics of every provider that has a bucket.
    pub fn get_all_statistics(&self) -> Result<HashMap<ProviderId, LimiterStats>> {
        let limiters = self.snapshot()?;
        limiters
            .into_iter()
            .map(|(p, l)| Ok((p, lock(&l)?.stats)))
            .collect()
    }

    /// Zero the counters of one provider, or of all when `None`.
    pub fn reset_statistics(&self, provider: Option<ProviderId>) -> Result<()> {
        match provider {
            Some(p) => {
                let limiter = self.limiter(p)?;
                lock(&limiter)?.stats = LimiterStats::default();
            }
            None => {
                for (_, limiter) in self.snapshot()? {
                    lock(&limiter)?.stats = LimiterStats::default();
                }
            }
        }
        Ok(())
    }

    /// Restore a provider's bucket to full capacity.
    pub fn reset_bucket(&self, provider: ProviderId) -> Result<()> {
        let limiter = self.limiter(provider)?;
        let mut guard = lock(&limiter)?;
        guard.bucket = TokenBucket::full(&guard.config);
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// One refill-check-debit step under the provider's lock.
    ///
    /// `remaining` is the wait budget left (`None` = non-waiting). A final
    /// decision (allowed, or rejected because the deficit exceeds the
    /// budget) is counted in the same critical section.
    fn attempt(
        limiter: &Mutex<ProviderLimiter>,
        provider: ProviderId,
        cost: Option<f64>,
        remaining: Option<Duration>,
    ) -> Result<Attempt> {
        let mut guard = lock(limiter)?;
        let config = guard.config;
        if !config.enabled {
            guard.record(provider, true);
            return Ok(Attempt::Allowed);
        }

        let cost = cost.unwrap_or(config.tokens_per_request);
        if !cost.is_finite() || cost <= 0.0 {
            return Err(HeimdallError::InvalidRequest(format!(
                "token cost must be > 0, got {cost}"
            )));
        }

        guard.bucket.refill(&config, Instant::now());
        if guard.bucket.try_take(cost) {
            guard.record(provider, true);
            return Ok(Attempt::Allowed);
        }

        let retry_after = guard.bucket.wait_time(&config, cost);
        match remaining {
            Some(budget) if retry_after <= budget.as_secs_f64() => Ok(Attempt::Pending(retry_after)),
            _ => {
                guard.record(provider, false);
                Err(HeimdallError::RateLimitExceeded {
                    provider,
                    retry_after,
                })
            }
        }
    }

    /// Get or lazily create a provider's limiter (double-checked locking).
    fn limiter(&self, provider: ProviderId) -> Result<Arc<Mutex<ProviderLimiter>>> {
        {
            let limiters = self.limiters.read().map_err(|e| {
                HeimdallError::InvalidConfiguration(format!("Failed to acquire read lock: {e}"))
            })?;
            if let Some(limiter) = limiters.get(&provider) {
                return Ok(Arc::clone(limiter));
            }
        }

        let mut limiters = self.limiters.write().map_err(|e| {
            HeimdallError::InvalidConfiguration(format!("Failed to acquire write lock: {e}"))
        })?;
        let limiter = limiters.entry(provider).or_insert_with(|| {
            let config = self
                .initial
                .get(&provider)
                .copied()
                .unwrap_or_else(|| RateLimitConfig::default_for(provider));
            Arc::new(Mutex::new(ProviderLimiter::new(config)))
        });
        Ok(Arc::clone(limiter))
    }

    fn snapshot(&self) -> Result<Vec<(ProviderId, Arc<Mutex<ProviderLimiter>>)>> {
        let limiters = self.limiters.read().map_err(|e| {
            HeimdallError::InvalidConfiguration(format!("Failed to acquire read lock: {e}"))
        })?;
        Ok(limiters
            .iter()
            .map(|(p, l)| (*p, Arc::clone(l)))
            .collect())
    }
}

fn lock(limiter: &Mutex<ProviderLimiter>) -> Result<std::sync::MutexGuard<'_, ProviderLimiter>> {
    limiter.lock().map_err(|e| {
        HeimdallError::InvalidConfiguration(format!("Failed to acquire bucket lock: {e}"))
    })
}
