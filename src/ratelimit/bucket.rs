//! Token bucket with lazy refill.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::ProviderId;
use crate::{HeimdallError, Result};

/// Per-provider rate limit settings.
///
/// ```rust
/// # use heimdall::RateLimitConfig;
/// let config = RateLimitConfig::new(60.0, 1.0).tokens_per_request(2.0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst capacity.
    pub max_tokens: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Cost of one call when the caller does not specify one.
    #[serde(default = "default_tokens_per_request")]
    pub tokens_per_request: f64,
    /// When false, every acquire succeeds without consuming tokens.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_tokens_per_request() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl RateLimitConfig {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            tokens_per_request: default_tokens_per_request(),
            enabled: true,
        }
    }

    /// Config that admits everything.
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            ..Self::new(0.0, 0.0)
        }
    }

    pub fn tokens_per_request(mut self, cost: f64) -> Self {
        self.tokens_per_request = cost;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Built-in limits: local runtimes are unlimited, cloud vendors get a
    /// conservative 60-request burst refilled at one per second.
    pub fn default_for(provider: ProviderId) -> Self {
        match provider {
            ProviderId::Ollama => Self::unlimited(),
            ProviderId::Qwen => Self::new(30.0, 0.5),
            ProviderId::OpenAi | ProviderId::Anthropic | ProviderId::Gemini => {
                Self::new(60.0, 1.0)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.max_tokens.is_finite() || self.max_tokens < 0.0 {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "max_tokens must be a finite value >= 0, got {}",
                self.max_tokens
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "refill_rate must be a finite value >= 0, got {}",
                self.refill_rate
            )));
        }
        if !self.tokens_per_request.is_finite() || self.tokens_per_request <= 0.0 {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "tokens_per_request must be > 0, got {}",
                self.tokens_per_request
            )));
        }
        Ok(())
    }
}

/// Current balance of one provider's bucket.
///
/// Invariant: `0 <= tokens <= max_tokens` after every operation.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub(crate) fn full(config: &RateLimitConfig) -> Self {
        Self {
            tokens: config.max_tokens,
            last_refill: Instant::now(),
        }
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Apply lazy refill up to `now`.
    pub(crate) fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(config.max_tokens);
        self.last_refill = now;
    }

    /// Debit `cost` if the balance covers it.
    pub(crate) fn try_take(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    /// Seconds until `cost` becomes available, `INFINITY` if never.
    pub(crate) fn wait_time(&self, config: &RateLimitConfig, cost: f64) -> f64 {
        if self.tokens >= cost {
            return 0.0;
        }
        if config.refill_rate <= 0.0 || cost > config.max_tokens {
            return f64::INFINITY;
        }
        (cost - self.tokens) / config.refill_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn validate_rejects_negative_and_zero_cost() {
        assert!(RateLimitConfig::new(-1.0, 1.0).validate().is_err());
        assert!(RateLimitConfig::new(1.0, -0.5).validate().is_err());
        assert!(
            RateLimitConfig::new(1.0, 1.0)
                .tokens_per_request(0.0)
                .validate()
                .is_err()
        );
        assert!(RateLimitConfig::new(f64::NAN, 1.0).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let config = RateLimitConfig::new(5.0, 10.0);
        let mut bucket = TokenBucket::full(&config);
        assert!(bucket.try_take(5.0));
        tokio::time::advance(Duration::from_secs(60)).await;
        bucket.refill(&config, Instant::now());
        assert_eq!(bucket.tokens(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_proportional_to_elapsed_time() {
        let config = RateLimitConfig::new(10.0, 2.0);
        let mut bucket = TokenBucket::full(&config);
        assert!(bucket.try_take(10.0));
        tokio::time::advance(Duration::from_millis(1500)).await;
        bucket.refill(&config, Instant::now());
        assert!((bucket.tokens() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn wait_time_is_deficit_over_rate() {
        let config = RateLimitConfig::new(4.0, 2.0);
        let mut bucket = TokenBucket::full(&config);
        assert!(bucket.try_take(4.0));
        assert!((bucket.wait_time(&config, 1.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wait_time_is_infinite_without_refill_or_capacity() {
        let no_refill = RateLimitConfig::new(1.0, 0.0);
        let mut bucket = TokenBucket::full(&no_refill);
        assert!(bucket.try_take(1.0));
        assert!(bucket.wait_time(&no_refill, 1.0).is_infinite());

        let small = RateLimitConfig::new(2.0, 1.0);
        let bucket = TokenBucket::full(&small);
        assert!(bucket.wait_time(&small, 3.0).is_infinite());
    }
}
