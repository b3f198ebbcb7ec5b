//! Retry configuration and backoff calculation for the switcher.
//!
//! Backoff is exponential: `backoff_unit * backoff_base^attempt`, capped at
//! `max_delay`. A retry hint from the backend (structured `retry_after` or
//! rate-limit phrasing in the error text) replaces the computed delay but is
//! still capped.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::types::ProviderId;

/// Delay assumed when an error looks rate-limited but names no duration.
pub const DEFAULT_RATE_LIMIT_HINT: Duration = Duration::from_secs(60);

/// Retry and timeout policy for one provider cycle.
///
/// ```rust
/// # use heimdall::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_retries(5)
///     .backoff_unit(Duration::from_millis(200))
///     .attempt_timeout(Duration::from_secs(10));
/// assert_eq!(config.delay_for_attempt(1), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts per provider, including the first. Default: 3.
    pub max_retries: u32,
    /// Exponential growth factor. Default: 2.0.
    pub backoff_base: f64,
    /// Delay unit multiplied by `backoff_base^attempt`. Default: 1s.
    pub backoff_unit: Duration,
    /// Cap on any single delay. Default: 60s.
    pub max_delay: Duration,
    /// Upper bound on one adapter call. Default: 30s.
    pub attempt_timeout: Duration,
    /// Whether to sleep for rate limiter tokens instead of failing fast.
    pub rate_limit_wait: bool,
    /// Longest wait for tokens when `rate_limit_wait` is set. Default: 30s.
    pub rate_limit_max_wait: Duration,
    /// Per-provider replacements for `max_retries`.
    pub provider_max_retries: BTreeMap<ProviderId, u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30),
            rate_limit_wait: false,
            rate_limit_max_wait: Duration::from_secs(30),
            provider_max_retries: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt per provider.
    pub fn disabled() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n.max(1);
        self
    }

    /// Override `max_retries` for one provider.
    pub fn provider_max_retries(mut self, provider: ProviderId, n: u32) -> Self {
        self.provider_max_retries.insert(provider, n.max(1));
        self
    }

    /// Attempts allowed against `provider` in one cycle.
    pub fn attempts_for(&self, provider: ProviderId) -> u32 {
        self.provider_max_retries
            .get(&provider)
            .copied()
            .unwrap_or(self.max_retries)
            .max(1)
    }

    pub fn backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn rate_limit_wait(mut self, wait: bool, max_wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self.rate_limit_max_wait = max_wait;
        self
    }

    /// Computed backoff before retry number `attempt + 1` (0-indexed),
    /// without hints.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_base.max(0.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.backoff_unit.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay to actually sleep: the hint when present, else the computed
    /// backoff, capped at `max_delay` either way.
    pub fn effective_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        hint.map(|h| h.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

static RATE_LIMIT_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry[ _-]?after|rate[ _-]?limit|\b429\b|quota|too many requests")
        .expect("rate limit regex is valid")
});

static DURATION_SECS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:seconds?|secs?|s)\b").expect("duration regex is valid")
});

/// Best-effort delay hint from free-form error text.
///
/// Returns `None` unless the text looks rate-limited. When it does, the
/// first `<number> s|sec|secs|second|seconds` is used, else
/// [`DEFAULT_RATE_LIMIT_HINT`].
pub fn retry_hint_from_text(text: &str) -> Option<Duration> {
    if !RATE_LIMIT_PHRASE.is_match(text) {
        return None;
    }
    let parsed = DURATION_SECS
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
    Some(parsed.unwrap_or(DEFAULT_RATE_LIMIT_HINT))
}
