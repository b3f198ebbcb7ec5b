//! Heimdall error types

use std::fmt;
use std::time::Duration;

use crate::switcher::retry::retry_hint_from_text;
use crate::types::ProviderId;

/// Heimdall error types
#[derive(Debug, thiserror::Error)]
pub enum HeimdallError {
    // Admission control
    /// `retry_after` is in seconds and is `f64::INFINITY` when the bucket
    /// can never satisfy the request.
    #[error("rate limit exceeded for {provider}, retry after {retry_after:.2}s")]
    RateLimitExceeded { provider: ProviderId, retry_after: f64 },

    // Provider/network errors
    #[error("{provider} timed out after {}ms", .after.as_millis())]
    Timeout { provider: ProviderId, after: Duration },

    #[error("invalid credential for {provider}")]
    InvalidCredential { provider: ProviderId },

    #[error("model not found on {provider}: {model}")]
    ModelNotFound { provider: ProviderId, model: String },

    #[error("network error from {provider}: {message}")]
    Network { provider: ProviderId, message: String },

    #[error("generation failed on {provider}: {message}")]
    GenerationFailed { provider: ProviderId, message: String },

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: ProviderId,
        operation: &'static str,
    },

    /// Primary and fallback both exhausted.
    #[error("{0}")]
    ServiceUnavailable(Box<FailoverReport>),

    // Routing errors
    #[error("{provider} failed its health check: {reason}")]
    ProviderUnhealthy { provider: ProviderId, reason: String },

    #[error("{provider} is the {role} provider and cannot be deactivated")]
    ProviderInUse {
        provider: ProviderId,
        role: &'static str,
    },

    // Input / configuration errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    InvalidConfiguration(String),

    // Data errors
    #[error("cache error: {0}")]
    Cache(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HeimdallError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            HeimdallError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            HeimdallError::Timeout { .. } => "TIMEOUT",
            HeimdallError::InvalidCredential { .. } => "INVALID_CREDENTIAL",
            HeimdallError::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            HeimdallError::Network { .. } => "NETWORK_ERROR",
            HeimdallError::GenerationFailed { .. } => "GENERATION_FAILED",
            HeimdallError::Unsupported { .. } => "UNSUPPORTED",
            HeimdallError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            HeimdallError::ProviderUnhealthy { .. } => "PROVIDER_UNHEALTHY",
            HeimdallError::ProviderInUse { .. } => "PROVIDER_IN_USE",
            HeimdallError::InvalidRequest(_) => "INVALID_REQUEST",
            HeimdallError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            HeimdallError::Cache(_) => "CACHE_ERROR",
            HeimdallError::Json(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Providers this error is attributed to.
    pub fn providers(&self) -> Vec<ProviderId> {
        match self {
            HeimdallError::RateLimitExceeded { provider, .. }
            | HeimdallError::Timeout { provider, .. }
            | HeimdallError::InvalidCredential { provider }
            | HeimdallError::ModelNotFound { provider, .. }
            | HeimdallError::Network { provider, .. }
            | HeimdallError::GenerationFailed { provider, .. }
            | HeimdallError::Unsupported { provider, .. }
            | HeimdallError::ProviderUnhealthy { provider, .. }
            | HeimdallError::ProviderInUse { provider, .. } => vec![*provider],
            HeimdallError::ServiceUnavailable(report) => {
                let mut ids = vec![report.primary];
                ids.extend(report.fallback);
                ids
            }
            HeimdallError::InvalidRequest(_)
            | HeimdallError::InvalidConfiguration(_)
            | HeimdallError::Cache(_)
            | HeimdallError::Json(_) => Vec::new(),
        }
    }

    /// Whether another attempt against the same provider may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HeimdallError::RateLimitExceeded { .. }
                | HeimdallError::Timeout { .. }
                | HeimdallError::Network { .. }
                | HeimdallError::GenerationFailed { .. }
        )
    }

    /// Delay requested by the backend before the next attempt, if any.
    ///
    /// Structured `retry_after` values win; otherwise the error text is
    /// scanned for rate-limit phrasing (best effort).
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            HeimdallError::RateLimitExceeded { retry_after, .. }
                if retry_after.is_finite() && *retry_after >= 0.0 =>
            {
                // Too large for a Duration: the retry policy caps it anyway.
                Some(Duration::try_from_secs_f64(*retry_after).unwrap_or(Duration::MAX))
            }
            other => retry_hint_from_text(&other.to_string()),
        }
    }

    /// `retry_after` as a `Duration`, `None` when infinite or too large to
    /// represent.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HeimdallError::RateLimitExceeded { retry_after, .. } => {
                Duration::try_from_secs_f64(retry_after.max(0.0)).ok()
            }
            _ => None,
        }
    }
}

/// Details of a request that exhausted both primary and fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverReport {
    pub primary: ProviderId,
    pub primary_error: String,
    pub fallback: Option<ProviderId>,
    pub fallback_error: Option<String>,
    pub suggestions: Vec<String>,
}

impl FailoverReport {
    pub(crate) fn new(
        primary: ProviderId,
        primary_error: &HeimdallError,
        fallback: ProviderId,
        fallback_error: &HeimdallError,
    ) -> Self {
        let mut suggestions = Vec::new();
        for err in [primary_error, fallback_error] {
            let hint = match err {
                HeimdallError::InvalidCredential { provider } => {
                    format!("check the API key configured for {provider}")
                }
                HeimdallError::ModelNotFound { provider, model } => {
                    format!("verify that model '{model}' is available on {provider}")
                }
                HeimdallError::RateLimitExceeded { provider, .. } => {
                    format!("lower request volume or raise the rate limit for {provider}")
                }
                HeimdallError::Timeout { provider, .. } => {
                    format!("increase the attempt timeout or check latency of {provider}")
                }
                HeimdallError::Network { provider, .. } => {
                    format!("check network connectivity to {provider}")
                }
                _ => continue,
            };
            if !suggestions.contains(&hint) {
                suggestions.push(hint);
            }
        }
        suggestions.push("check provider health with the health monitor".to_string());
        suggestions.push("configure an additional fallback provider".to_string());

        Self {
            primary,
            primary_error: primary_error.to_string(),
            fallback: Some(fallback),
            fallback_error: Some(fallback_error.to_string()),
            suggestions,
        }
    }
}

impl fmt::Display for FailoverReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all providers failed: primary {} ({})",
            self.primary, self.primary_error
        )?;
        if let Some(fallback) = self.fallback {
            write!(
                f,
                "; fallback {} ({})",
                fallback,
                self.fallback_error.as_deref().unwrap_or("not attempted")
            )?;
        }
        if !self.suggestions.is_empty() {
            write!(f, "; suggestions: {}", self.suggestions.join("; "))?;
        }
        Ok(())
    }
}

/// Result type alias for Heimdall operations
pub type Result<T> = std::result::Result<T, HeimdallError>;
