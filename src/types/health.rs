//! Health probe results and per-provider health records.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::ProviderId;

/// Outcome of a single adapter health probe.
///
/// Adapters never fail a probe with an error; an unreachable backend is
/// reported as `available = false` with the reason in `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub available: bool,
    pub latency: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            available: true,
            latency,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            available: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// Last recorded health verdict for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthRecord {
    pub provider: ProviderId,
    pub is_healthy: bool,
    /// Reset to 0 on every successful check.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_latency: Option<Duration>,
    pub last_checked: Instant,
}

/// Emitted once per healthy/unhealthy transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthAlert {
    pub provider: ProviderId,
    /// Status after the transition.
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub error: Option<String>,
}
