//! Per-request audit records.
//!
//! The switcher hands one [`UsageRecord`] per completed request to an
//! optional [`UsageSink`]. Persisting them (database, log shipper, billing)
//! is up to the embedding application.

use serde::Serialize;

use crate::types::ProviderId;

/// Outcome of one switcher request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    /// Provider that produced the response, or the primary on failure.
    pub provider: ProviderId,
    pub model: Option<String>,
    pub operation: &'static str,
    pub success: bool,
    /// Whether the fallback provider was tried (and, on success, served).
    pub failed_over: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Receiver of [`UsageRecord`]s. Called inline on the request path, so
/// implementations should hand off slow work.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: &UsageRecord);
}
