//! Telemetry metric name constants.
//!
//! Centralised metric names for heimdall operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `heimdall_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider`: provider name (e.g. "ollama", "openai")
//! - `operation`: capability invoked (e.g. "generate", "embed")
//! - `status`: "ok" or "error"
//! - `direction`: "prompt" or "completion"

/// Total requests completed by the switcher (one per caller request).
///
/// Labels: `provider`, `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "heimdall_requests_total";

/// Request duration in seconds, including retries and failover.
///
/// Labels: `provider`, `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "heimdall_request_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `provider`, `operation`.
pub const RETRIES_TOTAL: &str = "heimdall_retries_total";

/// Total failovers from a primary to its fallback provider.
///
/// Labels: `from`, `to`, `operation`.
pub const FAILOVERS_TOTAL: &str = "heimdall_failovers_total";

/// Total tokens consumed.
///
/// Labels: `provider`, `direction` ("prompt" | "completion").
pub const TOKENS_TOTAL: &str = "heimdall_tokens_total";

/// Total response cache hits.
///
/// Labels: `tier` ("remote" | "local").
pub const CACHE_HITS_TOTAL: &str = "heimdall_cache_hits_total";

/// Total response cache misses.
pub const CACHE_MISSES_TOTAL: &str = "heimdall_cache_misses_total";

/// Rate limiter admission decisions.
///
/// Labels: `provider`, `decision` ("allowed" | "rejected").
pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "heimdall_rate_limit_decisions_total";

/// Health probes executed.
///
/// Labels: `provider`, `status` ("healthy" | "unhealthy").
pub const HEALTH_CHECKS_TOTAL: &str = "heimdall_health_checks_total";

/// Healthy/unhealthy transitions (one per alert).
///
/// Labels: `provider`, `status` (status after the transition).
pub const HEALTH_TRANSITIONS_TOTAL: &str = "heimdall_health_transitions_total";
