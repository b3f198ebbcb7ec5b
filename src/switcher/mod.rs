//! Provider switcher with retry, backoff and failover.
//!
//! Every request runs the same state machine:
//!
//! ```text
//! Try-Primary ──ok──────────────────────────────► Done
//!     │ exhausted
//!     ▼
//! Try-Fallback (same request, fresh retry cycle) ─ok─► Done
//!     │ exhausted
//!     ▼
//! Failed(ServiceUnavailable { primary, fallback, suggestions })
//! ```
//!
//! A provider cycle is up to `max_retries` attempts. Each attempt acquires
//! rate limiter tokens, then calls the adapter under `attempt_timeout`.
//! Transient failures sleep for the computed backoff (or the backend's
//! retry hint) before the next attempt. Non-transient failures and local
//! rate limiter rejections end the cycle early.

pub mod retry;
pub mod usage;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheClient, ResponseCache, cache_key};
use crate::error::FailoverReport;
use crate::providers::{ProviderAdapter, bounded_stream};
use crate::ratelimit::RateLimiter;
use crate::telemetry;
use crate::types::{
    EmbeddingResponse, GenerateRequest, GenerateResponse, HealthCheckResult, ProviderId,
    TextStream, Usage,
};
use crate::{HeimdallError, Result};

pub use retry::{RetryConfig, retry_hint_from_text};
pub use usage::{UsageRecord, UsageSink};

/// Which providers requests are routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub current: ProviderId,
    pub fallback: Option<ProviderId>,
    /// Providers that may be switched to, in preference order.
    pub enabled: Vec<ProviderId>,
}

/// Everything the switcher is built from. Assembled by
/// [`HeimdallBuilder`](crate::HeimdallBuilder).
pub(crate) struct SwitcherParts {
    pub adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    pub routing: Routing,
    pub retry: RetryConfig,
    pub cache: ResponseCache,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub usage_sink: Option<Arc<dyn UsageSink>>,
    pub health_check_timeout: Duration,
    pub stream_buffer: usize,
}

/// Routes requests to the active provider and fails over on exhaustion.
pub struct Switcher {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    routing: RwLock<Routing>,
    retry: RwLock<RetryConfig>,
    cache: ResponseCache,
    rate_limiter: Option<Arc<RateLimiter>>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    /// Generations routed per provider, pre-populated for every id.
    usage: HashMap<ProviderId, AtomicU64>,
    health_check_timeout: Duration,
    stream_buffer: usize,
}

/// Successful provider cycle.
struct Served<T> {
    value: T,
    provider: ProviderId,
    latency: Duration,
    failed_over: bool,
}

/// Failed provider cycle.
struct Exhausted {
    error: HeimdallError,
    attempts: u32,
    /// Ended by the local rate limiter rather than by the backend.
    local_rejection: bool,
}

impl Exhausted {
    /// Error surfaced when no fallback takes over.
    fn into_error(self, provider: ProviderId) -> HeimdallError {
        if self.local_rejection || !self.error.is_transient() {
            return self.error;
        }
        HeimdallError::GenerationFailed {
            provider,
            message: format!("{} attempts failed: {}", self.attempts, self.error),
        }
    }
}

impl Switcher {
    pub(crate) fn new(parts: SwitcherParts) -> Self {
        Self {
            adapters: parts.adapters,
            routing: RwLock::new(parts.routing),
            retry: RwLock::new(parts.retry),
            cache: parts.cache,
            rate_limiter: parts.rate_limiter,
            usage_sink: parts.usage_sink,
            usage: ProviderId::ALL
                .into_iter()
                .map(|p| (p, AtomicU64::new(0)))
                .collect(),
            health_check_timeout: parts.health_check_timeout,
            stream_buffer: parts.stream_buffer,
        }
    }

    // ========================================================================
    // Request path
    // ========================================================================

    /// Generate text, consulting the response cache when `use_cache` is set
    /// and caching is globally enabled.
    #[instrument(skip(self, request), fields(operation = "generate", model = ?request.model))]
    pub async fn generate(
        &self,
        request: &GenerateRequest,
        use_cache: bool,
    ) -> Result<GenerateResponse> {
        if request.prompt.is_empty() {
            return Err(HeimdallError::InvalidRequest(
                "prompt must not be empty".into(),
            ));
        }

        let key = if use_cache && self.cache.is_enabled() {
            Some(cache_key(request, self.get_current_method()?))
        } else {
            None
        };
        if let Some(key) = &key
            && let Some(hit) = self.cache.get(key).await
        {
            debug!(provider = %hit.provider, "served from response cache");
            return Ok(hit);
        }

        let served = self
            .execute("generate", request.model.as_deref(), |adapter| async move {
                adapter
                    .generate(
                        &request.prompt,
                        &request.options,
                        request.model.as_deref(),
                        request.system_prompt.as_deref(),
                    )
                    .await
            })
            .await?;

        let mut response = served.value;
        response.provider = served.provider;
        response.latency_ms = served.latency.as_millis() as u64;
        response.cached = false;
        record_token_usage(served.provider, &response.usage);

        if let Some(key) = &key {
            self.cache.put(key, &response).await;
        }
        Ok(response)
    }

    /// Stream generated text. Only opening the stream is retried; chunks
    /// are delivered through a bounded channel. Streams are never cached.
    #[instrument(skip(self, request), fields(operation = "stream_generate", model = ?request.model))]
    pub async fn stream_generate(&self, request: &GenerateRequest) -> Result<TextStream> {
        if request.prompt.is_empty() {
            return Err(HeimdallError::InvalidRequest(
                "prompt must not be empty".into(),
            ));
        }
        let served = self
            .execute(
                "stream_generate",
                request.model.as_deref(),
                |adapter| async move {
                    adapter
                        .stream_generate(
                            &request.prompt,
                            &request.options,
                            request.model.as_deref(),
                            request.system_prompt.as_deref(),
                        )
                        .await
                },
            )
            .await?;
        Ok(bounded_stream(served.value, self.stream_buffer))
    }

    /// Embed text through the same retry and failover path.
    #[instrument(skip(self, text), fields(operation = "embed"))]
    pub async fn embed(&self, text: &str, model: Option<&str>) -> Result<EmbeddingResponse> {
        let served = self
            .execute("embed", model, |adapter| async move {
                adapter.embed(text, model).await
            })
            .await?;
        let mut response = served.value;
        response.provider = served.provider;
        Ok(response)
    }

    /// Run one request through primary then fallback.
    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        model: Option<&str>,
        call: F,
    ) -> Result<Served<T>>
    where
        F: Fn(Arc<dyn ProviderAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (primary, fallback) = {
            let routing = self.read_routing()?;
            (routing.current, routing.fallback)
        };
        let retry = self.retry_config()?;
        let start = Instant::now();

        let primary_failure = match self.run_cycle(primary, operation, &retry, &call).await {
            Ok((value, latency)) => {
                let served = Served {
                    value,
                    provider: primary,
                    latency,
                    failed_over: false,
                };
                self.finish_ok(operation, model, start, &served);
                return Ok(served);
            }
            Err(failure) => failure,
        };

        let Some(fallback) = fallback.filter(|f| *f != primary) else {
            let error = primary_failure.into_error(primary);
            self.finish_err(operation, model, primary, start, &error, false);
            return Err(error);
        };

        warn!(
            from = %primary,
            to = %fallback,
            operation,
            error = %primary_failure.error,
            "primary provider exhausted, failing over"
        );
        metrics::counter!(telemetry::FAILOVERS_TOTAL,
            "from" => primary.as_str(),
            "to" => fallback.as_str(),
            "operation" => operation,
        )
        .increment(1);

        match self.run_cycle(fallback, operation, &retry, &call).await {
            Ok((value, latency)) => {
                let served = Served {
                    value,
                    provider: fallback,
                    latency,
                    failed_over: true,
                };
                self.finish_ok(operation, model, start, &served);
                Ok(served)
            }
            Err(fallback_failure) => {
                let error = HeimdallError::ServiceUnavailable(Box::new(FailoverReport::new(
                    primary,
                    &primary_failure.error,
                    fallback,
                    &fallback_failure.error,
                )));
                self.finish_err(operation, model, primary, start, &error, true);
                Err(error)
            }
        }
    }

    /// Up to `max_retries` attempts against one provider.
    async fn run_cycle<T, F, Fut>(
        &self,
        provider: ProviderId,
        operation: &'static str,
        retry: &RetryConfig,
        call: &F,
    ) -> std::result::Result<(T, Duration), Exhausted>
    where
        F: Fn(Arc<dyn ProviderAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(adapter) = self.adapters.get(&provider).cloned() else {
            return Err(Exhausted {
                error: HeimdallError::InvalidConfiguration(format!(
                    "no adapter registered for {provider}"
                )),
                attempts: 0,
                local_rejection: false,
            });
        };

        let max_attempts = retry.attempts_for(provider);
        let mut last_err = None;
        for attempt in 0..max_attempts {
            if let Some(limiter) = &self.rate_limiter
                && let Err(e) = limiter
                    .acquire(
                        provider,
                        None,
                        retry.rate_limit_wait,
                        retry.rate_limit_max_wait,
                    )
                    .await
            {
                debug!(provider = %provider, error = %e, "rejected by local rate limiter");
                return Err(Exhausted {
                    error: e,
                    attempts: attempt,
                    local_rejection: true,
                });
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(retry.attempt_timeout, call(Arc::clone(&adapter)))
                .await
                .unwrap_or(Err(HeimdallError::Timeout {
                    provider,
                    after: retry.attempt_timeout,
                }));

            match outcome {
                Ok(value) => return Ok((value, started.elapsed())),
                Err(e) if e.is_transient() => {
                    if attempt + 1 < max_attempts {
                        metrics::counter!(telemetry::RETRIES_TOTAL,
                            "provider" => provider.as_str(),
                            "operation" => operation,
                        )
                        .increment(1);
                        let delay = retry.effective_delay(attempt, e.retry_hint());
                        warn!(
                            provider = %provider,
                            operation,
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying after transient error"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(e);
                }
                Err(e) => {
                    debug!(provider = %provider, error = %e, "permanent error, ending retry cycle");
                    return Err(Exhausted {
                        error: e,
                        attempts: attempt + 1,
                        local_rejection: false,
                    });
                }
            }
        }

        Err(Exhausted {
            error: last_err.unwrap_or_else(|| HeimdallError::GenerationFailed {
                provider,
                message: "no attempts made".into(),
            }),
            attempts: max_attempts,
            local_rejection: false,
        })
    }

    fn finish_ok<T>(
        &self,
        operation: &'static str,
        model: Option<&str>,
        start: Instant,
        served: &Served<T>,
    ) {
        if let Some(counter) = self.usage.get(&served.provider) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        record_request(operation, served.provider, start, true);
        if let Some(sink) = &self.usage_sink {
            sink.record(&UsageRecord {
                provider: served.provider,
                model: model.map(str::to_string),
                operation,
                success: true,
                failed_over: served.failed_over,
                latency_ms: served.latency.as_millis() as u64,
                error_code: None,
                error_message: None,
            });
        }
    }

    fn finish_err(
        &self,
        operation: &'static str,
        model: Option<&str>,
        provider: ProviderId,
        start: Instant,
        error: &HeimdallError,
        failed_over: bool,
    ) {
        record_request(operation, provider, start, false);
        if let Some(sink) = &self.usage_sink {
            sink.record(&UsageRecord {
                provider,
                model: model.map(str::to_string),
                operation,
                success: false,
                failed_over,
                latency_ms: start.elapsed().as_millis() as u64,
                error_code: Some(error.code()),
                error_message: Some(error.to_string()),
            });
        }
    }

    // ========================================================================
    // Routing control
    // ========================================================================

    /// Make `provider` the active method.
    ///
    /// The target must be enabled and have an adapter.
    pub fn switch_method(&self, provider: ProviderId) -> Result<()> {
        let mut routing = self.write_routing()?;
        self.check_routable(&routing, provider)?;
        if routing.current != provider {
            info!(from = %routing.current, to = %provider, "switching active provider");
            routing.current = provider;
        }
        Ok(())
    }

    /// Like [`switch_method`](Self::switch_method), but the target must also
    /// pass a fresh health check. On rejection the active method is left
    /// unchanged.
    pub async fn switch_method_validated(&self, provider: ProviderId) -> Result<()> {
        let adapter = {
            let routing = self.read_routing()?;
            self.check_routable(&routing, provider)?
        };

        let check = tokio::time::timeout(self.health_check_timeout, adapter.health_check())
            .await
            .unwrap_or_else(|_| {
                HealthCheckResult::unhealthy(
                    self.health_check_timeout,
                    format!(
                        "health check timed out after {}ms",
                        self.health_check_timeout.as_millis()
                    ),
                )
            });
        if !check.available {
            warn!(provider = %provider, error = ?check.error, "switch rejected, provider unhealthy");
            return Err(HeimdallError::ProviderUnhealthy {
                provider,
                reason: check
                    .error
                    .unwrap_or_else(|| "reported unavailable".to_string()),
            });
        }

        self.switch_method(provider)
    }

    pub fn get_current_method(&self) -> Result<ProviderId> {
        Ok(self.read_routing()?.current)
    }

    /// Set or clear the fallback provider.
    pub fn set_fallback_provider(&self, provider: Option<ProviderId>) -> Result<()> {
        let mut routing = self.write_routing()?;
        if let Some(p) = provider {
            self.check_routable(&routing, p)?;
        }
        routing.fallback = provider;
        Ok(())
    }

    pub fn get_fallback_provider(&self) -> Result<Option<ProviderId>> {
        Ok(self.read_routing()?.fallback)
    }

    pub fn enabled_providers(&self) -> Result<Vec<ProviderId>> {
        Ok(self.read_routing()?.enabled.clone())
    }

    pub fn routing(&self) -> Result<Routing> {
        Ok(self.read_routing()?.clone())
    }

    /// Remove a provider from the enabled set. Fails while it is the active
    /// or fallback target.
    pub fn deactivate_provider(&self, provider: ProviderId) -> Result<()> {
        let mut routing = self.write_routing()?;
        if routing.current == provider {
            return Err(HeimdallError::ProviderInUse {
                provider,
                role: "active",
            });
        }
        if routing.fallback == Some(provider) {
            return Err(HeimdallError::ProviderInUse {
                provider,
                role: "fallback",
            });
        }
        routing.enabled.retain(|p| *p != provider);
        info!(provider = %provider, "provider deactivated");
        Ok(())
    }

    /// Add a provider back to the enabled set.
    pub fn activate_provider(&self, provider: ProviderId) -> Result<()> {
        if !self.adapters.contains_key(&provider) {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "no adapter registered for {provider}"
            )));
        }
        let mut routing = self.write_routing()?;
        if !routing.enabled.contains(&provider) {
            routing.enabled.push(provider);
            info!(provider = %provider, "provider activated");
        }
        Ok(())
    }

    /// Replace the routing table wholesale (config reload).
    pub(crate) fn apply_routing(&self, routing: Routing) -> Result<()> {
        for p in routing
            .enabled
            .iter()
            .chain(std::iter::once(&routing.current))
            .chain(routing.fallback.iter())
        {
            if !self.adapters.contains_key(p) {
                return Err(HeimdallError::InvalidConfiguration(format!(
                    "no adapter registered for {p}"
                )));
            }
        }
        if !routing.enabled.contains(&routing.current) {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "default provider {} is not enabled",
                routing.current
            )));
        }
        *self.write_routing()? = routing;
        Ok(())
    }

    pub fn retry_config(&self) -> Result<RetryConfig> {
        self.retry
            .read()
            .map(|r| r.clone())
            .map_err(|e| lock_err("retry", e))
    }

    pub fn set_retry_config(&self, config: RetryConfig) -> Result<()> {
        *self.retry.write().map_err(|e| lock_err("retry", e))? = config;
        Ok(())
    }

    /// Adapter registered for a provider.
    pub fn adapter(&self, provider: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    pub fn adapters(&self) -> &HashMap<ProviderId, Arc<dyn ProviderAdapter>> {
        &self.adapters
    }

    // ========================================================================
    // Usage counters
    // ========================================================================

    /// Generations routed per provider since the last reset.
    pub fn get_usage_stats(&self) -> BTreeMap<ProviderId, u64> {
        self.usage
            .iter()
            .map(|(p, c)| (*p, c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn reset_usage_stats(&self) {
        for counter in self.usage.values() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Cache control
    // ========================================================================

    pub async fn clear_response_cache(&self) {
        self.cache.clear().await;
        info!("response cache cleared");
    }

    pub fn enable_response_cache(&self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }

    pub fn is_response_cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Install (or remove) the shared cache tier.
    pub fn set_cache_client(&self, client: Option<Arc<dyn CacheClient>>) {
        self.cache.set_client(client);
    }

    pub fn response_cache(&self) -> &ResponseCache {
        &self.cache
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_routable(
        &self,
        routing: &Routing,
        provider: ProviderId,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        if !routing.enabled.contains(&provider) {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "provider {provider} is not enabled"
            )));
        }
        self.adapter(provider).ok_or_else(|| {
            HeimdallError::InvalidConfiguration(format!("no adapter registered for {provider}"))
        })
    }

    fn read_routing(&self) -> Result<RwLockReadGuard<'_, Routing>> {
        self.routing.read().map_err(|e| lock_err("routing", e))
    }

    fn write_routing(&self) -> Result<RwLockWriteGuard<'_, Routing>> {
        self.routing.write().map_err(|e| lock_err("routing", e))
    }
}

fn lock_err(what: &str, e: impl std::fmt::Display) -> HeimdallError {
    HeimdallError::InvalidConfiguration(format!("Failed to acquire {what} lock: {e}"))
}

fn record_request(operation: &'static str, provider: ProviderId, start: Instant, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(telemetry::REQUESTS_TOTAL,
        "provider" => provider.as_str(),
        "operation" => operation,
        "status" => status,
    )
    .increment(1);
    metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
        "provider" => provider.as_str(),
        "operation" => operation,
    )
    .record(start.elapsed().as_secs_f64());
}

fn record_token_usage(provider: ProviderId, usage: &Usage) {
    metrics::counter!(telemetry::TOKENS_TOTAL,
        "provider" => provider.as_str(),
        "direction" => "prompt",
    )
    .increment(u64::from(usage.prompt_tokens));
    metrics::counter!(telemetry::TOKENS_TOTAL,
        "provider" => provider.as_str(),
        "direction" => "completion",
    )
    .increment(u64::from(usage.completion_tokens));
}
