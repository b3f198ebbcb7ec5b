//! In-process gateway: switcher, rate limiter and health monitor wired
//! together behind one cloneable handle.

use std::sync::Arc;

use tracing::instrument;

use crate::health::HealthMonitor;
use crate::ratelimit::RateLimiter;
use crate::switcher::Switcher;
use crate::types::{EmbeddingResponse, GenerateRequest, GenerateResponse, ProviderId, TextStream};
use crate::{HeimdallError, Result};

/// Handle to a running gateway. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Gateway {
    switcher: Arc<Switcher>,
    rate_limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
}

impl Gateway {
    pub(crate) fn new(
        switcher: Arc<Switcher>,
        rate_limiter: Arc<RateLimiter>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            switcher,
            rate_limiter,
            health,
        }
    }

    /// Generate with the response cache consulted.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.switcher.generate(request, true).await
    }

    /// Generate, choosing whether to use the response cache for this call.
    pub async fn generate_with_cache(
        &self,
        request: &GenerateRequest,
        use_cache: bool,
    ) -> Result<GenerateResponse> {
        self.switcher.generate(request, use_cache).await
    }

    pub async fn stream_generate(&self, request: &GenerateRequest) -> Result<TextStream> {
        self.switcher.stream_generate(request).await
    }

    pub async fn embed(&self, text: &str, model: Option<&str>) -> Result<EmbeddingResponse> {
        self.switcher.embed(text, model).await
    }

    /// Models reported by one provider's backend.
    #[instrument(skip(self))]
    pub async fn list_models(&self, provider: ProviderId) -> Result<Vec<String>> {
        let adapter = self.switcher.adapter(provider).ok_or_else(|| {
            HeimdallError::InvalidConfiguration(format!("no adapter registered for {provider}"))
        })?;
        adapter.list_models().await
    }

    pub fn switcher(&self) -> &Arc<Switcher> {
        &self.switcher
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Start background health monitoring.
    pub fn start(&self) -> Result<()> {
        self.health.start()
    }

    /// Stop background tasks. Recorded state stays readable.
    pub async fn shutdown(&self) {
        self.health.stop().await;
    }
}

#[cfg(feature = "config")]
mod reload {
    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tracing::{info, warn};

    use super::Gateway;
    use crate::Config;
    use crate::Result;
    use crate::switcher::Routing;

    impl Gateway {
        /// Apply a new configuration to the running gateway: routing
        /// pointers and enabled set, retry policy, rate limits and the cache
        /// toggle. Adapters cannot be added this way. Nothing is applied if
        /// the routing part is invalid.
        pub fn reload(&self, config: &Config) -> Result<()> {
            config.validate()?;
            let enabled = config.enabled();
            let current_now = self.switcher.get_current_method()?;
            let current = config
                .default_provider
                .or_else(|| enabled.contains(&current_now).then_some(current_now))
                .or_else(|| enabled.first().copied())
                .unwrap_or(current_now);

            self.switcher.apply_routing(Routing {
                current,
                fallback: config.fallback_provider,
                enabled,
            })?;
            self.switcher.set_retry_config(config.retry_config())?;
            for (provider, limit) in config.rate_limits()? {
                // Reconfiguring refills the bucket; leave unchanged ones alone.
                if self.rate_limiter.get_config(provider)? != limit {
                    self.rate_limiter.configure_provider(provider, limit)?;
                }
            }
            self.switcher.enable_response_cache(config.cache.enabled);
            info!(current = %current, "configuration applied");
            Ok(())
        }

        /// Reload whenever a new configuration is published on `rx`.
        /// The task ends when the sender is dropped.
        pub fn watch_config(&self, mut rx: watch::Receiver<Config>) -> JoinHandle<()> {
            let gateway = self.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let config = rx.borrow_and_update().clone();
                    if let Err(e) = gateway.reload(&config) {
                        warn!(error = %e, "rejected configuration update");
                    }
                }
            })
        }
    }
}
