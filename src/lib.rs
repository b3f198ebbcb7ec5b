//! Heimdall - resilience gateway for LLM backends
//!
//! Routes text-generation and embedding requests to one of several
//! interchangeable providers while protecting those providers from overload
//! and protecting callers from provider instability:
//!
//! - [`RateLimiter`]: per-provider token buckets.
//! - [`Switcher`]: per-attempt timeouts, retry with exponential backoff,
//!   failover to a fallback provider, usage counters.
//! - [`HealthMonitor`]: scheduled health probes with transition alerts.
//! - [`ResponseCache`]: TTL cache of identical requests, optionally backed
//!   by a shared [`CacheClient`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use heimdall::{GenerateOptions, GenerateRequest, Heimdall, OllamaAdapter, ProviderId};
//!
//! #[tokio::main]
//! async fn main() -> heimdall::Result<()> {
//!     let gateway = Heimdall::builder()
//!         .adapter(Arc::new(OllamaAdapter::new().default_model("llama3")))
//!         .default_provider(ProviderId::Ollama)
//!         .build()?;
//!     gateway.start()?;
//!
//!     let request = GenerateRequest::new("What is the capital of France?")
//!         .system_prompt("Answer in one word.")
//!         .options(GenerateOptions::new().temperature(0.2));
//!     let response = gateway.generate(&request).await?;
//!     println!("{} (via {})", response.content, response.provider);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
#[cfg(feature = "config")]
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod providers;
pub mod ratelimit;
pub mod switcher;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use error::{FailoverReport, HeimdallError, Result};
pub use gateway::{Gateway, Heimdall, HeimdallBuilder};

pub use cache::{CacheClient, CacheConfig, ResponseCache};
#[cfg(feature = "redis")]
pub use cache::RedisCacheClient;
#[cfg(feature = "config")]
pub use config::Config;
pub use health::{HealthConfig, HealthMonitor};
#[cfg(feature = "ollama")]
pub use providers::OllamaAdapter;
pub use providers::ProviderAdapter;
pub use ratelimit::{LimiterStats, RateLimitConfig, RateLimitStatus, RateLimiter};
pub use switcher::{RetryConfig, Routing, Switcher, UsageRecord, UsageSink};

pub use types::{
    EmbeddingResponse, FinishReason, GenerateOptions, GenerateRequest, GenerateResponse,
    HealthAlert, HealthCheckResult, HealthRecord, ProviderId, TextStream, Usage,
};
