//! The adapter contract every backend implements.
//!
//! Adapters are thin: they translate one request into one vendor call and
//! map vendor failures onto [`HeimdallError`](crate::HeimdallError). Retry,
//! timeouts, rate limiting, caching and failover all live in the
//! [`Switcher`](crate::Switcher), so an adapter never retries on its own.
//!
//! # Error mapping
//!
//! | Vendor condition            | Error                    |
//! |-----------------------------|--------------------------|
//! | 401 / 403                   | `InvalidCredential`      |
//! | 404 for the requested model | `ModelNotFound`          |
//! | 429                         | `RateLimitExceeded`      |
//! | 5xx / malformed body        | `GenerationFailed`       |
//! | connect / read failure      | `Network`                |

use async_trait::async_trait;

use crate::types::{
    EmbeddingResponse, GenerateOptions, GenerateResponse, HealthCheckResult, ProviderId,
    TextStream,
};
use crate::{HeimdallError, Result};

/// A backend capable of text generation.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter speaks for.
    fn id(&self) -> ProviderId;

    /// Adapter name for logging/debugging.
    fn name(&self) -> &str {
        self.id().as_str()
    }

    /// Non-streaming generation. `model = None` means the adapter's default.
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<GenerateResponse>;

    /// Streaming generation. Errors before the first chunk are returned
    /// directly; later failures arrive as stream items.
    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<TextStream>;

    /// Text embedding. Not every backend offers one.
    async fn embed(&self, _text: &str, _model: Option<&str>) -> Result<EmbeddingResponse> {
        Err(HeimdallError::Unsupported {
            provider: self.id(),
            operation: "embed",
        })
    }

    /// Lightweight liveness probe. Must not return an error: failures are
    /// reported through [`HealthCheckResult::unhealthy`].
    async fn health_check(&self) -> HealthCheckResult;

    /// Model identifiers the backend reports as available.
    async fn list_models(&self) -> Result<Vec<String>>;
}
