//! Public types for the Heimdall API.

mod embedding;
mod generate;
mod health;
mod provider;

pub use embedding::EmbeddingResponse;
pub use generate::{
    FinishReason, GenerateOptions, GenerateRequest, GenerateResponse, TextStream, Usage,
};
pub use health::{HealthAlert, HealthCheckResult, HealthRecord};
pub use provider::ProviderId;
