//! Embedding response type.

use serde::{Deserialize, Serialize};

use super::{ProviderId, Usage};

/// Vector embedding of a single text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    pub model: String,
    pub provider: ProviderId,
    pub dimensions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl EmbeddingResponse {
    pub fn new(embedding: Vec<f32>, model: impl Into<String>, provider: ProviderId) -> Self {
        Self {
            dimensions: embedding.len(),
            embedding,
            model: model.into(),
            provider,
            usage: None,
        }
    }
}
