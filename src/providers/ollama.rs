//! Ollama adapter for a local or self-hosted model runtime.
//!
//! Speaks the native Ollama HTTP API:
//! - `POST /api/generate` for generation (NDJSON when streaming)
//! - `POST /api/embeddings` for embeddings
//! - `GET /api/tags` for model listing and health probes

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::ProviderAdapter;
use crate::types::{
    EmbeddingResponse, FinishReason, GenerateOptions, GenerateResponse, HealthCheckResult,
    ProviderId, TextStream, Usage,
};
use crate::{HeimdallError, Result};

/// Default address of a local Ollama daemon.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Model used when the request does not name one.
pub const DEFAULT_MODEL: &str = "llama3";

/// Retry-After assumed when a 429 carries no header.
const DEFAULT_RETRY_AFTER_SECS: f64 = 60.0;

const PROVIDER: ProviderId = ProviderId::Ollama;

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaAdapter {
    http: Client,
    base_url: String,
    default_model: String,
    api_key: Option<String>,
}

impl Default for OllamaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaAdapter {
    /// Adapter for the daemon at [`DEFAULT_BASE_URL`].
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Adapter for a custom address (remote host, or wiremock in tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: build_client(Duration::from_secs(120)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            api_key: None,
        }
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Bearer token for daemons behind an authenticating proxy.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Transport-level timeout for every HTTP call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.http = build_client(timeout);
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.post(format!("{}{}", self.base_url, path)))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(format!("{}{}", self.base_url, path)))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn generate_body<'a>(
        &'a self,
        prompt: &'a str,
        options: &GenerateOptions,
        model: Option<&'a str>,
        system_prompt: Option<&'a str>,
        stream: bool,
    ) -> GenerateBody<'a> {
        GenerateBody {
            model: model.unwrap_or(&self.default_model),
            prompt,
            system: system_prompt,
            stream,
            options: OllamaOptions::from(options),
        }
    }

    async fn fetch_tags(&self) -> Result<Vec<String>> {
        let response = self.get("/api/tags").send().await.map_err(network)?;
        let response = check_status(response, None).await?;
        let tags: TagsResponse = response.json().await.map_err(malformed)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> ProviderId {
        PROVIDER
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<GenerateResponse> {
        let body = self.generate_body(prompt, options, model, system_prompt, false);
        let model_name = body.model.to_string();
        let response = self
            .post("/api/generate")
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        let response = check_status(response, Some(&model_name)).await?;
        let reply: GenerateReply = response.json().await.map_err(malformed)?;

        if let Some(error) = reply.error {
            return Err(HeimdallError::GenerationFailed {
                provider: PROVIDER,
                message: error,
            });
        }

        let mut out = GenerateResponse::new(
            reply.response,
            reply.model.unwrap_or(model_name),
            PROVIDER,
        )
        .with_usage(Usage::new(
            reply.prompt_eval_count.unwrap_or(0),
            reply.eval_count.unwrap_or(0),
        ));
        if let Some(reason) = reply.done_reason.as_deref() {
            out.finish_reason = FinishReason::from_vendor(reason);
        }
        if let Some(ns) = reply.total_duration {
            out.metadata
                .insert("total_duration_ns".into(), serde_json::Value::from(ns));
        }
        Ok(out)
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<TextStream> {
        let body = self.generate_body(prompt, options, model, system_prompt, true);
        let model_name = body.model.to_string();
        let response = self
            .post("/api/generate")
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        let response = check_status(response, Some(&model_name)).await?;
        debug!(model = %model_name, "ollama stream opened");
        Ok(ndjson_chunks(response))
    }

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<EmbeddingResponse> {
        let model_name = model.unwrap_or(&self.default_model).to_string();
        let response = self
            .post("/api/embeddings")
            .json(&EmbedBody {
                model: &model_name,
                prompt: text,
            })
            .send()
            .await
            .map_err(network)?;
        let response = check_status(response, Some(&model_name)).await?;
        let reply: EmbedReply = response.json().await.map_err(malformed)?;
        if reply.embedding.is_empty() {
            return Err(HeimdallError::GenerationFailed {
                provider: PROVIDER,
                message: "empty embedding".into(),
            });
        }
        Ok(EmbeddingResponse::new(reply.embedding, model_name, PROVIDER))
    }

    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        match self.fetch_tags().await {
            Ok(_) => HealthCheckResult::healthy(start.elapsed()),
            Err(e) => HealthCheckResult::unhealthy(start.elapsed(), e.to_string()),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.fetch_tags().await
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn network(e: reqwest::Error) -> HeimdallError {
    HeimdallError::Network {
        provider: PROVIDER,
        message: e.to_string(),
    }
}

fn malformed(e: reqwest::Error) -> HeimdallError {
    HeimdallError::GenerationFailed {
        provider: PROVIDER,
        message: format!("malformed response: {e}"),
    }
}

/// Pass successful responses through; map failures onto the taxonomy.
async fn check_status(response: Response, model: Option<&str>) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0);
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorReply>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            HeimdallError::InvalidCredential { provider: PROVIDER }
        }
        StatusCode::NOT_FOUND => HeimdallError::ModelNotFound {
            provider: PROVIDER,
            model: model.unwrap_or("<unknown>").to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => HeimdallError::RateLimitExceeded {
            provider: PROVIDER,
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        code => HeimdallError::GenerationFailed {
            provider: PROVIDER,
            message: format!("HTTP {}: {}", code.as_u16(), detail),
        },
    })
}

// ============================================================================
// Streaming
// ============================================================================

struct NdjsonState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
    finished: bool,
}

/// Turn a streaming `/api/generate` body into text chunks.
///
/// Lines may be split across network reads, so bytes are buffered until a
/// newline arrives. Empty chunks are skipped; `done: true` ends the stream.
fn ndjson_chunks(response: Response) -> TextStream {
    let state = NdjsonState {
        body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        buf: Vec::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            let line = match st.buf.iter().position(|b| *b == b'\n') {
                Some(pos) => Some(st.buf.drain(..=pos).collect::<Vec<u8>>()),
                None => match st.body.next().await {
                    Some(Ok(bytes)) => {
                        st.buf.extend_from_slice(&bytes);
                        None
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(network(e)), st));
                    }
                    None => {
                        st.finished = true;
                        Some(std::mem::take(&mut st.buf))
                    }
                },
            };

            let Some(line) = line else { continue };
            match parse_line(&line) {
                Ok(None) => {}
                Ok(Some((text, done))) => {
                    if done {
                        st.finished = true;
                    }
                    if !text.is_empty() {
                        return Some((Ok(text), st));
                    }
                }
                Err(e) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
            }
        }
    }))
}

fn parse_line(line: &[u8]) -> Result<Option<(String, bool)>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: GenerateReply =
        serde_json::from_slice(line).map_err(|e| HeimdallError::GenerationFailed {
            provider: PROVIDER,
            message: format!("malformed stream chunk: {e}"),
        })?;
    if let Some(error) = chunk.error {
        return Err(HeimdallError::GenerationFailed {
            provider: PROVIDER,
            message: error,
        });
    }
    Ok(Some((chunk.response, chunk.done)))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Default)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
}

impl From<&GenerateOptions> for OllamaOptions {
    fn from(o: &GenerateOptions) -> Self {
        Self {
            temperature: o.temperature,
            top_p: o.top_p,
            top_k: o.top_k,
            num_predict: o.max_tokens,
            stop: o.stop_sequences.clone(),
            seed: o.seed,
            frequency_penalty: o.frequency_penalty,
            presence_penalty: o.presence_penalty,
        }
    }
}

#[derive(Deserialize)]
struct GenerateReply {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct EmbedBody<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedReply {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Deserialize)]
struct ErrorReply {
    error: String,
}
