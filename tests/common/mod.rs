//! Shared test doubles.
//!
//! [`MockAdapter`] replays a script of outcomes, one per call, and records
//! what it was asked so tests can assert on call counts and on the exact
//! request context each attempt saw.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use heimdall::{
    EmbeddingResponse, GenerateOptions, GenerateResponse, HealthCheckResult, HeimdallError,
    ProviderAdapter, ProviderId, Result, RetryConfig, TextStream, Usage,
};

/// What the adapter does on one call.
#[derive(Clone)]
pub enum Outcome {
    Reply(&'static str),
    Fail(fn(ProviderId) -> HeimdallError),
    /// Sleep for this long, then reply.
    Hang(Duration),
}

/// One observed generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub prompt: String,
    pub options: GenerateOptions,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

pub struct MockAdapter {
    id: ProviderId,
    script: Mutex<VecDeque<Outcome>>,
    /// Used once the script runs out.
    fallback: Outcome,
    calls: AtomicU32,
    seen: Mutex<Vec<Seen>>,
    healthy: AtomicBool,
    panic_on_health: AtomicBool,
    health_checks: AtomicU32,
}

impl MockAdapter {
    /// Always replies with `text`.
    pub fn replying(id: ProviderId, text: &'static str) -> Arc<Self> {
        Arc::new(Self::new(id, Vec::new(), Outcome::Reply(text)))
    }

    /// Always fails with `error`.
    pub fn failing(id: ProviderId, error: fn(ProviderId) -> HeimdallError) -> Arc<Self> {
        Arc::new(Self::new(id, Vec::new(), Outcome::Fail(error)))
    }

    /// Plays `script` in order, then `then` forever.
    pub fn scripted(id: ProviderId, script: Vec<Outcome>, then: Outcome) -> Arc<Self> {
        Arc::new(Self::new(id, script, then))
    }

    fn new(id: ProviderId, script: Vec<Outcome>, fallback: Outcome) -> Self {
        Self {
            id,
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            panic_on_health: AtomicBool::new(false),
            health_checks: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn panic_on_health(&self) {
        self.panic_on_health.store(true, Ordering::SeqCst);
    }

    pub fn health_checks(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }

    async fn next(&self) -> Result<&'static str> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match outcome {
            Outcome::Reply(text) => Ok(text),
            Outcome::Fail(error) => Err(error(self.id)),
            Outcome::Hang(d) => {
                tokio::time::sleep(d).await;
                Ok("late")
            }
        }
    }

    fn observe(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) {
        self.seen.lock().unwrap().push(Seen {
            prompt: prompt.to_string(),
            options: options.clone(),
            model: model.map(str::to_string),
            system_prompt: system_prompt.map(str::to_string),
        });
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<GenerateResponse> {
        self.observe(prompt, options, model, system_prompt);
        let text = self.next().await?;
        Ok(
            GenerateResponse::new(text, model.unwrap_or("mock-model"), self.id)
                .with_usage(Usage::new(3, 5)),
        )
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<TextStream> {
        self.observe(prompt, options, model, system_prompt);
        let text = self.next().await?;
        let chunks: Vec<Result<String>> = text
            .split_inclusive(' ')
            .map(|c| Ok(c.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<EmbeddingResponse> {
        self.next().await?;
        Ok(EmbeddingResponse::new(
            vec![text.len() as f32, 0.5],
            model.unwrap_or("mock-embed"),
            self.id,
        ))
    }

    async fn health_check(&self) -> HealthCheckResult {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_health.load(Ordering::SeqCst) {
            panic!("probe exploded");
        }
        if self.healthy.load(Ordering::SeqCst) {
            HealthCheckResult::healthy(Duration::from_millis(2))
        } else {
            HealthCheckResult::unhealthy(Duration::from_millis(2), "backend down")
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["mock-model".to_string()])
    }
}

// ============================================================================
// Error constructors
// ============================================================================

pub fn network(provider: ProviderId) -> HeimdallError {
    HeimdallError::Network {
        provider,
        message: "connection reset".into(),
    }
}

pub fn bad_key(provider: ProviderId) -> HeimdallError {
    HeimdallError::InvalidCredential { provider }
}

pub fn upstream_429(provider: ProviderId) -> HeimdallError {
    HeimdallError::RateLimitExceeded {
        provider,
        retry_after: 5.0,
    }
}

/// Backend 429 whose retry-after is far beyond any representable delay.
pub fn upstream_429_huge(provider: ProviderId) -> HeimdallError {
    HeimdallError::RateLimitExceeded {
        provider,
        retry_after: 1e30,
    }
}

/// Retry policy with millisecond backoff so tests run fast on a real clock.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::new()
        .max_retries(max_retries)
        .backoff_unit(Duration::from_millis(1))
        .max_delay(Duration::from_millis(20))
}
