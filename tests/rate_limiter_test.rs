//! Integration tests for the token-bucket rate limiter.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use heimdall::{
    GenerateRequest, Heimdall, HeimdallError, ProviderId, RateLimitConfig, RateLimiter,
};
use tokio::time::Instant;

use common::{MockAdapter, fast_retry};

fn single(provider: ProviderId, config: RateLimitConfig) -> RateLimiter {
    RateLimiter::with_configs(HashMap::from([(provider, config)]))
}

// ============================================================================
// Admission
// ============================================================================

#[test]
fn five_tokens_no_refill_admits_five_then_never() {
    let rl = single(ProviderId::OpenAi, RateLimitConfig::new(5.0, 0.0));

    for i in 0..5 {
        assert!(
            rl.try_acquire(ProviderId::OpenAi, None).is_ok(),
            "call {i} should be admitted"
        );
    }
    let err = rl.try_acquire(ProviderId::OpenAi, None).unwrap_err();
    assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    assert_eq!(err.retry_after(), None, "no refill means an infinite wait");

    let stats = rl.get_statistics(ProviderId::OpenAi).unwrap();
    assert_eq!(stats.requests, 6);
    assert_eq!(stats.allowed, 5);
    assert_eq!(stats.rejected, 1);
}

#[test]
fn cost_above_capacity_is_never_satisfiable() {
    let rl = single(ProviderId::Anthropic, RateLimitConfig::new(4.0, 100.0));
    assert_eq!(
        rl.get_wait_time(ProviderId::Anthropic, Some(5.0)).unwrap(),
        f64::INFINITY
    );
    assert!(rl.try_acquire(ProviderId::Anthropic, Some(5.0)).is_err());
    assert!(rl.try_acquire(ProviderId::Anthropic, Some(4.0)).is_ok());
}

#[test]
fn non_positive_cost_is_invalid() {
    let rl = RateLimiter::new();
    let err = rl.try_acquire(ProviderId::OpenAi, Some(0.0)).unwrap_err();
    assert!(matches!(err, HeimdallError::InvalidRequest(_)));
    let err = rl.try_acquire(ProviderId::OpenAi, Some(-1.0)).unwrap_err();
    assert!(matches!(err, HeimdallError::InvalidRequest(_)));
}

#[test]
fn custom_cost_debits_that_many_tokens() {
    let rl = single(
        ProviderId::Gemini,
        RateLimitConfig::new(10.0, 0.0).tokens_per_request(3.0),
    );
    rl.try_acquire(ProviderId::Gemini, None).unwrap();
    rl.try_acquire(ProviderId::Gemini, Some(5.0)).unwrap();
    let status = rl.get_status(ProviderId::Gemini).unwrap();
    assert_eq!(status.available_tokens, 2.0);
    assert!(rl.try_acquire(ProviderId::Gemini, None).is_err());
}

#[test]
fn unconfigured_providers_get_builtin_defaults() {
    let rl = RateLimiter::new();
    assert!(!rl.get_config(ProviderId::Ollama).unwrap().enabled);
    let openai = rl.get_config(ProviderId::OpenAi).unwrap();
    assert!(openai.enabled);
    assert_eq!(openai.max_tokens, 60.0);
    assert_eq!(rl.get_all_status().unwrap().len(), ProviderId::ALL.len());
}

#[test]
fn disabled_provider_admits_everything_without_debit() {
    let rl = single(ProviderId::Qwen, RateLimitConfig::new(2.0, 0.0));
    rl.enable_provider(ProviderId::Qwen, false).unwrap();
    for _ in 0..50 {
        rl.try_acquire(ProviderId::Qwen, None).unwrap();
    }
    assert_eq!(rl.get_status(ProviderId::Qwen).unwrap().available_tokens, 2.0);

    rl.enable_provider(ProviderId::Qwen, true).unwrap();
    rl.try_acquire(ProviderId::Qwen, None).unwrap();
    rl.try_acquire(ProviderId::Qwen, None).unwrap();
    assert!(rl.try_acquire(ProviderId::Qwen, None).is_err());
}

// ============================================================================
// Refill
// ============================================================================

#[tokio::test(start_paused = true)]
async fn refill_is_proportional_to_elapsed_time() {
    let rl = single(ProviderId::OpenAi, RateLimitConfig::new(2.0, 1.0));
    rl.try_acquire(ProviderId::OpenAi, None).unwrap();
    rl.try_acquire(ProviderId::OpenAi, None).unwrap();

    let wait = rl.get_wait_time(ProviderId::OpenAi, None).unwrap();
    assert!((wait - 1.0).abs() < 1e-6, "expected ~1s, got {wait}");

    tokio::time::advance(Duration::from_millis(500)).await;
    let wait = rl.get_wait_time(ProviderId::OpenAi, None).unwrap();
    assert!((wait - 0.5).abs() < 1e-6, "expected ~0.5s, got {wait}");
    assert!(!rl.check_available(ProviderId::OpenAi, None).unwrap());

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(rl.check_available(ProviderId::OpenAi, None).unwrap());

    // Long idle never overfills.
    tokio::time::advance(Duration::from_secs(3600)).await;
    let status = rl.get_status(ProviderId::OpenAi).unwrap();
    assert_eq!(status.available_tokens, 2.0);
}

#[tokio::test(start_paused = true)]
async fn reset_bucket_restores_capacity() {
    let rl = single(ProviderId::Gemini, RateLimitConfig::new(3.0, 0.01));
    for _ in 0..3 {
        rl.try_acquire(ProviderId::Gemini, None).unwrap();
    }
    assert!(rl.try_acquire(ProviderId::Gemini, None).is_err());
    rl.reset_bucket(ProviderId::Gemini).unwrap();
    assert_eq!(rl.get_status(ProviderId::Gemini).unwrap().available_tokens, 3.0);
}

// ============================================================================
// Waiting acquire
// ============================================================================

#[tokio::test(start_paused = true)]
async fn waiting_acquire_sleeps_for_the_deficit() {
    let rl = single(ProviderId::Anthropic, RateLimitConfig::new(1.0, 10.0));
    rl.try_acquire(ProviderId::Anthropic, None).unwrap();

    let started = Instant::now();
    rl.acquire(ProviderId::Anthropic, None, true, Duration::from_secs(1))
        .await
        .unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
    assert!(waited < Duration::from_millis(200), "waited {waited:?}");

    let stats = rl.get_statistics(ProviderId::Anthropic).unwrap();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.allowed, 2);
}

#[tokio::test(start_paused = true)]
async fn waiting_acquire_gives_up_beyond_max_wait() {
    let rl = single(ProviderId::Anthropic, RateLimitConfig::new(1.0, 0.5));
    rl.try_acquire(ProviderId::Anthropic, None).unwrap();

    let err = rl
        .acquire(ProviderId::Anthropic, None, true, Duration::from_secs(1))
        .await
        .unwrap_err();
    let retry_after = err.retry_after().unwrap();
    assert!(retry_after > Duration::from_secs(1));

    let stats = rl.get_statistics(ProviderId::Anthropic).unwrap();
    assert_eq!(stats.rejected, 1, "a waited-out rejection counts once");
    assert_eq!(stats.requests, stats.allowed + stats.rejected);
}

#[tokio::test(start_paused = true)]
async fn unbounded_max_wait_is_accepted() {
    let rl = single(ProviderId::OpenAi, RateLimitConfig::new(1.0, 10.0));
    rl.acquire(ProviderId::OpenAi, None, false, Duration::MAX)
        .await
        .unwrap();

    let started = Instant::now();
    rl.acquire(ProviderId::OpenAi, None, true, Duration::MAX)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(rl.get_statistics(ProviderId::OpenAi).unwrap().allowed, 2);
}

#[tokio::test(start_paused = true)]
async fn tiny_refill_rate_yields_unrepresentable_retry_after() {
    let rl = single(ProviderId::Qwen, RateLimitConfig::new(1.0, 1e-30));
    rl.try_acquire(ProviderId::Qwen, None).unwrap();

    let err = rl.try_acquire(ProviderId::Qwen, None).unwrap_err();
    match err {
        HeimdallError::RateLimitExceeded { retry_after, .. } => assert!(retry_after > 1e29),
        ref other => panic!("expected RateLimitExceeded, got {other:?}"),
    }
    assert_eq!(err.retry_after(), None);
    assert_eq!(err.retry_hint(), Some(Duration::MAX));

    let err = rl
        .acquire(ProviderId::Qwen, None, true, Duration::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, HeimdallError::RateLimitExceeded { .. }));
}

#[tokio::test(start_paused = true)]
async fn switcher_waits_on_limiter_with_unbounded_budget() {
    let openai = MockAdapter::replying(ProviderId::OpenAi, "hello");
    let gateway = Heimdall::builder()
        .adapter(openai.clone())
        .rate_limit(ProviderId::OpenAi, RateLimitConfig::new(1.0, 10.0))
        .retry(fast_retry(1).rate_limit_wait(true, Duration::MAX))
        .build()
        .unwrap();

    let request = GenerateRequest::new("hi");
    gateway.generate_with_cache(&request, false).await.unwrap();
    gateway.generate_with_cache(&request, false).await.unwrap();
    assert_eq!(openai.calls(), 2);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_overspend() {
    let rl = Arc::new(single(ProviderId::OpenAi, RateLimitConfig::new(20.0, 0.0)));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move { rl.try_acquire(ProviderId::OpenAi, None).is_ok() })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);

    let stats = rl.get_statistics(ProviderId::OpenAi).unwrap();
    assert_eq!(stats.requests, 100);
    assert_eq!(stats.allowed, 20);
    assert_eq!(stats.rejected, 80);
    assert_eq!(rl.get_status(ProviderId::OpenAi).unwrap().available_tokens, 0.0);
}

#[test]
fn reset_statistics_zeroes_counters() {
    let rl = single(ProviderId::OpenAi, RateLimitConfig::new(1.0, 0.0));
    rl.try_acquire(ProviderId::OpenAi, None).unwrap();
    let _ = rl.try_acquire(ProviderId::OpenAi, None);
    rl.try_acquire(ProviderId::Ollama, None).unwrap();

    rl.reset_statistics(Some(ProviderId::OpenAi)).unwrap();
    assert_eq!(rl.get_statistics(ProviderId::OpenAi).unwrap().requests, 0);
    assert_eq!(rl.get_statistics(ProviderId::Ollama).unwrap().requests, 1);

    rl.reset_statistics(None).unwrap();
    let all = rl.get_all_statistics().unwrap();
    assert!(all.values().all(|s| s.requests == 0));
}

// ============================================================================
// Switcher integration
// ============================================================================

#[tokio::test]
async fn local_rejection_is_not_retried_and_surfaces_unchanged() {
    let openai = MockAdapter::replying(ProviderId::OpenAi, "hello");
    let gateway = Heimdall::builder()
        .adapter(openai.clone())
        .rate_limit(ProviderId::OpenAi, RateLimitConfig::new(1.0, 0.0))
        .retry(fast_retry(3))
        .build()
        .unwrap();

    let request = GenerateRequest::new("hi");
    gateway.generate_with_cache(&request, false).await.unwrap();
    let err = gateway
        .generate_with_cache(&request, false)
        .await
        .unwrap_err();

    assert!(matches!(err, HeimdallError::RateLimitExceeded { .. }));
    assert_eq!(openai.calls(), 1, "rejected requests never reach the adapter");
}

#[tokio::test]
async fn local_rejection_fails_over_to_fallback() {
    let openai = MockAdapter::replying(ProviderId::OpenAi, "from openai");
    let ollama = MockAdapter::replying(ProviderId::Ollama, "from ollama");
    let gateway = Heimdall::builder()
        .adapter(openai.clone())
        .adapter(ollama.clone())
        .default_provider(ProviderId::OpenAi)
        .fallback_provider(ProviderId::Ollama)
        .rate_limit(ProviderId::OpenAi, RateLimitConfig::new(1.0, 0.0))
        .retry(fast_retry(3))
        .build()
        .unwrap();

    let request = GenerateRequest::new("hi");
    let first = gateway.generate_with_cache(&request, false).await.unwrap();
    assert_eq!(first.provider, ProviderId::OpenAi);

    let second = gateway.generate_with_cache(&request, false).await.unwrap();
    assert_eq!(second.provider, ProviderId::Ollama);
    assert_eq!(second.content, "from ollama");
    assert_eq!(openai.calls(), 1);
}

#[tokio::test]
async fn disabling_rate_limiting_bypasses_buckets() {
    let openai = MockAdapter::replying(ProviderId::OpenAi, "ok");
    let gateway = Heimdall::builder()
        .adapter(openai.clone())
        .rate_limit(ProviderId::OpenAi, RateLimitConfig::new(1.0, 0.0))
        .disable_rate_limiting()
        .build()
        .unwrap();

    for _ in 0..5 {
        gateway
            .generate_with_cache(&GenerateRequest::new("hi"), false)
            .await
            .unwrap();
    }
    assert_eq!(openai.calls(), 5);
}
