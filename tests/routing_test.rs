//! Tests for active/fallback routing control.

mod common;

use std::sync::Arc;
use std::time::Duration;

use heimdall::{Gateway, GenerateRequest, HealthConfig, Heimdall, HeimdallError, ProviderId};

use common::{MockAdapter, fast_retry};

/// OpenAI active, Ollama fallback, Anthropic enabled but idle.
fn three_providers() -> (Gateway, Arc<MockAdapter>, Arc<MockAdapter>) {
    let openai = MockAdapter::replying(ProviderId::OpenAi, "openai");
    let anthropic = MockAdapter::replying(ProviderId::Anthropic, "anthropic");
    let ollama = MockAdapter::replying(ProviderId::Ollama, "ollama");
    let gateway = Heimdall::builder()
        .adapter(openai.clone())
        .adapter(anthropic.clone())
        .adapter(ollama)
        .default_provider(ProviderId::OpenAi)
        .fallback_provider(ProviderId::Ollama)
        .retry(fast_retry(1))
        .build()
        .unwrap();
    (gateway, openai, anthropic)
}

#[test]
fn builder_defaults_to_first_enabled_provider() {
    let gateway = Heimdall::builder()
        .adapter(MockAdapter::replying(ProviderId::Gemini, ""))
        .adapter(MockAdapter::replying(ProviderId::OpenAi, ""))
        .build()
        .unwrap();
    let routing = gateway.switcher().routing().unwrap();
    assert_eq!(routing.current, ProviderId::OpenAi);
    assert_eq!(routing.fallback, None);
    assert_eq!(routing.enabled, vec![ProviderId::OpenAi, ProviderId::Gemini]);
}

#[test]
fn builder_rejects_unusable_configurations() {
    assert!(Heimdall::builder().build().is_err());
    assert!(
        Heimdall::builder()
            .adapter(MockAdapter::replying(ProviderId::OpenAi, ""))
            .default_provider(ProviderId::Gemini)
            .build()
            .is_err()
    );
    assert!(
        Heimdall::builder()
            .adapter(MockAdapter::replying(ProviderId::OpenAi, ""))
            .enabled_providers([ProviderId::OpenAi, ProviderId::Qwen])
            .build()
            .is_err()
    );
    assert!(
        Heimdall::builder()
            .adapter(MockAdapter::replying(ProviderId::OpenAi, ""))
            .health(HealthConfig::new().interval(Duration::ZERO))
            .build()
            .is_err()
    );
}

#[tokio::test]
async fn switch_changes_serving_provider() {
    let (gateway, openai, anthropic) = three_providers();

    gateway.switcher().switch_method(ProviderId::Anthropic).unwrap();
    assert_eq!(
        gateway.switcher().get_current_method().unwrap(),
        ProviderId::Anthropic
    );
    let response = gateway
        .generate_with_cache(&GenerateRequest::new("hi"), false)
        .await
        .unwrap();
    assert_eq!(response.provider, ProviderId::Anthropic);
    assert_eq!(anthropic.calls(), 1);
    assert_eq!(openai.calls(), 0);
}

#[test]
fn switching_to_a_disabled_provider_fails() {
    let (gateway, _, _) = three_providers();
    assert!(gateway.switcher().switch_method(ProviderId::Gemini).is_err());
    assert_eq!(
        gateway.switcher().get_current_method().unwrap(),
        ProviderId::OpenAi
    );
}

#[test]
fn active_and_fallback_providers_cannot_be_deactivated() {
    let (gateway, _, _) = three_providers();
    let switcher = gateway.switcher();

    let err = switcher.deactivate_provider(ProviderId::OpenAi).unwrap_err();
    assert!(matches!(
        err,
        HeimdallError::ProviderInUse {
            provider: ProviderId::OpenAi,
            role: "active"
        }
    ));
    let err = switcher.deactivate_provider(ProviderId::Ollama).unwrap_err();
    assert!(matches!(err, HeimdallError::ProviderInUse { role: "fallback", .. }));
    assert_eq!(switcher.enabled_providers().unwrap().len(), 3);

    // Once something else is active, the old one can go.
    switcher.switch_method(ProviderId::Anthropic).unwrap();
    switcher.deactivate_provider(ProviderId::OpenAi).unwrap();
    assert!(!switcher.enabled_providers().unwrap().contains(&ProviderId::OpenAi));
    assert!(switcher.switch_method(ProviderId::OpenAi).is_err());

    switcher.activate_provider(ProviderId::OpenAi).unwrap();
    switcher.switch_method(ProviderId::OpenAi).unwrap();
}

#[test]
fn fallback_can_be_cleared_and_reassigned() {
    let (gateway, _, _) = three_providers();
    let switcher = gateway.switcher();

    switcher.set_fallback_provider(None).unwrap();
    assert_eq!(switcher.get_fallback_provider().unwrap(), None);
    switcher.deactivate_provider(ProviderId::Ollama).unwrap();

    assert!(switcher.set_fallback_provider(Some(ProviderId::Ollama)).is_err());
    switcher
        .set_fallback_provider(Some(ProviderId::Anthropic))
        .unwrap();
    assert_eq!(
        switcher.get_fallback_provider().unwrap(),
        Some(ProviderId::Anthropic)
    );
}

#[test]
fn activating_a_provider_without_adapter_fails() {
    let (gateway, _, _) = three_providers();
    assert!(gateway.switcher().activate_provider(ProviderId::Qwen).is_err());
}

#[tokio::test]
async fn validated_switch_rejects_unhealthy_target() {
    let (gateway, _, anthropic) = three_providers();
    anthropic.set_healthy(false);

    let err = gateway
        .switcher()
        .switch_method_validated(ProviderId::Anthropic)
        .await
        .unwrap_err();
    match err {
        HeimdallError::ProviderUnhealthy { provider, reason } => {
            assert_eq!(provider, ProviderId::Anthropic);
            assert_eq!(reason, "backend down");
        }
        other => panic!("expected ProviderUnhealthy, got {other:?}"),
    }
    assert_eq!(
        gateway.switcher().get_current_method().unwrap(),
        ProviderId::OpenAi
    );

    anthropic.set_healthy(true);
    gateway
        .switcher()
        .switch_method_validated(ProviderId::Anthropic)
        .await
        .unwrap();
    assert_eq!(
        gateway.switcher().get_current_method().unwrap(),
        ProviderId::Anthropic
    );
    assert_eq!(anthropic.health_checks(), 2);
}

#[tokio::test]
async fn list_models_asks_the_named_provider() {
    let (gateway, _, _) = three_providers();
    assert_eq!(
        gateway.list_models(ProviderId::Anthropic).await.unwrap(),
        vec!["mock-model".to_string()]
    );
    assert!(gateway.list_models(ProviderId::Qwen).await.is_err());
}
