//! Gateway routing and the chat-completion client against a fake gateway.

mod support;

use std::sync::Arc;

use llm_relay::config::{Config, GenerationConfig};
use llm_relay::error::ProviderError;
use llm_relay::provider::{Attachment, CompletionRequest, GenerationParams, ProviderId};
use llm_relay::router::{BindingReason, CredentialSource, ModelRouter, ModelSpec, StaticCredentials};
use llm_relay_core::models::ChatMessage;

use support::{FakeGateway, Reply, PRIMARY_PATH, SECONDARY_PATH};

fn config(gateway: &FakeGateway) -> Config {
    let mut cfg = Config::minimal();
    cfg.providers.primary.base_url = gateway.primary_url();
    cfg.providers.primary.api_key = Some("sk-primary".to_string());
    cfg.providers.secondary.base_url = gateway.secondary_url();
    cfg.generation.timeout_secs = 5;
    cfg
}

fn router(cfg: &Config, creds: StaticCredentials, loaded: bool) -> ModelRouter {
    let creds: Arc<dyn CredentialSource> = Arc::new(creds);
    ModelRouter::new(cfg, creds, loaded).unwrap()
}

fn request(model: &str, text: &str) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::system("be brief"), ChatMessage::user(text)],
        params: GenerationParams::from_config(&GenerationConfig::default()),
        attachments: Vec::new(),
        tools: Vec::new(),
    }
}

fn pdf_attachment() -> Attachment {
    Attachment {
        filename: "report.pdf".to_string(),
        bytes: b"%PDF-1.4 fake".to_vec(),
        mime_type: "application/pdf".to_string(),
    }
}

// ─── Routing ────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_secondary_credential_binds_primary() {
    let gw = FakeGateway::start(Reply::text("ok")).await;
    let r = router(&config(&gw), StaticCredentials::new(), true);

    let b = r.route(&ModelSpec::text("gpt-4"));
    assert_eq!(b.provider_id, ProviderId::PrimaryGateway);
    assert_eq!(b.reason, BindingReason::MissingCredentials);
    assert_eq!(b.resolved_model, "gpt-4");
}

#[tokio::test]
async fn routing_is_deterministic() {
    let gw = FakeGateway::start(Reply::text("ok")).await;
    let cfg = config(&gw);
    for (creds, loaded) in [
        (StaticCredentials::new(), true),
        (StaticCredentials::new().with("OPENAI_API_KEY", "sk-x"), true),
        (StaticCredentials::new().with("OPENAI_API_KEY", "sk-x"), false),
    ] {
        let r = router(&cfg, creds, loaded);
        for name in ["gpt-4", "google/gemini-2.5-flash", "o1-mini", "mistral-large"] {
            let spec = ModelSpec::text(name);
            assert_eq!(r.route(&spec), r.route(&spec), "{}", name);
        }
    }
}

#[tokio::test]
async fn unavailable_secondary_always_falls_back_to_primary() {
    let gw = FakeGateway::start(Reply::text("ok")).await;
    let cfg = config(&gw);

    let unloaded = router(&cfg, StaticCredentials::new().with("OPENAI_API_KEY", "sk-x"), false);
    let b = unloaded.route(&ModelSpec::text("gpt-4"));
    assert_eq!(b.provider_id, ProviderId::PrimaryGateway);
    assert_eq!(b.reason, BindingReason::ProviderUnavailable);

    let keyed = router(&cfg, StaticCredentials::new().with("OPENAI_API_KEY", "sk-x"), true);
    let b = keyed.route(&ModelSpec::text("O1-Preview"));
    assert_eq!(b.provider_id, ProviderId::PrimaryGateway);
    assert_eq!(b.reason, BindingReason::ConstructionError);
}

#[tokio::test]
async fn secondary_binding_calls_secondary_with_its_key() {
    let gw = FakeGateway::start(Reply::text("from secondary")).await;
    let r = router(
        &config(&gw),
        StaticCredentials::new().with("OPENAI_API_KEY", "sk-secondary"),
        true,
    );

    let (binding, provider) = r.bind(&ModelSpec::text("gpt-4o"));
    assert_eq!(binding.provider_id, ProviderId::SecondaryGateway);
    assert_eq!(binding.reason, BindingReason::DirectMatch);

    let completion = provider.call(&request("gpt-4o", "hi")).await.unwrap();
    assert_eq!(completion.text, "from secondary");

    let sent = gw.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].path, SECONDARY_PATH);
    assert_eq!(sent[0].authorization.as_deref(), Some("Bearer sk-secondary"));
    assert_eq!(sent[0].title, None);
}

#[tokio::test]
async fn marker_models_go_to_primary_even_with_secondary_key() {
    let gw = FakeGateway::start(Reply::text("from primary")).await;
    let r = router(
        &config(&gw),
        StaticCredentials::new().with("OPENAI_API_KEY", "sk-secondary"),
        true,
    );

    let (binding, provider) = r.bind(&ModelSpec::text("google/gemini-2.5-flash"));
    assert_eq!(binding.provider_id, ProviderId::PrimaryGateway);
    assert_eq!(binding.reason, BindingReason::DirectMatch);

    provider
        .call(&request("google/gemini-2.5-flash", "hi"))
        .await
        .unwrap();
    let sent = &gw.requests()[0];
    assert_eq!(sent.path, PRIMARY_PATH);
    assert_eq!(sent.authorization.as_deref(), Some("Bearer sk-primary"));
    assert_eq!(sent.title.as_deref(), Some("llm-relay"));
}

// ─── Wire format and parsing ────────────────────────────────────────

#[tokio::test]
async fn request_body_carries_generation_params() {
    let gw = FakeGateway::start(Reply::text("four")).await;
    let mut cfg = config(&gw);
    cfg.generation.stop = vec!["\n\n".to_string()];
    let r = router(&cfg, StaticCredentials::new(), true);
    let (_, provider) = r.bind(&ModelSpec::text("google/gemini-2.5-flash"));

    let mut req = request("google/gemini-2.5-flash", "What is 2+2?");
    req.params = GenerationParams::from_config(&cfg.generation);
    let c = provider.call(&req).await.unwrap();
    assert_eq!(c.text, "four");
    assert!(c.tools_used.is_empty());

    let body = &gw.requests()[0].body;
    assert_eq!(body["model"], "google/gemini-2.5-flash");
    assert_eq!(body["max_tokens"], 1500);
    assert_eq!(body["stop"][0], "\n\n");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "What is 2+2?");
    assert!(body.get("attachments").is_none());
    assert!(body.get("plugins").is_none());
    assert!(body.get("stream").is_none());
}

#[tokio::test]
async fn tool_calls_are_reported() {
    let gw = FakeGateway::start(Reply::Tools(
        "done".to_string(),
        vec!["web_search".to_string(), "calculator".to_string()],
    ))
    .await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::text("any"));

    let c = provider.call(&request("any", "hi")).await.unwrap();
    assert_eq!(c.tools_used, vec!["web_search", "calculator"]);
}

#[tokio::test]
async fn malformed_payload_is_malformed_error() {
    let gw = FakeGateway::start(Reply::Malformed).await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::text("any"));

    let err = provider.call(&request("any", "hi")).await.unwrap_err();
    assert_eq!(err.kind(), "malformed");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unreachable_gateway_is_transport_error() {
    let mut cfg = Config::minimal();
    cfg.providers.primary.base_url = support::dead_url(PRIMARY_PATH);
    cfg.generation.timeout_secs = 2;
    let r = router(&cfg, StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::text("any"));

    let err = provider.call(&request("any", "hi")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Transport(_)), "{:?}", err);
    assert!(err.user_message().starts_with("Error: "));
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_client_matches_async_client() {
    let gw = FakeGateway::start(Reply::text("same answer")).await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::text("google/x"));
    let req = request("google/x", "hi");

    let a = provider.call(&req).await.unwrap();
    let b = provider.call_blocking(&req).await.unwrap();
    assert_eq!(a.text, b.text);

    let sent = gw.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body, sent[1].body);
    assert_eq!(sent[1].authorization.as_deref(), Some("Bearer sk-primary"));
}

// ─── File calls ─────────────────────────────────────────────────────

#[tokio::test]
async fn file_call_sends_attachments_and_plugin() {
    let gw = FakeGateway::start(Reply::text("a report")).await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::file("google/gemma-3-27b-it"));

    let c = provider
        .call_with_files(&request("google/gemma-3-27b-it", "summarise"), vec![pdf_attachment()])
        .await
        .unwrap();
    assert_eq!(c.model, "google/gemma-3-27b-it");

    let body = &gw.requests()[0].body;
    assert_eq!(body["attachments"][0]["name"], "report.pdf");
    assert_eq!(body["attachments"][0]["mime_type"], "application/pdf");
    assert_eq!(body["plugins"][0]["id"], "file-parser");
    assert_eq!(body["plugins"][0]["pdf"]["engine"], "pdf-text");
}

#[tokio::test]
async fn file_call_retries_once_with_fallback_model() {
    let gw = FakeGateway::start(Reply::text("fallback answer")).await;
    gw.push(Reply::Status(502));
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::file("google/gemma-3-27b-it"));

    let c = provider
        .call_with_files(&request("google/gemma-3-27b-it", "summarise"), vec![pdf_attachment()])
        .await
        .unwrap();
    assert_eq!(c.text, "fallback answer");
    assert_eq!(c.model, "openchat/openchat-3.5-1210");

    let models: Vec<String> = gw.requests().iter().map(|r| r.model().to_string()).collect();
    assert_eq!(models, vec!["google/gemma-3-27b-it", "openchat/openchat-3.5-1210"]);
}

#[tokio::test]
async fn file_call_gives_up_after_fallback_fails() {
    let gw = FakeGateway::start(Reply::Status(503)).await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::file("google/gemma-3-27b-it"));

    let err = provider
        .call_with_files(&request("google/gemma-3-27b-it", "x"), vec![pdf_attachment()])
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Status { status: 503, .. }));
    assert_eq!(gw.request_count(), 2);
}

#[tokio::test]
async fn secondary_rejects_attachments() {
    let gw = FakeGateway::start(Reply::text("ok")).await;
    let r = router(
        &config(&gw),
        StaticCredentials::new().with("OPENAI_API_KEY", "sk-x"),
        true,
    );
    let (binding, provider) = r.bind(&ModelSpec::file("gpt-4o"));
    assert_eq!(binding.provider_id, ProviderId::SecondaryGateway);
    assert!(!provider.supports_files());

    let err = provider
        .call_with_files(&request("gpt-4o", "x"), vec![pdf_attachment()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(!err.is_retryable());
    assert_eq!(gw.request_count(), 0);
}

// ─── Streaming ──────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_yields_deltas_in_order() {
    let gw = FakeGateway::start(Reply::Stream(vec![
        "The ".to_string(),
        "answer ".to_string(),
        "is 4.".to_string(),
    ]))
    .await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::text("any"));

    let mut rx = provider.call_streaming(&request("any", "2+2?")).await.unwrap();
    let mut text = String::new();
    while let Some(delta) = rx.recv().await {
        text.push_str(&delta.unwrap());
    }
    assert_eq!(text, "The answer is 4.");
    assert_eq!(gw.requests()[0].body["stream"], true);
}

#[tokio::test]
async fn streaming_error_status_fails_before_streaming() {
    let gw = FakeGateway::start(Reply::Status(429)).await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::text("any"));

    let err = provider
        .call_streaming(&request("any", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Status { status: 429, .. }));
}

#[tokio::test]
async fn streaming_rejects_attachments() {
    let gw = FakeGateway::start(Reply::text("ok")).await;
    let r = router(&config(&gw), StaticCredentials::new(), false);
    let (_, provider) = r.bind(&ModelSpec::file("any"));

    let mut req = request("any", "x");
    req.attachments.push(pdf_attachment());
    let err = provider.call_streaming(&req).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
}
