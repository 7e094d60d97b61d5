use super::external::{build_body, build_headers, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use super::template::{PathExpr, ResponseMapping};
use super::*;
use crate::catalog::{Capability, ExternalModel, InternalModel};
use crate::http::create_client_with_timeout;
use crate::secrets::{CredentialCipher, NoCredentialKey};
use mockito::Matcher;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

fn cipher() -> CredentialCipher {
    CredentialCipher::new([7u8; 32])
}

fn dispatcher(base_url: &str) -> ProviderDispatcher {
    ProviderDispatcher::new(
        create_client_with_timeout(Duration::from_secs(5)).unwrap(),
        InternalProvider {
            base_url: base_url.to_string(),
            api_key: Some("sk-internal".to_string()),
        },
        Arc::new(cipher()),
    )
}

fn internal_model() -> ModelDescriptor {
    ModelDescriptor::Internal(InternalModel {
        id: "im-1".to_string(),
        slug: "small".to_string(),
        upstream_model: "gpt-4o-mini-2024-07-18".to_string(),
        prompt_price_per_1k: 0.01,
        completion_price_per_1k: 0.03,
        markup_percent: 20.0,
        capabilities: vec![Capability::Chat, Capability::Embed],
        context_window: 128_000,
        active: true,
    })
}

fn external_model(endpoint: String) -> ExternalModel {
    ExternalModel {
        id: "em-1".to_string(),
        owner_id: "caller-1".to_string(),
        model_name: "my-llama".to_string(),
        endpoint_url: endpoint,
        credential: cipher().encrypt("sk-byom").unwrap(),
        prompt_price_per_1k: 0.002,
        completion_price_per_1k: 0.004,
        request_template: None,
        response_mapping: None,
        custom_headers: BTreeMap::new(),
        capabilities: vec![Capability::Chat, Capability::Embed],
        active: true,
    }
}

fn chat(temperature: Option<f64>, max_tokens: Option<u32>) -> DispatchRequest {
    DispatchRequest::Chat {
        messages: vec![json!({"role": "user", "content": "hi"})],
        temperature,
        max_tokens,
    }
}

#[tokio::test]
async fn internal_chat_forwards_fields_and_rewrites_model() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-internal")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini-2024-07-18",
            "user": "caller-1",
            "temperature": 0.2,
            "max_tokens": 64
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": "gpt-4o-mini-2024-07-18",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let result = dispatcher(&server.url())
        .dispatch(&internal_model(), "small", "caller-1", &chat(Some(0.2), Some(64)))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(result.usage, TokenUsage::new(100, 50));
    assert_eq!(result.body["model"], "small");
    assert_eq!(result.body["choices"][0]["message"]["content"], "hello");
}

#[tokio::test]
async fn internal_embedding_has_no_completion_tokens() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/embeddings")
        .match_body(Matcher::PartialJson(json!({"input": ["a", "b"]})))
        .with_status(200)
        .with_body(
            json!({
                "object": "list",
                "data": [{"embedding": [0.1, 0.2], "index": 0}],
                "usage": {"prompt_tokens": 8, "completion_tokens": 3, "total_tokens": 11}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let result = dispatcher(&server.url())
        .dispatch(
            &internal_model(),
            "small",
            "caller-1",
            &DispatchRequest::Embed { input: json!(["a", "b"]) },
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(result.usage, TokenUsage::new(8, 0));
}

#[tokio::test]
async fn upstream_error_status_is_a_dispatch_failure() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body("model overloaded")
        .create_async()
        .await;

    let err = dispatcher(&server.url())
        .dispatch(&internal_model(), "small", "caller-1", &chat(None, None))
        .await
        .unwrap_err();

    assert_eq!(err.kind, DispatchErrorKind::Status(503));
    assert!(err.message.contains("model overloaded"));
}

#[tokio::test]
async fn non_json_body_is_invalid_response() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body("<html>gateway</html>")
        .create_async()
        .await;

    let err = dispatcher(&server.url())
        .dispatch(&internal_model(), "small", "caller-1", &chat(None, None))
        .await
        .unwrap_err();

    assert_eq!(err.kind, DispatchErrorKind::InvalidResponse);
}

#[tokio::test]
async fn unreachable_provider_is_transport_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = dispatcher(&format!("http://{}", addr))
        .dispatch(&internal_model(), "small", "caller-1", &chat(None, None))
        .await
        .unwrap_err();

    assert_eq!(err.kind, DispatchErrorKind::Transport);
}

#[tokio::test]
async fn silent_provider_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let dispatcher = ProviderDispatcher::new(
        create_client_with_timeout(Duration::from_millis(200)).unwrap(),
        InternalProvider {
            base_url: format!("http://{}", addr),
            api_key: None,
        },
        Arc::new(NoCredentialKey),
    );

    let err = dispatcher
        .dispatch(&internal_model(), "small", "caller-1", &chat(None, None))
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
    holder.abort();
}

#[tokio::test]
async fn external_call_uses_template_credential_and_mapping() {
    let mut server = mockito::Server::new_async().await;
    let mut model = external_model(format!("{}/generate", server.url()));
    model.request_template = Some(
        serde_json::from_value(json!({"stream": false, "options": {"top_k": 40}, "max_tokens": 256}))
            .unwrap(),
    );
    model.response_mapping = Some(
        serde_json::from_value(json!({
            "id": "meta.requestId",
            "choices": "result.choices",
            "usage": "result.tokenCounts"
        }))
        .unwrap(),
    );
    model.custom_headers = BTreeMap::from([
        ("x-team".to_string(), "search".to_string()),
        ("Authorization".to_string(), "Bearer hijacked".to_string()),
    ]);

    let mock = server
        .mock("POST", "/generate")
        .match_header("authorization", "Bearer sk-byom")
        .match_header("content-type", "application/json")
        .match_header("x-team", "search")
        .match_body(Matcher::Json(json!({
            "stream": false,
            "options": {"top_k": 40},
            "model": "my-llama",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": DEFAULT_TEMPERATURE,
            "max_tokens": 256
        })))
        .with_status(200)
        .with_body(
            json!({
                "meta": {"requestId": "r-42"},
                "result": {
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "yo"}}],
                    "tokenCounts": {"promptTokens": 12, "completionTokens": 4}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let result = dispatcher("http://unused")
        .dispatch(&ModelDescriptor::External(model), "my-llama", "caller-1", &chat(None, None))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(result.usage, TokenUsage::new(12, 4));
    assert_eq!(result.body["id"], "r-42");
    assert_eq!(result.body["object"], "chat.completion");
    assert_eq!(result.body["model"], "my-llama");
    assert_eq!(result.body["choices"][0]["message"]["content"], "yo");
    assert_eq!(result.body["usage"]["total_tokens"], 16);
    assert!(result.body["created"].is_i64());
}

#[tokio::test]
async fn mapped_usage_path_missing_defaults_to_zero() {
    let mut server = mockito::Server::new_async().await;
    let mut model = external_model(format!("{}/generate", server.url()));
    model.response_mapping = Some(ResponseMapping {
        usage: Some(PathExpr::parse("result.tokenCounts").unwrap()),
        ..ResponseMapping::default()
    });
    let _mock = server
        .mock("POST", "/generate")
        .with_status(200)
        .with_body(json!({"result": {"text": "no counts here"}}).to_string())
        .create_async()
        .await;

    let result = dispatcher("http://unused")
        .dispatch(&ModelDescriptor::External(model), "my-llama", "caller-1", &chat(None, None))
        .await
        .unwrap();

    assert_eq!(result.usage, TokenUsage::zero());
    assert_eq!(result.body["usage"], json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}));
    assert!(result.body["id"].as_str().unwrap().starts_with("gen-"));
    assert_eq!(result.body["choices"], json!([]));
}

#[tokio::test]
async fn unmapped_external_body_passes_through() {
    let mut server = mockito::Server::new_async().await;
    let model = external_model(format!("{}/v1/chat/completions", server.url()));
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({"temperature": 0.7, "max_tokens": 1000})))
        .with_status(200)
        .with_body(
            json!({
                "id": "x",
                "model": "upstream-name",
                "choices": [],
                "usage": {"prompt_tokens": 5, "completion_tokens": 6}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let result = dispatcher("http://unused")
        .dispatch(&ModelDescriptor::External(model), "em-1", "caller-1", &chat(None, None))
        .await
        .unwrap();

    assert_eq!(result.usage, TokenUsage::new(5, 6));
    assert_eq!(result.body["model"], "em-1");
    assert_eq!(result.body["id"], "x");
}

#[tokio::test]
async fn undecryptable_credential_fails_before_sending() {
    let mut server = mockito::Server::new_async().await;
    let mut model = external_model(format!("{}/generate", server.url()));
    model.credential = "aes256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string();
    let mock = server.mock("POST", "/generate").expect(0).create_async().await;

    let err = dispatcher("http://unused")
        .dispatch(&ModelDescriptor::External(model), "my-llama", "caller-1", &chat(None, None))
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert_eq!(err.kind, DispatchErrorKind::Credential);
    assert!(!err.message.contains("sk-byom"));
}

#[test]
fn custom_headers_cannot_override_protected_headers() {
    let custom = BTreeMap::from([
        ("Content-Type".to_string(), "text/plain".to_string()),
        ("authorization".to_string(), "Bearer evil".to_string()),
        ("x-org".to_string(), "acme".to_string()),
        ("bad header".to_string(), "x".to_string()),
    ]);

    let headers = build_headers(Some("sk-real"), &custom);

    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(headers["authorization"], "Bearer sk-real");
    assert_eq!(headers["x-org"], "acme");
    assert_eq!(headers.len(), 3);
}

#[test]
fn no_credential_means_no_auth_header() {
    let headers = build_headers(None, &BTreeMap::new());
    assert!(headers.get("authorization").is_none());
}

#[test]
fn body_prefers_live_then_template_then_default() {
    let mut model = external_model("http://x".to_string());

    let body = build_body(&model, &chat(None, None));
    assert_eq!(body["temperature"], json!(DEFAULT_TEMPERATURE));
    assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));

    model.request_template =
        Some(serde_json::from_value(json!({"temperature": 0.1, "max_tokens": 42})).unwrap());
    let body = build_body(&model, &chat(None, None));
    assert_eq!(body["temperature"], json!(0.1));
    assert_eq!(body["max_tokens"], json!(42));

    let body = build_body(&model, &chat(Some(0.9), Some(7)));
    assert_eq!(body["temperature"], json!(0.9));
    assert_eq!(body["max_tokens"], json!(7));
    assert_eq!(body["model"], "my-llama");
}

#[test]
fn embedding_body_carries_model_and_input() {
    let model = external_model("http://x".to_string());
    let body = build_body(&model, &DispatchRequest::Embed { input: json!("text") });
    assert_eq!(body, json!({"model": "my-llama", "input": "text"}));
}

#[test]
fn usage_extraction_accepts_common_spellings() {
    let read = |v: serde_json::Value| extract_usage(Some(&v), false).unwrap();
    assert_eq!(read(json!({"prompt_tokens": 3, "completion_tokens": 4})), TokenUsage::new(3, 4));
    assert_eq!(read(json!({"inputTokens": 3, "outputTokens": 4})), TokenUsage::new(3, 4));
    assert_eq!(read(json!({"prompt_tokens": 3})), TokenUsage::new(3, 0));
    assert_eq!(read(json!({"prompt_tokens": 3.9, "completion_tokens": -2})), TokenUsage::new(3, 0));
    assert_eq!(read(json!("nonsense")), TokenUsage::zero());
    assert_eq!(extract_usage(None, false).unwrap(), TokenUsage::zero());
}

#[test]
fn usage_extraction_rejects_implausible_counts() {
    let err = extract_usage(Some(&json!({"prompt_tokens": 1e20, "completion_tokens": 1})), false)
        .unwrap_err();
    assert_eq!(err.kind, DispatchErrorKind::InvalidResponse);

    let err = extract_usage(Some(&json!({"completion_tokens": u64::MAX})), false).unwrap_err();
    assert_eq!(err.kind, DispatchErrorKind::InvalidResponse);

    let at_bound = json!({"prompt_tokens": MAX_TOKEN_COUNT, "completion_tokens": MAX_TOKEN_COUNT});
    let usage = extract_usage(Some(&at_bound), false).unwrap();
    assert!(i64::try_from(usage.total()).is_ok());
}

#[test]
fn error_snippets_are_bounded() {
    let long = "é".repeat(2_000);
    assert_eq!(snippet(&long).chars().count(), ERROR_SNIPPET_CHARS);
    assert_eq!(snippet("short"), "short");
}
