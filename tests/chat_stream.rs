//! Contract tests for the OpenAI-compatible SSE chat backend.

#![allow(clippy::unwrap_used)]

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use colloquy::config::LlmConfig;
use colloquy::error::CoreError;
use colloquy::llm::{ApiChatClient, ChatBackend, ChatMessage};

fn sse_body(tokens: &[&str]) -> String {
    let mut body = String::new();
    for token in tokens {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{token}\"}}}}]}}\n\n"
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn streams_deltas_from_sse() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(&["Hel", "lo", "."]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let config = LlmConfig {
        api_url: server.uri(),
        ..Default::default()
    };
    let client = ApiChatClient::new(&config);
    let stream = client
        .stream_chat("gpt-4o-mini", &[ChatMessage::new("user", "hi")], 64)
        .await
        .unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), "Hello.");
}

#[tokio::test]
async fn trailing_v1_in_base_url_is_tolerated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(&["ok"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let config = LlmConfig {
        api_url: format!("{}/v1", server.uri()),
        ..Default::default()
    };
    let client = ApiChatClient::new(&config);
    let stream = client
        .stream_chat("gpt-4o-mini", &[ChatMessage::new("user", "hi")], 64)
        .await
        .unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), "ok");
}

#[tokio::test]
async fn server_errors_are_transient_transport() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = LlmConfig {
        api_url: server.uri(),
        ..Default::default()
    };
    let client = ApiChatClient::new(&config);
    let err = client
        .stream_chat("gpt-4o-mini", &[ChatMessage::new("user", "hi")], 64)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn client_errors_are_not_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let config = LlmConfig {
        api_url: server.uri(),
        ..Default::default()
    };
    let client = ApiChatClient::new(&config);
    let err = client
        .stream_chat("gpt-4o-mini", &[ChatMessage::new("user", "hi")], 64)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Llm(_)));
    assert!(!err.is_transient());
}
