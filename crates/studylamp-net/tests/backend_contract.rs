//! HTTP contract tests for the assistant backend.
//!
//! Verify request shape (path, method, auth header, body) and how status codes
//! and error bodies surface through `HttpBackend`, `ChatSession` and
//! `HealthPoller`.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use studylamp_net::{
    Backend, BackendError, ChatError, ChatRequest, ChatSession, HealthPoller, HealthStatus,
    HttpBackend, Role,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(message: &str) -> ChatRequest {
    ChatRequest {
        message: message.into(),
        context: "study-assistant".into(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Chat
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_sends_bearer_token_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_json(json!({"message": "what is a monad", "context": "study-assistant"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "a burrito"})))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri()).unwrap();
    let reply = backend.chat(&request("what is a monad"), "secret-token").await.unwrap();
    assert_eq!(reply.response, "a burrito");
}

#[tokio::test]
async fn test_chat_error_body_message_surfaces() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "model overloaded"})))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri()).unwrap();
    let err = backend.chat(&request("hi"), "t").await.unwrap_err();
    match err {
        BackendError::Status { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message.as_deref(), Some("model overloaded"));
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_chat_fallback_field_used_when_no_message() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"fallback": "Try rephrasing."})))
        .mount(&server)
        .await;

    let session = ChatSession::new(Arc::new(HttpBackend::new(server.uri()).unwrap()), "study-assistant");
    session.set_credential(Some("t".into()));

    assert_eq!(
        session.send("hi").await,
        Err(ChatError::Unknown("Try rephrasing.".into()))
    );
    assert_eq!(session.thread().messages()[1].text, "Try rephrasing.");
}

#[tokio::test]
async fn test_chat_session_maps_status_codes() {
    for (code, expected) in [
        (401, ChatError::Unauthenticated),
        (429, ChatError::RateLimited),
        (503, ChatError::ServiceUnavailable),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(code).set_body_json(json!({"message": "ignored"})))
            .expect(1)
            .mount(&server)
            .await;

        let session =
            ChatSession::new(Arc::new(HttpBackend::new(server.uri()).unwrap()), "study-assistant");
        session.set_credential(Some("t".into()));

        assert_eq!(session.send("hi").await, Err(expected.clone()), "HTTP {code}");
        let thread = session.thread();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread.messages()[1].role, Role::Assistant);
        assert_eq!(thread.messages()[1].text, expected.to_string());
    }
}

#[tokio::test]
async fn test_chat_without_credential_never_hits_server() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "hi"})))
        .expect(0)
        .mount(&server)
        .await;

    let session = ChatSession::new(Arc::new(HttpBackend::new(server.uri()).unwrap()), "study-assistant");
    assert_eq!(session.send("explain recursion").await, Err(ChatError::Unauthenticated));
}

#[tokio::test]
async fn test_chat_malformed_success_body_is_invalid_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri()).unwrap();
    let err = backend.chat(&request("hi"), "t").await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidResponse(_)));
}

// ────────────────────────────────────────────────────────────────────────────
// Health
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_json_payload() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok", "version": "1.4"})))
        .mount(&server)
        .await;

    let poller = HealthPoller::new(Arc::new(HttpBackend::new(server.uri()).unwrap()));
    assert_eq!(
        poller.check_once().await,
        HealthStatus::Healthy { payload: json!({"status": "ok", "version": "1.4"}) }
    );
}

#[tokio::test]
async fn test_health_plain_text_payload() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri()).unwrap();
    assert_eq!(backend.health().await.unwrap(), json!("OK"));
}

#[tokio::test]
async fn test_health_server_error_is_unhealthy() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let poller = HealthPoller::new(Arc::new(HttpBackend::new(server.uri()).unwrap()));
    assert_eq!(poller.check_once().await, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_health_slow_server_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri())
        .unwrap()
        .with_health_timeout(Duration::from_millis(200));
    let poller = HealthPoller::new(Arc::new(backend)).with_timeout(Duration::from_millis(300));

    let started = std::time::Instant::now();
    assert_eq!(poller.check_once().await, HealthStatus::Unhealthy);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_health_unreachable_server_is_unhealthy() {
    // Nothing listens on port 9 (discard) in CI containers.
    let poller = HealthPoller::new(Arc::new(HttpBackend::new("http://127.0.0.1:9").unwrap()));
    assert_eq!(poller.check_once().await, HealthStatus::Unhealthy);
}
