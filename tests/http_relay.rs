use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chat_relay::utils::test_support::{delta_payload, should_skip_httpmock, upstream_sse};
use chat_relay::{
    AccessToken, HttpState, RelayEngine, Result, ServiceMode, TokenProvider, UpstreamClient,
    UserTable, router,
};
use httpmock::{Method::POST, MockServer};
use serde_json::{Value, json};
use tower::ServiceExt as _;

async fn app_for(server: &MockServer) -> Result<axum::Router> {
    let http = reqwest::Client::new();
    let tokens = Arc::new(TokenProvider::new(
        http.clone(),
        server.url("/api/v2/oauth"),
        "api-key-1",
        "GIGACHAT_API_PERS",
    )?);
    tokens.store(AccessToken::new("tok-1")).await;
    let engine = RelayEngine::new(
        UpstreamClient::new(http, tokens).with_base_url(server.url("/api/v1")),
    );
    let users = UserTable::new(BTreeMap::from([("user".to_string(), "chat123".to_string())]));
    Ok(router(HttpState::new(
        Arc::new(engine),
        users,
        ServiceMode::Upstream,
    )))
}

fn post_request(body: Value) -> Request<Body> {
    Request::post("/request")
        .header("content-type", "application/json")
        .header(
            "authorization",
            format!("Basic {}", STANDARD.encode("user:chat123")),
        )
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn sse_frames(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            let payload = frame.strip_prefix("data: ").expect("data frame");
            serde_json::from_str(payload).expect("frame json")
        })
        .collect()
}

#[tokio::test]
async fn streaming_request_relays_upstream_deltas() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(upstream_sse(&[delta_payload("Hi"), delta_payload(" there")]));
        })
        .await;

    let response = app_for(&server)
        .await?
        .oneshot(post_request(json!({ "message": "hello", "stream": true, "dialog_id": "d-1" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(
        sse_frames(&bytes),
        vec![
            json!({ "chunk": "Hi", "accumulated": "Hi", "done": false }),
            json!({ "chunk": " there", "accumulated": "Hi there", "done": false }),
            json!({ "chunk": "", "accumulated": "Hi there", "done": true }),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn streaming_upstream_failure_is_single_error_frame() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v1/chat/completions");
            then.status(500).body("internal");
        })
        .await;

    let response = app_for(&server)
        .await?
        .oneshot(post_request(json!({ "message": "hello", "stream": true })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let frames = sse_frames(&bytes);
    assert_eq!(frames.len(), 1);
    let error = frames[0]["error"].as_str().unwrap_or_default();
    assert!(error.contains("500"), "{error}");
    Ok(())
}

#[tokio::test]
async fn buffered_upstream_error_keeps_status() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v1/chat/completions");
            then.status(429).body("too many requests");
        })
        .await;

    let response = app_for(&server)
        .await?
        .oneshot(post_request(json!({ "message": "hello" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert!(
        body["detail"]
            .as_str()
            .unwrap_or_default()
            .contains("too many requests")
    );
    Ok(())
}

#[tokio::test]
async fn buffered_request_returns_upstream_text() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"choices":[{"message":{"content":"hi there"}}]}"#);
        })
        .await;

    let response = app_for(&server)
        .await?
        .oneshot(post_request(json!({ "message": "hello" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body, json!({ "response": "hi there" }));
    Ok(())
}
