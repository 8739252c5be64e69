//! Inbound challenge and signed receive endpoint tests.
//!
//! Drives the router in-process and checks that only requests signed with the
//! configured shared secret are accepted, and that repeated event ids are
//! acknowledged without being processed twice.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{body_bytes, body_json, json_request, TestApp, INBOUND_SECRET};
use mervo_core::sign;
use serde_json::json;
use tower::ServiceExt;

fn signed_receive(body: &'static str, signature: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/receive")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("X-Signature", signature);
    }
    Ok(builder.body(Body::from(body))?)
}

#[tokio::test]
async fn challenge_echoes_token() -> Result<()> {
    let app = TestApp::new().router();

    let request = json_request("POST", "/webhooks/verify", &json!({"challenge": "c-123"}))?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?, json!({"challenge": "c-123"}));
    Ok(())
}

#[tokio::test]
async fn challenge_without_token_returns_pong() -> Result<()> {
    let app = TestApp::new().router();

    let response = app.oneshot(json_request("POST", "/webhooks/verify", &json!({}))?).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?, json!({"challenge": "pong"}));
    Ok(())
}

#[tokio::test]
async fn malformed_challenge_is_client_error() -> Result<()> {
    let app = TestApp::new().router();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/verify")
        .header("content-type", "application/json")
        .body(Body::from("{\"challenge\": "))?;

    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await?;
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn receive_accepts_matching_signature() -> Result<()> {
    let app = TestApp::new().router();
    let body = r#"{"type":"job.completed","data":{"job":7}}"#;
    let signature = sign(body.as_bytes(), INBOUND_SECRET)?;

    let response = app.oneshot(signed_receive(body, Some(&signature))?).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await?, b"ok");
    Ok(())
}

#[tokio::test]
async fn receive_rejects_signature_from_other_secret() -> Result<()> {
    let app = TestApp::new().router();
    let body = r#"{"type":"job.completed"}"#;
    let forged = sign(body.as_bytes(), "some-other-secret")?;

    let response = app.clone().oneshot(signed_receive(body, Some(&forged))?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_bytes(response).await?, b"invalid signature");

    // same request, correct secret
    let genuine = sign(body.as_bytes(), INBOUND_SECRET)?;
    let response = app.oneshot(signed_receive(body, Some(&genuine))?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn receive_rejects_missing_signature() -> Result<()> {
    let app = TestApp::new().router();

    let response = app.oneshot(signed_receive(r#"{"a":1}"#, None)?).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn receive_rejects_tampered_body() -> Result<()> {
    let app = TestApp::new().router();
    let signature = sign(br#"{"amount":100}"#, INBOUND_SECRET)?;

    let response = app.oneshot(signed_receive(r#"{"amount":999}"#, Some(&signature))?).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn receive_accepts_prefixed_signature() -> Result<()> {
    let app = TestApp::new().router();
    let body = r#"{"a":1}"#;
    let signature = format!("sha256={}", sign(body.as_bytes(), INBOUND_SECRET)?);

    let response = app.oneshot(signed_receive(body, Some(&signature))?).await?;

    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn receive_fails_closed_without_configured_secret() -> Result<()> {
    let mut test_app = TestApp::new();
    test_app.state.webhook_secret = None;
    let app = test_app.router();
    let body = r#"{"a":1}"#;
    let signature = sign(body.as_bytes(), INBOUND_SECRET)?;

    let response = app.oneshot(signed_receive(body, Some(&signature))?).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn receive_uses_configured_header() -> Result<()> {
    let mut test_app = TestApp::new();
    test_app.state = test_app.state.clone().with_signature_header("X-Hub-Signature-256");
    let app = test_app.router();
    let body = r#"{"a":1}"#;
    let signature = sign(body.as_bytes(), INBOUND_SECRET)?;

    let response = app.clone().oneshot(signed_receive(body, Some(&signature))?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/receive")
        .header("x-hub-signature-256", &signature)
        .body(Body::from(body))?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn duplicate_event_ids_are_acknowledged_once() -> Result<()> {
    let test_app = TestApp::new();
    let app = test_app.router();
    let body = r#"{"id":"evt_42","type":"job.completed"}"#;
    let signature = sign(body.as_bytes(), INBOUND_SECRET)?;

    let first = app.clone().oneshot(signed_receive(body, Some(&signature))?).await?;
    let second = app.oneshot(signed_receive(body, Some(&signature))?).await?;

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_bytes(second).await?, b"ok");
    assert!(test_app.state.dedupe.contains("evt_42").await);
    Ok(())
}

#[tokio::test]
async fn unsigned_duplicate_is_not_recorded() -> Result<()> {
    let test_app = TestApp::new();
    let app = test_app.router();

    let response = app.oneshot(signed_receive(r#"{"id":"evt_forged"}"#, None)?).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!test_app.state.dedupe.contains("evt_forged").await);
    Ok(())
}
