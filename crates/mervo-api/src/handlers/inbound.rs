//! Inbound endpoints for external webhook senders.
//!
//! `verify` echoes a subscription challenge. `receive` authenticates the raw
//! body against the configured shared secret and drops events whose id was
//! already seen within the dedupe window.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use mervo_core::{crypto, MervoError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::ApiError;
use crate::server::AppState;

const DEFAULT_CHALLENGE: &str = "pong";

/// Body of a challenge request.
#[derive(Debug, Default, Deserialize)]
pub struct ChallengeRequest {
    /// Token to echo back.
    #[serde(default)]
    pub challenge: Option<String>,
}

/// Body of a challenge response.
#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    /// The echoed token, or `"pong"` when none was sent.
    pub challenge: String,
}

/// Echoes the caller's challenge token.
///
/// An empty body counts as a request without a token.
///
/// # Errors
///
/// Returns 400 when the body is not a JSON object with an optional string
/// `challenge` field.
#[instrument(name = "verify_challenge", skip(body), fields(body_len = body.len()))]
pub async fn verify_challenge(body: Bytes) -> Result<Json<ChallengeResponse>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ChallengeRequest::default()
    } else {
        serde_json::from_slice::<ChallengeRequest>(&body).map_err(|e| {
            debug!(error = %e, "malformed challenge body");
            ApiError::BadRequest(format!("malformed challenge body: {e}"))
        })?
    };

    let challenge = request.challenge.unwrap_or_else(|| DEFAULT_CHALLENGE.to_string());
    Ok(Json(ChallengeResponse { challenge }))
}

/// Accepts a signed inbound event.
///
/// Responds `200 "ok"` when the signature header verifies against the raw
/// body, `401 "invalid signature"` otherwise. A missing header and a missing
/// configured secret both fail verification.
#[instrument(name = "receive_webhook", skip(state, headers, body), fields(body_len = body.len()))]
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = state.webhook_secret.as_deref() else {
        warn!(code = MervoError::SignatureMismatch.code(), "no inbound secret configured");
        return unauthorized();
    };

    let signature = headers.get(&*state.signature_header).and_then(|v| v.to_str().ok());
    let Some(signature) = signature else {
        warn!(code = MervoError::SignatureMismatch.code(), "inbound signature header missing");
        return unauthorized();
    };

    if !crypto::verify(&body, secret, signature) {
        warn!(code = MervoError::SignatureMismatch.code(), "inbound signature mismatch");
        return unauthorized();
    }

    if let Some(event_id) = event_id(&body) {
        if !state.dedupe.check_and_record(&event_id).await {
            let duplicate = MervoError::DuplicateEvent { event_id };
            info!(code = duplicate.code(), error = %duplicate, "duplicate inbound event ignored");
            return ok();
        }
        info!(event_id = %event_id, "inbound event accepted");
    } else {
        debug!("inbound event accepted without id");
    }

    ok()
}

/// Extracts the string `id` field of a JSON object body.
fn event_id(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("id")?.as_str().filter(|id| !id.is_empty()).map(ToString::to_string)
}

fn ok() -> Response {
    (StatusCode::OK, "ok").into_response()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "invalid signature").into_response()
}
