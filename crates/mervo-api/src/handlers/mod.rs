//! HTTP request handlers for the mervo API.
//!
//! Handlers are grouped by functionality:
//! - `inbound` - challenge echo and signed receive for external senders
//! - `connectors` - registered connector manifests
//! - `deliveries` - producer enqueue, status, listing, cancel and the manual
//!   process-one trigger
//! - `health` - service health
//!
//! # Error Handling
//!
//! JSON handlers return `{ "error": { "code", "message" } }` with codes from
//! the `MervoError` taxonomy (E1001-E3001). The inbound receive endpoint
//! answers in plain text.

pub mod connectors;
pub mod deliveries;
pub mod health;
pub mod inbound;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mervo_core::{CoreError, MervoError};
use serde::Serialize;

pub use connectors::list_connectors;
pub use deliveries::{
    cancel_delivery, enqueue_delivery, get_delivery, list_deliveries, process_one,
};
pub use health::health_check;
pub use inbound::{receive_webhook, verify_challenge};

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from the taxonomy, or a generic HTTP code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Failure of a JSON handler.
#[derive(Debug)]
pub enum ApiError {
    /// Coded pipeline error.
    Pipeline(MervoError),
    /// Requested delivery does not exist.
    NotFound(String),
    /// Request conflicts with the delivery's current state.
    Conflict(String),
    /// Request could not be parsed.
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Pipeline(MervoError::SignatureMismatch) => StatusCode::UNAUTHORIZED,
            Self::Pipeline(MervoError::PayloadTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Pipeline(
                MervoError::MalformedDelivery { .. } | MervoError::UnsupportedEvent { .. },
            ) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Pipeline(MervoError::DuplicateEvent { .. }) | Self::Conflict(_) => {
                StatusCode::CONFLICT
            },
            Self::Pipeline(MervoError::QueueUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Pipeline(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn detail(&self) -> ErrorDetail {
        let (code, message) = match self {
            Self::Pipeline(error) => (error.code(), error.to_string()),
            Self::NotFound(message) => ("NOT_FOUND", message.clone()),
            Self::Conflict(message) => ("CONFLICT", message.clone()),
            Self::BadRequest(message) => ("BAD_REQUEST", message.clone()),
        };
        ErrorDetail { code: code.to_string(), message }
    }
}

impl From<MervoError> for ApiError {
    fn from(error: MervoError) -> Self {
        Self::Pipeline(error)
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            CoreError::InvalidTransition { .. } => Self::Conflict(error.to_string()),
            CoreError::InvalidInput(reason) => Self::Pipeline(MervoError::malformed(reason)),
            CoreError::Database(message) => Self::Pipeline(MervoError::QueueUnavailable(message)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse { error: self.detail() })).into_response()
    }
}
