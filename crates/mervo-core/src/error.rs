//! Error types for delivery storage and the webhook pipeline.
//!
//! `CoreError` covers queue storage and state-machine violations.
//! `MervoError` is the coded taxonomy surfaced to producers, receivers and
//! operators, with stable codes for client disambiguation.

use thiserror::Error;

use crate::models::{DeliveryId, DeliveryStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for queue storage and lifecycle operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested state change is not allowed from the stored state.
    #[error("Invalid transition for delivery {id} in state {status}: {reason}")]
    InvalidTransition {
        /// Delivery the transition was attempted on.
        id: DeliveryId,
        /// Status currently stored for the delivery.
        status: DeliveryStatus,
        /// Why the transition was refused.
        reason: String,
    },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Creates an `InvalidTransition` error.
    pub fn invalid_transition(
        id: DeliveryId,
        status: DeliveryStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition { id, status, reason: reason.into() }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested delivery not found".to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::InvalidInput(format!("cannot decode column {index}: {source}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Coded errors for the webhook pipeline.
#[derive(Debug, Error)]
pub enum MervoError {
    // Inbound and producer errors (E1001-E1005)
    /// Inbound HMAC signature missing or not matching (E1001).
    #[error("[E1001] Signature mismatch: HMAC verification failed")]
    SignatureMismatch,

    /// Payload exceeds the accepted size (E1002).
    #[error("[E1002] Payload too large: {size_bytes} bytes exceeds {limit_bytes} byte limit")]
    PayloadTooLarge {
        /// Size of the payload in bytes.
        size_bytes: usize,
        /// Maximum accepted size in bytes.
        limit_bytes: usize,
    },

    /// Delivery rejected at enqueue time (E1003).
    #[error("[E1003] Malformed delivery: {reason}")]
    MalformedDelivery {
        /// What is wrong with the delivery.
        reason: String,
    },

    /// Inbound event already processed within the dedupe window (E1004).
    #[error("[E1004] Duplicate event: {event_id} already processed")]
    DuplicateEvent {
        /// The inbound event id.
        event_id: String,
    },

    /// Connector unknown or not accepting the event type (E1005).
    #[error("[E1005] Unsupported event: connector {connector_id} does not accept {event_type}")]
    UnsupportedEvent {
        /// Connector the producer named.
        connector_id: String,
        /// Event type the producer tried to enqueue.
        event_type: String,
    },

    // Delivery errors (E2001-E2004)
    /// Connection refused, DNS failure or other transport error (E2001).
    #[error("[E2001] Transport error: {message}")]
    Transport {
        /// Underlying transport error message.
        message: String,
    },

    /// Outbound call exceeded its timeout (E2002).
    #[error("[E2002] Timeout: exceeded {timeout_ms}ms")]
    Timeout {
        /// Timeout that was exceeded in milliseconds.
        timeout_ms: u64,
    },

    /// Endpoint answered outside 2xx (E2003).
    #[error("[E2003] HTTP status error: {status} response from endpoint")]
    HttpStatus {
        /// HTTP status code returned by the endpoint.
        status: u16,
    },

    /// Retry budget exhausted, delivery dead-lettered (E2004).
    #[error("[E2004] Max attempts exceeded: gave up after {attempts} attempts")]
    MaxAttemptsExceeded {
        /// Number of failed attempts recorded.
        attempts: u32,
    },

    // System errors (E3001)
    /// The delivery queue backend is unavailable (E3001).
    #[error("[E3001] Queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl MervoError {
    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SignatureMismatch => "E1001",
            Self::PayloadTooLarge { .. } => "E1002",
            Self::MalformedDelivery { .. } => "E1003",
            Self::DuplicateEvent { .. } => "E1004",
            Self::UnsupportedEvent { .. } => "E1005",
            Self::Transport { .. } => "E2001",
            Self::Timeout { .. } => "E2002",
            Self::HttpStatus { .. } => "E2003",
            Self::MaxAttemptsExceeded { .. } => "E2004",
            Self::QueueUnavailable(_) => "E3001",
        }
    }

    /// Returns whether this error counts as a retryable attempt failure.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::HttpStatus { .. }
                | Self::QueueUnavailable(_)
        )
    }

    /// Creates a `MalformedDelivery` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedDelivery { reason: reason.into() }
    }
}
