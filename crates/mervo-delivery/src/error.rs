//! Error types for delivery attempts and the worker runtime.
//!
//! Attempt errors (`NetworkError`, `Timeout`, `HttpStatus`, `Payload`) never
//! escape the dispatcher; they become queue transitions. The remaining
//! variants describe queue, configuration and worker lifecycle failures.

use std::{fmt, time::Duration};

use mervo_core::{CoreError, MervoError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering webhooks.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection refused, DNS failure or another transport error.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Outbound call exceeded the per-call timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Endpoint answered with a status outside 2xx.
    #[error("endpoint returned HTTP {status_code}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Captured response body
        body: String,
    },

    /// Payload could not be serialized or signed.
    #[error("payload preparation failed: {message}")]
    Payload {
        /// What went wrong
        message: String,
    },

    /// Queue read or write failed.
    #[error("queue error: {message}")]
    Queue {
        /// Queue error message
        message: String,
    },

    /// Invalid engine, client or retry configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("workers did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked or was aborted.
    #[error("worker {worker_id} failed: {error}")]
    WorkerPanic {
        /// Worker that failed
        worker_id: usize,
        /// Join error description
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates an HTTP status error from a response.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates a payload preparation error.
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns true for failures worth another attempt.
    ///
    /// Follows the coded taxonomy: transport, timeout and HTTP status
    /// failures retry; a payload that cannot be serialized or signed does
    /// not.
    pub fn is_retryable(&self) -> bool {
        self.as_pipeline_error().is_some_and(|error| error.is_retryable())
    }

    /// Maps an attempt failure onto the coded pipeline taxonomy.
    ///
    /// Returns `None` for runtime errors that are not attempt outcomes.
    pub fn as_pipeline_error(&self) -> Option<MervoError> {
        match self {
            Self::NetworkError { message } => {
                Some(MervoError::Transport { message: message.clone() })
            },
            Self::Payload { message } => Some(MervoError::malformed(message.clone())),
            Self::Timeout { timeout_ms } => Some(MervoError::Timeout { timeout_ms: *timeout_ms }),
            Self::HttpStatus { status_code, .. } => {
                Some(MervoError::HttpStatus { status: *status_code })
            },
            Self::Queue { message } => Some(MervoError::QueueUnavailable(message.clone())),
            Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::queue(error.to_string())
    }
}

/// Category of delivery error for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures.
    Network,
    /// Per-call timeout.
    Timeout,
    /// Non-2xx responses.
    Http,
    /// Serialization or signing.
    Payload,
    /// Queue storage.
    Queue,
    /// Configuration problems.
    Configuration,
    /// Worker lifecycle.
    Worker,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } => Self::Network,
            DeliveryError::Timeout { .. } => Self::Timeout,
            DeliveryError::HttpStatus { .. } => Self::Http,
            DeliveryError::Payload { .. } => Self::Payload,
            DeliveryError::Queue { .. } => Self::Queue,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::WorkerPanic { .. } => {
                Self::Worker
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::Http => write!(f, "http"),
            Self::Payload => write!(f, "payload"),
            Self::Queue => write!(f, "queue"),
            Self::Configuration => write!(f, "configuration"),
            Self::Worker => write!(f, "worker"),
        }
    }
}
