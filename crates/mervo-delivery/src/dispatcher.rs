//! Drives one in-flight delivery to its next state.
//!
//! Each `dispatch` makes exactly one outbound POST. Every attempt failure,
//! whether transport, timeout, non-2xx status or payload preparation, is
//! turned into a queue transition: a requeue with backoff, or a dead-letter
//! with the captured diagnostic once the attempt budget is spent. Only queue
//! write failures are returned to the caller.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mervo_core::{crypto, Clock, Delivery, DeliveryId, DeliveryStatus, MervoError};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, ErrorCategory, Result},
    queue::{DeliveryQueue, Resolution},
    retry::{RetryDecision, RetryPolicy},
};

/// Largest diagnostic stored on a dead-lettered delivery.
pub const MAX_DIAGNOSTIC_BYTES: usize = 1024;

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Result of a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Endpoint answered 2xx.
    Delivered {
        /// Delivery id
        delivery_id: DeliveryId,
        /// Status returned by the endpoint
        status_code: u16,
    },
    /// Attempt failed; requeued.
    Retrying {
        /// Delivery id
        delivery_id: DeliveryId,
        /// Failed attempts so far
        attempt_count: u32,
        /// When the delivery becomes due again
        next_attempt: DateTime<Utc>,
    },
    /// Attempt budget spent.
    DeadLettered {
        /// Delivery id
        delivery_id: DeliveryId,
        /// Failed attempts recorded
        attempt_count: u32,
        /// Last response body or error
        diagnostic: String,
    },
}

impl DispatchOutcome {
    /// Delivery the outcome refers to.
    pub fn delivery_id(&self) -> DeliveryId {
        match self {
            Self::Delivered { delivery_id, .. }
            | Self::Retrying { delivery_id, .. }
            | Self::DeadLettered { delivery_id, .. } => *delivery_id,
        }
    }
}

/// Signs, sends and resolves deliveries taken from a queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn DeliveryQueue>,
    client: DeliveryClient,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("client", &self.client)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        client: DeliveryClient,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, client, retry_policy, clock }
    }

    /// Queue the dispatcher reads from and writes to.
    pub fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        &self.queue
    }

    /// Retry policy applied to failed attempts.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Dequeues the next due delivery and dispatches it.
    ///
    /// Returns `Ok(None)` when nothing is due.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Queue` when the queue cannot be read or the
    /// resulting transition cannot be written.
    pub async fn process_next(&self) -> Result<Option<DispatchOutcome>> {
        let now = self.clock.now_utc();
        match self.queue.dequeue_ready(now).await? {
            Some(delivery) => self.dispatch(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Makes one outbound attempt for an in-flight delivery and records the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Queue` when `delivery` is not in-flight or the
    /// queue transition fails. Attempt failures are never returned.
    #[instrument(
        name = "dispatch",
        skip(self, delivery),
        fields(delivery_id = %delivery.id, attempt = delivery.attempt_count + 1)
    )]
    pub async fn dispatch(&self, mut delivery: Delivery) -> Result<DispatchOutcome> {
        if delivery.status != DeliveryStatus::InFlight {
            return Err(DeliveryError::queue(format!(
                "delivery {} is {}, expected in-flight",
                delivery.id, delivery.status
            )));
        }

        let result = self.attempt(&delivery).await;
        let finished_at = self.clock.now_utc();
        delivery.last_attempt_at = Some(finished_at);

        match result {
            Ok(response) => {
                let delivery_id = delivery.id;
                let written = self.queue.finalize(delivery, Resolution::Delivered).await;
                self.write(written, delivery_id)?;
                info!(status_code = response.status_code, "delivery succeeded");
                Ok(DispatchOutcome::Delivered { delivery_id, status_code: response.status_code })
            },
            Err(error) => self.handle_failure(delivery, &error, finished_at).await,
        }
    }

    async fn attempt(&self, delivery: &Delivery) -> Result<DeliveryResponse> {
        let body = serde_json::to_vec(&delivery.payload)
            .map_err(|e| DeliveryError::payload(format!("cannot serialize payload: {e}")))?;

        let signature = delivery
            .secret
            .as_deref()
            .map(|secret| crypto::sign(&body, secret))
            .transpose()
            .map_err(|e| DeliveryError::payload(format!("cannot sign payload: {e}")))?;

        let response = self
            .client
            .deliver(DeliveryRequest {
                delivery_id: delivery.id,
                url: delivery.url.clone(),
                body: Bytes::from(body),
                signature,
                attempt_number: delivery.attempt_count.saturating_add(1),
            })
            .await?;

        if response.is_success {
            Ok(response)
        } else {
            Err(DeliveryError::http_status(response.status_code, response.body))
        }
    }

    async fn handle_failure(
        &self,
        mut delivery: Delivery,
        error: &DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        delivery.attempt_count = delivery.attempt_count.saturating_add(1);
        let delivery_id = delivery.id;
        let attempt_count = delivery.attempt_count;
        let code = error.as_pipeline_error().map(|e| e.code());

        let decision = if error.is_retryable() {
            self.retry_policy.decide(attempt_count, failed_at)
        } else {
            let reason = format!("{} failure is not retryable", ErrorCategory::from(error));
            RetryDecision::GiveUp { reason }
        };

        match decision {
            RetryDecision::Retry { next_attempt_at, delay } => {
                warn!(
                    attempt_count,
                    error = %error,
                    error_category = %ErrorCategory::from(error),
                    code,
                    retry_in_ms = delay.as_millis(),
                    "delivery attempt failed, requeueing"
                );
                self.write(self.queue.requeue(delivery, next_attempt_at).await, delivery_id)?;
                Ok(DispatchOutcome::Retrying {
                    delivery_id,
                    attempt_count,
                    next_attempt: next_attempt_at,
                })
            },
            RetryDecision::GiveUp { reason } => {
                let diagnostic = diagnostic_for(error);
                let code = if error.is_retryable() {
                    Some(MervoError::MaxAttemptsExceeded { attempts: attempt_count }.code())
                } else {
                    code
                };
                error!(
                    attempt_count,
                    error = %error,
                    error_category = %ErrorCategory::from(error),
                    code,
                    reason = %reason,
                    "delivery dead-lettered"
                );
                let resolution = Resolution::DeadLetter { diagnostic: diagnostic.clone() };
                self.write(self.queue.finalize(delivery, resolution).await, delivery_id)?;
                Ok(DispatchOutcome::DeadLettered { delivery_id, attempt_count, diagnostic })
            },
        }
    }

    fn write(
        &self,
        result: mervo_core::Result<Delivery>,
        delivery_id: DeliveryId,
    ) -> Result<Delivery> {
        result.map_err(|e| {
            error!(delivery_id = %delivery_id, error = %e, "failed to record delivery outcome");
            DeliveryError::from(e)
        })
    }
}

/// Builds the dead-letter diagnostic for the final failed attempt.
///
/// Non-2xx responses keep their status and body; other failures keep the
/// error message. Always non-empty.
fn diagnostic_for(error: &DeliveryError) -> String {
    let text = match error {
        DeliveryError::HttpStatus { status_code, body } if body.trim().is_empty() => {
            format!("HTTP {status_code}")
        },
        DeliveryError::HttpStatus { status_code, body } => format!("HTTP {status_code}: {body}"),
        other => other.to_string(),
    };
    truncate_diagnostic(&text, MAX_DIAGNOSTIC_BYTES)
}

/// Truncates `text` to at most `max_bytes`, marking the cut.
pub fn truncate_diagnostic(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut end = max_bytes.saturating_sub(TRUNCATION_SUFFIX.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_SUFFIX}", &text[..end])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn short_diagnostics_are_kept() {
        assert_eq!(truncate_diagnostic("boom", 1024), "boom");
    }

    #[test]
    fn long_diagnostics_are_truncated() {
        let text = "x".repeat(5000);
        let truncated = truncate_diagnostic(&text, MAX_DIAGNOSTIC_BYTES);

        assert_eq!(truncated.len(), MAX_DIAGNOSTIC_BYTES);
        assert!(truncated.ends_with("... (truncated)"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(1000);
        let truncated = truncate_diagnostic(&text, 100);

        assert!(truncated.len() <= 100);
        assert!(truncated.ends_with("... (truncated)"));
    }

    #[test]
    fn diagnostic_includes_status_and_body() {
        let diagnostic = diagnostic_for(&DeliveryError::http_status(500, "Internal Server Error"));
        assert_eq!(diagnostic, "HTTP 500: Internal Server Error");

        assert_eq!(diagnostic_for(&DeliveryError::http_status(503, "  ")), "HTTP 503");
        assert_eq!(
            diagnostic_for(&DeliveryError::timeout(Duration::from_secs(10))),
            "request timeout after 10000ms"
        );
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let id = DeliveryId::new();
        let json = serde_json::to_value(DispatchOutcome::Delivered {
            delivery_id: id,
            status_code: 200,
        })
        .unwrap();

        assert_eq!(json["outcome"], "delivered");
        assert_eq!(json["status_code"], 200);
        assert_eq!(json["delivery_id"], id.to_string());
    }
}
