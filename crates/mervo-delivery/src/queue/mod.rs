//! Delivery queue abstraction.
//!
//! The queue is the only shared mutable state in the delivery pipeline. Every
//! backend guarantees that `dequeue_ready` hands a delivery to at most one
//! caller, and that `requeue` and `finalize` only apply to a delivery that is
//! still `in-flight` with an attempt count no lower than the stored one.
//! Lost updates are refused rather than silently overwritten.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use mervo_core::{error::Result, Delivery, DeliveryId, DeliveryStatus, NewDelivery};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryDeliveryQueue;
pub use postgres::PostgresDeliveryQueue;

/// Boxed future returned by queue operations.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Default page size for `list`.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Terminal outcome recorded by `finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Endpoint acknowledged the delivery.
    Delivered,
    /// Attempt budget exhausted.
    DeadLetter {
        /// Last response body or error, attached once.
        diagnostic: String,
    },
}

impl Resolution {
    /// Status the delivery ends in.
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Self::Delivered => DeliveryStatus::Delivered,
            Self::DeadLetter { .. } => DeliveryStatus::DeadLetter,
        }
    }
}

/// Storage operations behind the dispatcher and the HTTP surface.
///
/// Implementations own their synchronization; callers never lock around
/// them. Attempt accounting belongs to the dispatcher: `requeue` and
/// `finalize` persist the `attempt_count` and `last_attempt_at` carried by
/// the delivery they are given.
pub trait DeliveryQueue: Send + Sync + 'static {
    /// Inserts a validated delivery as `pending`, due now, with no attempts.
    fn enqueue(&self, new: NewDelivery) -> QueueFuture<'_, Delivery>;

    /// Claims the due delivery with the earliest `next_attempt`, ties broken
    /// by insertion order, and marks it `in-flight`.
    ///
    /// Returns `None` when nothing is due at `now`.
    fn dequeue_ready(&self, now: DateTime<Utc>) -> QueueFuture<'_, Option<Delivery>>;

    /// Moves an `in-flight` delivery back to `pending`, due at `next_attempt`.
    fn requeue(&self, delivery: Delivery, next_attempt: DateTime<Utc>)
        -> QueueFuture<'_, Delivery>;

    /// Moves an `in-flight` delivery to its terminal status.
    fn finalize(&self, delivery: Delivery, resolution: Resolution) -> QueueFuture<'_, Delivery>;

    /// Cancels a `pending` delivery.
    fn cancel(&self, id: DeliveryId) -> QueueFuture<'_, Delivery>;

    /// Looks up a delivery by id.
    fn find(&self, id: DeliveryId) -> QueueFuture<'_, Option<Delivery>>;

    /// Lists deliveries in enqueue order, optionally filtered by status.
    fn list(&self, status: Option<DeliveryStatus>, limit: usize)
        -> QueueFuture<'_, Vec<Delivery>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_maps_to_terminal_status() {
        assert_eq!(Resolution::Delivered.status(), DeliveryStatus::Delivered);
        let dead = Resolution::DeadLetter { diagnostic: "HTTP 500".to_string() };
        assert_eq!(dead.status(), DeliveryStatus::DeadLetter);
        assert!(dead.status().is_terminal());
    }
}
