//! In-process delivery queue.
//!
//! One mutex guards both the records and the ready index, so a dequeue and
//! the state change it makes are a single critical section. The ready index
//! is keyed by `(next_attempt, sequence)`, which yields earliest-due first
//! and FIFO among equal due times. Exclusivity holds across tasks of one
//! process only; use `PostgresDeliveryQueue` for multiple instances.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use mervo_core::{
    error::{CoreError, Result},
    Clock, Delivery, DeliveryId, DeliveryStatus, NewDelivery,
};
use tokio::sync::Mutex;

use super::{DeliveryQueue, QueueFuture, Resolution};

#[derive(Debug)]
struct Entry {
    delivery: Delivery,
    sequence: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<DeliveryId, Entry>,
    ready: BTreeMap<(DateTime<Utc>, u64), DeliveryId>,
    next_sequence: u64,
}

impl State {
    fn in_flight_entry(&mut self, incoming: &Delivery, operation: &str) -> Result<&mut Entry> {
        let entry = self
            .entries
            .get_mut(&incoming.id)
            .ok_or_else(|| CoreError::NotFound(format!("delivery {}", incoming.id)))?;
        check_in_flight(&entry.delivery, incoming, operation)?;
        Ok(entry)
    }
}

/// Refuses a transition unless the stored delivery is `in-flight` and the
/// incoming attempt count has not gone backwards.
pub(crate) fn check_in_flight(
    stored: &Delivery,
    incoming: &Delivery,
    operation: &str,
) -> Result<()> {
    if stored.status != DeliveryStatus::InFlight {
        return Err(CoreError::invalid_transition(
            stored.id,
            stored.status,
            format!("cannot {operation} a delivery that is not in-flight"),
        ));
    }
    if incoming.attempt_count < stored.attempt_count {
        return Err(CoreError::invalid_transition(
            stored.id,
            stored.status,
            format!(
                "cannot {operation} with attempt_count {} below stored {}",
                incoming.attempt_count, stored.attempt_count
            ),
        ));
    }
    Ok(())
}

/// Delivery queue held in process memory.
#[derive(Debug)]
pub struct InMemoryDeliveryQueue {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDeliveryQueue {
    /// Creates an empty queue timestamping records with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(State::default()), clock }
    }

    /// Number of deliveries held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Returns true when the queue holds no deliveries at all.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }
}

impl DeliveryQueue for InMemoryDeliveryQueue {
    fn enqueue(&self, new: NewDelivery) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            new.validate().map_err(|e| CoreError::InvalidInput(e.to_string()))?;

            let delivery = Delivery::from_new(new, self.clock.now_utc());
            let mut state = self.state.lock().await;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.ready.insert((delivery.next_attempt, sequence), delivery.id);
            state.entries.insert(delivery.id, Entry { delivery: delivery.clone(), sequence });
            Ok(delivery)
        })
    }

    fn dequeue_ready(&self, now: DateTime<Utc>) -> QueueFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;

            let Some((&key, _)) = state.ready.first_key_value() else {
                return Ok(None);
            };
            if key.0 > now {
                return Ok(None);
            }

            let Some(id) = state.ready.remove(&key) else {
                return Ok(None);
            };
            let entry = state
                .entries
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("delivery {id} missing from queue")))?;

            entry.delivery.status = DeliveryStatus::InFlight;
            entry.delivery.updated_at = self.clock.now_utc();
            Ok(Some(entry.delivery.clone()))
        })
    }

    fn requeue(
        &self,
        delivery: Delivery,
        next_attempt: DateTime<Utc>,
    ) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut state = self.state.lock().await;

            let entry = state.in_flight_entry(&delivery, "requeue")?;
            entry.delivery.status = DeliveryStatus::Pending;
            entry.delivery.attempt_count = delivery.attempt_count;
            entry.delivery.last_attempt_at = delivery.last_attempt_at;
            entry.delivery.next_attempt = next_attempt;
            entry.delivery.updated_at = now;
            let sequence = entry.sequence;
            let updated = entry.delivery.clone();

            state.ready.insert((next_attempt, sequence), updated.id);
            Ok(updated)
        })
    }

    fn finalize(&self, delivery: Delivery, resolution: Resolution) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut state = self.state.lock().await;

            let entry = state.in_flight_entry(&delivery, "finalize")?;
            entry.delivery.status = resolution.status();
            entry.delivery.attempt_count = delivery.attempt_count;
            entry.delivery.last_attempt_at = delivery.last_attempt_at;
            entry.delivery.updated_at = now;
            match resolution {
                Resolution::Delivered => entry.delivery.delivered_at = Some(now),
                Resolution::DeadLetter { diagnostic } => {
                    entry.delivery.diagnostic = Some(diagnostic);
                },
            }
            Ok(entry.delivery.clone())
        })
    }

    fn cancel(&self, id: DeliveryId) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut state = self.state.lock().await;

            let entry = state
                .entries
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;
            if entry.delivery.status != DeliveryStatus::Pending {
                return Err(CoreError::invalid_transition(
                    id,
                    entry.delivery.status,
                    "only pending deliveries can be cancelled",
                ));
            }

            entry.delivery.status = DeliveryStatus::Cancelled;
            entry.delivery.updated_at = now;
            let key = (entry.delivery.next_attempt, entry.sequence);
            let cancelled = entry.delivery.clone();

            state.ready.remove(&key);
            Ok(cancelled)
        })
    }

    fn find(&self, id: DeliveryId) -> QueueFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            Ok(self.state.lock().await.entries.get(&id).map(|entry| entry.delivery.clone()))
        })
    }

    fn list(
        &self,
        status: Option<DeliveryStatus>,
        limit: usize,
    ) -> QueueFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            let state = self.state.lock().await;

            let mut entries: Vec<&Entry> = state
                .entries
                .values()
                .filter(|entry| status.map_or(true, |s| entry.delivery.status == s))
                .collect();
            entries.sort_by_key(|entry| entry.sequence);

            Ok(entries.into_iter().take(limit).map(|entry| entry.delivery.clone()).collect())
        })
    }
}
