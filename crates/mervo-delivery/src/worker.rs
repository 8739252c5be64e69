//! Polling delivery worker.
//!
//! A worker repeatedly claims one due delivery and dispatches it. Attempts
//! run to completion even when shutdown is requested; cancellation is only
//! observed between attempts and while idle.

use std::{sync::Arc, time::Duration};

use mervo_core::Clock;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    dispatcher::{DispatchOutcome, Dispatcher},
    engine::EngineStats,
    error::Result,
};

/// Pause after a queue error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Claims one due delivery, dispatches it and records the result in `stats`.
pub(crate) async fn process_one(
    dispatcher: &Dispatcher,
    stats: &RwLock<EngineStats>,
    clock: &dyn Clock,
) -> Result<Option<DispatchOutcome>> {
    let Some(delivery) = dispatcher.queue().dequeue_ready(clock.now_utc()).await? else {
        return Ok(None);
    };

    stats.write().await.in_flight += 1;
    let result = dispatcher.dispatch(delivery).await;
    stats.write().await.record(&result);

    result.map(Some)
}

/// Single delivery worker.
pub(crate) struct DeliveryWorker {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<RwLock<EngineStats>>,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    pub(crate) fn new(
        id: usize,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<RwLock<EngineStats>>,
        poll_interval: Duration,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, dispatcher, stats, poll_interval, cancellation_token, clock }
    }

    /// Claims and dispatches deliveries until cancelled.
    ///
    /// Queue errors are logged and retried after a pause; they never end
    /// the loop.
    pub(crate) async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match process_one(&self.dispatcher, &self.stats, self.clock.as_ref()).await {
                Ok(Some(outcome)) => {
                    debug!(
                        worker_id = self.id,
                        delivery_id = %outcome.delivery_id(),
                        "delivery dispatched"
                    );
                },
                Ok(None) => {
                    tokio::select! {
                        () = self.clock.sleep(self.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "delivery processing failed");
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }
}
