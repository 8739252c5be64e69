//! Supervised set of delivery workers.
//!
//! Spawns one tokio task per worker and owns their join handles. Shutdown
//! cancels the shared token and waits for every worker to finish its current
//! attempt, bounded by a timeout.

use std::{sync::Arc, time::Duration};

use mervo_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    engine::EngineStats,
    error::{DeliveryError, Result},
    worker::DeliveryWorker,
};

/// Worker tasks sharing one dispatcher.
pub(crate) struct WorkerPool {
    worker_count: usize,
    poll_interval: Duration,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    pub(crate) fn new(
        worker_count: usize,
        poll_interval: Duration,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker_count,
            poll_interval,
            dispatcher,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns the configured number of workers.
    pub(crate) async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.dispatcher.clone(),
                self.stats.clone(),
                self.poll_interval,
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Cancels all workers and waits for them to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` when the workers do not stop
    /// within `timeout`, or `DeliveryError::WorkerPanic` for the first worker
    /// task that panicked.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = timeout.as_millis(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();

        let shutdown_future = async move {
            let mut first_panic = None;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker failed during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(timeout_ms = timeout.as_millis(), "worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(active_workers = active, "worker pool dropped without shutdown");
            self.cancellation_token.cancel();
        }
    }
}
