//! Delivery engine: configuration, statistics and worker lifecycle.

use std::{sync::Arc, time::Duration};

use mervo_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::{ClientConfig, DeliveryClient},
    dispatcher::{DispatchOutcome, Dispatcher},
    error::{DeliveryError, Result},
    queue::DeliveryQueue,
    retry::RetryPolicy,
    worker,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Attempt budget and backoff.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: Duration::from_secs(1),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Dispatches attempted since startup.
    pub deliveries_processed: u64,
    /// Deliveries acknowledged with 2xx.
    pub delivered: u64,
    /// Failed attempts that were requeued.
    pub retried: u64,
    /// Deliveries moved to dead-letter.
    pub dead_lettered: u64,
    /// Dispatches whose queue write failed.
    pub queue_errors: u64,
    /// Dispatches currently running.
    pub in_flight: u64,
}

impl EngineStats {
    /// Records the result of one dispatch.
    pub(crate) fn record(&mut self, result: &Result<DispatchOutcome>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.deliveries_processed += 1;
        match result {
            Ok(DispatchOutcome::Delivered { .. }) => self.delivered += 1,
            Ok(DispatchOutcome::Retrying { .. }) => self.retried += 1,
            Ok(DispatchOutcome::DeadLettered { .. }) => self.dead_lettered += 1,
            Err(_) => self.queue_errors += 1,
        }
    }
}

/// Runs delivery workers against a queue.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine over `queue`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for a zero worker count or an
    /// HTTP client that cannot be built.
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be greater than zero"));
        }

        let client = DeliveryClient::new(config.client_config.clone())?;
        let dispatcher =
            Arc::new(Dispatcher::new(queue, client, config.retry_policy, clock.clone()));

        Ok(Self {
            config,
            dispatcher,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Spawns the worker pool and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the engine is already
    /// running or was shut down.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::configuration("delivery engine was shut down"));
        }

        info!(
            worker_count = self.config.worker_count,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_attempts = self.config.retry_policy.max_attempts,
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.config.worker_count,
            self.config.poll_interval,
            self.dispatcher.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await;
        self.worker_pool = Some(worker_pool);

        Ok(())
    }

    /// Stops workers after their current attempt.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` or `DeliveryError::WorkerPanic`
    /// from the worker pool.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        match self.worker_pool.take() {
            Some(worker_pool) => worker_pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => Ok(()),
        }
    }

    /// Returns a snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Dispatches one due delivery on the calling task.
    ///
    /// This is the manual trigger used by operators and `run-once`; it works
    /// whether or not workers are running.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Queue` when the queue cannot be read or written.
    pub async fn process_one(&self) -> Result<Option<DispatchOutcome>> {
        worker::process_one(&self.dispatcher, &self.stats, self.clock.as_ref()).await
    }

    /// Dispatcher shared by the workers.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Queue the engine drains.
    pub fn queue(&self) -> Arc<dyn DeliveryQueue> {
        self.dispatcher.queue().clone()
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }
}
