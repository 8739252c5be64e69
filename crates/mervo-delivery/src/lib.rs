//! Outbound webhook delivery with bounded retries.
//!
//! Producers enqueue deliveries; workers claim due ones, sign the serialized
//! payload, POST it once per attempt, and either mark the delivery
//! delivered, requeue it with capped exponential backoff, or dead-letter it
//! when the attempt budget is spent.
//!
//! # Architecture
//!
//! 1. **Queue** - [`queue::DeliveryQueue`] hands each due delivery to exactly
//!    one caller. In-memory and PostgreSQL (`FOR UPDATE SKIP LOCKED`)
//!    backends are provided.
//! 2. **Dispatcher** - [`dispatcher::Dispatcher`] performs one attempt and
//!    records its outcome.
//! 3. **Engine** - [`DeliveryEngine`] runs N workers over one dispatcher and
//!    shuts them down gracefully.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mervo_core::{Clock, RealClock};
//! use mervo_delivery::{queue::InMemoryDeliveryQueue, DeliveryConfig, DeliveryEngine};
//!
//! # async fn example() -> mervo_delivery::Result<()> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let queue = Arc::new(InMemoryDeliveryQueue::new(clock.clone()));
//! let mut engine = DeliveryEngine::new(queue, DeliveryConfig::default(), clock)?;
//!
//! engine.start().await?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};
pub use queue::{DeliveryQueue, InMemoryDeliveryQueue, PostgresDeliveryQueue, Resolution};
pub use retry::{backoff, BackoffPolicy, RetryPolicy};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 1;
