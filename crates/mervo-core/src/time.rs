//! Clock abstraction for due-time and backoff scheduling.
//!
//! A delivery's `next_attempt` is a UTC timestamp, while idle workers sleep
//! on monotonic time. Both go through `Clock` so tests can walk a delivery
//! through its whole retry schedule without waiting for real backoff.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Boxed future returned by [`Clock::sleep`].
pub type Sleep<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Source of time for the queue, dispatcher and workers.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for `next_attempt` and the audit timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Waits for `duration`.
    fn sleep(&self, duration: Duration) -> Sleep<'_>;
}

/// Clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock.
///
/// Clones share one offset, so the copy handed to a queue and the copy kept
/// by a test always agree. `sleep` advances the offset and yields instead of
/// waiting.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    start_utc: DateTime<Utc>,
    start_instant: Instant,
}

impl TestClock {
    /// Starts at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Starts at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            start_utc: start,
            start_instant: Instant::now(),
        }
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Total time advanced since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.start_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.start_utc.checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
