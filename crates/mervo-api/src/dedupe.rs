//! Bounded, time-windowed store of inbound event ids.
//!
//! Backed by a `moka` cache, so memory is capped by `max_entries` and ids
//! are forgotten after `ttl`.

use std::time::Duration;

use moka::future::Cache;

/// Dedupe store configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeConfig {
    /// How long an event id is remembered.
    pub ttl: Duration,
    /// Maximum number of remembered ids.
    pub max_entries: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(24 * 60 * 60), max_entries: 100_000 }
    }
}

/// Remembers inbound event ids for a bounded window.
#[derive(Clone)]
pub struct DedupeStore {
    seen: Cache<String, ()>,
}

impl DedupeStore {
    /// Creates an empty store.
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .build(),
        }
    }

    /// Records `event_id`, returning true only for its first sighting
    /// within the window.
    ///
    /// Concurrent calls with the same id see exactly one `true`.
    pub async fn check_and_record(&self, event_id: &str) -> bool {
        self.seen.entry_by_ref(event_id).or_insert(()).await.is_fresh()
    }

    /// Returns true if `event_id` is currently remembered.
    pub async fn contains(&self, event_id: &str) -> bool {
        self.seen.get(event_id).await.is_some()
    }

    /// Approximate number of remembered ids.
    pub fn len(&self) -> u64 {
        self.seen.entry_count()
    }

    /// Returns true when no ids are remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupeStore {
    fn default() -> Self {
        Self::new(DedupeConfig::default())
    }
}

impl std::fmt::Debug for DedupeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeStore").field("entries", &self.seen.entry_count()).finish()
    }
}
