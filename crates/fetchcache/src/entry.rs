use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Caller-supplied side information stored alongside a value. Never interpreted by the cache.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A single cached value together with its bookkeeping.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    /// The cached payload.
    pub value: T,
    /// When the entry was written.
    pub stored_at: Instant,
    /// The effective time-to-live of this entry.
    pub ttl: Duration,
    /// An opaque freshness token of the upstream response, like an `ETag`.
    pub validator: Option<String>,
    /// Caller-supplied side information.
    pub metadata: Option<Metadata>,
}

impl<T> CacheEntry<T> {
    /// The age of this entry at `now`.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    /// Whether this entry has outlived its TTL at `now`.
    pub fn is_stale_at(&self, now: Instant) -> bool {
        self.age_at(now) > self.ttl
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }
}

/// Whether a looked up entry is unusable without a refresh at `now`.
///
/// A missing entry is always stale.
pub fn is_stale<T>(entry: Option<&CacheEntry<T>>, now: Instant) -> bool {
    entry.is_none_or(|entry| entry.is_stale_at(now))
}

/// Per-write options of [`EntryStore::set`](crate::store::EntryStore::set).
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Overrides the default TTL of the cache.
    pub ttl: Option<Duration>,
    pub validator: Option<String>,
    pub metadata: Option<Metadata>,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
