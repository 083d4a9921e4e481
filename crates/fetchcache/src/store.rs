//! Bounded storage of cache entries.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::entry::{CacheEntry, SetOptions};

/// A size-bounded map of cache entries with least-recently-used eviction.
///
/// The store never hides stale entries: expiry is decided by the reader, so that stale values can
/// still be served while they are being revalidated. Stale entries only leave the store through
/// eviction, [`delete`](Self::delete), [`clear`](Self::clear) or an explicit
/// [`prune`](Self::prune).
///
/// The store is not synchronized, the owning [`Cache`](crate::Cache) keeps it behind its lock.
#[derive(Debug)]
pub struct EntryStore<T> {
    entries: LruCache<String, CacheEntry<T>>,
    default_ttl: Duration,
    update_age_on_access: bool,
}

impl<T> EntryStore<T> {
    pub fn new(max_entries: NonZeroUsize, default_ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(max_entries),
            default_ttl,
            update_age_on_access: true,
        }
    }

    /// Controls whether [`get`](Self::get) marks entries as recently used.
    pub fn with_update_age_on_access(mut self, update_age_on_access: bool) -> Self {
        self.update_age_on_access = update_age_on_access;
        self
    }

    /// Looks up an entry, regardless of whether it is stale.
    ///
    /// Unless disabled, this marks the entry as recently used. It never extends its TTL.
    pub fn get(&mut self, key: &str) -> Option<&CacheEntry<T>> {
        if self.update_age_on_access {
            self.entries.get(key)
        } else {
            self.entries.peek(key)
        }
    }

    /// Looks up an entry without touching its recency.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<T>> {
        self.entries.peek(key)
    }

    /// Inserts or replaces the entry for `key`, stored as of now.
    ///
    /// If the store is full and `key` is new, the least recently used entry is evicted first and
    /// returned.
    pub fn set(
        &mut self,
        key: String,
        value: T,
        options: SetOptions,
    ) -> Option<(String, CacheEntry<T>)> {
        let SetOptions {
            ttl,
            validator,
            metadata,
        } = options;
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            validator,
            metadata,
        };

        // `push` also hands back the previous entry of a replaced key, which is not an eviction.
        let is_replace = self.entries.contains(&key);
        let evicted = self.entries.push(key, entry);
        evicted.filter(|_| !is_replace)
    }

    /// Whether an entry exists for `key`. Does not touch its recency.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Removes every entry that outlived its own TTL at `now`, returning how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_stale_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// All keys, most recently used first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }
}
