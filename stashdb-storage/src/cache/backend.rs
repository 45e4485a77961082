//! Cache backend trait and the in-memory implementation.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A type-erased cached result.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be safe for concurrent get/put: nothing above this
/// trait takes a lock around them.
pub trait CacheBackend: Send + Sync {
    /// Get a live entry. Entries whose expiry is at or before `now` are misses.
    fn get(&self, bucket: &str, key: &str, now: DateTime<Utc>) -> Option<CachedValue>;

    /// Store an entry that expires at `expires_at`. `now` decides which
    /// entries are already expired when the bucket is full.
    fn put(
        &self,
        bucket: &str,
        key: &str,
        value: CachedValue,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    );

    /// Remove every entry in a bucket. Returns the number removed.
    fn clear_bucket(&self, bucket: &str) -> u64;

    /// Get cache statistics.
    fn stats(&self) -> CacheStats;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    value: CachedValue,
    expires_at: DateTime<Utc>,
}

/// Concurrent in-memory backend, one map per bucket.
///
/// A full bucket drops its expired entries first, then the entry closest
/// to expiry.
pub struct InMemoryCacheBackend {
    buckets: DashMap<String, DashMap<String, Entry>>,
    max_entries_per_bucket: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for InMemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCacheBackend")
            .field("buckets", &self.buckets.len())
            .field("max_entries_per_bucket", &self.max_entries_per_bucket)
            .finish()
    }
}

impl InMemoryCacheBackend {
    pub fn new(max_entries_per_bucket: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            max_entries_per_bucket: max_entries_per_bucket.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn make_room(&self, entries: &DashMap<String, Entry>, now: DateTime<Utc>) {
        if entries.len() < self.max_entries_per_bucket {
            return;
        }
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let mut evicted = (before - entries.len()) as u64;

        while entries.len() >= self.max_entries_per_bucket {
            let oldest = entries
                .iter()
                .min_by_key(|e| e.value().expires_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn get(&self, bucket: &str, key: &str, now: DateTime<Utc>) -> Option<CachedValue> {
        let found = self.buckets.get(bucket).and_then(|entries| {
            let live = entries
                .get(key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.value.clone());
            if live.is_none() {
                entries.remove_if(key, |_, entry| entry.expires_at <= now);
            }
            live
        });
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        value: CachedValue,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let entries = self.buckets.entry(bucket.to_string()).or_default();
        if !entries.contains_key(key) {
            self.make_room(&entries, now);
        }
        entries.insert(key.to_string(), Entry { value, expires_at });
    }

    fn clear_bucket(&self, bucket: &str) -> u64 {
        match self.buckets.get(bucket) {
            Some(entries) => {
                let removed = entries.len() as u64;
                entries.clear();
                removed
            }
            None => 0,
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.buckets.iter().map(|b| b.value().len() as u64).sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
