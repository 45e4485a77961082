//! Request-aware query cache.

use std::sync::Arc;

use chrono::Duration;
use sha2::{Digest, Sha256};
use stashdb_core::{Clock, RequestContext, SyncPolicy, SystemClock, Value};

use super::backend::{CacheBackend, CacheStats, InMemoryCacheBackend};

/// Cache key for a query: SHA-256 over the bucket, SQL text and arguments.
pub fn cache_key(bucket: &str, sql: &str, args: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"SQLQuery");
    hasher.update(bucket.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(sql.as_bytes());
    for arg in args {
        hasher.update(b"\x1f");
        hasher.update(arg.type_name().as_bytes());
        hasher.update(b":");
        hasher.update(arg.cache_key_part().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Time-boxed, bucket-partitioned query cache with read-your-write bypass.
#[derive(Clone)]
pub struct SmartQueryCache {
    backend: Arc<dyn CacheBackend>,
    policy: SyncPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SmartQueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartQueryCache")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for SmartQueryCache {
    fn default() -> Self {
        Self::in_memory(SyncPolicy::default())
    }
}

impl SmartQueryCache {
    pub fn new(backend: Arc<dyn CacheBackend>, policy: SyncPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            policy,
            clock,
        }
    }

    /// In-memory backend sized by the policy, on the system clock.
    pub fn in_memory(policy: SyncPolicy) -> Self {
        let backend = Arc::new(InMemoryCacheBackend::new(policy.max_entries_per_bucket));
        Self::new(backend, policy, Arc::new(SystemClock))
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Look up `key`, unless the request context says this read must bypass
    /// the cache. A bypass is reported as a miss.
    pub fn get_smart<T>(&self, ctx: &RequestContext, bucket: &str, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.check_should_skip(ctx, bucket, key) {
            tracing::trace!(bucket = %bucket, "Skipping cache for this request");
            return None;
        }
        self.get(bucket, key)
    }

    /// Decide whether this lookup must skip the cache.
    ///
    /// A given (bucket, key) is skipped at most once per request; later
    /// lookups in the same request read the cache normally. Otherwise skips
    /// for tasks and jobs, for non-`GET` methods, and when the caller's
    /// recency marker falls inside the recency window.
    pub fn check_should_skip(&self, ctx: &RequestContext, bucket: &str, key: &str) -> bool {
        let memo_key = format!("checked-should-skip-for-key-{}---{}", bucket, key);
        if !ctx.mark_once(&memo_key) {
            return false;
        }
        if ctx.is_background() {
            return true;
        }
        if ctx.is_write_method() {
            return true;
        }
        ctx.has_recent_postback(self.clock.now_millis(), self.policy.recency_window_millis())
    }

    /// Plain lookup with no request heuristics.
    pub fn get<T>(&self, bucket: &str, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.backend
            .get(bucket, key, self.clock.now())
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// Store `value` under `key` for the policy's TTL.
    pub fn set<T>(&self, bucket: &str, key: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        let ttl = Duration::from_std(self.policy.cache_ttl).unwrap_or_else(|_| Duration::seconds(15));
        let now = self.clock.now();
        self.backend.put(bucket, key, Arc::new(value), now + ttl, now);
    }

    /// Evict every entry in `bucket`.
    pub fn clear_bucket(&self, bucket: &str) {
        let removed = self.backend.clear_bucket(bucket);
        if removed > 0 {
            tracing::debug!(bucket = %bucket, removed, "Cleared cache bucket");
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.backend.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_stable_and_distinguishes_args() {
        let a = cache_key("widgets", "SELECT * FROM widgets WHERE id=$1", &[Value::BigInt(1)]);
        let b = cache_key("widgets", "SELECT * FROM widgets WHERE id=$1", &[Value::BigInt(1)]);
        let c = cache_key("widgets", "SELECT * FROM widgets WHERE id=$1", &[Value::BigInt(2)]);
        let d = cache_key("gadgets", "SELECT * FROM widgets WHERE id=$1", &[Value::BigInt(1)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_key_distinguishes_types() {
        let text = cache_key("w", "q", &[Value::Text("1".into())]);
        let int = cache_key("w", "q", &[Value::Int(1)]);
        assert_ne!(text, int);
    }

    #[test]
    fn test_get_downcasts_to_stored_type() {
        let cache = SmartQueryCache::default();
        cache.set("widgets", "k", vec![1_i64, 2, 3]);
        assert_eq!(cache.get::<Vec<i64>>("widgets", "k"), Some(vec![1, 2, 3]));
        assert_eq!(cache.get::<String>("widgets", "k"), None);
    }

    #[test]
    fn test_skip_only_once_per_request() {
        let cache = SmartQueryCache::default();
        cache.set("widgets", "k", 7_i32);
        let ctx = RequestContext::task();
        assert_eq!(cache.get_smart::<i32>(&ctx, "widgets", "k"), None);
        assert_eq!(cache.get_smart::<i32>(&ctx, "widgets", "k"), Some(7));
    }
}
