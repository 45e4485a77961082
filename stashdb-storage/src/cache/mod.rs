//! Smart Query Cache.
//!
//! A time-boxed, bucket-partitioned cache of query results. Reads consult
//! the current [`stashdb_core::RequestContext`] and force a miss right after
//! the caller's own write, so a user never reads back stale results while
//! unrelated readers keep hitting the cache.
//!
//! Caching is purely an optimization: every cached path has an uncached
//! equivalent that produces the same result at read time.

pub mod backend;
pub mod smart;

pub use backend::{CacheBackend, CacheStats, CachedValue, InMemoryCacheBackend};
pub use smart::{cache_key, SmartQueryCache};
