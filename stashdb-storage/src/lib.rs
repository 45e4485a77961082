//! StashDB Storage - Query Cache, Stash and Sync
//!
//! In-process state that sits in front of the database: the request-aware
//! Smart Query Cache, the per-bucket in-memory stash, and the polling sync
//! protocol that keeps the stash fresh.

pub mod cache;
pub mod stash;
pub mod sync;

pub use cache::{
    cache_key, CacheBackend, CacheStats, CachedValue, InMemoryCacheBackend, SmartQueryCache,
};
pub use stash::{MemoryStash, Stash};
pub use sync::{BucketSyncer, DeltaSource, SyncOutcome};
