//! Property-Based Tests for the Smart Query Cache
//!
//! A write request never reads from the cache, a caller who wrote within
//! the recency window never reads from the cache, and everyone else gets
//! the cached value verbatim until it expires.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use stashdb_storage::{cache_key, InMemoryCacheBackend, SmartQueryCache};
use stashdb_test_utils::generators::{arb_method, arb_scalar_value};
use stashdb_test_utils::{requests, Clock, ManualClock, RequestContext, SyncPolicy, Value};

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_cache() -> (SmartQueryCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let policy = SyncPolicy::default();
    let backend = Arc::new(InMemoryCacheBackend::new(policy.max_entries_per_bucket));
    (SmartQueryCache::new(backend, policy, clock.clone()), clock)
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_write_methods_always_miss(
        method in arb_method(),
        args in prop::collection::vec(arb_scalar_value(), 0..4),
        cached in any::<i64>(),
    ) {
        let (cache, _clock) = test_cache();
        let key = cache_key("widgets", "SELECT * FROM widgets WHERE count > $1", &args);
        cache.set("widgets", &key, cached);

        let ctx = RequestContext::web(method.clone());
        let result = cache.get_smart::<i64>(&ctx, "widgets", &key);
        if method == "GET" {
            prop_assert_eq!(result, Some(cached));
        } else {
            prop_assert_eq!(result, None);
        }
    }

    #[test]
    fn prop_recent_postback_misses(ago_ms in 0i64..15_000, cached in any::<i32>()) {
        let (cache, clock) = test_cache();
        cache.set("widgets", "k", cached);

        let ctx = requests::get_after_write(clock.as_ref(), ago_ms);
        prop_assert_eq!(cache.get_smart::<i32>(&ctx, "widgets", "k"), None);
    }

    #[test]
    fn prop_old_postback_hits(ago_ms in 15_000i64..10_000_000, cached in any::<i32>()) {
        let (cache, clock) = test_cache();
        cache.set("widgets", "k", cached);

        let ctx = requests::get_after_write(clock.as_ref(), ago_ms);
        prop_assert_eq!(cache.get_smart::<i32>(&ctx, "widgets", "k"), Some(cached));
    }

    #[test]
    fn prop_entries_expire_after_ttl(extra_ms in 0u64..60_000, cached in any::<i32>()) {
        let (cache, clock) = test_cache();
        cache.set("widgets", "k", cached);
        clock.advance(Duration::from_secs(15) + Duration::from_millis(extra_ms));
        prop_assert_eq!(cache.get_smart::<i32>(&requests::get(), "widgets", "k"), None);
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[test]
fn test_absent_marker_hits() {
    let (cache, _clock) = test_cache();
    cache.set("widgets", "k", "cached".to_string());
    assert_eq!(
        cache.get_smart::<String>(&requests::get(), "widgets", "k"),
        Some("cached".to_string())
    );
}

#[test]
fn test_background_requests_skip_once_per_key() {
    let (cache, _clock) = test_cache();
    cache.set("widgets", "a", 1_i32);
    cache.set("widgets", "b", 2_i32);

    for ctx in [requests::task(), requests::job()] {
        assert_eq!(cache.get_smart::<i32>(&ctx, "widgets", "a"), None);
        assert_eq!(cache.get_smart::<i32>(&ctx, "widgets", "b"), None);
        assert_eq!(cache.get_smart::<i32>(&ctx, "widgets", "a"), Some(1));
    }
}

#[test]
fn test_clear_bucket_evicts_only_that_bucket() {
    let (cache, _clock) = test_cache();
    cache.set("widgets", "k", 1_i32);
    cache.set("articles", "k", 2_i32);
    cache.clear_bucket("widgets");

    assert_eq!(cache.get::<i32>("widgets", "k"), None);
    assert_eq!(cache.get::<i32>("articles", "k"), Some(2));
}

#[test]
fn test_stats_track_hits_and_misses() {
    let (cache, clock) = test_cache();
    cache.set("widgets", "k", Value::Int(1));
    assert!(cache.get::<Value>("widgets", "k").is_some());
    assert!(cache.get::<Value>("widgets", "missing").is_none());
    clock.advance(Duration::from_secs(20));
    assert!(cache.get::<Value>("widgets", "k").is_none());

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(clock.now_millis(), ManualClock::default().now_millis() + 20_000);
}

#[test]
fn test_full_bucket_evicts_one_entry_on_manual_clock() {
    let clock = Arc::new(ManualClock::default());
    let backend = Arc::new(InMemoryCacheBackend::new(3));
    let cache = SmartQueryCache::new(backend, SyncPolicy::default(), clock.clone());
    for (n, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
        cache.set("widgets", key, n as i32);
        clock.advance(Duration::from_millis(1));
    }

    let live: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .filter(|key| cache.get::<i32>("widgets", key).is_some())
        .collect();
    assert_eq!(live, vec!["b", "c", "d"]);
    assert_eq!(cache.stats().evictions, 1);
}
