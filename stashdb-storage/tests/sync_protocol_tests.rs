//! Sync protocol tests: high-water-mark monotonicity, per-request
//! memoization, the bounded lock wait, and cache invalidation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stashdb_storage::{BucketSyncer, DeltaSource, MemoryStash, SmartQueryCache, Stash, SyncOutcome};
use stashdb_test_utils::{
    requests, Clock, ManualClock, StashResult, SyncPolicy, VecDeltaSource, Widget,
};

// ============================================================================
// HELPERS
// ============================================================================

fn widget(id: i64, name: &str, count: i32, modified: i64) -> Widget {
    Widget {
        id: Some(id),
        name: name.to_string(),
        count,
        last_modified_millis: modified,
        ..Widget::default()
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    cache: SmartQueryCache,
    syncer: BucketSyncer,
    stash: MemoryStash<Widget>,
}

fn harness(policy: SyncPolicy) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let cache = SmartQueryCache::new(
        Arc::new(stashdb_storage::InMemoryCacheBackend::default()),
        policy.clone(),
        clock.clone(),
    );
    let syncer = BucketSyncer::new("widgets", policy, clock.clone(), cache.clone());
    Harness {
        clock,
        cache,
        syncer,
        stash: MemoryStash::new("widgets"),
    }
}

/// Delays every fetch so concurrent requests contend for the lock.
struct SlowSource {
    inner: VecDeltaSource<Widget>,
    delay: Duration,
}

#[async_trait]
impl DeltaSource<Widget> for SlowSource {
    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> StashResult<Vec<Widget>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_updated_since(since).await
    }
}

// ============================================================================
// HIGH-WATER MARK
// ============================================================================

#[tokio::test]
async fn test_successful_sync_advances_to_start_time() {
    let h = harness(SyncPolicy::default());
    let source = VecDeltaSource::new(vec![widget(1, "a", 1, 10), widget(2, "b", 2, 20)]);
    let start = h.clock.now_millis();

    let outcome = h
        .syncer
        .on_pre_read::<Widget>(&requests::task(), &source, &h.stash)
        .await
        .unwrap();

    assert_eq!(outcome, SyncOutcome::Synced { changed: 2 });
    assert_eq!(h.syncer.last_sync_millis(), start);
    assert_eq!(h.stash.len(), 2);
}

#[tokio::test]
async fn test_failed_sync_keeps_high_water_mark() {
    let h = harness(SyncPolicy::default());
    h.syncer.set_last_sync_millis(500);
    let source = VecDeltaSource::new(vec![widget(1, "a", 1, 600)]);
    source.fail_next();

    let result = h.syncer.on_pre_read::<Widget>(&requests::task(), &source, &h.stash).await;
    assert!(result.is_err());
    assert_eq!(h.syncer.last_sync_millis(), 500);
    assert!(h.stash.is_empty());

    // The retry re-covers the same window.
    let outcome = h
        .syncer
        .on_pre_read::<Widget>(&requests::task(), &source, &h.stash)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { changed: 1 });
    assert_eq!(source.last_since_millis(), Some(500));
    assert_eq!(h.syncer.last_sync_millis(), h.clock.now_millis());
}

// ============================================================================
// NEEDS-SYNC POLICY
// ============================================================================

#[tokio::test]
async fn test_bucket_checked_once_per_request() {
    let h = harness(SyncPolicy::default());
    let source = VecDeltaSource::new(vec![widget(1, "a", 1, 10)]);
    let ctx = requests::task();

    let first = h.syncer.on_pre_read::<Widget>(&ctx, &source, &h.stash).await.unwrap();
    let second = h.syncer.on_pre_read::<Widget>(&ctx, &source, &h.stash).await.unwrap();
    assert!(matches!(first, SyncOutcome::Synced { .. }));
    assert_eq!(second, SyncOutcome::AlreadyChecked);
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn test_fresh_get_skips_until_interval_elapses() {
    let h = harness(SyncPolicy::default());
    let source = VecDeltaSource::new(vec![]);
    h.syncer.set_last_sync_millis(h.clock.now_millis());

    let outcome = h
        .syncer
        .on_pre_read::<Widget>(&requests::get(), &source, &h.stash)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::NotNeeded);

    h.clock.advance(Duration::from_secs(16));
    let outcome = h
        .syncer
        .on_pre_read::<Widget>(&requests::get(), &source, &h.stash)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { changed: 0 });
}

#[tokio::test]
async fn test_write_method_and_recent_postback_force_sync() {
    let h = harness(SyncPolicy::default());
    h.syncer.set_last_sync_millis(h.clock.now_millis() - 1);

    assert!(h.syncer.check_needs_sync(&requests::post()));
    assert!(h.syncer.check_needs_sync(&requests::job()));
    assert!(h
        .syncer
        .check_needs_sync(&requests::get_after_write(h.clock.as_ref(), 2_000)));
    assert!(!h.syncer.check_needs_sync(&requests::get()));
}

// ============================================================================
// LOCKING
// ============================================================================

#[tokio::test]
async fn test_lock_timeout_gives_up_silently() {
    let policy = SyncPolicy::default().with_lock_timeout(Duration::from_millis(50));
    let h = harness(policy);
    let source = SlowSource {
        inner: VecDeltaSource::new(vec![widget(1, "a", 1, 10)]),
        delay: Duration::from_millis(300),
    };

    let first_ctx = requests::task();
    let second_ctx = requests::task();
    let (first, second) = tokio::join!(
        h.syncer.on_pre_read::<Widget>(&first_ctx, &source, &h.stash),
        h.syncer.on_pre_read::<Widget>(&second_ctx, &source, &h.stash),
    );

    assert_eq!(first.unwrap(), SyncOutcome::Synced { changed: 1 });
    assert_eq!(second.unwrap(), SyncOutcome::LockUnavailable);
}

#[tokio::test]
async fn test_waiter_sees_sync_done_elsewhere() {
    let policy = SyncPolicy::default().with_lock_timeout(Duration::from_secs(5));
    let h = harness(policy);
    let source = SlowSource {
        inner: VecDeltaSource::new(vec![widget(1, "a", 1, 10)]),
        delay: Duration::from_millis(50),
    };

    let first_ctx = requests::task();
    let second_ctx = requests::task();
    let (first, second) = tokio::join!(
        h.syncer.on_pre_read::<Widget>(&first_ctx, &source, &h.stash),
        h.syncer.on_pre_read::<Widget>(&second_ctx, &source, &h.stash),
    );

    assert_eq!(first.unwrap(), SyncOutcome::Synced { changed: 1 });
    assert_eq!(second.unwrap(), SyncOutcome::SyncedElsewhere);
    assert_eq!(source.inner.fetch_count(), 1);
}

// ============================================================================
// CACHE INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_changes_clear_cache_bucket() {
    let h = harness(SyncPolicy::default());
    let source = VecDeltaSource::new(vec![widget(1, "a", 1, 10)]);
    h.syncer.force_sync::<Widget>(&source, &h.stash).await.unwrap();

    // Same rows again: nothing changed, cache survives.
    h.cache.set("widgets", "k", 1_i32);
    h.syncer.set_last_sync_millis(0);
    let changed = h.syncer.force_sync::<Widget>(&source, &h.stash).await.unwrap();
    assert_eq!(changed, 0);
    assert_eq!(h.cache.get::<i32>("widgets", "k"), Some(1));

    source.upsert(widget(1, "a", 2, 20)).await;
    h.syncer.set_last_sync_millis(0);
    let changed = h.syncer.force_sync::<Widget>(&source, &h.stash).await.unwrap();
    assert_eq!(changed, 1);
    assert_eq!(h.cache.get::<i32>("widgets", "k"), None);
    assert_eq!(h.stash.for_id(1).map(|w| w.count), Some(2));
}

#[tokio::test]
async fn test_deleted_rows_leave_stash() {
    let h = harness(SyncPolicy::default());
    let source = VecDeltaSource::new(vec![widget(1, "a", 1, 10)]);
    h.syncer.force_sync::<Widget>(&source, &h.stash).await.unwrap();
    assert_eq!(h.stash.len(), 1);

    let mut gone = widget(1, "a", 1, 20);
    gone.deleted = true;
    source.upsert(gone).await;
    h.syncer.set_last_sync_millis(0);
    h.syncer.force_sync::<Widget>(&source, &h.stash).await.unwrap();
    assert!(h.stash.is_empty());
}
