//! Polling sync protocol between a table and its in-memory stash.
//!
//! Per bucket and per logical request the state moves from not-checked to
//! either checked-no-sync-needed or checked-synced. A sync re-reads every
//! row updated since the last high-water mark and merges it into the stash.
//! The high-water mark only advances after the full delta has been read,
//! so a failed attempt is re-covered by the next one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use stashdb_core::{Clock, Millis, Model, RequestContext, StashResult, SyncPolicy};
use tokio::sync::Mutex;

use crate::cache::SmartQueryCache;
use crate::stash::Stash;

/// Source of rows changed since a point in time.
#[async_trait]
pub trait DeltaSource<M: Model>: Send + Sync {
    /// Every row whose `row_updated_at` is at or after `since`.
    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> StashResult<Vec<M>>;
}

/// What a pre-read check ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This request already checked the bucket.
    AlreadyChecked,
    /// The bucket is fresh enough for this request.
    NotNeeded,
    /// The lock was not acquired in time; current stash state is served.
    LockUnavailable,
    /// Another task synced past this request's start while we waited.
    SyncedElsewhere,
    /// The delta was merged. `changed` counts rows that altered the stash.
    Synced { changed: usize },
}

/// Sync state for one bucket.
pub struct BucketSyncer {
    bucket: String,
    last_sync_millis: AtomicI64,
    lock: Mutex<()>,
    policy: SyncPolicy,
    clock: Arc<dyn Clock>,
    cache: SmartQueryCache,
}

impl std::fmt::Debug for BucketSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketSyncer")
            .field("bucket", &self.bucket)
            .field("last_sync_millis", &self.last_sync_millis())
            .finish_non_exhaustive()
    }
}

impl BucketSyncer {
    pub fn new(
        bucket: impl Into<String>,
        policy: SyncPolicy,
        clock: Arc<dyn Clock>,
        cache: SmartQueryCache,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            last_sync_millis: AtomicI64::new(0),
            lock: Mutex::new(()),
            policy,
            clock,
            cache,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// High-water mark of the last successful sync, in epoch milliseconds.
    pub fn last_sync_millis(&self) -> Millis {
        self.last_sync_millis.load(Ordering::SeqCst)
    }

    /// Seed the high-water mark, e.g. after a full initial load.
    pub fn set_last_sync_millis(&self, millis: Millis) {
        self.last_sync_millis.store(millis, Ordering::SeqCst);
    }

    fn synced_marker(&self) -> String {
        format!("bucket-synced:{}", self.bucket)
    }

    /// Whether this request needs a fresh sync before reading.
    pub fn check_needs_sync(&self, ctx: &RequestContext) -> bool {
        if ctx.is_background() || ctx.is_write_method() {
            return true;
        }
        let now = self.clock.now_millis();
        if self.last_sync_millis() < now - self.policy.sync_interval_millis() {
            return true;
        }
        ctx.has_recent_postback(now, self.policy.recency_window_millis())
    }

    /// Run the pre-read check for `ctx`, syncing the stash if needed.
    ///
    /// Never blocks longer than the policy's lock timeout; on timeout the
    /// sync is skipped and the current stash is served.
    pub async fn on_pre_read<M: Model>(
        &self,
        ctx: &RequestContext,
        source: &dyn DeltaSource<M>,
        stash: &dyn Stash<M>,
    ) -> StashResult<SyncOutcome> {
        let request_now = self.clock.now_millis();
        if !ctx.mark_once(&self.synced_marker()) {
            return Ok(SyncOutcome::AlreadyChecked);
        }
        if !self.check_needs_sync(ctx) {
            return Ok(SyncOutcome::NotNeeded);
        }

        let _guard = match tokio::time::timeout(self.policy.lock_timeout, self.lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(
                    bucket = %self.bucket,
                    timeout_ms = self.policy.lock_timeout.as_millis() as u64,
                    "Could not acquire sync lock; serving current stash"
                );
                return Ok(SyncOutcome::LockUnavailable);
            }
        };

        if self.last_sync_millis() >= request_now {
            return Ok(SyncOutcome::SyncedElsewhere);
        }

        let changed = self.sync_locked(source, stash).await?;
        Ok(SyncOutcome::Synced { changed })
    }

    /// Sync regardless of request state. Waits for the lock without timeout.
    pub async fn force_sync<M: Model>(
        &self,
        source: &dyn DeltaSource<M>,
        stash: &dyn Stash<M>,
    ) -> StashResult<usize> {
        let _guard = self.lock.lock().await;
        self.sync_locked(source, stash).await
    }

    async fn sync_locked<M: Model>(
        &self,
        source: &dyn DeltaSource<M>,
        stash: &dyn Stash<M>,
    ) -> StashResult<usize> {
        let sync_start = self.clock.now_millis();
        let since = Utc
            .timestamp_millis_opt(self.last_sync_millis())
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        // On error the high-water mark stays put.
        let items = source.fetch_updated_since(since).await?;
        let fetched = items.len();
        let changed = items
            .into_iter()
            .map(|item| stash.load_item(item))
            .filter(|changed| *changed)
            .count();

        self.last_sync_millis.store(sync_start, Ordering::SeqCst);
        if changed > 0 {
            self.cache.clear_bucket(&self.bucket);
        }
        tracing::debug!(
            bucket = %self.bucket,
            fetched,
            changed,
            "Synced bucket from database"
        );
        Ok(changed)
    }
}
