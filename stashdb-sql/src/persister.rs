//! Persister: CRUD plus an in-memory stash kept fresh by the sync protocol.

use std::sync::Arc;

use stashdb_core::{Model, RequestContext, Schema, StashResult};
use stashdb_storage::{BucketSyncer, MemoryStash, Stash, SyncOutcome};

use crate::crud::SaveOutcome;
use crate::pool::Db;

/// Reads through a [`MemoryStash`] for `M`, writes through [`Db`].
pub struct DbPersister<M> {
    db: Arc<Db>,
    schema: Arc<Schema>,
    stash: MemoryStash<M>,
    syncer: BucketSyncer,
}

impl<M: Model + PartialEq> DbPersister<M> {
    /// `M` must already be registered with `db`.
    pub fn new(db: Arc<Db>) -> StashResult<Self> {
        let schema = db.schema::<M>()?;
        let syncer = BucketSyncer::new(
            schema.bucket(),
            db.policy().clone(),
            db.clock().clone(),
            db.cache().clone(),
        );
        Ok(Self {
            stash: MemoryStash::new(schema.bucket()),
            db,
            schema,
            syncer,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn stash(&self) -> &MemoryStash<M> {
        &self.stash
    }

    pub fn syncer(&self) -> &BucketSyncer {
        &self.syncer
    }

    /// Replace the stash with every row in the table and start the sync
    /// high-water mark at the time the read began.
    pub async fn load_all(&self) -> StashResult<usize> {
        let started = self.db.clock().now_millis();
        let items = self.db.fetch_all::<M>().await?;
        self.stash.reset();
        let count = items.len();
        for item in items {
            self.stash.load_item(item);
        }
        self.syncer.set_last_sync_millis(started);
        tracing::info!(table = %self.schema.name, count, "Loaded stash");
        Ok(count)
    }

    /// Run the sync check for this request before reading the stash.
    pub async fn on_pre_read(&self, ctx: &RequestContext) -> StashResult<SyncOutcome> {
        self.syncer
            .on_pre_read::<M>(ctx, self.db.as_ref(), &self.stash)
            .await
    }

    /// Every stashed row, after the pre-read sync check.
    pub async fn items(&self, ctx: &RequestContext) -> StashResult<Vec<M>> {
        self.on_pre_read(ctx).await?;
        Ok(self.stash.items())
    }

    /// A stashed row by id, after the pre-read sync check.
    pub async fn for_id(&self, ctx: &RequestContext, id: i64) -> StashResult<Option<M>> {
        self.on_pre_read(ctx).await?;
        Ok(self.stash.for_id(id))
    }

    /// Every row from the database, in the model's default sort when it
    /// declares one.
    pub async fn fetch_all(&self) -> StashResult<Vec<M>> {
        match &self.schema.default_sort {
            Some((field, direction)) => {
                self.db
                    .fetch_all_sorted::<M>(field, direction.as_sql())
                    .await
            }
            None => self.db.fetch_all::<M>().await,
        }
    }

    /// One row straight from the database.
    pub async fn fetch_one(&self, id: i64) -> StashResult<Option<M>> {
        self.db.fetch_one::<M>(id).await
    }

    /// Save `model` and mirror the stored row into the stash.
    ///
    /// The row is read back so the stash holds the database's
    /// `row_updated_at`; the next delta sync then sees it as unchanged.
    pub async fn persist(&self, model: &mut M) -> StashResult<SaveOutcome> {
        let outcome = self.db.save(model).await?;
        let stored = match model.id() {
            Some(id) => self.db.fetch_one::<M>(id).await?,
            None => None,
        };
        match stored {
            Some(stored) => {
                model.set_last_modified_millis(stored.last_modified_millis());
                self.stash.load_item(stored);
            }
            None => {
                self.stash.load_item(model.clone());
            }
        }
        Ok(outcome)
    }

    /// Delete the row and drop it from the stash.
    pub async fn hard_delete(&self, model: &mut M) -> StashResult<u64> {
        let affected = self.db.delete(model).await?;
        if let Some(id) = model.id() {
            self.stash.remove(id);
        }
        Ok(affected)
    }
}
