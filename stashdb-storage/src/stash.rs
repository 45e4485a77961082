//! In-memory mirror of a bucket's rows.

use std::collections::BTreeMap;
use std::sync::RwLock;

use stashdb_core::{Model, Value};

/// A per-bucket, in-memory mirror of table rows keyed by id.
pub trait Stash<M: Model>: Send + Sync {
    fn bucket(&self) -> &str;

    /// Merge one row into the stash. Returns `true` when the stash changed.
    fn load_item(&self, item: M) -> bool;

    /// Drop a row. Returns `true` if it was present.
    fn remove(&self, id: i64) -> bool;

    fn for_id(&self, id: i64) -> Option<M>;

    /// All rows, ordered by id.
    fn items(&self) -> Vec<M>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reset(&self);
}

/// [`Stash`] backed by an ordered map behind a read-write lock.
#[derive(Debug)]
pub struct MemoryStash<M> {
    bucket: String,
    items: RwLock<BTreeMap<i64, M>>,
}

impl<M: Model + PartialEq> MemoryStash<M> {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            items: RwLock::new(BTreeMap::new()),
        }
    }

    /// First row whose `property` equals `value`.
    pub fn for_unique_key(&self, property: &str, value: &Value) -> Option<M> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items
            .values()
            .find(|item| item.property(property).as_ref() == Some(value))
            .cloned()
    }

    /// Every row whose `property` equals `value`.
    pub fn list_for_key(&self, property: &str, value: &Value) -> Vec<M> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items
            .values()
            .filter(|item| item.property(property).as_ref() == Some(value))
            .cloned()
            .collect()
    }
}

impl<M: Model + PartialEq> Stash<M> for MemoryStash<M> {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn load_item(&self, item: M) -> bool {
        let Some(id) = item.id() else {
            tracing::warn!(bucket = %self.bucket, "Loading an item with a null id; ignoring");
            return false;
        };
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        if item.is_deleted() {
            return items.remove(&id).is_some();
        }
        match items.get(&id) {
            Some(existing) if *existing == item => false,
            _ => {
                items.insert(id, item);
                true
            }
        }
    }

    fn remove(&self, id: i64) -> bool {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.remove(&id).is_some()
    }

    fn for_id(&self, id: i64) -> Option<M> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items.get(&id).cloned()
    }

    fn items(&self) -> Vec<M> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items.values().cloned().collect()
    }

    fn len(&self) -> usize {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items.len()
    }

    fn reset(&self) {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.clear();
    }
}
