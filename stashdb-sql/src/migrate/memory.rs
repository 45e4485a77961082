//! In-memory stand-ins for the migration store and schema inspector, for
//! dry runs and tests that have no database.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use stashdb_core::{StashResult, StorageError};

use super::generate::SchemaInspector;
use super::migration::SqlMigration;
use super::runner::MigrationStore;

/// A migration recorded by [`InMemoryMigrationStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub app_name: String,
    pub version: i64,
    pub file_name: String,
    pub statements: Vec<String>,
}

/// [`MigrationStore`] over a map of app name to version.
#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    versions: Mutex<HashMap<String, i64>>,
    applied: Mutex<Vec<AppliedMigration>>,
    fail_on: Mutex<Option<String>>,
    tracking_table: AtomicBool,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `version` already recorded for `app_name`.
    pub fn with_version(self, app_name: &str, version: i64) -> Self {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(app_name.to_string(), version);
        self
    }

    /// Make applying `file_name` fail.
    pub fn fail_on(&self, file_name: &str) {
        *self.fail_on.lock().unwrap_or_else(|e| e.into_inner()) = Some(file_name.to_string());
    }

    pub fn applied(&self) -> Vec<AppliedMigration> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn tracking_table_created(&self) -> bool {
        self.tracking_table.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn ensure_tracking_table(&self) -> StashResult<()> {
        self.tracking_table.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn current_version(&self, app_name: &str) -> StashResult<i64> {
        let versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(versions.get(app_name).copied().unwrap_or(0))
    }

    async fn apply(&self, migration: &SqlMigration, statements: &[String]) -> StashResult<()> {
        let failing = self.fail_on.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if failing.as_deref() == Some(migration.file_name.as_str()) {
            return Err(StorageError::Migration {
                file: migration.file_name.clone(),
                reason: "configured to fail".to_string(),
            }
            .into());
        }
        {
            let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
            let current = versions.entry(migration.app_name.clone()).or_insert(0);
            *current = (*current).max(migration.version);
        }
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AppliedMigration {
                app_name: migration.app_name.clone(),
                version: migration.version,
                file_name: migration.file_name.clone(),
                statements: statements.to_vec(),
            });
        Ok(())
    }
}

/// [`SchemaInspector`] over a fixed table to columns map.
#[derive(Debug, Default, Clone)]
pub struct StaticSchemaInspector {
    tables: HashMap<String, BTreeSet<String>>,
}

impl StaticSchemaInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table<I, S>(mut self, table: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.insert(
            table.to_string(),
            columns.into_iter().map(Into::into).collect(),
        );
        self
    }
}

#[async_trait]
impl SchemaInspector for StaticSchemaInspector {
    async fn table_exists(&self, table: &str) -> StashResult<bool> {
        Ok(self.tables.contains_key(table))
    }

    async fn column_exists(&self, table: &str, column: &str) -> StashResult<bool> {
        Ok(self
            .tables
            .get(table)
            .map(|columns| columns.contains(column))
            .unwrap_or(false))
    }
}
