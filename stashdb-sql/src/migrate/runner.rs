//! Migration Runner.
//!
//! Migrations run in order: every bundled set first, then the user
//! directory. Each migration is skipped when its app's recorded version is
//! already at or above it; the first failure stops the batch.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use stashdb_core::{Dialect, StashResult, StorageError, Value};

use super::migration::{discover_dir, BundledMigrations, SqlMigration};
use crate::bind::{as_params, pg_args};
use crate::error::query_error;
use crate::pool::Db;

/// Where migrations are tracked and applied.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Create the bookkeeping table if it is absent.
    async fn ensure_tracking_table(&self) -> StashResult<()>;

    /// Highest recorded version for `app_name`, 0 when none.
    async fn current_version(&self, app_name: &str) -> StashResult<i64>;

    /// Execute `statements` and record `migration` as done.
    async fn apply(&self, migration: &SqlMigration, statements: &[String]) -> StashResult<()>;
}

fn migration_error(migration: &SqlMigration, err: tokio_postgres::Error) -> StorageError {
    tracing::error!(file = %migration.file_name, "Migration failed: {:?}", err);
    let reason = match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    StorageError::Migration {
        file: migration.file_name.clone(),
        reason,
    }
}

#[async_trait]
impl MigrationStore for Db {
    async fn ensure_tracking_table(&self) -> StashResult<()> {
        self.batch_execute(self.dialect().migrations_table_ddl())
            .await
    }

    async fn current_version(&self, app_name: &str) -> StashResult<i64> {
        let version = self
            .query_scalar::<i32>(
                &self.dialect().current_version_query(),
                &[Value::from(app_name)],
            )
            .await?;
        Ok(version.map(i64::from).unwrap_or(0))
    }

    /// The migration SQL and its bookkeeping row commit in one transaction.
    async fn apply(&self, migration: &SqlMigration, statements: &[String]) -> StashResult<()> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(query_error)?;
        for statement in statements {
            tx.batch_execute(statement)
                .await
                .map_err(|e| migration_error(migration, e))?;
        }
        let record = [
            Value::BigInt(migration.version),
            Value::Text(migration.app_name.clone()),
            Value::Text(migration.file_name.clone()),
            Value::Timestamp(Utc::now()),
        ];
        let bound = pg_args(&record);
        tx.execute(self.dialect().record_migration_sql().as_str(), &as_params(&bound))
            .await
            .map_err(query_error)?;
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }
}

/// Ordered set of known migrations for one dialect.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    dialect: Dialect,
    migrations: Vec<SqlMigration>,
}

impl MigrationRunner {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            migrations: Vec::new(),
        }
    }

    /// Append a bundled set. Bundled sets run in the order they are added.
    pub fn with_bundled(mut self, bundled: &BundledMigrations) -> Self {
        self.migrations.extend(bundled.migrations(self.dialect));
        self
    }

    /// Append the migrations found in the user directory.
    pub fn with_dir(mut self, dir: &Path) -> StashResult<Self> {
        self.migrations.extend(discover_dir(dir, self.dialect)?);
        Ok(self)
    }

    /// Append already-built migrations as they are.
    pub fn with_migrations(mut self, migrations: impl IntoIterator<Item = SqlMigration>) -> Self {
        self.migrations.extend(migrations);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn migrations(&self) -> &[SqlMigration] {
        &self.migrations
    }

    /// Highest user-directory version known to this runner.
    pub fn max_user_version(&self) -> i64 {
        self.migrations
            .iter()
            .filter(|m| m.app_name == super::migration::USER_APP)
            .map(|m| m.version)
            .max()
            .unwrap_or(0)
    }

    /// Migrations not yet recorded.
    pub async fn pending(&self, store: &dyn MigrationStore) -> StashResult<Vec<SqlMigration>> {
        store.ensure_tracking_table().await?;
        let mut pending = Vec::new();
        for migration in &self.migrations {
            let current = store.current_version(&migration.app_name).await?;
            if current >= migration.version {
                continue;
            }
            tracing::warn!(file = %migration.file_name, "Un-executed migration found");
            pending.push(migration.clone());
        }
        Ok(pending)
    }

    /// Apply every pending migration in order, returning those applied.
    pub async fn run(&self, store: &dyn MigrationStore) -> StashResult<Vec<SqlMigration>> {
        store.ensure_tracking_table().await?;
        let mut applied = Vec::new();
        for migration in &self.migrations {
            // Re-read per migration: an earlier one may have recorded a higher version.
            let current = store.current_version(&migration.app_name).await?;
            if current >= migration.version {
                tracing::debug!(
                    file = %migration.file_name,
                    current,
                    app = %migration.app_name,
                    "Migration already applied"
                );
                continue;
            }
            tracing::info!(
                app = %migration.app_name,
                file = %migration.file_name,
                "Run migration"
            );
            let statements = migration.statements()?;
            store.apply(migration, &statements).await?;
            applied.push(migration.clone());
        }
        Ok(applied)
    }
}
