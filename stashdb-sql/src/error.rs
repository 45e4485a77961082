//! Mapping driver and pool failures into [`StashError`].
//!
//! The driver errors come from foreign crates, so these are free functions
//! used with `map_err` rather than `From` impls. Every mapping logs the full
//! driver error before wrapping it.

use deadpool_postgres::PoolError;
use stashdb_core::{StashError, StorageError, UsageError};
use tokio_postgres::error::SqlState;

/// Wrap a statement failure.
pub fn query_error(err: tokio_postgres::Error) -> StashError {
    tracing::error!("Database error: {:?}", err);
    let reason = match err.as_db_error() {
        Some(db) => format!("{}: {}", db.code().code(), db.message()),
        None => err.to_string(),
    };
    StorageError::Query { reason }.into()
}

/// Wrap a failure to hand out a pooled connection.
pub fn pool_error(err: PoolError) -> StashError {
    tracing::error!("Connection pool error: {:?}", err);
    let reason = match err {
        PoolError::Timeout(_) => "Timed out waiting for a database connection".to_string(),
        PoolError::Closed => "Database connection pool is closed".to_string(),
        other => other.to_string(),
    };
    StorageError::Pool { reason }.into()
}

/// Like [`query_error`], but an insert colliding on the table's primary key
/// becomes [`UsageError::DuplicateId`].
pub fn insert_error(err: tokio_postgres::Error, table: &str, id: i64) -> StashError {
    if is_primary_key_violation(&err, table) {
        tracing::error!(table = %table, id, "Insert reused an existing id");
        return UsageError::DuplicateId {
            id,
            table: table.to_string(),
        }
        .into();
    }
    query_error(err)
}

fn is_primary_key_violation(err: &tokio_postgres::Error, table: &str) -> bool {
    if err.code() != Some(&SqlState::UNIQUE_VIOLATION) {
        return false;
    }
    let expected = format!("{}_pkey", table);
    err.as_db_error()
        .and_then(|db| db.constraint())
        .map(|constraint| constraint == expected)
        .unwrap_or(false)
}
