//! Error types for StashDB operations

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Configuration errors. These abort initialization and are never recovered locally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error(
        "The database CURRENT_TIMESTAMP is mismatched with the server time. Db time is {db_time}, \
         server time is {local_time} (tolerance {tolerance_secs}s). Make sure the database server \
         is in UTC and that all server clocks are matched."
    )]
    ClockSkew {
        db_time: DateTime<Utc>,
        local_time: DateTime<Utc>,
        tolerance_secs: i64,
    },

    #[error("Model {model} has no table name; cannot register it with the database")]
    MissingTableName { model: String },

    #[error("Column property {property} does not resolve to a property on model {model}")]
    UnresolvedProperty { model: String, property: String },

    #[error("Could not connect to the database: {reason}")]
    Connection { reason: String },
}

/// Usage errors: programmer mistakes that propagate to the caller unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("Sort field must be a database key. Sort field was: {field} on model {model}")]
    InvalidSortField { field: String, model: String },

    #[error("Invalid sort direction: {direction}")]
    InvalidSortDirection { direction: String },

    #[error("Field {field} is not a column of table {table}")]
    InvalidField { field: String, table: String },

    #[error("No schema registered for model {model}")]
    SchemaNotFound { model: String },

    #[error("Could not find converter: {name}")]
    ConverterNotFound { name: String },

    #[error("Id {id} is already in use in table {table}")]
    DuplicateId { id: i64, table: String },

    #[error("Unknown property {property} on model {model}")]
    UnknownProperty { model: String, property: String },

    #[error("Type mismatch for {property}: expected {expected}, got {got}")]
    TypeMismatch {
        property: String,
        expected: String,
        got: String,
    },

    #[error("Could not guess database column type for column {column}")]
    UnsupportedColumnType { column: String },

    #[error("Migrations have not yet been executed: {files:?}")]
    PendingMigrations { files: Vec<String> },
}

/// Storage layer errors (driver, pool and file-system failures).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Query failed: {reason}")]
    Query { reason: String },

    #[error("Connection pool error: {reason}")]
    Pool { reason: String },

    #[error("Could not load the next ticket after {attempts} attempts")]
    TicketsExhausted { attempts: u32 },

    #[error("Conversion failed for column {column}: {reason}")]
    Conversion { column: String, reason: String },

    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Migration {file} failed: {reason}")]
    Migration { file: String, reason: String },
}

/// Master error type for all StashDB errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StashError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StashError {
    /// True for errors that abort startup.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// True for programmer mistakes.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

impl From<serde_json::Error> for StashError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Conversion {
            column: "<json>".to_string(),
            reason: err.to_string(),
        }
        .into()
    }
}

/// Result type alias for StashDB operations.
pub type StashResult<T> = Result<T, StashError>;

// =============================================================================
// TESTS
// =============================================================================
