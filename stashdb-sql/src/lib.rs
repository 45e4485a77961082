//! StashDB SQL - Pool, CRUD and Migrations
//!
//! Everything that talks to PostgreSQL: the connection pool manager, the
//! CRUD engine with its cache-aware query helpers, the database-backed
//! persister, the ticket generator, the migration runner and the
//! schema-diff generator behind `sql-generate`.

pub mod bind;
pub mod cli;
pub mod commands;
pub mod crud;
pub mod error;
pub mod migrate;
pub mod persister;
pub mod pool;
pub mod row;
pub mod sql;
pub mod telemetry;
pub mod tickets;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use crud::SaveOutcome;
pub use migrate::{
    builtin_migrations, generate_all, generate_for_schema, BundledMigrations, GenerateResult,
    InMemoryMigrationStore, MigrationRunner, MigrationStore, SchemaInspector, SqlMigration,
    StaticSchemaInspector,
};
pub use persister::DbPersister;
pub use pool::{verify_clock_skew, Db, DbBuilder};
pub use row::Record;
pub use sql::Statement;
pub use tickets::PostgresTickets;
