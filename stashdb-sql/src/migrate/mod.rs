//! Versioned migrations and schema-diff generation.

pub mod generate;
pub mod memory;
pub mod migration;
pub mod runner;
pub mod script;

pub use generate::{
    alter_table_sql, create_table_sql, generate_all, generate_for_schema, last_migration_number,
    slugify, write_migration, GenerateResult, SchemaInspector, MIGRATIONS_LIST, VERSION_STEP,
};
pub use memory::{AppliedMigration, InMemoryMigrationStore, StaticSchemaInspector};
pub use migration::{
    builtin_migrations, discover_dir, parse_file_name, BundledMigrations, SqlMigration, USER_APP,
};
pub use runner::{MigrationRunner, MigrationStore};
