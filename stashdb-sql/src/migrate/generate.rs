//! Schema-Diff Generator.
//!
//! Compares registered schemas against the live database and writes
//! `CREATE TABLE` or `ALTER TABLE ... ADD COLUMN` migrations for whatever
//! is missing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use stashdb_core::{
    Col, Dialect, Schema, SchemaRegistry, StashResult, StorageError, UsageError, ID_COLUMN,
    ROW_UPDATED_AT,
};

use super::migration::discover_dir;
use super::runner::{MigrationRunner, MigrationStore};
use crate::pool::Db;

/// Name of the optional migration list kept next to the migration files.
pub const MIGRATIONS_LIST: &str = "migrations.txt";

/// Step between generated migration numbers.
pub const VERSION_STEP: i64 = 10;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w-]").expect("valid regex"));
static HYPHENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").expect("valid regex"));
static KEY_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(UNIQUE\s+)?KEY\s+`?(\w+)`?\s*\((.+)\)\s*,?\s*$").expect("valid regex")
});

/// Live table structure, as needed by the generator.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn table_exists(&self, table: &str) -> StashResult<bool>;
    async fn column_exists(&self, table: &str, column: &str) -> StashResult<bool>;
}

#[async_trait]
impl SchemaInspector for Db {
    async fn table_exists(&self, table: &str) -> StashResult<bool> {
        Db::table_exists(self, table).await
    }

    async fn column_exists(&self, table: &str, column: &str) -> StashResult<bool> {
        Db::column_exists(self, table, column).await
    }
}

/// One generated change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateResult {
    /// File-name slug, e.g. `create-table-widgets`.
    pub change_prefix: String,
    pub sql: String,
    /// `sql` wrapped as a script migration.
    pub sql_js: String,
    pub table_name: String,
}

impl GenerateResult {
    fn new(change_prefix: String, sql: String, table_name: &str) -> Self {
        let sql_js = format!("db.execute('''\n{}\n''');", sql);
        Self {
            change_prefix,
            sql,
            sql_js,
            table_name: table_name.to_string(),
        }
    }
}

/// Lowercase, hyphen-separated form of `input`.
pub fn slugify(input: &str) -> String {
    let spaced = WHITESPACE.replace_all(input, "-");
    let cleaned = NON_SLUG.replace_all(&spaced, "-");
    HYPHENS.replace_all(&cleaned, "-").to_lowercase()
}

// ============================================================================
// DDL
// ============================================================================

fn column_definition(col: &Col, dialect: Dialect, for_alter: bool) -> StashResult<String> {
    let canonical = col.db_type()?;
    let is_text = canonical.contains("text");
    let mut def = format!("{} {}", dialect.quote(&col.name), dialect.render_type(&canonical));
    // Adding a NOT NULL text column would fail on existing rows.
    if !(for_alter && is_text) {
        def.push_str(if col.nullable { " NULL" } else { " NOT NULL" });
    }
    if !is_text {
        if let Some(default) = col
            .default_value
            .as_ref()
            .and_then(|v| dialect.render_default(v))
        {
            def.push_str(" DEFAULT ");
            def.push_str(&default);
        }
    }
    Ok(def)
}

/// Rewrite a MySQL-style `[UNIQUE] KEY name (cols)` definition as a Postgres
/// index. Anything else is passed through.
fn postgres_extra_key(schema: &Schema, definition: &str) -> String {
    let dialect = Dialect::Postgres;
    let Some(caps) = KEY_DEFINITION.captures(definition) else {
        let trimmed = definition.trim().trim_end_matches(';');
        return format!("{};", trimmed);
    };
    let unique = if caps.get(1).is_some() { "UNIQUE " } else { "" };
    let name = format!("{}_{}", schema.name, &caps[2]);
    let columns: Vec<String> = caps[3]
        .split(',')
        .map(|c| dialect.quote(c.trim().trim_matches('`').trim_matches('"')))
        .collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
        unique,
        dialect.quote(&name),
        dialect.quote(&schema.name),
        columns.join(", ")
    )
}

fn create_table_mysql(schema: &Schema) -> StashResult<String> {
    let dialect = Dialect::MySql;
    let mut lines = vec![format!("  {} bigint(20) unsigned NOT NULL", dialect.quote(ID_COLUMN))];
    for col in &schema.columns {
        lines.push(format!("  {}", column_definition(col, dialect, false)?));
    }
    lines.push(format!(
        "  {} timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP",
        dialect.quote(ROW_UPDATED_AT)
    ));
    lines.push(format!("  PRIMARY KEY ({})", dialect.quote(ID_COLUMN)));
    lines.push(format!(
        "  KEY `row_updated_at_key` ({})",
        dialect.quote(ROW_UPDATED_AT)
    ));
    for col in &schema.columns {
        let key = dialect.quote(&format!("{}_key", col.name));
        if col.unique_key {
            lines.push(format!("  UNIQUE KEY {} ({})", key, dialect.quote(&col.name)));
        } else if col.alternative_key {
            lines.push(format!("  KEY {} ({})", key, dialect.quote(&col.name)));
        }
    }
    for definition in &schema.extra_key_definitions {
        lines.push(format!("  {}", definition.trim().trim_end_matches(',')));
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;",
        dialect.quote(&schema.name),
        lines.join(",\n")
    ))
}

fn create_table_postgres(schema: &Schema) -> StashResult<String> {
    let dialect = Dialect::Postgres;
    let table = dialect.quote(&schema.name);
    let mut lines = vec![format!("  {} BIGINT NOT NULL", dialect.quote(ID_COLUMN))];
    for col in &schema.columns {
        lines.push(format!("  {}", column_definition(col, dialect, false)?));
    }
    lines.push(format!(
        "  {} TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP",
        dialect.quote(ROW_UPDATED_AT)
    ));
    lines.push(format!("  PRIMARY KEY ({})", dialect.quote(ID_COLUMN)));

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        table,
        lines.join(",\n")
    )];
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({});",
        dialect.quote(&format!("{}_row_updated_at_key", schema.name)),
        table,
        dialect.quote(ROW_UPDATED_AT)
    ));
    for col in &schema.columns {
        if !col.is_key() {
            continue;
        }
        let unique = if col.unique_key { "UNIQUE " } else { "" };
        statements.push(format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
            unique,
            dialect.quote(&format!("{}_{}_key", schema.name, col.name)),
            table,
            dialect.quote(&col.name)
        ));
    }
    for definition in &schema.extra_key_definitions {
        statements.push(postgres_extra_key(schema, definition));
    }
    let trigger = dialect.quote(&format!("{}_touch_row_updated_at", schema.name));
    statements.push(format!("DROP TRIGGER IF EXISTS {} ON {};", trigger, table));
    if let Some(create_trigger) = dialect.row_updated_at_trigger(&schema.name) {
        statements.push(create_trigger);
    }
    Ok(statements.join("\n"))
}

/// Full `CREATE TABLE` migration for `schema`, including the `id` primary
/// key and the indexed `row_updated_at` column.
pub fn create_table_sql(schema: &Schema, dialect: Dialect) -> StashResult<GenerateResult> {
    let sql = match dialect {
        Dialect::MySql => create_table_mysql(schema)?,
        Dialect::Postgres => create_table_postgres(schema)?,
    };
    Ok(GenerateResult::new(
        format!("create-table-{}", schema.name),
        sql,
        &schema.name,
    ))
}

/// `ALTER TABLE ... ADD COLUMN` migration for `columns`.
pub fn alter_table_sql(
    schema: &Schema,
    columns: &[&Col],
    dialect: Dialect,
) -> StashResult<GenerateResult> {
    let additions = columns
        .iter()
        .map(|col| {
            column_definition(col, dialect, true).map(|def| format!("\n    ADD COLUMN {}", def))
        })
        .collect::<StashResult<Vec<_>>>()?;
    let sql = format!(
        "ALTER TABLE {}{};",
        dialect.quote(&schema.name),
        additions.join(",")
    );
    Ok(GenerateResult::new(
        slugify(&format!("alter-{}-add-{}", schema.name, columns.len())),
        sql,
        &schema.name,
    ))
}

/// The change needed to bring the live table up to `schema`, if any.
pub async fn generate_for_schema(
    schema: &Schema,
    dialect: Dialect,
    inspector: &dyn SchemaInspector,
) -> StashResult<Option<GenerateResult>> {
    if !inspector.table_exists(&schema.name).await? {
        return create_table_sql(schema, dialect).map(Some);
    }
    let mut missing = Vec::new();
    for col in &schema.columns {
        if !inspector.column_exists(&schema.name, &col.name).await? {
            missing.push(col);
        }
    }
    if missing.is_empty() {
        return Ok(None);
    }
    alter_table_sql(schema, &missing, dialect).map(Some)
}

// ============================================================================
// FILES
// ============================================================================

fn io_error(path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Highest migration number in `dir`: from `migrations.txt` when present,
/// otherwise from the migration files themselves.
pub fn last_migration_number(dir: &Path, dialect: Dialect) -> StashResult<i64> {
    let list = dir.join(MIGRATIONS_LIST);
    if !list.is_file() {
        return Ok(discover_dir(dir, dialect)?
            .iter()
            .map(|m| m.version)
            .max()
            .unwrap_or(0));
    }
    let text = std::fs::read_to_string(&list).map_err(|e| io_error(&list, e))?;
    let max = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//") && !line.starts_with('#'))
        .filter_map(|line| line.split_once('-'))
        .filter_map(|(version, _)| version.parse::<i64>().ok())
        .max()
        .unwrap_or(0);
    Ok(max)
}

/// Write `result` as migration `number` in `dir`, and append it to
/// `migrations.txt` when that file exists.
pub fn write_migration(
    dir: &Path,
    number: i64,
    result: &GenerateResult,
    dialect: Dialect,
) -> StashResult<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    let stem = format!("{:05}-{}", number, result.change_prefix);
    let path = dir.join(format!("{}.{}.js", stem, dialect.name()));
    std::fs::write(&path, &result.sql_js).map_err(|e| io_error(&path, e))?;

    let list = dir.join(MIGRATIONS_LIST);
    if list.is_file() {
        let mut text = std::fs::read_to_string(&list).map_err(|e| io_error(&list, e))?;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stem);
        text.push('\n');
        std::fs::write(&list, text).map_err(|e| io_error(&list, e))?;
    }
    tracing::info!(file = %path.display(), "Wrote migration");
    Ok(path)
}

/// Generate migrations for every registered schema.
///
/// Refuses to run while `runner` has migrations pending against `store`.
/// DDL is rendered for `dialect`, which may differ from the runner's.
/// `confirm` decides per change whether it is written; accepted changes are
/// numbered in steps of [`VERSION_STEP`] above the highest known version.
pub async fn generate_all(
    schemas: &SchemaRegistry,
    inspector: &dyn SchemaInspector,
    runner: &MigrationRunner,
    store: &dyn MigrationStore,
    dir: &Path,
    dialect: Dialect,
    mut confirm: impl FnMut(&GenerateResult) -> bool,
) -> StashResult<Vec<PathBuf>> {
    let pending = runner.pending(store).await?;
    if !pending.is_empty() {
        return Err(UsageError::PendingMigrations {
            files: pending.into_iter().map(|m| m.file_name).collect(),
        }
        .into());
    }
    let mut last = last_migration_number(dir, dialect)?.max(runner.max_user_version());
    let mut written = Vec::new();
    tracing::info!(schemas = schemas.len(), "Generating SQL for registered schemas");
    for schema in schemas.schemas() {
        let Some(result) = generate_for_schema(schema, dialect, inspector).await? else {
            tracing::info!(table = %schema.name, "No change needed");
            continue;
        };
        tracing::info!(table = %schema.name, "SQL generated\n{}", result.sql);
        if confirm(&result) {
            last += VERSION_STEP;
            written.push(write_migration(dir, last, &result, dialect)?);
        }
    }
    Ok(written)
}
