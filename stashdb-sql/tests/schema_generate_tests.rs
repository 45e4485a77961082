//! Schema-diff generator tests against a static view of the database.

use std::fs;

use stashdb_core::{model_to_schema, Dialect, SchemaRegistry, StashError, UsageError};
use stashdb_sql::migrate::{
    generate_all, generate_for_schema, last_migration_number, write_migration, MIGRATIONS_LIST,
};
use stashdb_sql::{InMemoryMigrationStore, MigrationRunner, SqlMigration, StaticSchemaInspector};
use stashdb_test_utils::{Article, Widget};

fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register::<Widget>().unwrap();
    registry.register::<Article>().unwrap();
    registry
}

// ============================================================================
// CREATE / ALTER
// ============================================================================

#[tokio::test]
async fn test_missing_table_gets_postgres_create() {
    let schema = model_to_schema::<Widget>().unwrap();
    let inspector = StaticSchemaInspector::new();

    let result = generate_for_schema(&schema, Dialect::Postgres, &inspector)
        .await
        .unwrap()
        .expect("a change");

    assert_eq!(result.change_prefix, "create-table-widgets");
    assert_eq!(result.table_name, "widgets");
    let expected_table = "CREATE TABLE IF NOT EXISTS \"widgets\" (\n  \
        \"id\" BIGINT NOT NULL,\n  \
        \"name\" varchar(250) NOT NULL DEFAULT '',\n  \
        \"count\" integer NOT NULL DEFAULT 0,\n  \
        \"row_updated_at\" TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,\n  \
        PRIMARY KEY (\"id\")\n);";
    assert!(result.sql.starts_with(expected_table), "{}", result.sql);
    assert!(result.sql.contains(
        "CREATE INDEX IF NOT EXISTS \"widgets_row_updated_at_key\" ON \"widgets\" (\"row_updated_at\");"
    ));
    assert!(result
        .sql
        .contains("DROP TRIGGER IF EXISTS \"widgets_touch_row_updated_at\" ON \"widgets\";"));
    assert!(result.sql.contains("EXECUTE FUNCTION stashdb_touch_row_updated_at()"));
    assert_eq!(result.sql_js, format!("db.execute('''\n{}\n''');", result.sql));
}

#[tokio::test]
async fn test_postgres_create_indexes_keys() {
    let schema = model_to_schema::<Article>().unwrap();
    let result = generate_for_schema(&schema, Dialect::Postgres, &StaticSchemaInspector::new())
        .await
        .unwrap()
        .unwrap();

    assert!(result.sql.contains("\"title\" varchar(120) NOT NULL DEFAULT ''"));
    assert!(result.sql.contains("\"status\" varchar(30) NOT NULL DEFAULT 'DRAFT'"));
    assert!(result.sql.contains("\"featured\" boolean NOT NULL DEFAULT FALSE"));
    assert!(result.sql.contains("\"published_at\" timestamp NULL"));
    // Text columns carry no default.
    assert!(result.sql.contains("\"meta\" text NULL,"));
    assert!(result.sql.contains(
        "CREATE INDEX IF NOT EXISTS \"articles_title_key\" ON \"articles\" (\"title\");"
    ));
    assert!(result.sql.contains(
        "CREATE INDEX IF NOT EXISTS \"articles_status_views_key\" ON \"articles\" (\"status\", \"views\");"
    ));
}

#[tokio::test]
async fn test_mysql_create_table() {
    let schema = model_to_schema::<Article>().unwrap();
    let result = generate_for_schema(&schema, Dialect::MySql, &StaticSchemaInspector::new())
        .await
        .unwrap()
        .unwrap();

    assert!(result.sql.starts_with(
        "CREATE TABLE IF NOT EXISTS `articles` (\n  `id` bigint(20) unsigned NOT NULL,\n"
    ));
    assert!(result.sql.contains("  `title` varchar(120) NOT NULL DEFAULT '',\n"));
    assert!(result.sql.contains("  `featured` bit(1) NOT NULL DEFAULT 0,\n"));
    assert!(result.sql.contains("  `tags` longtext NULL,\n"));
    assert!(result.sql.contains(
        "  `row_updated_at` timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,\n"
    ));
    assert!(result.sql.contains("  PRIMARY KEY (`id`),\n"));
    assert!(result.sql.contains("  KEY `row_updated_at_key` (`row_updated_at`),\n"));
    assert!(result.sql.contains("  KEY `title_key` (`title`),\n"));
    assert!(result.sql.contains("  KEY `status_views_key` (`status`, `views`)\n"));
    assert!(result.sql.ends_with(
        ") ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;"
    ));
}

#[tokio::test]
async fn test_missing_columns_get_alter() {
    let schema = model_to_schema::<Widget>().unwrap();
    let inspector = StaticSchemaInspector::new().with_table("widgets", ["id", "name"]);

    let result = generate_for_schema(&schema, Dialect::Postgres, &inspector)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.change_prefix, "alter-widgets-add-1");
    assert_eq!(
        result.sql,
        "ALTER TABLE \"widgets\"\n    ADD COLUMN \"count\" integer NOT NULL DEFAULT 0;"
    );
}

#[tokio::test]
async fn test_alter_text_columns_omit_nullability() {
    let schema = model_to_schema::<Article>().unwrap();
    let inspector = StaticSchemaInspector::new().with_table(
        "articles",
        ["id", "title", "status", "published_at", "score", "views", "featured"],
    );

    let result = generate_for_schema(&schema, Dialect::Postgres, &inspector)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.change_prefix, "alter-articles-add-2");
    assert_eq!(
        result.sql,
        "ALTER TABLE \"articles\"\n    ADD COLUMN \"meta\" text,\n    ADD COLUMN \"tags\" text;"
    );
}

#[tokio::test]
async fn test_up_to_date_table_needs_nothing() {
    let schema = model_to_schema::<Widget>().unwrap();
    let inspector = StaticSchemaInspector::new().with_table("widgets", ["id", "name", "count"]);

    let result = generate_for_schema(&schema, Dialect::Postgres, &inspector)
        .await
        .unwrap();

    assert!(result.is_none());
}

// ============================================================================
// FILES
// ============================================================================

#[test]
fn test_last_number_from_migrations_list() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join(MIGRATIONS_LIST),
        "// bundled\n00010-create-table-widgets\n\n# retired\n00040-alter-widgets-add-1\n00020-x\n",
    )
    .unwrap();
    // Files are ignored while the list exists.
    fs::write(dir.path().join("00090-late.postgres.sql"), "SELECT 1").unwrap();

    assert_eq!(last_migration_number(dir.path(), Dialect::Postgres).unwrap(), 40);
}

#[test]
fn test_last_number_from_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("00030-a.postgres.sql"), "SELECT 1").unwrap();
    fs::write(dir.path().join("00050-b.mysql.sql"), "SELECT 1").unwrap();

    assert_eq!(last_migration_number(dir.path(), Dialect::Postgres).unwrap(), 30);
    let empty = tempfile::tempdir().unwrap();
    assert_eq!(last_migration_number(empty.path(), Dialect::Postgres).unwrap(), 0);
}

#[tokio::test]
async fn test_write_migration_appends_to_list() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(MIGRATIONS_LIST), "00010-create-table-gadgets").unwrap();
    let schema = model_to_schema::<Widget>().unwrap();
    let result = generate_for_schema(&schema, Dialect::Postgres, &StaticSchemaInspector::new())
        .await
        .unwrap()
        .unwrap();

    let path = write_migration(dir.path(), 20, &result, Dialect::Postgres).unwrap();

    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "00020-create-table-widgets.postgres.js"
    );
    assert_eq!(fs::read_to_string(&path).unwrap(), result.sql_js);
    assert_eq!(
        fs::read_to_string(dir.path().join(MIGRATIONS_LIST)).unwrap(),
        "00010-create-table-gadgets\n00020-create-table-widgets\n"
    );
}

// ============================================================================
// GENERATE ALL
// ============================================================================

#[tokio::test]
async fn test_generate_all_numbers_confirmed_changes() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(MIGRATIONS_LIST), "00020-create-table-gadgets\n").unwrap();
    let runner = MigrationRunner::new(Dialect::Postgres);
    let store = InMemoryMigrationStore::new();
    let inspector = StaticSchemaInspector::new();
    let mut offered = Vec::new();

    let written = generate_all(
        &registry(),
        &inspector,
        &runner,
        &store,
        dir.path(),
        Dialect::Postgres,
        |result| {
            offered.push(result.table_name.clone());
            result.table_name == "widgets"
        },
    )
    .await
    .unwrap();

    assert_eq!(offered, vec!["widgets".to_string(), "articles".to_string()]);
    assert_eq!(written.len(), 1);
    assert!(written[0].ends_with("00030-create-table-widgets.postgres.js"));
    assert!(!dir
        .path()
        .join("00040-create-table-articles.postgres.js")
        .exists());
}

#[tokio::test]
async fn test_generate_all_skips_unchanged_tables() {
    let dir = tempfile::tempdir().unwrap();
    let runner = MigrationRunner::new(Dialect::Postgres);
    let store = InMemoryMigrationStore::new();
    let inspector = StaticSchemaInspector::new()
        .with_table("widgets", ["id", "name", "count"])
        .with_table("articles", ["id", "title"]);

    let written = generate_all(
        &registry(),
        &inspector,
        &runner,
        &store,
        dir.path(),
        Dialect::Postgres,
        |_| true,
    )
    .await
    .unwrap();

    assert_eq!(written.len(), 1);
    assert!(written[0].ends_with("00010-alter-articles-add-7.postgres.js"));
}

#[tokio::test]
async fn test_generate_all_refuses_with_pending_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let pending =
        SqlMigration::from_file("", "00010-users.postgres.sql", "SELECT 1", Dialect::Postgres)
            .unwrap();
    let runner = MigrationRunner::new(Dialect::Postgres).with_migrations([pending]);
    let store = InMemoryMigrationStore::new();

    let err = generate_all(
        &registry(),
        &StaticSchemaInspector::new(),
        &runner,
        &store,
        dir.path(),
        Dialect::Postgres,
        |_| true,
    )
    .await
    .unwrap_err();

    assert_eq!(
        err,
        StashError::Usage(UsageError::PendingMigrations {
            files: vec!["00010-users.postgres.sql".to_string()]
        })
    );
    assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_generate_all_renders_target_dialect() {
    let dir = tempfile::tempdir().unwrap();
    let runner = MigrationRunner::new(Dialect::Postgres);
    let store = InMemoryMigrationStore::new();
    let inspector = StaticSchemaInspector::new().with_table("widgets", ["id", "name", "count"]);

    let written = generate_all(
        &registry(),
        &inspector,
        &runner,
        &store,
        dir.path(),
        Dialect::MySql,
        |_| true,
    )
    .await
    .unwrap();

    assert_eq!(written.len(), 1);
    assert!(written[0].ends_with("00010-create-table-articles.mysql.js"));
    let script = fs::read_to_string(&written[0]).unwrap();
    assert!(script.contains("CREATE TABLE IF NOT EXISTS `articles`"));
}
