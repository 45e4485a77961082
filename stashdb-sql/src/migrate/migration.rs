//! Migration files: naming, discovery and bundled sets.

use std::path::Path;

use stashdb_core::{Dialect, StashResult, StorageError};

use super::script;

/// App name recorded for migrations discovered in the user directory.
pub const USER_APP: &str = "";

/// One versioned schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigration {
    pub version: i64,
    /// Owning application; versions are tracked per app.
    pub app_name: String,
    pub file_name: String,
    pub source: String,
    /// `.js` files wrap their SQL in `'''` blocks.
    pub is_script: bool,
}

impl SqlMigration {
    /// Build from a file name, or `None` when the name does not follow
    /// `<version>-<slug>.<dialect>.<sql|js>` for `dialect`.
    pub fn from_file(
        app_name: impl Into<String>,
        file_name: &str,
        source: impl Into<String>,
        dialect: Dialect,
    ) -> Option<Self> {
        let version = parse_file_name(file_name, dialect)?;
        Some(Self {
            version,
            app_name: app_name.into(),
            file_name: file_name.to_string(),
            source: source.into(),
            is_script: file_name.ends_with(".js"),
        })
    }

    /// The SQL to execute, in order.
    pub fn statements(&self) -> StashResult<Vec<String>> {
        if self.is_script {
            script::extract_sql(&self.source, &self.file_name)
        } else {
            Ok(vec![self.source.clone()])
        }
    }
}

/// Version number of a migration file, or `None` when the file should be
/// ignored for `dialect`.
pub fn parse_file_name(file_name: &str, dialect: Dialect) -> Option<i64> {
    if file_name.starts_with('.') || file_name.starts_with('#') {
        return None;
    }
    if !(file_name.ends_with(".sql") || file_name.ends_with(".js")) {
        return None;
    }
    let lowered = file_name.to_lowercase();
    if !lowered.contains(&format!(".{}.", dialect.name())) {
        return None;
    }
    let (version, _) = file_name.split_once('-')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok()
}

fn sort(migrations: &mut [SqlMigration]) {
    migrations.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
}

/// Migrations in `dir` for `dialect`, ordered by version. A missing
/// directory yields no migrations.
pub fn discover_dir(dir: &Path, dialect: Dialect) -> StashResult<Vec<SqlMigration>> {
    if !dir.is_dir() {
        tracing::debug!(dir = %dir.display(), "Migration directory does not exist");
        return Ok(Vec::new());
    }
    let io_error = |path: &Path, e: std::io::Error| StorageError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| io_error(dir, e))? {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if parse_file_name(file_name, dialect).is_none() {
            tracing::trace!(file = %file_name, "Skipping non-migration file");
            continue;
        }
        let source = std::fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        if let Some(migration) = SqlMigration::from_file(USER_APP, file_name, source, dialect) {
            tracing::debug!(file = %file_name, version = migration.version, "Found migration");
            migrations.push(migration);
        }
    }
    sort(&mut migrations);
    Ok(migrations)
}

/// Migrations shipped inside a binary for one application.
#[derive(Debug, Clone, Default)]
pub struct BundledMigrations {
    app_name: String,
    files: Vec<(String, String)>,
}

impl BundledMigrations {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            files: Vec::new(),
        }
    }

    pub fn file(mut self, file_name: impl Into<String>, source: impl Into<String>) -> Self {
        self.files.push((file_name.into(), source.into()));
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The files that apply to `dialect`, ordered by version.
    pub fn migrations(&self, dialect: Dialect) -> Vec<SqlMigration> {
        let mut migrations: Vec<_> = self
            .files
            .iter()
            .filter_map(|(name, source)| {
                SqlMigration::from_file(self.app_name.clone(), name, source.clone(), dialect)
            })
            .collect();
        sort(&mut migrations);
        migrations
    }
}

/// StashDB's own migrations (the ticket source).
pub fn builtin_migrations() -> BundledMigrations {
    BundledMigrations::new("stashdb")
        .file(
            "00010-tickets.postgres.sql",
            include_str!("../../sql/00010-tickets.postgres.sql"),
        )
        .file(
            "00010-tickets.mysql.sql",
            include_str!("../../sql/00010-tickets.mysql.sql"),
        )
}
