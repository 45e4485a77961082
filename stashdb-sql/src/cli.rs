//! Command-line front end.
//!
//! The `stashdb` binary runs these commands with no models registered,
//! which is enough for `sql-migrate` and `sql-check-migrations`.
//! Applications that want `sql-generate` call [`run`] from their own
//! binary with a `register` hook that adds their models.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stashdb_core::{DbConfig, Dialect, StashResult};

use crate::commands::{sql_check_migrations, sql_generate, sql_migrate};
use crate::migrate::{builtin_migrations, MigrationRunner};
use crate::pool::{Db, DbBuilder};

const DEFAULT_MIGRATIONS_DIR: &str = "sql";

/// StashDB schema and migration tool
#[derive(Debug, Parser)]
#[command(name = "stashdb")]
#[command(about = "Generate and run SQL migrations for StashDB models")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// TOML file with a [database] table. Defaults to STASHDB_DB_* variables.
    #[arg(short, long, global = true, env = "STASHDB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding migration files
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate migrations for tables and columns the database lacks
    SqlGenerate {
        /// Write every generated migration without asking
        #[arg(short, long)]
        yes: bool,

        /// Dialect of the generated DDL (postgres or mysql)
        #[arg(short, long, default_value_t = Dialect::Postgres)]
        dialect: Dialect,
    },

    /// Run all migrations that have not been executed yet
    SqlMigrate,

    /// Fail when any migration has not been executed yet
    SqlCheckMigrations,
}

impl Cli {
    pub fn load_config(&self) -> StashResult<DbConfig> {
        match &self.config {
            Some(path) => DbConfig::from_toml_file(path),
            None => Ok(DbConfig::from_env()),
        }
    }

    /// Command-line directory, then the configured one, then `sql`.
    pub fn resolve_migrations_dir(&self, config: &DbConfig) -> PathBuf {
        self.migrations_dir
            .clone()
            .or_else(|| config.migrations_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR))
    }
}

/// Connect, then run the selected command. Returns `false` when the command
/// completed but reported a failure, such as pending migrations.
pub async fn run<F>(cli: &Cli, register: F) -> StashResult<bool>
where
    F: FnOnce(DbBuilder) -> StashResult<DbBuilder>,
{
    let config = cli.load_config()?;
    let dir = cli.resolve_migrations_dir(&config);
    let db = register(Db::builder(config))?.connect().await?;
    let runner = MigrationRunner::new(db.dialect())
        .with_bundled(&builtin_migrations())
        .with_dir(&dir)?;

    match &cli.command {
        Commands::SqlGenerate { yes, dialect } => {
            let written = sql_generate(&db, &runner, &dir, *dialect, *yes).await?;
            for path in &written {
                println!("{}", path.display());
            }
            Ok(true)
        }
        Commands::SqlMigrate => {
            sql_migrate(&db, &runner).await?;
            Ok(true)
        }
        Commands::SqlCheckMigrations => {
            let pending = sql_check_migrations(&db, &runner).await?;
            for migration in &pending {
                println!("{}", migration.file_name);
            }
            Ok(pending.is_empty())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_generate_with_global_flags() {
        let cli = Cli::try_parse_from([
            "stashdb",
            "sql-generate",
            "--yes",
            "--migrations-dir",
            "db/sql",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::SqlGenerate {
                yes: true,
                dialect: Dialect::Postgres
            }
        ));
        let dir = cli.resolve_migrations_dir(&DbConfig::default());
        assert_eq!(dir, PathBuf::from("db/sql"));
    }

    #[test]
    fn test_parse_generate_for_mysql() {
        let cli = Cli::try_parse_from(["stashdb", "sql-generate", "--dialect", "mysql"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::SqlGenerate {
                yes: false,
                dialect: Dialect::MySql
            }
        ));
        assert!(Cli::try_parse_from(["stashdb", "sql-generate", "--dialect", "oracle"]).is_err());
    }

    #[test]
    fn test_migrations_dir_falls_back_to_config() {
        let cli = Cli::try_parse_from(["stashdb", "sql-migrate"]).unwrap();
        let config = DbConfig {
            migrations_dir: Some(PathBuf::from("conf/sql")),
            ..DbConfig::default()
        };
        assert_eq!(cli.resolve_migrations_dir(&config), PathBuf::from("conf/sql"));
        assert_eq!(
            cli.resolve_migrations_dir(&DbConfig::default()),
            PathBuf::from(DEFAULT_MIGRATIONS_DIR)
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["stashdb", "sql-drop"]).is_err());
    }
}
