//! The `sql-generate`, `sql-migrate` and `sql-check-migrations` actions.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use stashdb_core::{Dialect, StashResult, StorageError};

use crate::migrate::{generate_all, GenerateResult, MigrationRunner, SqlMigration};
use crate::pool::Db;

const WRITE_PROMPT: &str = "Write this script to file? ";

/// Ask a yes/no question until the answer parses. End of input means no.
pub fn prompt_yes_no<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    question: &str,
) -> StashResult<bool> {
    let io_error = |e: std::io::Error| StorageError::Io {
        path: "<stdin>".to_string(),
        reason: e.to_string(),
    };
    loop {
        write!(output, "{}[y/n] ", question).map_err(io_error)?;
        output.flush().map_err(io_error)?;
        let mut line = String::new();
        if input.read_line(&mut line).map_err(io_error)? == 0 {
            return Ok(false);
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => continue,
        }
    }
}

/// Generate `dialect` migrations for every schema registered on `db`,
/// writing them to `dir`. Without `assume_yes` each change is confirmed on
/// stdin.
pub async fn sql_generate(
    db: &Db,
    runner: &MigrationRunner,
    dir: &Path,
    dialect: Dialect,
    assume_yes: bool,
) -> StashResult<Vec<PathBuf>> {
    let stdin = std::io::stdin();
    let mut prompt_error = None;
    let confirm = |result: &GenerateResult| {
        if assume_yes {
            return true;
        }
        println!("{}", result.sql);
        match prompt_yes_no(&mut stdin.lock(), &mut std::io::stdout(), WRITE_PROMPT) {
            Ok(answer) => answer,
            Err(err) => {
                prompt_error.get_or_insert(err);
                false
            }
        }
    };
    let written = generate_all(db.schemas(), db, runner, db, dir, dialect, confirm).await?;
    if let Some(err) = prompt_error {
        return Err(err);
    }
    Ok(written)
}

/// Apply every pending migration, then draw one ticket to verify the
/// ticket source.
pub async fn sql_migrate(db: &Db, runner: &MigrationRunner) -> StashResult<Vec<SqlMigration>> {
    let applied = runner.run(db).await?;
    let ticket = db.tickets().next_id().await?;
    tracing::debug!(ticket, "Ticket generation verified");
    tracing::info!(count = applied.len(), "Migrations complete");
    Ok(applied)
}

/// Migrations not yet applied; each one is logged as a warning.
pub async fn sql_check_migrations(
    db: &Db,
    runner: &MigrationRunner,
) -> StashResult<Vec<SqlMigration>> {
    runner.pending(db).await
}
