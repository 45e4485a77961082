//! `stashdb` command-line tool.
//!
//! ```bash
//! stashdb --config stashdb.toml sql-migrate
//! stashdb sql-check-migrations --migrations-dir sql
//! ```

use std::process::ExitCode;

use clap::Parser;
use stashdb_sql::cli::{run, Cli};
use stashdb_sql::telemetry::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli, Ok).await {
        Ok(true) => {
            println!("result:success");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("result:failure");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!("{}", err);
            println!("result:failure");
            ExitCode::FAILURE
        }
    }
}
