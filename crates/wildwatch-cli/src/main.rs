//! Wildwatch CLI - run Kobo reconciliation and inspect local incident data.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::completions::run_completions;
use crate::commands::forms::run_forms;
use crate::commands::submissions::run_submissions;
use crate::commands::sync::{run_conflicts, run_cursor, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wildwatch_cli=warn,wildwatch_core=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let db_path = cli.db_path.as_deref();

    match cli.command {
        Commands::Sync { form, full, json } => run_sync(&form, full, json, db_path).await,
        Commands::Forms { refresh, json } => run_forms(refresh, json, db_path).await,
        Commands::Submissions {
            form,
            status,
            limit,
            json,
        } => run_submissions(form.as_deref(), status.as_deref(), limit, json, db_path).await,
        Commands::Conflicts { limit, json } => run_conflicts(limit, json, db_path).await,
        Commands::Cursor { form } => run_cursor(form.as_deref(), db_path).await,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
    }
}
