use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "wildwatch")]
#[command(about = "Reconcile and inspect wildlife incident reports synced with Kobo Toolbox")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Local database file (overrides DATABASE_URL)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one reconciliation pass for a form
    Sync {
        /// Kobo form uid
        form: String,
        /// Reset the cursor and re-read every remote submission
        #[arg(long)]
        full: bool,
        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List cached form definitions
    Forms {
        /// Fetch forms from Kobo and refresh the cache first
        #[arg(long)]
        refresh: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored submissions
    Submissions {
        /// Filter by form uid
        #[arg(long)]
        form: Option<String>,
        /// Filter by sync status (unsynced, synced, conflict, failed)
        #[arg(long)]
        status: Option<String>,
        /// Number of submissions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the sync cursor and recent runs for a form, or every cursor
    Cursor {
        /// Kobo form uid (lists all cursors when omitted)
        form: Option<String>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
