use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use dropmark::commands::{
    BatchOptions, DirOverrides, RunOptions, cmd_batch, cmd_config_show, cmd_doctor, cmd_prune,
    cmd_reset, cmd_run, cmd_status,
};
use dropmark::ledger::LedgerStatus;
use dropmark::logging::{LogConfig, init_logging};
use dropmark::paths;

#[derive(Parser)]
#[command(name = "dropmark")]
#[command(about = "Watch a drop folder and clean new captures exactly once")]
#[command(version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the drop directory until interrupted
    Run {
        /// Directory to watch (overrides config)
        #[arg(long)]
        drop_dir: Option<PathBuf>,

        /// Directory to place results in (overrides config)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Process the files already present in a directory, then exit
    Batch {
        /// Directory to scan (default: the configured drop directory)
        input_dir: Option<PathBuf>,

        /// Directory to place results in (default: the configured output directory)
        output_dir: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Reset failed entries for the found files and try them again
        #[arg(long)]
        retry_failed: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List ledger entries
    Status {
        /// Only show entries with this status (pending, in_progress, done, failed)
        #[arg(long, value_parser = parse_status)]
        status: Option<LedgerStatus>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move failed entries back to pending so they are retried
    Reset {
        /// Logical keys to reset (e.g. 20251104_1209)
        #[arg(required_unless_present = "all_failed", conflicts_with = "all_failed")]
        keys: Vec<String>,

        /// Reset every failed entry
        #[arg(long)]
        all_failed: bool,
    },

    /// Remove done and failed entries older than a number of days
    Prune {
        #[arg(long, value_name = "DAYS")]
        older_than_days: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check directories, the transform program, the ledger and the instance record
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_status(s: &str) -> Result<LedgerStatus, String> {
    s.parse().map_err(|e: dropmark::DropmarkError| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Long-running commands also write the activity log
    let log_dir = matches!(cli.command, Commands::Run { .. } | Commands::Batch { .. })
        .then(paths::logs_dir);
    if let Err(e) = init_logging(LogConfig {
        app_name: "dropmark",
        log_dir,
        verbose: cli.verbose,
    }) {
        eprintln!("warning: {e}");
    }

    let result = match cli.command {
        Commands::Run {
            drop_dir,
            output_dir,
        } => cmd_run(RunOptions {
            dirs: DirOverrides {
                drop_dir,
                output_dir,
            },
        })
        .await
        .map(|()| true),

        Commands::Batch {
            input_dir,
            output_dir,
            yes,
            retry_failed,
            json,
        } => cmd_batch(BatchOptions {
            input_dir,
            output_dir,
            yes,
            retry_failed,
            output_json: json,
        })
        .await
        .map(|summary| !summary.has_failures()),

        Commands::Status { status, json } => cmd_status(status, json).map(|()| true),
        Commands::Reset { keys, all_failed } => cmd_reset(&keys, all_failed).map(|()| true),
        Commands::Prune {
            older_than_days,
            json,
        } => cmd_prune(older_than_days, json).map(|()| true),
        Commands::Doctor { json } => cmd_doctor(json),
        Commands::Config { action } => match action {
            ConfigAction::Show { json } => cmd_config_show(json).map(|()| true),
        },
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
