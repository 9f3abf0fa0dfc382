//! # Trial Harvest CLI (`trials`)
//!
//! The `trials` binary runs the harvest pipeline and inspects its run
//! ledger. It is meant to be invoked monthly by an external scheduler, and
//! by hand with the same contract for local testing.
//!
//! ## Usage
//!
//! ```bash
//! trials --config ./config/trials.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trials init` | Create the run-ledger database |
//! | `trials check` | Validate configuration and keyword lists |
//! | `trials run` | Harvest, classify and write the output tables |
//! | `trials stats` | Show the cursor and recent runs |
//! | `trials cursor show\|reset` | Inspect or clear the "since last run" cursor |
//!
//! ## Exit codes
//!
//! | Code | Stage |
//! |------|-------|
//! | 0 | success |
//! | 1 | auxiliary command failed |
//! | 2 | configuration |
//! | 3 | retrieval |
//! | 4 | classification |
//! | 5 | output |
//! | 6 | run ledger |
//! | 130 | interrupted |

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use trial_harvest::check;
use trial_harvest::config;
use trial_harvest::error::HarvestError;
use trial_harvest::harvest::{self, RunOptions};
use trial_harvest::migrate;
use trial_harvest::progress::ProgressMode;
use trial_harvest::stats;

/// Trial Harvest: retrieve, classify and tabulate clinical trials from a
/// public registry.
#[derive(Parser)]
#[command(
    name = "trials",
    about = "Retrieve clinical trials from a registry, classify them by keyword and write CSV tables",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trials.toml")]
    config: PathBuf,

    /// Progress reporting on stderr: `auto` (human on a TTY), `human`, `json` or `off`.
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_parser = ["auto", "human", "json", "off"]
    )]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the run-ledger schema. Safe to run repeatedly.
    Init,

    /// Validate configuration and keyword lists without contacting the registry.
    Check,

    /// Run one harvest pass.
    ///
    /// Without flags the window starts at the stored cursor (or covers
    /// everything if there is none) and ends today.
    Run {
        /// Ignore the stored cursor and take a full snapshot.
        #[arg(long, conflicts_with = "since")]
        full: bool,

        /// Only studies last updated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Reference date of the run (YYYY-MM-DD), not after today. Defaults to today (UTC).
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Fetch, classify and normalize, but write no tables and keep the cursor.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the stored cursor and recent runs.
    Stats,

    /// Inspect or reset the "since last run" cursor.
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Print the stored cursor date.
    Show,
    /// Clear the cursor; the next run is a full snapshot.
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Harvest(e)) => {
            eprintln!("Error: {} stage failed: {}", e.stage(), e);
            ExitCode::from(e.exit_code() as u8)
        }
        Err(Failure::Other(e)) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

enum Failure {
    Harvest(HarvestError),
    Other(anyhow::Error),
}

impl From<HarvestError> for Failure {
    fn from(e: HarvestError) -> Self {
        Failure::Harvest(e)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(e: anyhow::Error) -> Self {
        Failure::Other(e)
    }
}

async fn dispatch(cli: Cli) -> Result<(), Failure> {
    let cfg = config::load_config(&cli.config)?;
    let progress = ProgressMode::from_flag(&cli.progress).unwrap_or(ProgressMode::Off);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg)
                .await
                .map_err(HarvestError::from)?;
            println!("Run ledger initialized at {}", cfg.db.path.display());
        }
        Commands::Check => {
            check::run_check(&cfg).await?;
        }
        Commands::Run {
            full,
            since,
            as_of,
            dry_run,
        } => {
            let options = RunOptions {
                full,
                since,
                as_of,
                dry_run,
            };
            let reporter = progress.reporter();
            let report = harvest::run_harvest(&cfg, &options, reporter.as_ref()).await?;
            report.print();
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Cursor { action } => match action {
            CursorAction::Show => stats::run_cursor_show(&cfg).await?,
            CursorAction::Reset => stats::run_cursor_reset(&cfg).await?,
        },
    }

    Ok(())
}
