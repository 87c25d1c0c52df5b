//! # Ensemble CLI (`ensemble`)
//!
//! Runs the whole pipeline once: extract, transform, load, founder
//! features. There are no subcommands.
//!
//! ## Usage
//!
//! ```bash
//! ensemble --config ./config/ensemble.toml [--incremental | --full] [--initialize-db]
//! ```
//!
//! Logs go to stderr; the run summary goes to stdout. The exit code is
//! non-zero when the run fails.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use ensemble_pipeline::config;
use ensemble_pipeline::logging::{self, LogFormat};
use ensemble_pipeline::pipeline::{self, RunOptions};

/// Ensemble: reconcile startup organization, people, and job exports with
/// an enrichment API and load them into SQLite.
#[derive(Parser)]
#[command(name = "ensemble", version, about)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, default_value = "./config/ensemble.toml")]
    config: PathBuf,

    /// Only process rows that are new or updated since the last run.
    #[arg(long, conflicts_with = "full")]
    incremental: bool,

    /// Process every row regardless of previous runs.
    #[arg(long)]
    full: bool,

    /// Create the database schema before running.
    #[arg(long)]
    initialize_db: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Explicit flags win over the configured default.
    fn incremental(&self, default: bool) -> bool {
        if self.full {
            false
        } else if self.incremental {
            true
        } else {
            default
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_tracing(&cfg.logging.level, cli.verbose, cli.log_format);

    let options = RunOptions {
        incremental: cli.incremental(cfg.pipeline.incremental),
        initialize_db: cli.initialize_db,
    };
    let metrics = pipeline::run_pipeline(&cfg, options).await;
    pipeline::print_summary(&cfg, &metrics);

    if metrics.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_incremental_conflict() {
        assert!(Cli::try_parse_from(["ensemble", "--full", "--incremental"]).is_err());
    }

    #[test]
    fn mode_flags_override_default() {
        let cli = Cli::try_parse_from(["ensemble", "--full"]).unwrap();
        assert!(!cli.incremental(true));
        let cli = Cli::try_parse_from(["ensemble", "--incremental"]).unwrap();
        assert!(cli.incremental(false));
        let cli = Cli::try_parse_from(["ensemble"]).unwrap();
        assert!(cli.incremental(true));
        assert!(!cli.incremental(false));
    }
}
