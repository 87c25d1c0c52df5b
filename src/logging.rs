//! Tracing setup and pipeline banners.
//!
//! Logs go to stderr so stdout carries only the run summary.

use std::time::Duration;

use chrono::Local;
use clap::ValueEnum;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter directive for the configured level, raised by `-v` flags.
pub fn filter_directive(level: &str, verbose: u8) -> String {
    let level = match verbose {
        0 => level.trim().to_lowercase(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let level = if level.is_empty() { "info".to_string() } else { level };
    format!("ensemble_pipeline={level},ensemble={level},warn", level = level)
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// Calling this twice is harmless; the second call is ignored.
pub fn init_tracing(level: &str, verbose: u8, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level, verbose)));

    let result = match format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

const RULE: &str = "==================================================";

pub fn pipeline_started(incremental: bool) {
    let mode = if incremental { "incremental" } else { "full" };
    info!("{}", RULE);
    info!(
        mode,
        "PIPELINE STARTED at {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", RULE);
}

pub fn stage(name: &str) {
    info!("{}", "-".repeat(RULE.len()));
    info!("STAGE: {}", name.to_uppercase());
    info!("{}", "-".repeat(RULE.len()));
}

pub fn pipeline_completed(status: &str, elapsed: Duration) {
    info!("{}", RULE);
    info!(
        status,
        "PIPELINE COMPLETED at {} (total duration {:.2}s)",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        elapsed.as_secs_f64()
    );
    info!("{}", RULE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_overrides_configured_level() {
        assert_eq!(
            filter_directive("WARN", 0),
            "ensemble_pipeline=warn,ensemble=warn,warn"
        );
        assert!(filter_directive("info", 1).starts_with("ensemble_pipeline=debug"));
        assert!(filter_directive("info", 3).starts_with("ensemble_pipeline=trace"));
        assert!(filter_directive("", 0).starts_with("ensemble_pipeline=info"));
    }
}
