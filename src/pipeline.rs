//! Pipeline orchestration.
//!
//! Sequences extract → transform → load → founder features, decides between
//! incremental and full mode, collects [`PipelineMetrics`], and writes the
//! [`RunState`] at the end of every run. Errors from any stage are caught
//! here: the run is recorded as `error`, the state file is still written,
//! and the metrics carry the message.

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::enrich::EnrichmentClient;
use crate::extract::Extractor;
use crate::features;
use crate::load::{self, LoadStats};
use crate::logging;
use crate::migrate;
use crate::state::{RunState, RunStatus};
use crate::stats::{self, DatabaseStats, IntegrityReport};
use crate::transform::{RepairReport, Transformed, Transformer};

/// Flags resolved from the command line and configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub incremental: bool,
    pub initialize_db: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractMetrics {
    pub organizations: usize,
    pub people: usize,
    pub jobs: usize,
    pub organizations_enriched: usize,
    pub people_enriched: usize,
    pub job_history_entries: usize,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformMetrics {
    pub organizations: usize,
    pub people: usize,
    pub jobs: usize,
    pub repair: RepairReport,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadMetrics {
    pub upserts: LoadStats,
    /// `None` when derivation was skipped.
    pub founder_features: Option<u64>,
    pub duration_secs: f64,
}

/// Everything a run reports about itself.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub run_id: String,
    pub mode: &'static str,
    pub started_at: NaiveDateTime,
    pub duration_secs: f64,
    pub enrichment_enabled: bool,
    pub extract: Option<ExtractMetrics>,
    pub transform: Option<TransformMetrics>,
    pub load: Option<LoadMetrics>,
    pub stats_before: DatabaseStats,
    pub stats_after: DatabaseStats,
    pub integrity_before: Option<IntegrityReport>,
    pub integrity_after: Option<IntegrityReport>,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl PipelineMetrics {
    fn new(incremental: bool, started_at: NaiveDateTime) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            mode: if incremental { "incremental" } else { "full" },
            started_at,
            duration_secs: 0.0,
            enrichment_enabled: false,
            extract: None,
            transform: None,
            load: None,
            stats_before: DatabaseStats::new(),
            stats_after: DatabaseStats::new(),
            integrity_before: None,
            integrity_after: None,
            status: RunStatus::Success,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    fn persisted(&self, table: &str) -> i64 {
        self.stats_after.get(table).copied().unwrap_or(0)
    }
}

/// Current UTC time, truncated to whole seconds so stored timestamps
/// compare exactly.
fn run_timestamp() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Run the whole pipeline. Never fails: errors are recorded in the returned
/// metrics and in the run state file.
pub async fn run_pipeline(config: &Config, options: RunOptions) -> PipelineMetrics {
    let clock = Instant::now();
    let started_at = run_timestamp();
    let mut metrics = PipelineMetrics::new(options.incremental, started_at);
    let state_path = &config.pipeline.state_file;
    let mut state = RunState::load(state_path);

    logging::pipeline_started(options.incremental);
    info!(
        run_id = %metrics.run_id,
        previous_run = ?state.last_run_time,
        previous_status = ?state.last_run_status,
        "loaded run state"
    );

    let outcome = execute(config, options, started_at, &mut metrics, &mut state).await;
    if let Err(e) = outcome {
        let message = format!("{:#}", e);
        error!(error = %message, "pipeline failed");
        metrics.status = RunStatus::Error;
        metrics.error = Some(message);
    }

    metrics.duration_secs = clock.elapsed().as_secs_f64();
    state.last_run_time = Some(run_timestamp());
    state.last_run_status = Some(metrics.status);
    if let Err(e) = state.save(state_path) {
        warn!(error = ?e, "failed to write run state");
    }

    match serde_json::to_string(&metrics) {
        Ok(json) => info!(metrics = %json, "pipeline metrics"),
        Err(e) => warn!(error = %e, "failed to serialize metrics"),
    }
    logging::pipeline_completed(metrics.status.as_str(), clock.elapsed());
    metrics
}

async fn execute(
    config: &Config,
    options: RunOptions,
    run_ts: NaiveDateTime,
    metrics: &mut PipelineMetrics,
    state: &mut RunState,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = run_stages(&pool, config, options, run_ts, metrics, state).await;
    pool.close().await;
    result
}

async fn ensure_schema(pool: &SqlitePool, initialize: bool) -> Result<()> {
    if initialize {
        info!("initializing database schema");
        return migrate::provision(pool).await;
    }
    for table in migrate::table_names() {
        if !migrate::table_exists(pool, table).await? {
            warn!(table, "schema incomplete, provisioning missing tables");
            return migrate::provision(pool).await;
        }
    }
    Ok(())
}

fn log_integrity(when: &str, report: &IntegrityReport) {
    if report.is_clean() {
        info!(when, "no data integrity issues found");
        return;
    }
    for issue in report.issues() {
        warn!(when, "{}", issue);
    }
}

async fn run_stages(
    pool: &SqlitePool,
    config: &Config,
    options: RunOptions,
    run_ts: NaiveDateTime,
    metrics: &mut PipelineMetrics,
    state: &mut RunState,
) -> Result<()> {
    ensure_schema(pool, options.initialize_db).await?;

    metrics.stats_before = stats::database_stats(pool).await?;
    let before = stats::integrity_report(pool).await?;
    log_integrity("before", &before);
    metrics.integrity_before = Some(before);

    let client = if config.api.is_enabled() {
        match EnrichmentClient::connect(config).await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "enrichment unavailable, continuing with file data only");
                None
            }
        }
    } else {
        info!("no enrichment service configured");
        None
    };
    metrics.enrichment_enabled = client.is_some();

    // Extract
    logging::stage("extract");
    let stage_clock = Instant::now();
    let extracted = Extractor::new(config, pool, client.as_ref())
        .extract_all(options.incremental)
        .await
        .context("Extract stage failed")?;
    state.last_extract_time = Some(run_timestamp());
    metrics.extract = Some(ExtractMetrics {
        organizations: extracted.organizations.table.len(),
        people: extracted.people.table.len(),
        jobs: extracted.jobs.len(),
        organizations_enriched: extracted.organizations.enrichment.len(),
        people_enriched: extracted.people.enrichment.len(),
        job_history_entries: extracted.job_history_count(),
        duration_secs: stage_clock.elapsed().as_secs_f64(),
    });

    // Transform
    logging::stage("transform");
    let stage_clock = Instant::now();
    let persisted = if options.incremental {
        Some(load::load_persisted_keys(pool).await?)
    } else {
        None
    };
    let transformed = Transformer::new(run_ts).transform_all(&extracted, persisted.as_ref());
    state.last_transform_time = Some(run_timestamp());
    metrics.transform = Some(TransformMetrics {
        organizations: transformed.organizations.len(),
        people: transformed.people.len(),
        jobs: transformed.jobs.len(),
        repair: transformed.report,
        duration_secs: stage_clock.elapsed().as_secs_f64(),
    });

    // Load
    logging::stage("load");
    let stage_clock = Instant::now();
    let (upserts, founder_features) = load_and_derive(
        pool,
        &transformed,
        options.incremental,
        run_ts,
        config.pipeline.batch_size,
    )
    .await?;
    state.last_load_time = Some(run_timestamp());
    metrics.load = Some(LoadMetrics {
        upserts,
        founder_features,
        duration_secs: stage_clock.elapsed().as_secs_f64(),
    });

    metrics.stats_after = stats::database_stats(pool).await?;
    for (table, change) in stats::stats_delta(&metrics.stats_before, &metrics.stats_after) {
        info!(
            table = %table,
            rows = metrics.stats_after.get(&table).copied().unwrap_or(0),
            change,
            "table row count"
        );
    }
    let after = stats::integrity_report(pool).await?;
    log_integrity("after", &after);
    metrics.integrity_after = Some(after);
    Ok(())
}

/// Upsert the merged tables, then derive founder features once the load has
/// committed. A failed load returns before any feature is touched.
async fn load_and_derive(
    pool: &SqlitePool,
    transformed: &Transformed,
    incremental: bool,
    run_ts: NaiveDateTime,
    batch_size: usize,
) -> Result<(LoadStats, Option<u64>)> {
    let upserts = load::load_all(pool, transformed, batch_size)
        .await
        .context("Load stage failed")?;

    let today = run_ts.date();
    let founder_features = if !incremental {
        let rows =
            features::derive_founder_features(&transformed.jobs, &transformed.organizations, today);
        Some(features::replace_founder_features(pool, &rows, run_ts).await?)
    } else if transformed.jobs.is_empty() {
        info!("no changed jobs, keeping existing founder features");
        None
    } else {
        let rows = features::derive_delta_founder_features(
            &transformed.jobs,
            &transformed.organizations,
            today,
        );
        Some(features::merge_founder_features(pool, &rows, run_ts).await?)
    };
    Ok((upserts, founder_features))
}

/// Print the human-readable run summary to stdout.
pub fn print_summary(config: &Config, metrics: &PipelineMetrics) {
    println!("ensemble run ({})", metrics.mode);
    println!("  run id: {}", metrics.run_id);
    println!("  status: {}", metrics.status.as_str());
    if let Some(err) = &metrics.error {
        println!("  error: {}", err);
    }
    println!(
        "  enrichment: {}",
        if metrics.enrichment_enabled { "on" } else { "off" }
    );
    if let Some(x) = &metrics.extract {
        println!(
            "  extracted: {} organizations, {} people, {} jobs",
            x.organizations, x.people, x.jobs
        );
        if metrics.enrichment_enabled {
            println!(
                "  enriched: {} organizations, {} people, {} history entries",
                x.organizations_enriched, x.people_enriched, x.job_history_entries
            );
        }
    }
    if let Some(t) = &metrics.transform {
        println!(
            "  repaired: {} org references nulled, {} jobs dropped",
            t.repair.org_refs_nulled, t.repair.jobs_dropped
        );
        println!(
            "  job history: {} added, {} duplicates collapsed",
            t.repair.synthetic_jobs_added, t.repair.duplicates_collapsed
        );
    }
    if let Some(l) = &metrics.load {
        let failed = l.upserts.organizations.failed + l.upserts.people.failed + l.upserts.jobs.failed;
        println!(
            "  written: {} inserted, {} updated, {} failed",
            l.upserts.organizations.inserted + l.upserts.people.inserted + l.upserts.jobs.inserted,
            l.upserts.organizations.updated + l.upserts.people.updated + l.upserts.jobs.updated,
            failed
        );
        println!("  organizations persisted: {}", metrics.persisted("organizations"));
        println!("  people persisted: {}", metrics.persisted("people"));
        println!("  jobs persisted: {}", metrics.persisted("jobs"));
        println!("  founder features: {}", metrics.persisted("founder_features"));
    }
    if let Some(report) = &metrics.integrity_after {
        for issue in report.issues() {
            println!("  integrity: {}", issue);
        }
    }
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    println!("  database: {} ({})", config.db.path.display(), stats::format_bytes(db_size));
    println!("  duration: {:.2}s", metrics.duration_secs);
    if metrics.succeeded() {
        println!("ok");
    }
}
