//! Database statistics and integrity diagnostics.
//!
//! [`database_stats`] counts rows in every user table; [`integrity_report`]
//! looks for jobs with broken references and entities with blank names. The
//! orchestrator logs both before and after the load. Neither ever blocks a
//! run: integrity issues are diagnostics.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::migrate;

/// Row counts per table, ordered by table name.
pub type DatabaseStats = BTreeMap<String, i64>;

/// Count rows in every user table of the database.
pub async fn database_stats(pool: &SqlitePool) -> Result<DatabaseStats> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list tables")?;

    let mut stats = BTreeMap::new();
    for table in tables {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
            .fetch_one(pool)
            .await
            .with_context(|| format!("Failed to count rows of {}", table))?;
        stats.insert(table, count);
    }
    Ok(stats)
}

/// Counts of integrity problems across the three entity relations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub jobs_missing_person: i64,
    pub jobs_dangling_org: i64,
    pub people_blank_name: i64,
    pub organizations_blank_name: i64,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues().is_empty()
    }

    /// Human-readable issue lines; empty when clean.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.jobs_missing_person > 0 {
            issues.push(format!(
                "Found {} jobs with missing person references",
                self.jobs_missing_person
            ));
        }
        if self.jobs_dangling_org > 0 {
            issues.push(format!(
                "Found {} jobs referencing unknown organizations",
                self.jobs_dangling_org
            ));
        }
        if self.people_blank_name > 0 {
            issues.push(format!(
                "Found {} people with missing names",
                self.people_blank_name
            ));
        }
        if self.organizations_blank_name > 0 {
            issues.push(format!(
                "Found {} organizations with missing names",
                self.organizations_blank_name
            ));
        }
        issues
    }
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    sqlx::query_scalar(sql)
        .fetch_one(pool)
        .await
        .with_context(|| format!("Integrity query failed: {}", sql))
}

/// Run the integrity checks. Relations that do not exist yet are skipped.
pub async fn integrity_report(pool: &SqlitePool) -> Result<IntegrityReport> {
    let mut report = IntegrityReport::default();
    let jobs = migrate::table_exists(pool, "jobs").await?;
    let people = migrate::table_exists(pool, "people").await?;
    let orgs = migrate::table_exists(pool, "organizations").await?;

    if jobs && people {
        report.jobs_missing_person = count(
            pool,
            "SELECT COUNT(*) FROM jobs j LEFT JOIN people p ON j.person_uuid = p.uuid WHERE p.uuid IS NULL",
        )
        .await?;
    }
    if jobs && orgs {
        report.jobs_dangling_org = count(
            pool,
            "SELECT COUNT(*) FROM jobs j LEFT JOIN organizations o ON j.org_uuid = o.uuid \
             WHERE j.org_uuid IS NOT NULL AND o.uuid IS NULL",
        )
        .await?;
    }
    if people {
        report.people_blank_name = count(
            pool,
            "SELECT COUNT(*) FROM people WHERE name IS NULL OR TRIM(name) = ''",
        )
        .await?;
    }
    if orgs {
        report.organizations_blank_name = count(
            pool,
            "SELECT COUNT(*) FROM organizations WHERE name IS NULL OR TRIM(name) = ''",
        )
        .await?;
    }
    Ok(report)
}

/// Per-table change between two snapshots, for tables present in either.
pub fn stats_delta(before: &DatabaseStats, after: &DatabaseStats) -> BTreeMap<String, i64> {
    let mut delta = BTreeMap::new();
    for (table, count) in after {
        delta.insert(table.clone(), count - before.get(table).copied().unwrap_or(0));
    }
    for (table, count) in before {
        delta.entry(table.clone()).or_insert(-count);
    }
    delta
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
