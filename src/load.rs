//! Load stage: batched, idempotent upsert of merged tables.
//!
//! Each row is checked by primary key and then updated or inserted. Only
//! columns that exist in the target relation are written. Batches run as
//! savepoints inside one outer transaction covering organizations, people
//! and jobs, so a failure in any relation rolls back all three.
//!
//! A row whose statement fails (constraint violation, type mismatch) is
//! counted and skipped; the batch continues.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection};
use sqlx::{Connection, Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::migrate;
use crate::models::{EntityKind, KEY_COLUMN, LAST_PROCESSED_COLUMN};
use crate::table::{Record, Table, Value};
use crate::transform::{PersistedKeys, Transformed};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A cell in its storage representation.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Text(s) => SqlValue::Text(s.clone()),
            Value::Int(i) => SqlValue::Int(*i),
            Value::Float(f) if !f.is_finite() => SqlValue::Null,
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                SqlValue::Int(*f as i64)
            }
            Value::Float(f) => SqlValue::Float(*f),
            Value::Bool(b) => SqlValue::Int(i64::from(*b)),
            Value::Date(_) | Value::DateTime(_) => SqlValue::Text(value.to_string()),
            Value::List(items) if items.is_empty() => SqlValue::Null,
            Value::List(_) => SqlValue::Text(value.to_string()),
            Value::Json(serde_json::Value::Null) => SqlValue::Null,
            Value::Json(serde_json::Value::String(s)) => SqlValue::Text(s.clone()),
            Value::Json(v) => SqlValue::Text(v.to_string()),
        }
    }
}

fn bind_value(query: SqliteQuery<'_>, value: SqlValue) -> SqliteQuery<'_> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Int(i) => query.bind(i),
        SqlValue::Float(f) => query.bind(f),
        SqlValue::Text(s) => query.bind(s),
    }
}

/// Per-relation outcome of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
}

impl UpsertStats {
    fn absorb(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

/// Outcome of the whole load stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub organizations: UpsertStats,
    pub people: UpsertStats,
    pub jobs: UpsertStats,
}

/// Column names of a relation, in declaration order.
pub async fn table_columns(conn: &mut SqliteConnection, relation: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", relation))
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("Failed to inspect columns of {}", relation))?;
    if rows.is_empty() {
        bail!("Relation {} does not exist", relation);
    }
    rows.iter()
        .map(|r| r.try_get::<String, _>("name").map_err(Into::into))
        .collect()
}

/// Statements for one relation, built once per upsert call.
struct UpsertPlan {
    relation: String,
    key: String,
    columns: Vec<String>,
    exists_sql: String,
    insert_sql: String,
    update_sql: String,
    /// Whether the update statement carries the monotonic timestamp clause.
    tracks_processed: bool,
}

impl UpsertPlan {
    fn new(relation: &str, key: &str, table: &Table, stored_columns: &[String]) -> Self {
        let columns: Vec<String> = stored_columns
            .iter()
            .filter(|c| table.has_column(c) || c.as_str() == key)
            .cloned()
            .collect();

        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            relation,
            columns.join(", "),
            placeholders
        );

        let tracks_processed = columns.iter().any(|c| c == LAST_PROCESSED_COLUMN);
        let mut assignments: Vec<String> = columns
            .iter()
            .filter(|c| c.as_str() != key && c.as_str() != LAST_PROCESSED_COLUMN)
            .map(|c| format!("{} = ?", c))
            .collect();
        if tracks_processed {
            assignments.push(format!(
                "{col} = CASE WHEN {col} IS NULL OR {col} < ? THEN ? ELSE {col} END",
                col = LAST_PROCESSED_COLUMN
            ));
        }
        let update_sql = if assignments.is_empty() {
            String::new()
        } else {
            format!(
                "UPDATE {} SET {} WHERE {} = ?",
                relation,
                assignments.join(", "),
                key
            )
        };

        Self {
            relation: relation.to_string(),
            key: key.to_string(),
            exists_sql: format!("SELECT 1 FROM {} WHERE {} = ? LIMIT 1", relation, key),
            columns,
            insert_sql,
            update_sql,
            tracks_processed,
        }
    }

    async fn apply(&self, conn: &mut SqliteConnection, row: &Record, key: &str) -> Result<bool> {
        let exists = sqlx::query(&self.exists_sql)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?
            .is_some();

        if exists {
            if self.update_sql.is_empty() {
                return Ok(false);
            }
            let mut query = sqlx::query(&self.update_sql);
            for column in &self.columns {
                if column == &self.key || column == LAST_PROCESSED_COLUMN {
                    continue;
                }
                query = bind_value(query, SqlValue::from(row.get(column)));
            }
            if self.tracks_processed {
                let processed = SqlValue::from(row.get(LAST_PROCESSED_COLUMN));
                query = bind_value(query, processed.clone());
                query = bind_value(query, processed);
            }
            query.bind(key.to_string()).execute(&mut *conn).await?;
            Ok(false)
        } else {
            let mut query = sqlx::query(&self.insert_sql);
            for column in &self.columns {
                query = bind_value(query, SqlValue::from(row.get(column)));
            }
            query.execute(&mut *conn).await?;
            Ok(true)
        }
    }
}

/// Upsert `table` into `relation` keyed by `key`, one savepoint per batch.
///
/// # Errors
///
/// Only failures of the batch savepoints themselves propagate; failing rows
/// are counted in the returned stats.
pub async fn upsert(
    conn: &mut SqliteConnection,
    table: &Table,
    relation: &str,
    key: &str,
    batch_size: usize,
) -> Result<UpsertStats> {
    let stored = table_columns(conn, relation).await?;
    let plan = UpsertPlan::new(relation, key, table, &stored);
    let batch_size = batch_size.max(1);
    let batches = table.len().div_ceil(batch_size);
    let mut stats = UpsertStats::default();

    for (i, rows) in table.rows().chunks(batch_size).enumerate() {
        let mut batch = conn.begin().await?;
        let mut batch_stats = UpsertStats::default();

        for row in rows {
            let row_key = match row.get(key) {
                Value::Null => None,
                v => Some(v.key_repr()),
            };
            let row_key = match row_key {
                Some(k) if !k.trim().is_empty() => k,
                _ => {
                    debug!(relation, "skipping row without primary key");
                    batch_stats.failed += 1;
                    continue;
                }
            };
            match plan.apply(&mut batch, row, &row_key).await {
                Ok(true) => batch_stats.inserted += 1,
                Ok(false) => batch_stats.updated += 1,
                Err(e) => {
                    debug!(relation, key = %row_key, error = %e, "row upsert failed");
                    batch_stats.failed += 1;
                }
            }
        }

        batch
            .commit()
            .await
            .with_context(|| format!("Failed to commit batch {} of {}", i + 1, plan.relation))?;

        if batch_stats.failed > 0 {
            warn!(
                relation,
                batch = i + 1,
                batches,
                failed = batch_stats.failed,
                "batch completed with failed rows"
            );
        } else {
            debug!(relation, batch = i + 1, batches, "batch committed");
        }
        stats.absorb(batch_stats);
    }

    info!(
        relation,
        inserted = stats.inserted,
        updated = stats.updated,
        failed = stats.failed,
        "upsert complete"
    );
    Ok(stats)
}

async fn upsert_entities(
    conn: &mut SqliteConnection,
    data: &Transformed,
    batch_size: usize,
) -> Result<LoadStats> {
    let mut stats = LoadStats::default();
    for (kind, table) in [
        (EntityKind::Organization, &data.organizations),
        (EntityKind::Person, &data.people),
        (EntityKind::Job, &data.jobs),
    ] {
        let result = upsert(conn, table, kind.relation(), KEY_COLUMN, batch_size)
            .await
            .with_context(|| format!("Failed to load {}", kind))?;
        match kind {
            EntityKind::Organization => stats.organizations.absorb(result),
            EntityKind::Person => stats.people.absorb(result),
            EntityKind::Job => stats.jobs.absorb(result),
        }
    }
    Ok(stats)
}

/// Upsert organizations, then people, then jobs inside one transaction.
/// Any error rolls back all three relations.
pub async fn load_all(pool: &SqlitePool, data: &Transformed, batch_size: usize) -> Result<LoadStats> {
    info!("starting data load");
    let mut tx = pool.begin().await.context("Failed to begin load transaction")?;

    match upsert_entities(&mut tx, data, batch_size).await {
        Ok(stats) => {
            tx.commit().await.context("Failed to commit load transaction")?;
            Ok(stats)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "failed to roll back load transaction");
            }
            Err(e)
        }
    }
}

/// Keys already stored for a relation; empty when the relation is absent.
pub async fn persisted_keys(pool: &SqlitePool, kind: EntityKind) -> Result<HashSet<String>> {
    let relation = kind.relation();
    if !migrate::table_exists(pool, relation).await? {
        return Ok(HashSet::new());
    }
    let keys: Vec<String> = sqlx::query_scalar(&format!(
        "SELECT {key} FROM {} WHERE {key} IS NOT NULL",
        relation,
        key = KEY_COLUMN
    ))
    .fetch_all(pool)
    .await
    .with_context(|| format!("Failed to read keys of {}", relation))?;
    Ok(keys.into_iter().collect())
}

/// Organization and person keys already stored.
pub async fn load_persisted_keys(pool: &SqlitePool) -> Result<PersistedKeys> {
    Ok(PersistedKeys {
        organizations: persisted_keys(pool, EntityKind::Organization).await?,
        people: persisted_keys(pool, EntityKind::Person).await?,
    })
}
