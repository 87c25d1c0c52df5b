//! Extract stage: tabular source files → [`Table`]s, plus enrichment fetch.
//!
//! [`read_source`] is the record source reader. It loads a CSV file, coerces
//! the entity's timestamp-like columns (unparsable values become nulls),
//! tags every row with `source = "file"`, and in incremental mode keeps only
//! rows that are new or updated since the last recorded run.
//!
//! [`Extractor`] runs the reader for all three entity kinds and, when an
//! [`EnrichmentClient`] is available, fetches enrichment records for the
//! organization domains and person profile URLs in batches.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::config::Config;
use crate::enrich::{EnrichmentClient, EnrichmentRecord, LookupKind};
use crate::migrate;
use crate::models::{EntityKind, Provenance, KEY_COLUMN, LAST_PROCESSED_COLUMN, SOURCE_COLUMN};
use crate::table::{self, Record, Table, Value};
use crate::transform::normalize_domain;

/// Stored `(uuid → last_processed_at)` markers for one relation.
pub type ProcessedMarkers = HashMap<String, Option<NaiveDateTime>>;

/// Read a CSV source into a table with typed timestamp columns.
///
/// # Errors
///
/// A missing file is fatal. Individual malformed fields never are: they
/// degrade to nulls.
pub fn read_csv(path: &Path, kind: EntityKind) -> Result<Table> {
    if !path.exists() {
        bail!("Source file not found: {}", path.display());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(path)
        .with_context(|| format!("Failed to open source file: {}", path.display()))?;

    let headers: Vec<String> = reader
        .byte_headers()
        .with_context(|| format!("Failed to read header row of {}", path.display()))?
        .iter()
        .map(|h| {
            String::from_utf8_lossy(h)
                .trim_start_matches('\u{feff}')
                .trim()
                .to_string()
        })
        .collect();

    let mut table = Table::new(headers.iter().cloned());
    for (line, record) in reader.byte_records().enumerate() {
        let record = record
            .with_context(|| format!("Failed to read row {} of {}", line + 2, path.display()))?;
        let row: Record = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                let cell = record
                    .get(i)
                    .map(|raw| Value::text(String::from_utf8_lossy(raw).into_owned()))
                    .unwrap_or(Value::Null);
                (header.clone(), cell)
            })
            .collect();
        table.push(row);
    }

    coerce_columns(&mut table, kind);
    table.set_column(SOURCE_COLUMN, Value::text(Provenance::File.as_str()));
    table.set_column(LAST_PROCESSED_COLUMN, Value::Null);

    info!(
        kind = %kind,
        path = %path.display(),
        rows = table.len(),
        "extracted rows from source file"
    );
    Ok(table)
}

fn coerce_columns(table: &mut Table, kind: EntityKind) {
    for column in kind.timestamp_columns() {
        table.map_column(column, table::to_datetime);
    }
    for column in kind.date_columns() {
        table.map_column(column, table::to_date);
    }
    if kind == EntityKind::Job {
        table.coerce_column("is_current", |v| match table::to_bool(v) {
            Value::Null => Value::Bool(false),
            b => b,
        });
    }
}

/// Keep rows that are new, or whose `updated_at` is strictly newer than the
/// stored `last_processed_at`. A null stored marker counts as always older.
/// With no stored markers at all, the table is returned unchanged.
pub fn filter_incremental(mut table: Table, stored: &ProcessedMarkers) -> Table {
    if stored.is_empty() {
        info!(rows = table.len(), "no previous processing found, using all rows");
        return table;
    }

    let total = table.len();
    table.retain(|row| {
        let key = match row.text(KEY_COLUMN) {
            Some(k) => k,
            None => return true,
        };
        match stored.get(key) {
            None => true,
            Some(None) => true,
            Some(Some(processed_at)) => row
                .get("updated_at")
                .as_datetime()
                .map(|updated| updated > *processed_at)
                .unwrap_or(false),
        }
    });
    info!(
        kept = table.len(),
        total, "filtered rows for incremental processing"
    );
    table
}

/// Fetch the processing markers recorded for file-derived rows of `kind`.
/// A relation that does not exist yet yields no markers.
pub async fn processed_markers(pool: &SqlitePool, kind: EntityKind) -> Result<ProcessedMarkers> {
    let relation = kind.relation();
    if !migrate::table_exists(pool, relation).await? {
        return Ok(HashMap::new());
    }

    let [file, file_enriched] = Provenance::file_derived();
    let rows = sqlx::query(&format!(
        "SELECT uuid, last_processed_at FROM {} WHERE source IN (?, ?)",
        relation
    ))
    .bind(file)
    .bind(file_enriched)
    .fetch_all(pool)
    .await
    .with_context(|| format!("Failed to read processing markers from {}", relation))?;

    let mut markers = HashMap::with_capacity(rows.len());
    for row in rows {
        let uuid: String = row.try_get("uuid")?;
        let processed: Option<String> = row.try_get("last_processed_at")?;
        markers.insert(uuid, processed.as_deref().and_then(table::parse_datetime));
    }
    Ok(markers)
}

/// Record source reader: read a file and, in incremental mode, reduce it to
/// the delta against what the store has already processed.
pub async fn read_source(
    path: &Path,
    kind: EntityKind,
    incremental: bool,
    pool: &SqlitePool,
) -> Result<Table> {
    let table = read_csv(path, kind)?;
    if !incremental {
        return Ok(table);
    }
    let markers = processed_markers(pool, kind).await?;
    Ok(filter_incremental(table, &markers))
}

/// A file table and the enrichment records fetched for its keys.
#[derive(Debug, Clone, Default)]
pub struct EntityExtract {
    pub table: Table,
    pub enrichment: HashMap<String, EnrichmentRecord>,
}

/// Output of the extract stage.
#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub organizations: EntityExtract,
    pub people: EntityExtract,
    pub jobs: Table,
}

impl Extracted {
    /// Total employment-history entries carried by person enrichment records.
    pub fn job_history_count(&self) -> usize {
        self.people
            .enrichment
            .values()
            .filter_map(|r| r.get(crate::models::EMPLOYMENT_HISTORY_FIELD))
            .filter_map(|h| h.as_array())
            .map(|h| h.len())
            .sum()
    }
}

/// Runs the reader for every entity kind and gathers enrichment.
pub struct Extractor<'a> {
    config: &'a Config,
    pool: &'a SqlitePool,
    client: Option<&'a EnrichmentClient>,
}

impl<'a> Extractor<'a> {
    pub fn new(
        config: &'a Config,
        pool: &'a SqlitePool,
        client: Option<&'a EnrichmentClient>,
    ) -> Self {
        Self {
            config,
            pool,
            client,
        }
    }

    pub async fn extract_all(&self, incremental: bool) -> Result<Extracted> {
        info!(incremental, "starting data extraction");
        let sources = &self.config.sources;

        let organizations = read_source(
            &sources.organizations_path(),
            EntityKind::Organization,
            incremental,
            self.pool,
        )
        .await?;
        let domains: Vec<String> = organizations
            .distinct_text("domain")
            .iter()
            .filter_map(|d| normalize_domain(d))
            .collect();
        let org_enrichment = self.enrich(&domains, LookupKind::Organization).await;

        let people = read_source(
            &sources.people_path(),
            EntityKind::Person,
            incremental,
            self.pool,
        )
        .await?;
        let profile_urls = people.distinct_text("linkedin_url");
        let people_enrichment = self.enrich(&profile_urls, LookupKind::Person).await;

        let jobs = read_source(&sources.jobs_path(), EntityKind::Job, incremental, self.pool).await?;

        Ok(Extracted {
            organizations: EntityExtract {
                table: organizations,
                enrichment: org_enrichment,
            },
            people: EntityExtract {
                table: people,
                enrichment: people_enrichment,
            },
            jobs,
        })
    }

    async fn enrich(&self, keys: &[String], kind: LookupKind) -> HashMap<String, EnrichmentRecord> {
        let client = match self.client {
            Some(c) => c,
            None => return HashMap::new(),
        };

        let mut dedup = keys.to_vec();
        dedup.sort();
        dedup.dedup();

        info!(kind = kind.label(), keys = dedup.len(), "fetching enrichment data");
        let batch_size = self.config.pipeline.batch_size.max(1);
        let batches = dedup.len().div_ceil(batch_size);
        let mut results = HashMap::new();
        for (i, batch) in dedup.chunks(batch_size).enumerate() {
            info!(
                kind = kind.label(),
                batch = i + 1,
                batches,
                size = batch.len(),
                "processing enrichment batch"
            );
            results.extend(client.fetch_batch(batch, kind).await);
        }

        if results.len() < dedup.len() {
            warn!(
                kind = kind.label(),
                missing = dedup.len() - results.len(),
                "some keys were not enriched"
            );
        }
        info!(
            kind = kind.label(),
            enriched = results.len(),
            requested = dedup.len(),
            "enrichment complete"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_is_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = read_csv(&tmp.path().join("nope.csv"), EntityKind::Organization).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn reads_and_tags_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write(
            tmp.path(),
            "organizations.csv",
            "uuid,name,domain,updated_at,founded_on\n\
             o1,Acme,acme.com,2024-01-02 03:04:05,2010-05-01\n\
             o2,,beta.io,garbage,someday\n",
        );
        let table = read_csv(&path, EntityKind::Organization).unwrap();
        assert_eq!(table.len(), 2);

        let first = &table.rows()[0];
        assert_eq!(first.text("source"), Some("file"));
        assert!(first.get("last_processed_at").is_null());
        assert!(matches!(first.get("updated_at"), Value::DateTime(_)));
        assert!(matches!(first.get("founded_on"), Value::Date(_)));

        let second = &table.rows()[1];
        assert!(second.get("name").is_null());
        assert!(second.get("updated_at").is_null());
        assert!(second.get("founded_on").is_null());
    }

    #[test]
    fn job_is_current_defaults_to_false() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write(
            tmp.path(),
            "jobs.csv",
            "uuid,person_uuid,is_current,started_on\nj1,p1,TRUE,2020-01-01\nj2,p1,,bad\n",
        );
        let table = read_csv(&path, EntityKind::Job).unwrap();
        assert_eq!(table.rows()[0].get("is_current"), &Value::Bool(true));
        assert_eq!(table.rows()[1].get("is_current"), &Value::Bool(false));
        assert!(table.rows()[1].get("started_on").is_null());
    }

    fn delta_table() -> Table {
        let row = |uuid: &str, updated: Value| -> Record {
            [("uuid", Value::text(uuid)), ("updated_at", updated)]
                .into_iter()
                .collect()
        };
        Table::from_rows(vec![
            row("newer", Value::DateTime(ts(2024, 6, 1))),
            row("older", Value::DateTime(ts(2023, 1, 1))),
            row("equal", Value::DateTime(ts(2024, 1, 1))),
            row("fresh", Value::DateTime(ts(2020, 1, 1))),
            row("unmarked", Value::DateTime(ts(2020, 1, 1))),
        ])
    }

    #[test]
    fn incremental_filter_keeps_new_and_updated_rows() {
        let t1 = ts(2024, 1, 1);
        let stored: ProcessedMarkers = [
            ("newer".to_string(), Some(t1)),
            ("older".to_string(), Some(t1)),
            ("equal".to_string(), Some(t1)),
            ("unmarked".to_string(), None),
        ]
        .into_iter()
        .collect();

        let kept = filter_incremental(delta_table(), &stored);
        let keys: Vec<&str> = kept.rows().iter().filter_map(|r| r.text("uuid")).collect();
        assert_eq!(keys, vec!["newer", "fresh", "unmarked"]);
    }

    #[test]
    fn incremental_filter_first_run_keeps_everything() {
        let kept = filter_incremental(delta_table(), &HashMap::new());
        assert_eq!(kept.len(), 5);
    }
}
