//! Transform stage: reconcile file rows with enrichment records.
//!
//! The stage runs in a fixed order: organizations, people, jobs, then the
//! cross-entity repair pass.
//!
//! 1. **Normalize.** Names are whitespace-collapsed, domains lowercased,
//!    list fields parsed into [`Value::List`], employee buckets compacted, and
//!    every row stamped with the run timestamp.
//! 2. **Merge.** [`merge_enrichment`] left-joins a file table against the
//!    enrichment records on a key column. File values win when present;
//!    funding columns take the maximum of both sides; unmapped enrichment
//!    fields pass through as new columns. The provenance tag is recomputed
//!    from scratch on every merge.
//! 3. **Job history.** [`derive_job_history`] turns the employment history
//!    carried by person enrichment records into synthetic job rows, and
//!    [`union_jobs`] deduplicates them against the file jobs.
//! 4. **Repair.** [`repair_references`] nulls dangling organization
//!    references and drops jobs whose person does not exist.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::enrich::EnrichmentRecord;
use crate::extract::{EntityExtract, Extracted};
use crate::models::{
    EmploymentEntry, Provenance, EMPLOYMENT_HISTORY_FIELD, FUNDING_COLUMNS, KEY_COLUMN,
    LAST_PROCESSED_COLUMN, ORGANIZATION_FIELD_MAPPINGS, PEOPLE_FIELD_MAPPINGS, SOURCE_COLUMN,
};
use crate::table::{self, Record, Table, Value};

/// Columns an enrichment record may never overwrite.
const RESERVED_COLUMNS: &[&str] = &[KEY_COLUMN, SOURCE_COLUMN, LAST_PROCESSED_COLUMN];

const ORGANIZATION_NAME_COLUMNS: &[&str] = &["name", "legal_name"];
const PEOPLE_NAME_COLUMNS: &[&str] = &["name", "first_name", "last_name"];
const JOB_NAME_COLUMNS: &[&str] = &["name", "title", "org_name", "person_name"];
const LIST_COLUMNS: &[&str] = &["category_list", "category_groups_list", "roles"];

/// Columns that identify the same job across sources.
const JOB_IDENTITY_COLUMNS: &[&str] = &["person_uuid", "org_name", "title", "started_on", "ended_on"];

/// Trim and collapse internal whitespace. Blank input yields `None`.
pub fn normalize_name(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Domains join case-insensitively.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let d = raw.trim().to_lowercase();
    if d.is_empty() {
        None
    } else {
        Some(d)
    }
}

fn name_value(value: &Value) -> Value {
    match value {
        Value::Text(s) => normalize_name(s).map(Value::Text).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

/// Parse a list field from comma-separated or bracketed text.
pub fn parse_list(value: &Value) -> Value {
    let items: Vec<String> = match value {
        Value::List(items) => items.clone(),
        Value::Json(serde_json::Value::Array(items)) => items
            .iter()
            .map(|i| match i {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Value::Text(s) => {
            let s = s.trim();
            if s.starts_with('[') {
                if let Ok(items) = serde_json::from_str::<Vec<String>>(s) {
                    return list_or_null(items);
                }
            }
            let inner = s
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .unwrap_or(s);
            inner
                .split(',')
                .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\''))
                .map(str::to_string)
                .collect()
        }
        _ => return Value::Null,
    };
    list_or_null(items)
}

fn list_or_null(items: Vec<String>) -> Value {
    let items: Vec<String> = items
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect();
    if items.is_empty() {
        Value::Null
    } else {
        Value::List(items)
    }
}

/// Compact employee-count buckets: `"11 - 50"` → `"11-50"`, `"1001 +"` → `"1001+"`.
/// Descriptive values are kept as trimmed text.
pub fn normalize_employee_count(value: &Value) -> Value {
    let raw = match value {
        Value::Int(i) => return Value::Text(i.to_string()),
        Value::Float(f) if f.fract() == 0.0 => return Value::Text(format!("{}", *f as i64)),
        Value::Text(s) => s.trim(),
        other => return other.clone(),
    };
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let is_bucket = {
        let body = compact.strip_suffix('+').unwrap_or(&compact);
        let mut parts = body.splitn(2, '-');
        let lower = parts.next().unwrap_or("");
        let upper = parts.next();
        !lower.is_empty()
            && lower.chars().all(|c| c.is_ascii_digit())
            && upper.map_or(true, |u| !u.is_empty() && u.chars().all(|c| c.is_ascii_digit()))
            && !(upper.is_some() && compact.ends_with('+'))
    };
    if is_bucket {
        Value::Text(compact)
    } else {
        Value::text(raw)
    }
}

fn is_founder_job(row: &Record) -> bool {
    let tagged = row
        .text("job_type")
        .map(|t| t.trim().eq_ignore_ascii_case("founder"))
        .unwrap_or(false);
    let titled = row
        .text("title")
        .map(|t| t.to_lowercase().contains("founder"))
        .unwrap_or(false);
    tagged || titled
}

/// How one entity kind joins against its enrichment records.
#[derive(Debug, Clone, Copy)]
pub struct MergeSpec<'a> {
    pub key_column: &'a str,
    /// Enrichment field → file column renames.
    pub field_map: &'a [(&'a str, &'a str)],
    /// Columns resolved by taking the larger value.
    pub funding_columns: &'a [&'a str],
}

impl MergeSpec<'static> {
    pub fn organizations() -> Self {
        Self {
            key_column: "domain",
            field_map: ORGANIZATION_FIELD_MAPPINGS,
            funding_columns: FUNDING_COLUMNS,
        }
    }

    pub fn people() -> Self {
        Self {
            key_column: "linkedin_url",
            field_map: PEOPLE_FIELD_MAPPINGS,
            funding_columns: &[],
        }
    }
}

impl MergeSpec<'_> {
    fn column_for<'f>(&'f self, field: &'f str) -> &'f str {
        self.field_map
            .iter()
            .find(|(from, _)| *from == field)
            .map(|(_, to)| *to)
            .unwrap_or(field)
    }

    /// Flatten an enrichment record into a row under file column names.
    fn secondary_row(&self, record: &EnrichmentRecord) -> Record {
        let mut row = Record::new();
        for (field, raw) in record {
            let column = self.column_for(field.as_str());
            if RESERVED_COLUMNS.contains(&column) || column == self.key_column {
                continue;
            }
            // A renamed field and a verbatim field can land on the same column.
            if !row.get(column).is_null() {
                continue;
            }
            row.set(column, Value::from_json(raw));
        }
        row
    }
}

fn max_funding(file: &Value, enriched: &Value) -> Value {
    match (file.as_f64(), enriched.as_f64()) {
        (Some(a), Some(b)) => table::to_number(&Value::Float(a.max(b))),
        (Some(_), None) => file.clone(),
        (None, Some(_)) => enriched.clone(),
        (None, None) => {
            if file.is_null() {
                enriched.clone()
            } else {
                file.clone()
            }
        }
    }
}

/// Left-join `table` against `records` on `spec.key_column`.
///
/// Re-merging the output with the same records yields the same output.
pub fn merge_enrichment(
    mut table: Table,
    records: &HashMap<String, EnrichmentRecord>,
    spec: &MergeSpec<'_>,
) -> Table {
    table.ensure_column(SOURCE_COLUMN);
    let mut new_columns: Vec<String> = Vec::new();
    let mut matched = 0usize;

    for row in table.rows_mut() {
        let record = row
            .text(spec.key_column)
            .map(str::trim)
            .and_then(|key| records.get(key));

        let record = match record {
            Some(r) => r,
            None => {
                row.set(SOURCE_COLUMN, Value::text(Provenance::File.as_str()));
                continue;
            }
        };

        matched += 1;
        for (column, enriched) in spec.secondary_row(record).iter() {
            let current = row.get(column);
            let next = if spec.funding_columns.contains(&column.as_str()) {
                max_funding(current, enriched)
            } else if current.is_null() {
                enriched.clone()
            } else {
                continue;
            };
            if !row.contains(column) && !new_columns.contains(column) {
                new_columns.push(column.clone());
            }
            row.set(column.clone(), next);
        }
        row.set(
            SOURCE_COLUMN,
            Value::text(Provenance::FileEnriched.as_str()),
        );
    }

    for column in new_columns {
        table.ensure_column(column);
    }
    debug!(
        key = spec.key_column,
        matched,
        rows = table.len(),
        "merged enrichment records"
    );
    table
}

/// Build synthetic job rows from the employment history embedded in person
/// enrichment records. Entries whose profile URL does not resolve to a row in
/// `people` are dropped.
pub fn derive_job_history(
    people: &Table,
    enrichment: &HashMap<String, EnrichmentRecord>,
    timestamp: NaiveDateTime,
) -> Table {
    let mut by_profile: HashMap<&str, &Record> = HashMap::new();
    for person in people.rows() {
        if let (Some(url), Some(_)) = (person.text("linkedin_url"), person.text(KEY_COLUMN)) {
            by_profile.entry(url.trim()).or_insert(person);
        }
    }

    let mut profiles: Vec<&String> = enrichment.keys().collect();
    profiles.sort();

    let mut out = Table::default();
    for profile in profiles {
        let person = match by_profile.get(profile.trim()) {
            Some(p) => *p,
            None => continue,
        };
        let history = match enrichment[profile]
            .get(EMPLOYMENT_HISTORY_FIELD)
            .and_then(|h| h.as_array())
        {
            Some(h) => h,
            None => continue,
        };

        let person_uuid = person.text(KEY_COLUMN).unwrap_or_default();
        let person_name = person.text("name").unwrap_or_default();
        for (seq, raw) in history.iter().enumerate() {
            let entry: EmploymentEntry = match serde_json::from_value(raw.clone()) {
                Ok(e) => e,
                Err(e) => {
                    debug!(person = person_uuid, error = %e, "skipping unreadable history entry");
                    continue;
                }
            };
            out.push(synthetic_job(person_uuid, person_name, seq, &entry, timestamp));
        }
    }
    out
}

fn synthetic_job(
    person_uuid: &str,
    person_name: &str,
    seq: usize,
    entry: &EmploymentEntry,
    timestamp: NaiveDateTime,
) -> Record {
    let title = entry.title.as_deref().and_then(normalize_name);
    let org_name = entry.organization_name.as_deref().and_then(normalize_name);
    let label = format!(
        "{} {} @ {}",
        person_name,
        title.as_deref().unwrap_or(""),
        org_name.as_deref().unwrap_or("")
    );
    let date = |raw: &Option<String>| {
        raw.as_deref()
            .and_then(table::parse_date)
            .map(Value::Date)
            .unwrap_or(Value::Null)
    };

    [
        (KEY_COLUMN, Value::Text(format!("api-{}-{}", person_uuid, seq))),
        ("name", normalize_name(&label).map(Value::Text).unwrap_or(Value::Null)),
        ("person_uuid", Value::text(person_uuid)),
        ("person_name", Value::text(person_name)),
        ("org_uuid", Value::Null),
        ("org_name", org_name.map(Value::Text).unwrap_or(Value::Null)),
        ("title", title.map(Value::Text).unwrap_or(Value::Null)),
        ("started_on", date(&entry.start_date)),
        ("ended_on", date(&entry.end_date)),
        ("is_current", Value::Bool(entry.current.unwrap_or(false))),
        (
            "description",
            entry.description.clone().map(Value::text).unwrap_or(Value::Null),
        ),
        ("created_at", Value::DateTime(timestamp)),
        ("updated_at", Value::DateTime(timestamp)),
        (SOURCE_COLUMN, Value::text(Provenance::Api.as_str())),
        (LAST_PROCESSED_COLUMN, Value::DateTime(timestamp)),
    ]
    .into_iter()
    .collect()
}

fn job_identity(row: &Record) -> Vec<String> {
    JOB_IDENTITY_COLUMNS
        .iter()
        .map(|c| row.get(c).key_repr())
        .collect()
}

/// File jobs first, then synthetic jobs, keeping the first row of each
/// identity. Returns the union and the number of rows collapsed.
pub fn union_jobs(file_jobs: Table, synthetic: Table) -> (Table, usize) {
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut combined = Table::new(file_jobs.columns().to_vec());
    let mut collapsed = 0;
    for row in file_jobs.into_rows().into_iter().chain(synthetic.into_rows()) {
        if seen.insert(job_identity(&row)) {
            combined.push(row);
        } else {
            collapsed += 1;
        }
    }
    (combined, collapsed)
}

/// Counts produced by the transform stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RepairReport {
    pub org_refs_nulled: usize,
    pub jobs_dropped: usize,
    pub synthetic_jobs_added: usize,
    pub duplicates_collapsed: usize,
}

/// Null dangling organization references, then drop jobs whose person is
/// unknown. Organization repair never removes a row.
pub fn repair_references(
    mut jobs: Table,
    valid_orgs: &HashSet<String>,
    valid_people: &HashSet<String>,
    report: &mut RepairReport,
) -> Table {
    jobs.ensure_column("org_uuid");
    for row in jobs.rows_mut() {
        let dangling = match row.get("org_uuid") {
            Value::Null => false,
            v => !valid_orgs.contains(v.key_repr().trim()),
        };
        if dangling {
            row.set("org_uuid", Value::Null);
            report.org_refs_nulled += 1;
        }
    }

    let before = jobs.len();
    jobs.retain(|row| {
        row.text("person_uuid")
            .map(|p| valid_people.contains(p.trim()))
            .unwrap_or(false)
    });
    report.jobs_dropped += before - jobs.len();

    if report.org_refs_nulled > 0 || report.jobs_dropped > 0 {
        info!(
            org_refs_nulled = report.org_refs_nulled,
            jobs_dropped = report.jobs_dropped,
            "repaired job references"
        );
    }
    jobs
}

/// Keys already stored, united with the merged keys during incremental
/// repair.
#[derive(Debug, Clone, Default)]
pub struct PersistedKeys {
    pub organizations: HashSet<String>,
    pub people: HashSet<String>,
}

/// Output of the transform stage.
#[derive(Debug, Clone, Default)]
pub struct Transformed {
    pub organizations: Table,
    pub people: Table,
    pub jobs: Table,
    pub report: RepairReport,
}

pub struct Transformer {
    timestamp: NaiveDateTime,
}

impl Transformer {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self { timestamp }
    }

    fn stamp(&self, table: &mut Table) {
        table.set_column(LAST_PROCESSED_COLUMN, Value::DateTime(self.timestamp));
    }

    pub fn transform_organizations(&self, extract: &EntityExtract) -> Table {
        let mut table = extract.table.clone();
        table.map_column("domain", |v| match v {
            Value::Text(s) => normalize_domain(s).map(Value::Text).unwrap_or(Value::Null),
            other => other.clone(),
        });
        // Blank file names must not mask enrichment values.
        for column in ORGANIZATION_NAME_COLUMNS {
            table.map_column(column, name_value);
        }

        let mut table = merge_enrichment(table, &extract.enrichment, &MergeSpec::organizations());

        for column in ORGANIZATION_NAME_COLUMNS {
            table.map_column(column, name_value);
        }
        for column in LIST_COLUMNS {
            table.map_column(column, parse_list);
        }
        table.map_column("employee_count", normalize_employee_count);
        for column in FUNDING_COLUMNS {
            table.map_column(column, table::to_number);
        }
        for column in ["founded_on", "last_funding_on", "closed_on", "latest_funding_round_date"] {
            table.map_column(column, table::to_date);
        }
        self.stamp(&mut table);

        info!(rows = table.len(), "transformed organizations");
        table
    }

    pub fn transform_people(&self, extract: &EntityExtract) -> Table {
        let mut table = extract.table.clone();
        table.map_column("linkedin_url", |v| match v {
            Value::Text(s) => Value::text(s.trim()),
            other => other.clone(),
        });
        for column in PEOPLE_NAME_COLUMNS {
            table.map_column(column, name_value);
        }

        let mut table = merge_enrichment(table, &extract.enrichment, &MergeSpec::people());

        for column in PEOPLE_NAME_COLUMNS {
            table.map_column(column, name_value);
        }
        self.stamp(&mut table);

        info!(rows = table.len(), "transformed people");
        table
    }

    /// Normalize file jobs and union them with the derived job history.
    pub fn transform_jobs(
        &self,
        jobs: &Table,
        people: &Table,
        people_enrichment: &HashMap<String, EnrichmentRecord>,
        report: &mut RepairReport,
    ) -> Table {
        let mut table = jobs.clone();
        for column in JOB_NAME_COLUMNS {
            table.map_column(column, name_value);
        }
        self.stamp(&mut table);

        let synthetic = derive_job_history(people, people_enrichment, self.timestamp);
        let (mut table, collapsed) = union_jobs(table, synthetic);
        let api = Provenance::Api.as_str();
        let added = table
            .rows()
            .iter()
            .filter(|r| r.text(SOURCE_COLUMN) == Some(api))
            .count();
        report.synthetic_jobs_added += added;
        report.duplicates_collapsed += collapsed;

        table.ensure_column("is_founder");
        for row in table.rows_mut() {
            let founder = is_founder_job(row);
            row.set("is_founder", Value::Bool(founder));
        }

        info!(
            rows = table.len(),
            synthetic = added,
            collapsed,
            "transformed jobs"
        );
        table
    }

    /// Run every pass in order. `persisted` widens the valid key sets used
    /// by the repair pass (incremental runs).
    pub fn transform_all(&self, extracted: &Extracted, persisted: Option<&PersistedKeys>) -> Transformed {
        info!("starting data transformation");
        let mut report = RepairReport::default();

        let organizations = self.transform_organizations(&extracted.organizations);
        let people = self.transform_people(&extracted.people);
        let jobs = self.transform_jobs(
            &extracted.jobs,
            &people,
            &extracted.people.enrichment,
            &mut report,
        );

        let mut valid_orgs = organizations.key_set(KEY_COLUMN);
        let mut valid_people = people.key_set(KEY_COLUMN);
        if let Some(keys) = persisted {
            valid_orgs.extend(keys.organizations.iter().cloned());
            valid_people.extend(keys.people.iter().cloned());
        }
        let jobs = repair_references(jobs, &valid_orgs, &valid_people, &mut report);

        Transformed {
            organizations,
            people,
            jobs,
            report,
        }
    }
}
