//! Founder-feature derivation.
//!
//! Runs after the load transaction has committed, on the in-memory merged
//! tables. A founder is a person holding at least one founder-flagged job
//! (job type `founder`, or "founder" anywhere in the title) whose
//! organization resolves.
//!
//! A full run replaces the whole `founder_features` relation. An incremental
//! run only holds the changed rows, so it recomputes the founders whose
//! founded organizations are all in memory and upserts their rows; every
//! other stored row is left alone.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::models::{FounderFeatures, KEY_COLUMN};
use crate::table::{Record, Table, Value};

fn is_founder_flagged(job: &Record) -> bool {
    if let Value::Bool(flag) = job.get("is_founder") {
        if *flag {
            return true;
        }
    }
    let tagged = job
        .text("job_type")
        .map(|t| t.trim().eq_ignore_ascii_case("founder"))
        .unwrap_or(false);
    tagged
        || job
            .text("title")
            .map(|t| t.to_lowercase().contains("founder"))
            .unwrap_or(false)
}

fn is_executive(job: &Record) -> bool {
    job.text("job_type")
        .map(|t| t.trim().eq_ignore_ascii_case("executive"))
        .unwrap_or(false)
}

/// Categories of an organization, whether stored as a list, a JSON array or
/// comma-separated text.
fn categories(value: &Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::List(items) => items.clone(),
        Value::Json(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        Value::Text(s) => match serde_json::from_str::<Vec<String>>(s) {
            Ok(items) => items,
            Err(_) => s.split(',').map(str::to_string).collect(),
        },
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn lifespan_years(org: &Record, today: NaiveDate) -> Option<f64> {
    let founded = org.get("founded_on").as_datetime()?.date();
    let end = org
        .get("closed_on")
        .as_datetime()
        .map(|dt| dt.date())
        .unwrap_or(today);
    let days = (end - founded).num_days();
    if days < 0 {
        return None;
    }
    Some(days as f64 / 365.25)
}

/// Derive one [`FounderFeatures`] row per founder with at least one
/// resolvable founded organization. Output is ordered by person key.
pub fn derive_founder_features(
    jobs: &Table,
    organizations: &Table,
    today: NaiveDate,
) -> Vec<FounderFeatures> {
    let orgs: HashMap<&str, &Record> = organizations
        .rows()
        .iter()
        .filter_map(|o| o.text(KEY_COLUMN).map(|k| (k, o)))
        .collect();

    let mut by_person: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
    for job in jobs.rows().iter().filter(|j| is_founder_flagged(j)) {
        if let Some(person) = job.text("person_uuid") {
            by_person.entry(person).or_default().push(job);
        }
    }

    let mut features = Vec::new();
    for (person, founder_jobs) in by_person {
        let founded: BTreeSet<&str> = founder_jobs
            .iter()
            .filter_map(|j| j.text("org_uuid"))
            .filter(|uuid| orgs.contains_key(uuid))
            .collect();
        if founded.is_empty() {
            debug!(person, "no resolvable founded organization");
            continue;
        }

        let mut company_categories = BTreeSet::new();
        let mut total_funding_raised = 0.0;
        let mut num_acquisitions = 0;
        let mut lifespans = Vec::new();
        for org in founded.iter().filter_map(|uuid| orgs.get(uuid)) {
            company_categories.extend(categories(org.get("category_list")));
            total_funding_raised += org.get("total_funding_usd").as_f64().unwrap_or(0.0);
            if org
                .text("status")
                .map(|s| s.trim().eq_ignore_ascii_case("acquired"))
                .unwrap_or(false)
            {
                num_acquisitions += 1;
            }
            lifespans.extend(lifespan_years(org, today));
        }

        let job_titles: BTreeSet<String> = founder_jobs
            .iter()
            .filter_map(|j| j.text("title"))
            .map(str::to_string)
            .collect();

        features.push(FounderFeatures {
            person_uuid: person.to_string(),
            total_companies_founded: founded.len() as i64,
            company_categories: company_categories.into_iter().collect(),
            avg_company_lifespan: if lifespans.is_empty() {
                None
            } else {
                Some(lifespans.iter().sum::<f64>() / lifespans.len() as f64)
            },
            total_funding_raised,
            num_acquisitions,
            job_titles: job_titles.into_iter().collect(),
            leadership_roles_count: founder_jobs.iter().filter(|j| is_executive(j)).count() as i64,
        });
    }

    info!(founders = features.len(), "derived founder features");
    features
}

/// Restrict derivation to founders whose founder-flagged jobs all point at
/// organizations present in `organizations`. Used on incremental runs, where
/// the tables hold only the delta.
pub fn derive_delta_founder_features(
    jobs: &Table,
    organizations: &Table,
    today: NaiveDate,
) -> Vec<FounderFeatures> {
    let known = organizations.key_set(KEY_COLUMN);
    let incomplete: HashSet<String> = jobs
        .rows()
        .iter()
        .filter(|j| is_founder_flagged(j))
        .filter(|j| {
            j.text("org_uuid")
                .map(|org| !known.contains(org))
                .unwrap_or(false)
        })
        .filter_map(|j| j.text("person_uuid").map(str::to_string))
        .collect();
    if !incomplete.is_empty() {
        info!(
            founders = incomplete.len(),
            "keeping stored founder features for founders with unchanged companies"
        );
    }

    let mut scoped = jobs.clone();
    scoped.retain(|j| {
        j.text("person_uuid")
            .map(|p| !incomplete.contains(p))
            .unwrap_or(false)
    });
    derive_founder_features(&scoped, organizations, today)
}

async fn insert_rows(
    conn: &mut SqliteConnection,
    statement: &str,
    rows: &[FounderFeatures],
    computed_at: NaiveDateTime,
) -> Result<u64> {
    let sql = format!(
        r#"
        {} INTO founder_features (
            person_uuid, total_companies_founded, company_categories,
            avg_company_lifespan, total_funding_raised, num_acquisitions,
            job_titles, leadership_roles_count, computed_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        statement
    );
    let computed_at = computed_at.format("%Y-%m-%d %H:%M:%S").to_string();
    let mut written = 0u64;
    for row in rows {
        let result = sqlx::query(&sql)
            .bind(&row.person_uuid)
            .bind(row.total_companies_founded)
            .bind(serde_json::to_string(&row.company_categories)?)
            .bind(row.avg_company_lifespan)
            .bind(row.total_funding_raised)
            .bind(row.num_acquisitions)
            .bind(serde_json::to_string(&row.job_titles)?)
            .bind(row.leadership_roles_count)
            .bind(&computed_at)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => written += 1,
            Err(e) => warn!(person = %row.person_uuid, error = %e, "skipping founder feature row"),
        }
    }
    Ok(written)
}

/// Replace the contents of `founder_features` with `rows`.
/// Returns the number of rows written.
pub async fn replace_founder_features(
    pool: &SqlitePool,
    rows: &[FounderFeatures],
    computed_at: NaiveDateTime,
) -> Result<u64> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin founder feature transaction")?;

    sqlx::query("DELETE FROM founder_features")
        .execute(&mut *tx)
        .await
        .context("Failed to clear founder_features")?;
    let written = insert_rows(&mut tx, "INSERT", rows, computed_at).await?;

    tx.commit()
        .await
        .context("Failed to commit founder features")?;
    info!(rows = written, "founder features replaced");
    Ok(written)
}

/// Insert or overwrite the rows of the given founders, leaving every other
/// stored row in place. Returns the number of rows written.
pub async fn merge_founder_features(
    pool: &SqlitePool,
    rows: &[FounderFeatures],
    computed_at: NaiveDateTime,
) -> Result<u64> {
    if rows.is_empty() {
        info!("no founder features to update");
        return Ok(0);
    }
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin founder feature transaction")?;
    let written = insert_rows(&mut tx, "INSERT OR REPLACE", rows, computed_at).await?;
    tx.commit()
        .await
        .context("Failed to commit founder features")?;
    info!(rows = written, "founder features updated");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn org(uuid: &str, funding: Value, status: &str, categories: Value) -> Record {
        [
            ("uuid", Value::text(uuid)),
            ("total_funding_usd", funding),
            ("status", Value::text(status)),
            ("category_list", categories),
        ]
        .into_iter()
        .collect()
    }

    fn job(person: &str, org: Option<&str>, title: &str, job_type: Option<&str>) -> Record {
        [
            ("person_uuid", Value::text(person)),
            ("org_uuid", org.map(Value::text).unwrap_or(Value::Null)),
            ("title", Value::text(title)),
            ("job_type", job_type.map(Value::text).unwrap_or(Value::Null)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn two_companies_one_acquisition() {
        let orgs = Table::from_rows(vec![
            org("o1", Value::Int(1_000_000), "acquired", Value::List(vec!["AI".into()])),
            org("o2", Value::Float(2_000_000.0), "operating", Value::text("Fintech, AI")),
        ]);
        let jobs = Table::from_rows(vec![
            job("p1", Some("o1"), "Co-Founder", None),
            job("p1", Some("o2"), "CEO", Some("founder")),
            job("p1", Some("o2"), "Board Member", None),
        ]);

        let features = derive_founder_features(&jobs, &orgs, today());
        assert_eq!(features.len(), 1);
        let f = &features[0];
        assert_eq!(f.person_uuid, "p1");
        assert_eq!(f.total_companies_founded, 2);
        assert_eq!(f.total_funding_raised, 3_000_000.0);
        assert_eq!(f.num_acquisitions, 1);
        assert_eq!(f.company_categories, vec!["AI", "Fintech"]);
        assert_eq!(f.job_titles, vec!["CEO", "Co-Founder"]);
        assert_eq!(f.avg_company_lifespan, None);
    }

    #[test]
    fn founder_without_resolvable_org_is_skipped() {
        let orgs = Table::from_rows(vec![org("o1", Value::Null, "", Value::Null)]);
        let jobs = Table::from_rows(vec![
            job("p1", None, "Founder", None),
            job("p2", Some("o-gone"), "Founder", None),
            job("p3", Some("o1"), "Engineer", None),
        ]);
        assert!(derive_founder_features(&jobs, &orgs, today()).is_empty());
    }

    #[test]
    fn leadership_counts_executive_founder_jobs() {
        let orgs = Table::from_rows(vec![org("o1", Value::Null, "", Value::text(r#"["B2B"]"#))]);
        let jobs = Table::from_rows(vec![
            job("p1", Some("o1"), "Founder & CEO", Some("executive")),
            job("p1", Some("o1"), "Founder", Some("founder")),
        ]);
        let f = &derive_founder_features(&jobs, &orgs, today())[0];
        assert_eq!(f.leadership_roles_count, 1);
        assert_eq!(f.total_companies_founded, 1);
        assert_eq!(f.total_funding_raised, 0.0);
        assert_eq!(f.company_categories, vec!["B2B"]);
    }

    #[test]
    fn delta_skips_founders_with_companies_outside_the_delta() {
        let orgs = Table::from_rows(vec![org("o1", Value::Int(10), "", Value::Null)]);
        let jobs = Table::from_rows(vec![
            job("p1", Some("o1"), "Founder", None),
            job("p2", Some("o1"), "Founder", None),
            job("p2", Some("o-stored"), "Co-Founder", None),
            job("p3", Some("o-stored"), "Engineer", None),
        ]);
        let features = derive_delta_founder_features(&jobs, &orgs, today());
        let people: Vec<&str> = features.iter().map(|f| f.person_uuid.as_str()).collect();
        assert_eq!(people, vec!["p1"]);
    }

    #[tokio::test]
    async fn merge_keeps_rows_of_other_founders() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut cfg = crate::config::Config::default();
        cfg.db.path = tmp.path().join("features.db");
        let pool = crate::db::connect(&cfg).await.unwrap();
        crate::migrate::provision(&pool).await.unwrap();
        sqlx::query("INSERT INTO people (uuid, name) VALUES ('p1', 'Ada'), ('p2', 'Grace')")
            .execute(&pool)
            .await
            .unwrap();

        let orgs = Table::from_rows(vec![org("o1", Value::Int(10), "", Value::Null)]);
        let jobs = Table::from_rows(vec![
            job("p1", Some("o1"), "Founder", None),
            job("p2", Some("o1"), "Founder", None),
        ]);
        let ts = today().and_hms_opt(0, 0, 0).unwrap();
        let rows = derive_founder_features(&jobs, &orgs, today());
        assert_eq!(replace_founder_features(&pool, &rows, ts).await.unwrap(), 2);

        let mut updated = rows[0].clone();
        updated.total_funding_raised = 99.0;
        assert_eq!(merge_founder_features(&pool, &[updated], ts).await.unwrap(), 1);
        assert_eq!(merge_founder_features(&pool, &[], ts).await.unwrap(), 0);

        let stored: Vec<(String, f64)> = sqlx::query_as(
            "SELECT person_uuid, total_funding_raised FROM founder_features ORDER BY person_uuid",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            stored,
            vec![("p1".to_string(), 99.0), ("p2".to_string(), 10.0)]
        );
        pool.close().await;
    }

    #[test]
    fn lifespan_runs_to_closure_or_today() {
        let mut closed = org("o1", Value::Null, "closed", Value::Null);
        closed.set("founded_on", Value::Date(NaiveDate::from_ymd_opt(2010, 1, 1).unwrap()));
        closed.set("closed_on", Value::Date(NaiveDate::from_ymd_opt(2012, 1, 1).unwrap()));
        let mut open = org("o2", Value::Null, "operating", Value::Null);
        open.set("founded_on", Value::Date(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()));

        let jobs = Table::from_rows(vec![
            job("p1", Some("o1"), "Founder", None),
            job("p1", Some("o2"), "Founder", None),
        ]);
        let f = &derive_founder_features(&jobs, &Table::from_rows(vec![closed, open]), today())[0];
        let avg = f.avg_company_lifespan.unwrap();
        assert!((avg - 3.0).abs() < 0.01, "avg lifespan was {}", avg);
    }
}
