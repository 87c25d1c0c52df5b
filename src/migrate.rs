//! Declarative schema and idempotent provisioning.
//!
//! Every relation is described once in [`SCHEMA`] and created with
//! `CREATE TABLE IF NOT EXISTS`, so provisioning can run before every
//! pipeline invocation without touching existing data.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// A relation and the statement that creates it.
pub struct TableSchema {
    pub name: &'static str,
    pub ddl: &'static str,
}

pub const SCHEMA: &[TableSchema] = &[
    TableSchema {
        name: "organizations",
        ddl: r#"
        CREATE TABLE IF NOT EXISTS organizations (
            uuid TEXT PRIMARY KEY,
            name TEXT,
            legal_name TEXT,
            domain TEXT,
            homepage_url TEXT,
            country_code TEXT,
            state_code TEXT,
            region TEXT,
            city TEXT,
            address TEXT,
            postal_code TEXT,
            status TEXT,
            short_description TEXT,
            category_list TEXT,
            category_groups_list TEXT,
            roles TEXT,
            industry TEXT,
            industries TEXT,
            secondary_industries TEXT,
            keywords TEXT,
            technology_names TEXT,
            employee_count TEXT,
            estimated_num_employees INTEGER,
            founded_on DATE,
            founded_year INTEGER,
            closed_on DATE,
            last_funding_on DATE,
            total_funding_usd REAL,
            num_funding_rounds INTEGER,
            latest_funding_stage TEXT,
            latest_funding_round_date DATE,
            annual_revenue REAL,
            linkedin_url TEXT,
            twitter_url TEXT,
            facebook_url TEXT,
            created_at TIMESTAMP,
            updated_at TIMESTAMP,
            source TEXT NOT NULL DEFAULT 'file',
            last_processed_at TIMESTAMP
        )
        "#,
    },
    TableSchema {
        name: "people",
        ddl: r#"
        CREATE TABLE IF NOT EXISTS people (
            uuid TEXT PRIMARY KEY,
            name TEXT,
            first_name TEXT,
            last_name TEXT,
            gender TEXT,
            country_code TEXT,
            state_code TEXT,
            region TEXT,
            city TEXT,
            headline TEXT,
            seniority TEXT,
            functions TEXT,
            departments TEXT,
            subdepartments TEXT,
            featured_job_title TEXT,
            featured_job_organization_uuid TEXT,
            featured_job_organization_name TEXT,
            linkedin_url TEXT,
            github_url TEXT,
            facebook_url TEXT,
            twitter_url TEXT,
            created_at TIMESTAMP,
            updated_at TIMESTAMP,
            source TEXT NOT NULL DEFAULT 'file',
            last_processed_at TIMESTAMP
        )
        "#,
    },
    TableSchema {
        name: "jobs",
        ddl: r#"
        CREATE TABLE IF NOT EXISTS jobs (
            uuid TEXT PRIMARY KEY,
            name TEXT,
            person_uuid TEXT NOT NULL,
            person_name TEXT,
            org_uuid TEXT,
            org_name TEXT,
            title TEXT,
            job_type TEXT,
            started_on DATE,
            ended_on DATE,
            is_current BOOLEAN,
            is_founder BOOLEAN,
            description TEXT,
            created_at TIMESTAMP,
            updated_at TIMESTAMP,
            source TEXT NOT NULL DEFAULT 'file',
            last_processed_at TIMESTAMP,
            FOREIGN KEY (person_uuid) REFERENCES people (uuid),
            FOREIGN KEY (org_uuid) REFERENCES organizations (uuid)
        )
        "#,
    },
    TableSchema {
        name: "founder_features",
        ddl: r#"
        CREATE TABLE IF NOT EXISTS founder_features (
            person_uuid TEXT PRIMARY KEY,
            total_companies_founded INTEGER NOT NULL,
            company_categories TEXT,
            avg_company_lifespan REAL,
            total_funding_raised REAL NOT NULL DEFAULT 0,
            num_acquisitions INTEGER NOT NULL DEFAULT 0,
            job_titles TEXT,
            leadership_roles_count INTEGER NOT NULL DEFAULT 0,
            computed_at TIMESTAMP,
            FOREIGN KEY (person_uuid) REFERENCES people (uuid)
        )
        "#,
    },
    TableSchema {
        name: "company_features",
        ddl: r#"
        CREATE TABLE IF NOT EXISTS company_features (
            org_uuid TEXT PRIMARY KEY,
            founder_backgrounds TEXT,
            similar_companies TEXT,
            growth_stage TEXT,
            business_model TEXT,
            technologies TEXT,
            markets TEXT,
            FOREIGN KEY (org_uuid) REFERENCES organizations (uuid)
        )
        "#,
    },
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_organizations_domain ON organizations(domain)",
    "CREATE INDEX IF NOT EXISTS idx_people_linkedin_url ON people(linkedin_url)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_person_uuid ON jobs(person_uuid)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_org_uuid ON jobs(org_uuid)",
];

/// Names of all relations the pipeline owns.
pub fn table_names() -> impl Iterator<Item = &'static str> {
    SCHEMA.iter().map(|t| t.name)
}

/// Create every relation and index that does not exist yet.
pub async fn provision(pool: &SqlitePool) -> Result<()> {
    for table in SCHEMA {
        sqlx::query(table.ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create table {}", table.name))?;
    }
    for index in INDEXES {
        sqlx::query(index).execute(pool).await?;
    }
    tracing::info!(tables = SCHEMA.len(), "schema provisioned");
    Ok(())
}

/// Whether a relation exists in the connected database.
pub async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.db.path = dir.join("test.db");
        cfg
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&config_in(tmp.path())).await.unwrap();
        provision(&pool).await.unwrap();
        provision(&pool).await.unwrap();

        for name in table_names() {
            assert!(table_exists(&pool, name).await.unwrap(), "{} missing", name);
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn missing_table_reports_false() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&config_in(tmp.path())).await.unwrap();
        assert!(!table_exists(&pool, "organizations").await.unwrap());
        pool.close().await;
    }
}
