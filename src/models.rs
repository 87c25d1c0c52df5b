//! Core data models shared by every stage of the pipeline.
//!
//! Entities themselves travel as [`Table`](crate::table::Table)s; this module
//! holds what is fixed about them: which relation each kind lands in, the
//! provenance tags, the enrichment field-name mappings,
//! and the derived [`FounderFeatures`] row.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key column shared by organizations, people, and jobs.
pub const KEY_COLUMN: &str = "uuid";
/// Provenance column.
pub const SOURCE_COLUMN: &str = "source";
/// Run timestamp stamped on every row the pipeline touches.
pub const LAST_PROCESSED_COLUMN: &str = "last_processed_at";

/// The three entity kinds read from tabular sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Organization,
    Person,
    Job,
}

impl EntityKind {
    /// Relation the entity is persisted into.
    pub fn relation(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organizations",
            EntityKind::Person => "people",
            EntityKind::Job => "jobs",
        }
    }

    /// Columns holding date-times in the source files.
    pub fn timestamp_columns(&self) -> &'static [&'static str] {
        &["created_at", "updated_at"]
    }

    /// Columns holding calendar dates in the source files.
    pub fn date_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Organization => &["founded_on", "last_funding_on", "closed_on"],
            EntityKind::Person => &[],
            EntityKind::Job => &["started_on", "ended_on"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relation())
    }
}

/// Where a row's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Tabular source file only.
    File,
    /// Synthesized entirely from an enrichment payload (derived jobs).
    Api,
    /// File row filled in from a matching enrichment record.
    FileEnriched,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::File => "file",
            Provenance::Api => "api",
            Provenance::FileEnriched => "file+enriched",
        }
    }

    /// Tags whose rows originate from the tabular source.
    pub fn file_derived() -> [&'static str; 2] {
        [Provenance::File.as_str(), Provenance::FileEnriched.as_str()]
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enrichment field name → file column name, for organizations.
pub const ORGANIZATION_FIELD_MAPPINGS: &[(&str, &str)] = &[
    ("state", "region"),
    ("country", "country_code"),
    ("street_address", "address"),
    ("website_url", "homepage_url"),
    ("total_funding", "total_funding_usd"),
];

/// Enrichment field name → file column name, for people.
pub const PEOPLE_FIELD_MAPPINGS: &[(&str, &str)] =
    &[("state", "region"), ("country", "country_code")];

/// Columns whose conflicts resolve to the larger value.
pub const FUNDING_COLUMNS: &[&str] = &["total_funding_usd"];

/// Enrichment payload field carrying a person's employment history.
pub const EMPLOYMENT_HISTORY_FIELD: &str = "employment_history";

/// One entry of a person's employment history as returned by the
/// enrichment service.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct EmploymentEntry {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "organization")]
    pub organization_name: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default, alias = "is_current")]
    pub current: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Aggregate metrics for a person who founded at least one known company.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FounderFeatures {
    pub person_uuid: String,
    pub total_companies_founded: i64,
    /// Deduplicated, sorted union of the founded companies' categories.
    pub company_categories: Vec<String>,
    /// Mean age in years of founded companies with a known founding date.
    pub avg_company_lifespan: Option<f64>,
    pub total_funding_raised: f64,
    pub num_acquisitions: i64,
    /// Distinct titles of the founder-flagged jobs.
    pub job_titles: Vec<String>,
    pub leadership_roles_count: i64,
}
