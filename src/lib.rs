//! # Ensemble Pipeline
//!
//! A batch ETL for startup data. Organizations, people, and jobs are read
//! from CSV exports, optionally enriched through an external lookup API,
//! reconciled, and upserted into SQLite. A derived `founder_features` table
//! is rebuilt after every successful load.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │  CSV files  │──▶│   Extract    │──▶│  Transform   │──▶│   Load   │
//! │ orgs/people │   │ reader+delta │   │ merge+repair │   │  SQLite  │
//! │    jobs     │   └──────┬───────┘   └──────────────┘   └────┬─────┘
//! └─────────────┘          │                                   │
//!                   ┌──────▼───────┐                    ┌──────▼─────┐
//!                   │ Enrichment   │                    │  Founder   │
//!                   │ API (HTTPS)  │                    │  features  │
//!                   └──────────────┘                    └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ensemble --initialize-db --full      # first load
//! ensemble                             # incremental by default
//! API_BASE_URL=https://... API_KEY=... ensemble --full
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`logging`] | Tracing subscriber and stage banners |
//! | [`table`] | Row-based table with typed, nullable cells |
//! | [`models`] | Entity kinds, provenance, field mappings |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema provisioning |
//! | [`extract`] | CSV reader, incremental filter, enrichment fetch |
//! | [`enrich`] | Enrichment API client |
//! | [`transform`] | Merge, job history, reference repair |
//! | [`load`] | Batched upsert |
//! | [`features`] | Founder features |
//! | [`stats`] | Row counts and integrity report |
//! | [`state`] | Run state file |
//! | [`pipeline`] | Orchestration and metrics |

pub mod config;
pub mod db;
pub mod enrich;
pub mod extract;
pub mod features;
pub mod load;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod stats;
pub mod table;
pub mod transform;
