//! # Trial Harvest
//!
//! A periodic batch job that retrieves clinical-trial records from a
//! public registry, classifies each trial against user-maintained keyword
//! lists, normalizes the records into a stable tabular schema and writes
//! CSV tables for downstream reporting.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │ RegistryClient│──▶│ Classifier │──▶│ Normalizer │──▶│ CSV sink │
//! │ pages + retry │   │  keywords  │   │ fixed cols │   │ commit   │
//! └──────────────┘   └────────────┘   └────────────┘   └────┬─────┘
//!        ▲                                                   │
//!        │ since                                             ▼
//!   ┌────┴─────────────────────────────────────────────────────┐
//!   │              SQLite run ledger (cursor, runs)            │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! trials init                 # create the run ledger
//! trials check                # validate config and keyword lists
//! trials run --full           # first snapshot
//! trials run                  # monthly: everything updated since the last run
//! trials stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Run-level error taxonomy and exit codes |
//! | [`models`] | Trial record types |
//! | [`study`] | Flattening registry JSON into records |
//! | [`client`] | Paginated registry retrieval with retry |
//! | [`keywords`] | Keyword list loading |
//! | [`classify`] | Keyword classification |
//! | [`normalize`] | Row normalization and output schema |
//! | [`export`] | CSV tables with commit-on-success |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`state`] | Cursor and run history |
//! | [`harvest`] | Run orchestrator |
//! | [`progress`] | Progress reporting |
//! | [`check`] | Pre-flight validation |
//! | [`stats`] | Ledger overview |

pub mod check;
pub mod classify;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod harvest;
pub mod keywords;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod state;
pub mod stats;
pub mod study;
