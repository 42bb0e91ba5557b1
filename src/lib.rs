//! # Stack Sync
//!
//! Mirrors the state of a media-server stack running on an edge device into
//! a remote catalog.
//!
//! Each local service (media server, DVRs, indexer manager, ...) is read
//! through a [`SourceExtractor`](traits::SourceExtractor), its records are
//! normalized into typed canonical shapes, and the reconciler writes them
//! to the device's tenant partition with idempotent upserts keyed on
//! natural keys.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │  Extractors  │──▶│ Normalizer │──▶│ Reconciler │──▶│ Catalog  │
//! │ SQLite/File/ │   │ Canonical  │   │ upsert or  │   │  (REST)  │
//! │    HTTP      │   │  records   │   │ probe+write│   │          │
//! └──────────────┘   └────────────┘   └─────┬──────┘   └──────────┘
//!                                           │
//!                      ┌────────────────────┤
//!                      ▼                    ▼
//!                ┌───────────┐       ┌─────────────┐
//!                │ Scheduler │       │  Dashboard  │
//!                │ intervals │       │  JSON API   │
//!                └───────────┘       └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! stacksync device              # show the resolved device identity
//! stacksync sources             # list pipelines and their sources
//! stacksync run --family media  # one cycle of one family
//! stacksync serve               # scheduler + dashboard
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Raw and canonical records, run summaries |
//! | [`traits`] | Extractor traits |
//! | [`extractor_sqlite`] | Query-store extractors |
//! | [`extractor_config`] | Config-file and user-directory extractors |
//! | [`extractor_backup`] | Hashed configuration snapshots |
//! | [`extractor_media`] | Media-server HTTP extractors |
//! | [`normalize`] | Raw to canonical mapping |
//! | [`redact`] | Secret masking in config documents |
//! | [`catalog`] | Remote catalog writers |
//! | [`reconcile`] | Idempotent write protocol |
//! | [`tenancy`] | Tenant partition resolution |
//! | [`device`] | Stable device identity |
//! | [`pipeline`] | Per-entity pipelines and registry |
//! | [`coordinator`] | One run of one family |
//! | [`scheduler`] | Interval triggers and heartbeat |
//! | [`server`] | Dashboard JSON API |

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod extractor_backup;
pub mod extractor_config;
pub mod extractor_media;
pub mod extractor_sqlite;
pub mod history;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod normalize_media;
pub mod pipeline;
pub mod reconcile;
pub mod redact;
pub mod scheduler;
pub mod server;
pub mod sources;
pub mod tenancy;
pub mod traits;
