//! Extension traits for source extractors and the catalog.
//!
//! Every local service is read through one [`SourceExtractor`] capability.
//! The three variants differ only in where the state comes from:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 SourceExtractor                │
//! │  ┌────────────┐ ┌─────────────┐ ┌────────────┐ │
//! │  │ QueryStore │ │ ConfigFile  │ │ RemoteApi  │ │
//! │  │  (SQLite)  │ │ (XML/JSON)  │ │  (HTTP)    │ │
//! │  └────────────┘ └─────────────┘ └────────────┘ │
//! └──────────────────────┬─────────────────────────┘
//!                        ▼
//!        normalize() → reconcile() → CatalogWriter
//! ```
//!
//! Extractors are stateless and read-only. A missing source is not an
//! error: it yields an empty sequence. [`SyncError::SourceUnavailable`] is
//! reserved for sources that exist but cannot be read.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use stack_sync::error::Result;
//! use stack_sync::models::RawRecord;
//! use stack_sync::traits::{SourceExtractor, SourceKind};
//!
//! pub struct StaticSource;
//!
//! #[async_trait]
//! impl SourceExtractor for StaticSource {
//!     fn name(&self) -> &str { "static" }
//!     fn description(&self) -> &str { "Fixed records for tests" }
//!     fn kind(&self) -> SourceKind { SourceKind::ConfigFile }
//!
//!     async fn extract(&self) -> Result<Vec<RawRecord>> {
//!         Ok(vec![])
//!     }
//! }
//! ```
//!
//! [`SyncError::SourceUnavailable`]: crate::error::SyncError::SourceUnavailable

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::RawRecord;

/// Where an extractor reads its state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A SQLite file owned by the service.
    QueryStore,
    /// XML/JSON files on disk.
    ConfigFile,
    /// The service's HTTP API.
    RemoteApi,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::QueryStore => "query_store",
            SourceKind::ConfigFile => "config_file",
            SourceKind::RemoteApi => "remote_api",
        }
    }
}

/// A read-only view onto one local service.
///
/// # Lifecycle
///
/// 1. Built by [`PipelineRegistry::from_config`] from a `[services.<name>]`
///    entry.
/// 2. [`extract`](SourceExtractor::extract) is called once per run.
/// 3. Returned records are normalized and reconciled by the coordinator.
///
/// [`PipelineRegistry::from_config`]: crate::pipeline::PipelineRegistry::from_config
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    /// Service name, also used as the raw record's `source` label.
    fn name(&self) -> &str;

    /// One-line description, shown by `stacksync sources`.
    fn description(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Read the current state of the source.
    ///
    /// Returns `Ok(vec![])` when the source does not exist on this device.
    async fn extract(&self) -> Result<Vec<RawRecord>>;
}

/// Source of child records that belong to a parent, such as the
/// episodes of one series.
#[async_trait]
pub trait ChildSource: Send + Sync {
    fn name(&self) -> &str;

    /// Read the children of the parent with the given source id.
    async fn children(&self, parent_source_id: &str) -> Result<Vec<RawRecord>>;
}
