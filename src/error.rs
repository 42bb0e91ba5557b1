//! Error taxonomy for the sync engine.
//!
//! Source- and record-level failures never abort a run: they are caught by
//! the coordinator and turned into counters on the [`RunSummary`]. Only
//! [`SyncError::TenancyUnavailable`] ends a run early, because without a
//! resolved partition there is nowhere to write.
//!
//! [`RunSummary`]: crate::models::RunSummary

use thiserror::Error;

use crate::models::PipelineFamily;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A source is absent or unreachable. Non-fatal: the pipeline skips it.
    #[error("source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// The remote catalog rejected a write for one natural key.
    #[error("reconcile failed for {key}: {reason}")]
    ReconcileFailure { key: String, reason: String },

    /// The partition for this device could not be resolved. Aborts the run.
    #[error("tenancy unavailable: {0}")]
    TenancyUnavailable(String),

    /// Some entity pipelines recorded failures.
    #[error("run completed with failures in: {}", failed_entities.join(", "))]
    PartialRunFailure { failed_entities: Vec<String> },

    /// A trigger arrived while a run of the same family was in flight.
    #[error("a {0} run is already in progress")]
    RunInProgress(PipelineFamily),
}

impl SyncError {
    pub fn unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Transport-level outcome of a call against the remote catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The catalog answered but refused the request (validation, constraint).
    #[error("catalog rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Connection, timeout, or other transport failure.
    #[error("catalog transport error: {0}")]
    Transport(String),

    /// The catalog answered with a body we could not interpret.
    #[error("unexpected catalog response: {0}")]
    Decode(String),
}

impl CatalogError {
    /// Whether the failure is specific to the submitted rows rather than the
    /// connection. Rejected batches are split to isolate the bad record.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CatalogError::Rejected { status, .. } if (400..500).contains(status))
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CatalogError::Decode(err.to_string())
        } else {
            CatalogError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
