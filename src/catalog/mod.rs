//! Remote catalog abstraction.
//!
//! The [`CatalogWriter`] trait is the only way the engine talks to the
//! shared backend. Apart from surrogate id lookups, its one read is
//! [`CatalogWriter::select`], which backs the dashboard's media listing. It follows PostgREST conventions (tables addressed by
//! name, surrogate `id` column, conflict targets by column list) without
//! assuming any particular storage engine behind them.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CatalogError;
use crate::models::TenantPartition;

pub use memory::MemoryCatalog;
pub use rest::RestCatalog;

/// A single catalog row: column name → JSON value.
pub type Row = Map<String, Value>;

/// Reply of the partition provisioning endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub tables: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A bounded, newest-first read of one table.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    /// Columns to return; empty means every column.
    pub columns: &'a [&'a str],
    /// Equality filters, all of which must hold.
    pub filter: Vec<(&'a str, Value)>,
    /// Column sorted descending.
    pub newest_first_by: &'a str,
    pub limit: usize,
}

#[async_trait]
pub trait CatalogWriter: Send + Sync {
    /// Insert-or-merge `rows` on the natural key given by `conflict_columns`.
    async fn upsert(
        &self,
        partition: &TenantPartition,
        table: &str,
        conflict_columns: &[&str],
        rows: &[Row],
    ) -> Result<(), CatalogError>;

    /// Surrogate id of the row matching every `(column, value)` pair.
    /// `Ok(None)` means not found; errors are transport or rejection.
    async fn find_id(
        &self,
        partition: &TenantPartition,
        table: &str,
        key: &[(&str, Value)],
    ) -> Result<Option<String>, CatalogError>;

    /// Insert one row and return its surrogate id.
    async fn insert(
        &self,
        partition: &TenantPartition,
        table: &str,
        row: &Row,
    ) -> Result<String, CatalogError>;

    async fn update(
        &self,
        partition: &TenantPartition,
        table: &str,
        id: &str,
        row: &Row,
    ) -> Result<(), CatalogError>;

    /// Create-if-absent the namespace for a device.
    async fn provision(&self, partition_name: &str) -> Result<ProvisionOutcome, CatalogError>;

    /// Refresh partition metadata (last seen, status, version).
    async fn touch_partition(
        &self,
        partition: &TenantPartition,
        metadata: &Row,
    ) -> Result<(), CatalogError>;

    /// Rows of `table` in the partition, per `selection`.
    async fn select(
        &self,
        partition: &TenantPartition,
        table: &str,
        selection: &Selection<'_>,
    ) -> Result<Vec<Row>, CatalogError>;

    /// Append a row to a log-style table.
    async fn append(
        &self,
        partition: &TenantPartition,
        table: &str,
        row: &Row,
    ) -> Result<(), CatalogError>;
}

/// Render a JSON scalar for use in a filter or as an id.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
