//! In-memory [`CatalogWriter`] for tests and dry runs.
//!
//! Tables are `Vec<Row>` behind a `std::sync::RwLock`, namespaced by
//! partition in `schema` mode and shared in `device_row` mode. Rows get a
//! numeric surrogate `id` on first write. Failures can be injected per
//! table or per row value to exercise the reconciler's isolation paths.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use super::{scalar_text, CatalogWriter, ProvisionOutcome, Row, Selection};
use crate::error::CatalogError;
use crate::models::{TenancyMode, TenantPartition};

/// Namespace used by `device_row` tenancy.
const SHARED: &str = "public";

#[derive(Default)]
struct Failures {
    /// Tables whose every write fails with a transport error.
    unreachable_tables: Vec<String>,
    /// `(table, column, value)`: writes containing a matching row are rejected.
    reject_rows: Vec<(String, String, Value)>,
    provision_down: bool,
    provision_reply: Option<ProvisionOutcome>,
}

#[derive(Default)]
struct Calls {
    writes: HashMap<String, usize>,
    provisions: Vec<String>,
    touches: usize,
}

/// In-memory catalog for testing.
pub struct MemoryCatalog {
    tables: RwLock<HashMap<(String, String), Vec<Row>>>,
    next_id: RwLock<u64>,
    failures: RwLock<Failures>,
    calls: RwLock<Calls>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
            failures: RwLock::new(Failures::default()),
            calls: RwLock::new(Calls::default()),
        }
    }

    // ============ Failure injection ============

    /// Make every write to `table` fail as if the network dropped.
    pub fn fail_table(&self, table: &str) {
        if let Ok(mut f) = self.failures.write() {
            f.unreachable_tables.push(table.to_string());
        }
    }

    /// Reject (HTTP 422) any write containing a row where `column == value`.
    pub fn reject_rows_where(&self, table: &str, column: &str, value: Value) {
        if let Ok(mut f) = self.failures.write() {
            f.reject_rows
                .push((table.to_string(), column.to_string(), value));
        }
    }

    pub fn fail_provisioning(&self) {
        if let Ok(mut f) = self.failures.write() {
            f.provision_down = true;
        }
    }

    pub fn set_provision_reply(&self, reply: ProvisionOutcome) {
        if let Ok(mut f) = self.failures.write() {
            f.provision_reply = Some(reply);
        }
    }

    // ============ Inspection ============

    /// Rows of `table` in the partition's namespace.
    pub fn rows(&self, partition: &TenantPartition, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.get(&(namespace(partition), table.to_string())).cloned())
            .unwrap_or_default()
    }

    /// Rows of `table` in an explicit namespace (`"public"` for shared tables).
    pub fn rows_in(&self, namespace: &str, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.get(&(namespace.to_string(), table.to_string())).cloned())
            .unwrap_or_default()
    }

    /// Write calls issued against `table` (upsert batches, inserts, updates, appends).
    pub fn write_calls(&self, table: &str) -> usize {
        self.calls
            .read()
            .map(|c| c.writes.get(table).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn provision_calls(&self) -> Vec<String> {
        self.calls
            .read()
            .map(|c| c.provisions.clone())
            .unwrap_or_default()
    }

    pub fn touch_calls(&self) -> usize {
        self.calls.read().map(|c| c.touches).unwrap_or(0)
    }

    // ============ Internals ============

    fn record_write(&self, table: &str) {
        if let Ok(mut c) = self.calls.write() {
            *c.writes.entry(table.to_string()).or_insert(0) += 1;
        }
    }

    fn check_write(&self, table: &str, rows: &[&Row]) -> Result<(), CatalogError> {
        let failures = self
            .failures
            .read()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        if failures.unreachable_tables.iter().any(|t| t == table) {
            return Err(CatalogError::Transport(format!("{} unreachable", table)));
        }
        for (t, column, value) in &failures.reject_rows {
            if t == table && rows.iter().any(|r| r.get(column) == Some(value)) {
                return Err(CatalogError::Rejected {
                    status: 422,
                    body: format!("{} rejected for {}={}", table, column, value),
                });
            }
        }
        Ok(())
    }

    fn allocate_id(&self) -> Result<Value, CatalogError> {
        let mut next = self
            .next_id
            .write()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        let id = *next;
        *next += 1;
        Ok(Value::from(id))
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn namespace(partition: &TenantPartition) -> String {
    match partition.mode {
        TenancyMode::Schema => partition.partition_ref.clone(),
        TenancyMode::DeviceRow => SHARED.to_string(),
    }
}

/// Descending order on `column`: numbers numerically, anything else by its
/// text. Rows missing the column sort last.
fn newest_first(a: &Row, b: &Row, column: &str) -> Ordering {
    match (a.get(column), b.get(column)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => y
            .as_f64()
            .partial_cmp(&x.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => scalar_text(y).cmp(&scalar_text(x)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> CatalogError {
    CatalogError::Transport(e.to_string())
}

#[async_trait]
impl CatalogWriter for MemoryCatalog {
    async fn upsert(
        &self,
        partition: &TenantPartition,
        table: &str,
        conflict_columns: &[&str],
        rows: &[Row],
    ) -> Result<(), CatalogError> {
        self.record_write(table);
        self.check_write(table, &rows.iter().collect::<Vec<_>>())?;

        let mut ids = Vec::with_capacity(rows.len());
        for _ in rows {
            ids.push(self.allocate_id()?);
        }

        let mut tables = self.tables.write().map_err(lock_err)?;
        let stored = tables
            .entry((namespace(partition), table.to_string()))
            .or_default();

        for (row, new_id) in rows.iter().zip(ids) {
            let existing = stored.iter_mut().find(|s| {
                conflict_columns
                    .iter()
                    .all(|c| s.get(*c).is_some() && s.get(*c) == row.get(*c))
            });
            match existing {
                Some(s) => {
                    for (k, v) in row {
                        s.insert(k.clone(), v.clone());
                    }
                }
                None => {
                    let mut new_row = row.clone();
                    new_row.insert("id".into(), new_id);
                    stored.push(new_row);
                }
            }
        }
        Ok(())
    }

    async fn find_id(
        &self,
        partition: &TenantPartition,
        table: &str,
        key: &[(&str, Value)],
    ) -> Result<Option<String>, CatalogError> {
        let tables = self.tables.read().map_err(lock_err)?;
        let found = tables
            .get(&(namespace(partition), table.to_string()))
            .and_then(|rows| {
                rows.iter()
                    .find(|r| key.iter().all(|(c, v)| r.get(*c) == Some(v)))
            })
            .and_then(|r| r.get("id"))
            .map(scalar_text);
        Ok(found)
    }

    async fn insert(
        &self,
        partition: &TenantPartition,
        table: &str,
        row: &Row,
    ) -> Result<String, CatalogError> {
        self.record_write(table);
        self.check_write(table, &[row])?;
        let id = self.allocate_id()?;
        let mut new_row = row.clone();
        new_row.insert("id".into(), id.clone());
        self.tables
            .write()
            .map_err(lock_err)?
            .entry((namespace(partition), table.to_string()))
            .or_default()
            .push(new_row);
        Ok(scalar_text(&id))
    }

    async fn update(
        &self,
        partition: &TenantPartition,
        table: &str,
        id: &str,
        row: &Row,
    ) -> Result<(), CatalogError> {
        self.record_write(table);
        self.check_write(table, &[row])?;
        let mut tables = self.tables.write().map_err(lock_err)?;
        if let Some(stored) = tables
            .get_mut(&(namespace(partition), table.to_string()))
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|r| r.get("id").map(scalar_text).as_deref() == Some(id))
            })
        {
            for (k, v) in row {
                if k != "id" {
                    stored.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(())
    }

    async fn provision(&self, partition_name: &str) -> Result<ProvisionOutcome, CatalogError> {
        if let Ok(mut c) = self.calls.write() {
            c.provisions.push(partition_name.to_string());
        }
        let failures = self.failures.read().map_err(lock_err)?;
        if failures.provision_down {
            return Err(CatalogError::Transport("provisioning endpoint unreachable".into()));
        }
        Ok(failures.provision_reply.clone().unwrap_or(ProvisionOutcome {
            success: true,
            schema: Some(partition_name.to_string()),
            tables: None,
            error: None,
        }))
    }

    async fn touch_partition(
        &self,
        partition: &TenantPartition,
        metadata: &Row,
    ) -> Result<(), CatalogError> {
        if let Ok(mut c) = self.calls.write() {
            c.touches += 1;
        }
        let mut tables = self.tables.write().map_err(lock_err)?;
        let stored = tables
            .entry((namespace(partition), "partition_meta".to_string()))
            .or_default();
        match stored.first_mut() {
            Some(row) => {
                for (k, v) in metadata {
                    row.insert(k.clone(), v.clone());
                }
            }
            None => stored.push(metadata.clone()),
        }
        Ok(())
    }

    async fn select(
        &self,
        partition: &TenantPartition,
        table: &str,
        selection: &Selection<'_>,
    ) -> Result<Vec<Row>, CatalogError> {
        let tables = self.tables.read().map_err(lock_err)?;
        // Later writes first among equal sort keys.
        let mut rows: Vec<&Row> = tables
            .get(&(namespace(partition), table.to_string()))
            .map(|rows| {
                rows.iter()
                    .rev()
                    .filter(|r| selection.filter.iter().all(|(c, v)| r.get(*c) == Some(v)))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| newest_first(a, b, selection.newest_first_by));

        Ok(rows
            .into_iter()
            .take(selection.limit)
            .map(|row| {
                if selection.columns.is_empty() {
                    return row.clone();
                }
                row.iter()
                    .filter(|(k, _)| selection.columns.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .collect())
    }

    async fn append(
        &self,
        partition: &TenantPartition,
        table: &str,
        row: &Row,
    ) -> Result<(), CatalogError> {
        self.insert(partition, table, row).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partition(mode: TenancyMode, r: &str) -> TenantPartition {
        TenantPartition {
            device_identity: "dev".into(),
            partition_ref: r.into(),
            mode,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn upsert_merges_on_conflict_columns() {
        let cat = MemoryCatalog::new();
        let p = partition(TenancyMode::Schema, "den");
        cat.upsert(
            &p,
            "indexers",
            &["indexer_id"],
            &[row(&[("indexer_id", json!(1)), ("name", json!("a"))])],
        )
        .await
        .unwrap();
        cat.upsert(
            &p,
            "indexers",
            &["indexer_id"],
            &[row(&[("indexer_id", json!(1)), ("name", json!("b"))])],
        )
        .await
        .unwrap();

        let rows = cat.rows(&p, "indexers");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "b");
        assert_eq!(cat.write_calls("indexers"), 2);
    }

    #[tokio::test]
    async fn schema_partitions_are_isolated() {
        let cat = MemoryCatalog::new();
        let a = partition(TenancyMode::Schema, "a");
        let b = partition(TenancyMode::Schema, "b");
        let r = row(&[("source_item_id", json!("x"))]);
        cat.upsert(&a, "media", &["source_item_id"], &[r.clone()])
            .await
            .unwrap();
        assert!(cat
            .find_id(&b, "media", &[("source_item_id", json!("x"))])
            .await
            .unwrap()
            .is_none());
        assert!(cat
            .find_id(&a, "media", &[("source_item_id", json!("x"))])
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn injected_failures() {
        let cat = MemoryCatalog::new();
        let p = partition(TenancyMode::DeviceRow, "1");
        cat.reject_rows_where("movies", "title", json!("bad"));
        cat.fail_table("series");

        let err = cat
            .upsert(&p, "movies", &["source_movie_id"], &[row(&[("title", json!("bad"))])])
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        let err = cat
            .insert(&p, "series", &row(&[("title", json!("ok"))]))
            .await
            .unwrap_err();
        assert!(!err.is_rejection());
        assert!(cat.rows_in("public", "movies").is_empty());
    }

    #[tokio::test]
    async fn select_filters_orders_and_limits() {
        let cat = MemoryCatalog::new();
        let p = partition(TenancyMode::Schema, "den");
        for (id, kind, at) in [
            ("m1", "movie", "2026-01-01T00:00:00Z"),
            ("s1", "series", "2026-01-03T00:00:00Z"),
            ("m2", "movie", "2026-01-02T00:00:00Z"),
            ("m3", "movie", "2026-01-04T00:00:00Z"),
        ] {
            cat.upsert(
                &p,
                "media",
                &["source_item_id"],
                &[row(&[
                    ("source_item_id", json!(id)),
                    ("media_type", json!(kind)),
                    ("updated_at", json!(at)),
                ])],
            )
            .await
            .unwrap();
        }

        let rows = cat
            .select(
                &p,
                "media",
                &Selection {
                    columns: &["source_item_id"],
                    filter: vec![("media_type", json!("movie"))],
                    newest_first_by: "updated_at",
                    limit: 2,
                },
            )
            .await
            .unwrap();
        let ids: Vec<&Value> = rows.iter().map(|r| &r["source_item_id"]).collect();
        assert_eq!(ids, vec![&json!("m3"), &json!("m2")]);
        assert_eq!(rows[0].len(), 1);

        let other = partition(TenancyMode::Schema, "elsewhere");
        let none = cat
            .select(
                &other,
                "media",
                &Selection {
                    columns: &[],
                    filter: Vec::new(),
                    newest_first_by: "updated_at",
                    limit: 10,
                },
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn insert_then_update_by_id() {
        let cat = MemoryCatalog::new();
        let p = partition(TenancyMode::Schema, "den");
        let id = cat
            .insert(&p, "media", &row(&[("source_item_id", json!("s1"))]))
            .await
            .unwrap();
        cat.update(&p, "media", &id, &row(&[("title", json!("Severance"))]))
            .await
            .unwrap();
        let rows = cat.rows(&p, "media");
        assert_eq!(rows[0]["title"], "Severance");
        assert_eq!(scalar_text(&rows[0]["id"]), id);
    }
}
