//! Reconciliation of canonical records against the remote catalog.
//!
//! ```text
//!   records ──► dedup by natural key ──► stamp partition
//!                                            │
//!              ┌─────────────────────────────┴───────────────┐
//!              ▼                                             ▼
//!       upsert path                                    probe path
//!  batches of batch_size                       find_id ─► update(id)
//!  rejected batch ─► per-record upserts              └──► insert
//!              └──────────── buffer_unordered(max_concurrency) ┘
//! ```
//!
//! The probe path is not atomic: two devices racing on the same key can
//! both insert, and the later write wins on the next run.
//!
//! Failures never abort a reconcile. A bad record is counted in
//! [`EntityCounts::failed`] with its natural key logged, and the rest of
//! the batch carries on.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::{CatalogWriter, Row};
use crate::config::CatalogConfig;
use crate::error::SyncError;
use crate::models::{CanonicalRecord, EntityCounts, EntityType, NaturalKey, TenantPartition};

/// A record the catalog accepted, with its surrogate id when known.
#[derive(Debug, Clone)]
pub struct Confirmed {
    pub key: NaturalKey,
    pub id: Option<String>,
}

/// Result of reconciling one entity type.
#[derive(Debug, Default)]
pub struct Outcome {
    pub counts: EntityCounts,
    /// Confirmed records keyed by natural-key fingerprint.
    pub confirmed: HashMap<String, Confirmed>,
}

impl Outcome {
    fn absorb(&mut self, other: Outcome) {
        self.counts.merge(&other.counts);
        self.confirmed.extend(other.confirmed);
    }

    fn confirm(&mut self, key: NaturalKey, id: Option<String>) {
        self.counts.succeeded += 1;
        self.confirmed.insert(key.fingerprint(), Confirmed { key, id });
    }

    fn fail(&mut self, key: &NaturalKey, reason: impl ToString) {
        let err = SyncError::ReconcileFailure {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        warn!(entity = %key.entity, key = %key, error = %err, "record not reconciled");
        self.counts.failed += 1;
        self.counts.last_error = Some(err.to_string());
    }

    fn cancelled(&mut self, records: usize) {
        self.counts.failed += records as u64;
        self.counts.last_error = Some("run cancelled before write".to_string());
    }
}

#[derive(Debug, Clone)]
struct Pending {
    key: NaturalKey,
    row: Row,
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogWriter>,
    batch_size: usize,
    max_concurrency: usize,
    config: CatalogConfig,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn CatalogWriter>,
        config: &CatalogConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            batch_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            config: config.clone(),
            cancel,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Write `records` of one entity type into the partition.
    pub async fn reconcile(
        &self,
        partition: &TenantPartition,
        entity: EntityType,
        records: Vec<CanonicalRecord>,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        let pending = dedup(partition, records, &mut outcome.counts);
        if pending.is_empty() {
            return outcome;
        }

        let written = if self.config.uses_probe(entity) {
            self.probe_all(partition, entity, pending).await
        } else {
            self.upsert_all(partition, entity, pending).await
        };
        outcome.absorb(written);

        debug!(
            entity = %entity,
            succeeded = outcome.counts.succeeded,
            failed = outcome.counts.failed,
            skipped = outcome.counts.skipped,
            "reconciled"
        );
        outcome
    }

    /// Surrogate ids of the confirmed parents in `outcome`, keyed by
    /// fingerprint. Parents confirmed through an upsert are probed once.
    pub async fn parent_ids(
        &self,
        partition: &TenantPartition,
        entity: EntityType,
        outcome: &Outcome,
    ) -> HashMap<String, String> {
        let table = entity.table();
        let confirmed: Vec<(String, Confirmed)> = outcome
            .confirmed
            .iter()
            .map(|(fingerprint, confirmed)| (fingerprint.clone(), confirmed.clone()))
            .collect();
        stream::iter(confirmed)
            .map(|(fingerprint, confirmed)| async move {
                if let Some(id) = &confirmed.id {
                    return Some((fingerprint.clone(), id.clone()));
                }
                let filter = partition.key_filter(&confirmed.key);
                match self.catalog.find_id(partition, table, &filter).await {
                    Ok(Some(id)) => Some((fingerprint.clone(), id)),
                    Ok(None) => {
                        warn!(key = %confirmed.key, "confirmed parent not found on probe");
                        None
                    }
                    Err(e) => {
                        warn!(key = %confirmed.key, error = %e, "parent id lookup failed");
                        None
                    }
                }
            })
            .buffer_unordered(self.max_concurrency)
            .filter_map(|pair| async move { pair })
            .collect()
            .await
    }

    /// Reconcile child records that point at a parent by its source id.
    /// Children whose parent is missing from `parent_ids` are counted
    /// failed and never written.
    pub async fn reconcile_children(
        &self,
        partition: &TenantPartition,
        entity: EntityType,
        parent_ids: &HashMap<String, String>,
        records: Vec<CanonicalRecord>,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        let mut ready = Vec::with_capacity(records.len());

        for record in records {
            match record {
                CanonicalRecord::Episode(mut episode) => {
                    match parent_ids.get(&episode.series_source_id) {
                        Some(id) => {
                            episode.series_ref = Some(id.clone());
                            ready.push(CanonicalRecord::Episode(episode));
                        }
                        None => {
                            let key = CanonicalRecord::Episode(episode.clone()).natural_key();
                            outcome.fail(
                                &key,
                                format!("series {} not confirmed", episode.series_source_id),
                            );
                        }
                    }
                }
                other => ready.push(other),
            }
        }

        outcome.absorb(self.reconcile(partition, entity, ready).await);
        outcome
    }

    // ============ Upsert path ============

    async fn upsert_all(
        &self,
        partition: &TenantPartition,
        entity: EntityType,
        pending: Vec<Pending>,
    ) -> Outcome {
        let table = entity.table();
        let conflict = partition.conflict_columns(entity);
        let batches: Vec<Vec<Pending>> = pending
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();

        let results: Vec<Outcome> = stream::iter(batches)
            .map(|batch| self.upsert_batch(partition, table, &conflict, batch))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut outcome = Outcome::default();
        for result in results {
            outcome.absorb(result);
        }
        outcome
    }

    async fn upsert_batch(
        &self,
        partition: &TenantPartition,
        table: &str,
        conflict: &[&str],
        batch: Vec<Pending>,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        if self.cancel.is_cancelled() {
            outcome.cancelled(batch.len());
            return outcome;
        }

        outcome.counts.attempted += batch.len() as u64;
        let rows: Vec<Row> = batch.iter().map(|p| p.row.clone()).collect();

        match self.catalog.upsert(partition, table, conflict, &rows).await {
            Ok(()) => {
                for p in batch {
                    outcome.confirm(p.key, None);
                }
            }
            Err(e) if e.is_rejection() && batch.len() > 1 => {
                warn!(table, records = batch.len(), error = %e, "batch rejected, isolating records");
                for p in batch {
                    match self
                        .catalog
                        .upsert(partition, table, conflict, std::slice::from_ref(&p.row))
                        .await
                    {
                        Ok(()) => outcome.confirm(p.key, None),
                        Err(e) => outcome.fail(&p.key, e),
                    }
                }
            }
            Err(e) if e.is_rejection() => {
                for p in &batch {
                    outcome.fail(&p.key, &e);
                }
            }
            Err(e) => {
                warn!(table, records = batch.len(), error = %e, "batch write failed");
                for p in &batch {
                    outcome.fail(&p.key, &e);
                }
            }
        }
        outcome
    }

    // ============ Probe path ============

    async fn probe_all(
        &self,
        partition: &TenantPartition,
        entity: EntityType,
        pending: Vec<Pending>,
    ) -> Outcome {
        let table = entity.table();
        let results: Vec<Outcome> = stream::iter(pending)
            .map(|p| self.probe_one(partition, table, p))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut outcome = Outcome::default();
        for result in results {
            outcome.absorb(result);
        }
        outcome
    }

    async fn probe_one(&self, partition: &TenantPartition, table: &str, p: Pending) -> Outcome {
        let mut outcome = Outcome::default();
        if self.cancel.is_cancelled() {
            outcome.cancelled(1);
            return outcome;
        }

        outcome.counts.attempted += 1;
        let filter = partition.key_filter(&p.key);
        let written = match self.catalog.find_id(partition, table, &filter).await {
            Ok(Some(id)) => self
                .catalog
                .update(partition, table, &id, &p.row)
                .await
                .map(|_| id),
            Ok(None) => self.catalog.insert(partition, table, &p.row).await,
            Err(e) => Err(e),
        };

        match written {
            Ok(id) => outcome.confirm(p.key, Some(id)),
            Err(e) => outcome.fail(&p.key, e),
        }
        outcome
    }
}

/// Collapse duplicates by natural key, keeping the first position and the
/// last value. Each collapsed duplicate counts as skipped.
fn dedup(
    partition: &TenantPartition,
    records: Vec<CanonicalRecord>,
    counts: &mut EntityCounts,
) -> Vec<Pending> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut pending: Vec<Pending> = Vec::with_capacity(records.len());

    for record in records {
        let key = record.natural_key();
        let mut row = record.to_row();
        partition.stamp(&mut row);
        let fingerprint = key.fingerprint();
        match index.get(&fingerprint) {
            Some(&i) => {
                debug!(key = %key, "duplicate record, keeping the later one");
                counts.skipped += 1;
                pending[i] = Pending { key, row };
            }
            None => {
                index.insert(fingerprint, pending.len());
                pending.push(Pending { key, row });
            }
        }
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::models::{RawRecord, TenancyMode};
    use crate::normalize::{normalize, NormalizeContext, Normalized};
    use serde_json::{json, Value};

    fn config(batch_size: usize, probe: Vec<EntityType>) -> CatalogConfig {
        let mut config: CatalogConfig = toml::from_str("url = \"http://catalog.test\"").unwrap();
        config.batch_size = batch_size;
        config.probe_entities = probe;
        config
    }

    fn partition(mode: TenancyMode) -> TenantPartition {
        TenantPartition {
            device_identity: "dev".into(),
            partition_ref: match mode {
                TenancyMode::Schema => "den".into(),
                TenancyMode::DeviceRow => "7".into(),
            },
            mode,
        }
    }

    fn record(source: &str, entity: EntityType, value: Value) -> CanonicalRecord {
        match normalize(
            &RawRecord::from_value(source, value),
            entity,
            &NormalizeContext::new(None),
        ) {
            Normalized::Record(r) => r,
            Normalized::Skip(reason) => panic!("unexpected skip: {}", reason),
        }
    }

    fn indexer(id: i64, name: &str) -> CanonicalRecord {
        record("prowlarr", EntityType::Indexer, json!({ "Id": id, "Name": name, "Enable": 1 }))
    }

    fn series(id: &str) -> CanonicalRecord {
        record(
            "jellyfin",
            EntityType::Media,
            json!({ "Id": id, "Name": format!("Show {}", id), "Type": "Series" }),
        )
    }

    fn episode(id: &str, series_id: &str) -> CanonicalRecord {
        record(
            "jellyfin",
            EntityType::Episode,
            json!({ "Id": id, "Name": "Episode", "SeriesId": series_id }),
        )
    }

    fn reconciler(catalog: &Arc<MemoryCatalog>, config: &CatalogConfig) -> Reconciler {
        Reconciler::new(catalog.clone(), config, CancellationToken::new())
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let catalog = Arc::new(MemoryCatalog::new());
        let r = reconciler(&catalog, &config(100, vec![]));
        let p = partition(TenancyMode::Schema);
        let records = vec![indexer(1, "Nyaa"), indexer(2, "1337x")];

        let first = r.reconcile(&p, EntityType::Indexer, records.clone()).await;
        let second = r.reconcile(&p, EntityType::Indexer, records).await;

        assert_eq!(first.counts.succeeded, 2);
        assert_eq!(second.counts.succeeded, 2);
        assert_eq!(catalog.rows(&p, "indexers").len(), 2);
    }

    #[tokio::test]
    async fn duplicates_collapse_to_the_later_record() {
        let catalog = Arc::new(MemoryCatalog::new());
        let r = reconciler(&catalog, &config(100, vec![]));
        let p = partition(TenancyMode::Schema);

        let outcome = r
            .reconcile(&p, EntityType::Indexer, vec![indexer(1, "old"), indexer(1, "new")])
            .await;

        assert_eq!(outcome.counts.skipped, 1);
        assert_eq!(outcome.counts.attempted, 1);
        let rows = catalog.rows(&p, "indexers");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "new");
    }

    #[tokio::test]
    async fn rejected_batch_isolates_the_bad_record() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.reject_rows_where("indexers", "name", json!("broken"));
        let r = reconciler(&catalog, &config(10, vec![]));
        let p = partition(TenancyMode::Schema);

        let outcome = r
            .reconcile(
                &p,
                EntityType::Indexer,
                vec![indexer(1, "a"), indexer(2, "broken"), indexer(3, "c")],
            )
            .await;

        assert_eq!(outcome.counts.attempted, 3);
        assert_eq!(outcome.counts.succeeded, 2);
        assert_eq!(outcome.counts.failed, 1);
        assert!(outcome.counts.last_error.unwrap().contains("indexer_id=2"));
        assert_eq!(catalog.rows(&p, "indexers").len(), 2);
        // One batch, then one write per record.
        assert_eq!(catalog.write_calls("indexers"), 4);
    }

    #[tokio::test]
    async fn transport_failure_fails_the_batch() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.fail_table("indexers");
        let r = reconciler(&catalog, &config(2, vec![]));
        let p = partition(TenancyMode::Schema);

        let outcome = r
            .reconcile(
                &p,
                EntityType::Indexer,
                vec![indexer(1, "a"), indexer(2, "b"), indexer(3, "c")],
            )
            .await;

        assert_eq!(outcome.counts.failed, 3);
        assert_eq!(outcome.counts.succeeded, 0);
        assert_eq!(catalog.write_calls("indexers"), 2);
        // Each lost record is reported by its natural key.
        let last = outcome.counts.last_error.unwrap();
        assert!(last.starts_with("reconcile failed for indexer"), "{}", last);
        assert!(last.contains("unreachable"), "{}", last);
    }

    #[tokio::test]
    async fn probe_path_updates_existing_rows() {
        let catalog = Arc::new(MemoryCatalog::new());
        let r = reconciler(&catalog, &config(100, vec![EntityType::Media]));
        let p = partition(TenancyMode::Schema);

        let first = r.reconcile(&p, EntityType::Media, vec![series("s1")]).await;
        let id = first.confirmed["s1"].id.clone().unwrap();

        let renamed = record(
            "jellyfin",
            EntityType::Media,
            json!({ "Id": "s1", "Name": "Renamed", "Type": "Series" }),
        );
        let second = r.reconcile(&p, EntityType::Media, vec![renamed]).await;

        assert_eq!(second.confirmed["s1"].id.as_deref(), Some(id.as_str()));
        let rows = catalog.rows(&p, "media");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Renamed");
    }

    #[tokio::test]
    async fn device_row_mode_stamps_rows() {
        let catalog = Arc::new(MemoryCatalog::new());
        let r = reconciler(&catalog, &config(100, vec![]));
        let p = partition(TenancyMode::DeviceRow);

        r.reconcile(&p, EntityType::Indexer, vec![indexer(5, "x")])
            .await;

        let rows = catalog.rows_in("public", "indexers");
        assert_eq!(rows[0]["device_id"], "7");
    }

    #[tokio::test]
    async fn children_of_unconfirmed_parent_are_not_attempted() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.reject_rows_where("media", "source_item_id", json!("s-bad"));
        let r = reconciler(&catalog, &config(100, vec![]));
        let p = partition(TenancyMode::Schema);

        let parents = r
            .reconcile(&p, EntityType::Media, vec![series("s-ok"), series("s-bad")])
            .await;
        assert_eq!(parents.counts.failed, 1);

        let ids = r.parent_ids(&p, EntityType::Media, &parents).await;
        assert_eq!(ids.len(), 1);

        let children = r
            .reconcile_children(
                &p,
                EntityType::Episode,
                &ids,
                vec![
                    episode("e1", "s-ok"),
                    episode("e2", "s-bad"),
                    episode("e3", "s-bad"),
                ],
            )
            .await;

        assert_eq!(children.counts.attempted, 1);
        assert_eq!(children.counts.succeeded, 1);
        assert_eq!(children.counts.failed, 2);

        let rows = catalog.rows(&p, "media");
        let e1 = rows.iter().find(|r| r["source_item_id"] == "e1").unwrap();
        assert_eq!(e1["series_ref"], Value::from(ids["s-ok"].clone()));
        assert!(!rows.iter().any(|r| r["source_item_id"] == "e2"));
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let catalog = Arc::new(MemoryCatalog::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = Reconciler::new(catalog.clone(), &config(1, vec![]), cancel);
        let p = partition(TenancyMode::Schema);

        let outcome = r
            .reconcile(&p, EntityType::Indexer, vec![indexer(1, "a"), indexer(2, "b")])
            .await;

        assert_eq!(outcome.counts.attempted, 0);
        assert_eq!(outcome.counts.failed, 2);
        assert_eq!(catalog.write_calls("indexers"), 0);
    }
}
