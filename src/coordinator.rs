//! Run coordination: one cycle of one pipeline family.
//!
//! ```text
//! Idle ─► Resolving ─► Extracting(entity)* ─► Finalizing ─► Idle
//!             │
//!             └─ tenancy unavailable ─► Finalizing (status = failed)
//! ```
//!
//! At most one run per family is in flight. A trigger that arrives while
//! the family's lock is held is dropped with [`SyncError::RunInProgress`].
//! Pipelines of a family run concurrently; only tenancy failure ends a run
//! early. Every finished run becomes an immutable [`RunSummary`] in the
//! coordinator's history, and a copy is appended to the catalog's history
//! table on a best-effort basis.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Columns returned by [`RunCoordinator::media`].
const MEDIA_COLUMNS: &[&str] = &[
    "id",
    "media_type",
    "source_item_id",
    "title",
    "year",
    "quality",
    "poster_url",
    "status",
    "watch_state",
    "watched",
    "community_rating",
    "updated_at",
];

use crate::catalog::{CatalogWriter, RestCatalog, Row, Selection};
use crate::config::Config;
use crate::device::{resolve_identity, IdentitySources};
use crate::error::{Result, SyncError};
use crate::history::RunHistory;
use crate::models::{
    EntityType, MediaKind, PipelineFamily, RunStatus, RunSummary, RunSummaryBuilder,
    TenancyMode, TenantPartition,
};
use crate::normalize::NormalizeContext;
use crate::pipeline::{PipelineRegistry, RunContext};
use crate::reconcile::Reconciler;
use crate::tenancy::TenancyResolver;

/// Where a family's run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "entity", rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Resolving,
    Extracting(EntityType),
    Finalizing,
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilyStatus {
    pub family: PipelineFamily,
    pub running: bool,
    pub phase: RunPhase,
    pub pipelines: usize,
    pub last_run: Option<RunSummary>,
}

/// Snapshot served by the dashboard's status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub device_name: String,
    pub device_identity: String,
    pub tenancy: TenancyMode,
    pub partition: Option<TenantPartition>,
    pub families: Vec<FamilyStatus>,
}

pub struct RunCoordinator {
    registry: PipelineRegistry,
    resolver: TenancyResolver,
    reconciler: Reconciler,
    catalog: Arc<dyn CatalogWriter>,
    device_name: String,
    tenancy: TenancyMode,
    media_server_url: Option<String>,
    history_table: String,
    /// One lock per family, indexed by discriminant.
    locks: [tokio::sync::Mutex<()>; 3],
    phases: Mutex<BTreeMap<PipelineFamily, RunPhase>>,
    history: Mutex<RunHistory>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunCoordinator {
    pub fn new(
        config: &Config,
        catalog: Arc<dyn CatalogWriter>,
        registry: PipelineRegistry,
        identity: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            resolver: TenancyResolver::new(catalog.clone(), config, identity),
            reconciler: Reconciler::new(catalog.clone(), &config.catalog, cancel),
            catalog,
            device_name: config.device.name.clone(),
            tenancy: config.catalog.tenancy,
            media_server_url: config
                .media_server
                .enabled
                .then(|| config.media_server.url.trim_end_matches('/').to_string()),
            history_table: config.history.table.clone(),
            locks: Default::default(),
            phases: Mutex::new(
                PipelineFamily::ALL
                    .into_iter()
                    .map(|f| (f, RunPhase::Idle))
                    .collect(),
            ),
            history: Mutex::new(RunHistory::new(config.history.capacity)),
        }
    }

    /// Wire up the REST catalog, device identity and pipelines from config.
    pub fn from_config(config: &Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        if config.catalog.service_key().is_none() {
            warn!(env = %config.catalog.key_env, "catalog service key not set");
        }
        let catalog = RestCatalog::new(&config.catalog).context("Failed to build catalog client")?;
        let registry =
            PipelineRegistry::from_config(config).context("Failed to build pipelines")?;
        let (identity, origin) = resolve_identity(&IdentitySources::from_config(&config.device));
        info!(identity = %identity, origin = origin.as_str(), "device identity resolved");
        Ok(Self::new(config, Arc::new(catalog), registry, identity, cancel))
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn device_identity(&self) -> &str {
        self.resolver.identity()
    }

    fn lock(&self, family: PipelineFamily) -> &tokio::sync::Mutex<()> {
        &self.locks[family as usize]
    }

    fn set_phase(&self, family: PipelineFamily, phase: RunPhase) {
        guard(&self.phases).insert(family, phase);
    }

    pub fn phase(&self, family: PipelineFamily) -> RunPhase {
        guard(&self.phases)
            .get(&family)
            .copied()
            .unwrap_or(RunPhase::Idle)
    }

    pub fn is_running(&self, family: PipelineFamily) -> bool {
        self.lock(family).try_lock().is_err()
    }

    /// Run one cycle of `family`, or refuse if one is already in flight.
    pub async fn run_once(&self, family: PipelineFamily) -> Result<RunSummary> {
        let _running = self
            .lock(family)
            .try_lock()
            .map_err(|_| SyncError::RunInProgress(family))?;

        let summary = self.execute(family).await;
        self.set_phase(family, RunPhase::Idle);
        Ok(summary)
    }

    /// Run every family in turn. Families already in flight are reported
    /// as `RunInProgress`.
    pub async fn run_all(&self) -> Vec<Result<RunSummary>> {
        let mut results = Vec::with_capacity(PipelineFamily::ALL.len());
        for family in PipelineFamily::ALL {
            results.push(self.run_once(family).await);
        }
        results
    }

    async fn execute(&self, family: PipelineFamily) -> RunSummary {
        let mut builder = RunSummaryBuilder::start(family);
        info!(family = %family, "run started");

        self.set_phase(family, RunPhase::Resolving);
        let partition = match self.resolver.resolve().await {
            Ok(partition) => partition,
            Err(e) => {
                error!(family = %family, error = %e, "run aborted");
                self.set_phase(family, RunPhase::Finalizing);
                builder.tenancy_failed(e.to_string());
                let summary = builder.finalize();
                self.record(&summary, None).await;
                return summary;
            }
        };
        builder.partition(&partition.partition_ref);

        let normalize = NormalizeContext::new(self.media_server_url.clone());
        let on_extract = |entity: EntityType| self.set_phase(family, RunPhase::Extracting(entity));
        let ctx = RunContext {
            reconciler: &self.reconciler,
            partition: &partition,
            normalize: &normalize,
            on_extract: &on_extract,
        };

        let results = join_all(self.registry.pipelines(family).iter().map(|p| p.run(&ctx))).await;
        for (entity, counts) in results.into_iter().flatten() {
            builder.record(entity, &counts);
        }

        self.set_phase(family, RunPhase::Finalizing);
        let summary = builder.finalize();
        self.record(&summary, Some(&partition)).await;
        summary
    }

    async fn record(&self, summary: &RunSummary, partition: Option<&TenantPartition>) {
        match summary.status {
            RunStatus::Success => info!(
                family = %summary.family,
                succeeded = summary.total_succeeded(),
                seconds = summary.duration_seconds(),
                "run finished"
            ),
            RunStatus::Partial => {
                if let Some(err) = summary.partial_failure() {
                    warn!(
                        family = %summary.family,
                        succeeded = summary.total_succeeded(),
                        detail = summary.error_detail.as_deref().unwrap_or(""),
                        "{}",
                        err
                    );
                }
            }
            RunStatus::Failed => warn!(
                family = %summary.family,
                succeeded = summary.total_succeeded(),
                detail = summary.error_detail.as_deref().unwrap_or(""),
                "run failed"
            ),
        }

        guard(&self.history).push(summary.clone());

        let Some(partition) = partition else {
            return;
        };
        let mut row: Row = match serde_json::to_value(summary) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        partition.stamp(&mut row);
        if let Err(e) = self
            .catalog
            .append(partition, &self.history_table, &row)
            .await
        {
            warn!(table = %self.history_table, error = %e, "could not push run summary");
        }
    }

    /// Finished runs, newest first.
    pub fn history(&self, family: Option<PipelineFamily>) -> Vec<RunSummary> {
        guard(&self.history).list(family)
    }

    pub fn status(&self) -> StatusReport {
        let families = PipelineFamily::ALL
            .into_iter()
            .map(|family| FamilyStatus {
                family,
                running: self.is_running(family),
                phase: self.phase(family),
                pipelines: self.registry.pipelines(family).len(),
                last_run: guard(&self.history).last(family).cloned(),
            })
            .collect();

        StatusReport {
            device_name: self.device_name.clone(),
            device_identity: self.resolver.identity().to_string(),
            tenancy: self.tenancy,
            partition: self.resolver.cached().cloned(),
            families,
        }
    }

    /// This device's media rows as stored in the catalog, most recently
    /// synced first, optionally narrowed to one media type.
    pub async fn media(&self, kind: Option<MediaKind>, limit: usize) -> anyhow::Result<Vec<Row>> {
        let partition = self.resolver.resolve().await?;
        let mut filter = Vec::new();
        if partition.mode == TenancyMode::DeviceRow {
            filter.push((
                TenantPartition::DEVICE_COLUMN,
                Value::from(partition.partition_ref.clone()),
            ));
        }
        if let Some(kind) = kind {
            filter.push(("media_type", Value::from(kind.as_str())));
        }
        let selection = Selection {
            columns: MEDIA_COLUMNS,
            filter,
            newest_first_by: "updated_at",
            limit,
        };
        let rows = self
            .catalog
            .select(&partition, EntityType::Media.table(), &selection)
            .await
            .context("Failed to read media from catalog")?;
        Ok(rows)
    }

    /// Refresh partition metadata. Failures are logged, never fatal.
    pub async fn heartbeat(&self) {
        match self.resolver.heartbeat().await {
            Ok(()) => info!("heartbeat sent"),
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::models::RawRecord;
    use crate::pipeline::Pipeline;
    use crate::traits::{SourceExtractor, SourceKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Indexers {
        delay: Duration,
    }

    #[async_trait]
    impl SourceExtractor for Indexers {
        fn name(&self) -> &str {
            "prowlarr"
        }
        fn description(&self) -> &str {
            "two indexers"
        }
        fn kind(&self) -> SourceKind {
            SourceKind::QueryStore
        }
        async fn extract(&self) -> Result<Vec<RawRecord>> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![
                RawRecord::from_value("prowlarr", json!({ "Id": 1, "Name": "Nyaa" })),
                RawRecord::from_value("prowlarr", json!({ "Id": 2, "Name": "1337x" })),
            ])
        }
    }

    fn config() -> Config {
        toml::from_str(
            "[device]\nname = \"den\"\n[catalog]\nurl = \"http://catalog.test\"\n[history]\ncapacity = 2\n",
        )
        .unwrap()
    }

    fn coordinator(catalog: Arc<MemoryCatalog>, delay: Duration) -> Arc<RunCoordinator> {
        let mut registry = PipelineRegistry::new();
        registry.add(
            PipelineFamily::Library,
            Pipeline::Flat {
                entity: EntityType::Indexer,
                extractors: vec![Box::new(Indexers { delay })],
            },
        );
        Arc::new(RunCoordinator::new(
            &config(),
            catalog,
            registry,
            "dev-1".into(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn successful_run_is_recorded() {
        let catalog = Arc::new(MemoryCatalog::new());
        let coord = coordinator(catalog.clone(), Duration::ZERO);

        let summary = coord.run_once(PipelineFamily::Library).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.partition_ref.as_deref(), Some("den"));
        assert_eq!(summary.entities[&EntityType::Indexer].succeeded, 2);

        assert_eq!(coord.history(None).len(), 1);
        assert_eq!(coord.phase(PipelineFamily::Library), RunPhase::Idle);
        assert_eq!(catalog.rows_in("den", "run_history").len(), 1);
        assert_eq!(catalog.rows_in("den", "indexers").len(), 2);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_refused() {
        let catalog = Arc::new(MemoryCatalog::new());
        let coord = coordinator(catalog, Duration::from_millis(200));

        let background = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.run_once(PipelineFamily::Library).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coord.is_running(PipelineFamily::Library));
        let err = coord.run_once(PipelineFamily::Library).await.unwrap_err();
        assert!(matches!(err, SyncError::RunInProgress(PipelineFamily::Library)));
        // Other families are independent.
        assert!(coord.run_once(PipelineFamily::Backup).await.is_ok());

        assert!(background.await.unwrap().is_ok());
        assert!(!coord.is_running(PipelineFamily::Library));
    }

    #[tokio::test]
    async fn media_listing_reads_own_partition() {
        let catalog = Arc::new(MemoryCatalog::new());
        let coord = coordinator(catalog.clone(), Duration::ZERO);
        let den = TenantPartition {
            device_identity: "dev-1".into(),
            partition_ref: "den".into(),
            mode: TenancyMode::Schema,
        };
        let attic = TenantPartition {
            partition_ref: "attic".into(),
            ..den.clone()
        };
        for (partition, id, kind) in [
            (&den, "m1", "movie"),
            (&den, "s1", "series"),
            (&attic, "m9", "movie"),
        ] {
            let row: Row = json!({ "source_item_id": id, "media_type": kind, "title": id })
                .as_object()
                .unwrap()
                .clone();
            catalog
                .upsert(partition, "media", &["source_item_id"], &[row])
                .await
                .unwrap();
        }

        let movies = coord.media(Some(MediaKind::Movie), 10).await.unwrap();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0]["title"], "m1");
        assert_eq!(coord.media(None, 10).await.unwrap().len(), 2);
        assert_eq!(coord.media(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn media_listing_fails_without_tenancy() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.fail_provisioning();
        let coord = coordinator(catalog, Duration::ZERO);
        let err = coord.media(None, 10).await.unwrap_err();
        assert!(err.to_string().contains("tenancy unavailable"));
    }

    #[tokio::test]
    async fn tenancy_failure_fails_the_run() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.fail_provisioning();
        let coord = coordinator(catalog.clone(), Duration::ZERO);

        let summary = coord.run_once(PipelineFamily::Library).await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.partition_ref.is_none());
        assert!(summary.error_detail.unwrap().contains("tenancy unavailable"));
        assert!(summary.entities.is_empty());
        assert!(catalog.rows_in("den", "indexers").is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let catalog = Arc::new(MemoryCatalog::new());
        let coord = coordinator(catalog, Duration::ZERO);
        for _ in 0..3 {
            coord.run_once(PipelineFamily::Library).await.unwrap();
        }
        assert_eq!(coord.history(None).len(), 2);
        let status = coord.status();
        assert_eq!(status.partition.unwrap().partition_ref, "den");
        let library = status
            .families
            .iter()
            .find(|f| f.family == PipelineFamily::Library)
            .unwrap();
        assert_eq!(library.pipelines, 1);
        assert!(library.last_run.is_some());
    }
}
