//! Pipelines: extractor → normalizer → reconciler, per entity type.
//!
//! A [`PipelineRegistry`] is built once from config and groups pipelines by
//! [`PipelineFamily`]. The coordinator runs every pipeline of a family
//! concurrently; a failing pipeline only affects its own counters.
//!
//! ```text
//! backup   ─► Flat(Backup)           BackupExtractor per service
//! library  ─► Flat(MonitoredMovie)   SqliteExtractor(movies) per movie DVR
//!             Flat(MonitoredSeries)  SqliteExtractor(series) per series DVR
//!             Flat(QualityProfile)   SqliteExtractor(quality_profiles) per DVR
//!             Flat(Indexer)          SqliteExtractor(indexers)
//!             Flat(User)             UserDirectoryExtractor
//!             Flat(ServiceConfig)    ConfigFileExtractor per service
//! media    ─► Flat(Media)            MediaServerExtractor(Movie)
//!             Hierarchical           MediaServerExtractor(Series) ─► EpisodeSource
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::{Config, ServiceKind};
use crate::error::Result;
use crate::extractor_backup::BackupExtractor;
use crate::extractor_config::{ConfigFileExtractor, UserDirectoryExtractor};
use crate::extractor_media::{EpisodeSource, MediaServerClient, MediaServerExtractor};
use crate::extractor_sqlite::{Projection, SqliteExtractor};
use crate::models::{CanonicalRecord, EntityCounts, EntityType, PipelineFamily, RawRecord, TenantPartition};
use crate::normalize::{normalize, NormalizeContext, Normalized};
use crate::reconcile::Reconciler;
use crate::traits::{ChildSource, SourceExtractor};

/// Service label used when no media-server service is configured by name.
const MEDIA_SERVER_LABEL: &str = "media-server";

/// Everything a pipeline needs from the run it belongs to.
pub struct RunContext<'a> {
    pub reconciler: &'a Reconciler,
    pub partition: &'a TenantPartition,
    pub normalize: &'a NormalizeContext,
    /// Called when extraction of an entity type starts.
    pub on_extract: &'a (dyn Fn(EntityType) + Send + Sync),
}

pub enum Pipeline {
    /// One entity type from one or more independent sources.
    Flat {
        entity: EntityType,
        extractors: Vec<Box<dyn SourceExtractor>>,
    },
    /// Parents first, then the children of every confirmed parent.
    Hierarchical {
        parent_entity: EntityType,
        child_entity: EntityType,
        parents: Box<dyn SourceExtractor>,
        children: Box<dyn ChildSource>,
    },
}

impl Pipeline {
    pub fn entities(&self) -> Vec<EntityType> {
        match self {
            Pipeline::Flat { entity, .. } => vec![*entity],
            Pipeline::Hierarchical {
                parent_entity,
                child_entity,
                ..
            } => vec![*parent_entity, *child_entity],
        }
    }

    pub fn extractors(&self) -> Vec<&dyn SourceExtractor> {
        match self {
            Pipeline::Flat { extractors, .. } => extractors.iter().map(|e| e.as_ref()).collect(),
            Pipeline::Hierarchical { parents, .. } => vec![parents.as_ref()],
        }
    }

    /// Run the pipeline and return counters per entity type.
    pub async fn run(&self, ctx: &RunContext<'_>) -> Vec<(EntityType, EntityCounts)> {
        match self {
            Pipeline::Flat { entity, extractors } => {
                (ctx.on_extract)(*entity);
                let (records, mut counts) =
                    extract_all(extractors, *entity, ctx.normalize).await;
                let outcome = ctx
                    .reconciler
                    .reconcile(ctx.partition, *entity, records)
                    .await;
                counts.merge(&outcome.counts);
                vec![(*entity, counts)]
            }
            Pipeline::Hierarchical {
                parent_entity,
                child_entity,
                parents,
                children,
            } => {
                run_hierarchical(ctx, *parent_entity, *child_entity, parents.as_ref(), children.as_ref())
                    .await
            }
        }
    }
}

/// Normalize raw records, counting skips.
fn normalize_all(
    raws: Vec<RawRecord>,
    entity: EntityType,
    ctx: &NormalizeContext,
    counts: &mut EntityCounts,
) -> Vec<CanonicalRecord> {
    let mut records = Vec::with_capacity(raws.len());
    for raw in raws {
        match normalize(&raw, entity, ctx) {
            Normalized::Record(record) => records.push(record),
            Normalized::Skip(reason) => {
                debug!(entity = %entity, source = %raw.source, reason = %reason, "skipped record");
                counts.skipped += 1;
            }
        }
    }
    records
}

async fn extract_all(
    extractors: &[Box<dyn SourceExtractor>],
    entity: EntityType,
    ctx: &NormalizeContext,
) -> (Vec<CanonicalRecord>, EntityCounts) {
    let results = join_all(extractors.iter().map(|e| e.extract())).await;

    let mut counts = EntityCounts::default();
    let mut records = Vec::new();
    for (extractor, result) in extractors.iter().zip(results) {
        match result {
            Ok(raws) => {
                debug!(entity = %entity, source = extractor.name(), raw = raws.len(), "extracted");
                records.extend(normalize_all(raws, entity, ctx, &mut counts));
            }
            Err(e) => {
                warn!(entity = %entity, source = extractor.name(), error = %e, "source unavailable");
                counts.unavailable += 1;
                counts.last_error = Some(e.to_string());
            }
        }
    }
    (records, counts)
}

async fn run_hierarchical(
    ctx: &RunContext<'_>,
    parent_entity: EntityType,
    child_entity: EntityType,
    parents: &dyn SourceExtractor,
    children: &dyn ChildSource,
) -> Vec<(EntityType, EntityCounts)> {
    (ctx.on_extract)(parent_entity);
    let mut parent_counts = EntityCounts::default();
    let mut child_counts = EntityCounts::default();

    let parent_records = match parents.extract().await {
        Ok(raws) => normalize_all(raws, parent_entity, ctx.normalize, &mut parent_counts),
        Err(e) => {
            warn!(entity = %parent_entity, source = parents.name(), error = %e, "source unavailable");
            parent_counts.unavailable += 1;
            parent_counts.last_error = Some(e.to_string());
            return vec![(parent_entity, parent_counts), (child_entity, child_counts)];
        }
    };

    let parent_source_ids: Vec<String> = parent_records
        .iter()
        .map(|r| r.natural_key().fingerprint())
        .collect();

    let outcome = ctx
        .reconciler
        .reconcile(ctx.partition, parent_entity, parent_records)
        .await;
    parent_counts.merge(&outcome.counts);
    let parent_ids = ctx
        .reconciler
        .parent_ids(ctx.partition, parent_entity, &outcome)
        .await;

    (ctx.on_extract)(child_entity);
    let fetched: Vec<(String, Result<Vec<RawRecord>>)> = stream::iter(parent_source_ids)
        .map(|id| async move {
            let result = children.children(&id).await;
            (id, result)
        })
        .buffer_unordered(ctx.reconciler.max_concurrency())
        .collect()
        .await;

    let mut child_records = Vec::new();
    for (parent_id, result) in fetched {
        match result {
            Ok(raws) => {
                child_records.extend(normalize_all(raws, child_entity, ctx.normalize, &mut child_counts))
            }
            Err(e) => {
                warn!(entity = %child_entity, parent = %parent_id, error = %e, "children unavailable");
                child_counts.unavailable += 1;
                child_counts.last_error = Some(e.to_string());
            }
        }
    }

    let outcome = ctx
        .reconciler
        .reconcile_children(ctx.partition, child_entity, &parent_ids, child_records)
        .await;
    child_counts.merge(&outcome.counts);

    vec![(parent_entity, parent_counts), (child_entity, child_counts)]
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct PipelineRegistry {
    families: BTreeMap<PipelineFamily, Vec<Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, family: PipelineFamily, pipeline: Pipeline) {
        self.families
            .entry(family)
            .or_default()
            .push(Arc::new(pipeline));
    }

    pub fn pipelines(&self, family: PipelineFamily) -> &[Arc<Pipeline>] {
        self.families
            .get(&family)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    /// Build every pipeline the configured stack supports.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        let root = &config.stack.root;
        let services = config.services();

        // Backup
        let backups: Vec<Box<dyn SourceExtractor>> = services
            .iter()
            .filter(|(_, s)| !s.important_files().is_empty())
            .map(|(name, s)| {
                Box::new(BackupExtractor::new(
                    name.as_str(),
                    s.dir(name, root),
                    s.important_files(),
                )) as Box<dyn SourceExtractor>
            })
            .collect();
        registry.add_flat(PipelineFamily::Backup, EntityType::Backup, backups);

        // Library
        let sqlite = |kinds: &[ServiceKind], projection: Projection| -> Vec<Box<dyn SourceExtractor>> {
            services
                .iter()
                .filter(|(_, s)| kinds.contains(&s.kind))
                .filter_map(|(name, s)| {
                    let db = s.database_file(name)?;
                    Some(Box::new(SqliteExtractor::new(
                        name.as_str(),
                        s.dir(name, root).join(db),
                        projection,
                    )) as Box<dyn SourceExtractor>)
                })
                .collect()
        };
        registry.add_flat(
            PipelineFamily::Library,
            EntityType::MonitoredMovie,
            sqlite(&[ServiceKind::MovieDvr], Projection::Movies),
        );
        registry.add_flat(
            PipelineFamily::Library,
            EntityType::MonitoredSeries,
            sqlite(&[ServiceKind::SeriesDvr], Projection::Series),
        );
        registry.add_flat(
            PipelineFamily::Library,
            EntityType::QualityProfile,
            sqlite(
                &[ServiceKind::MovieDvr, ServiceKind::SeriesDvr],
                Projection::QualityProfiles,
            ),
        );
        registry.add_flat(
            PipelineFamily::Library,
            EntityType::Indexer,
            sqlite(&[ServiceKind::IndexerManager], Projection::Indexers),
        );

        let users: Vec<Box<dyn SourceExtractor>> = services
            .iter()
            .filter_map(|(name, s)| {
                let dir = s.users_dir()?;
                Some(Box::new(UserDirectoryExtractor::new(
                    name.as_str(),
                    s.dir(name, root).join(dir),
                )) as Box<dyn SourceExtractor>)
            })
            .collect();
        registry.add_flat(PipelineFamily::Library, EntityType::User, users);

        let configs: Vec<Box<dyn SourceExtractor>> = services
            .iter()
            .filter(|(_, s)| !s.config_files().is_empty())
            .map(|(name, s)| {
                Box::new(ConfigFileExtractor::new(
                    name.as_str(),
                    s.dir(name, root),
                    s.config_files(),
                )) as Box<dyn SourceExtractor>
            })
            .collect();
        registry.add_flat(PipelineFamily::Library, EntityType::ServiceConfig, configs);

        // Media
        if config.media_server.enabled {
            let label = config
                .services_of(ServiceKind::MediaServer)
                .into_iter()
                .next()
                .map(|(name, _)| name)
                .unwrap_or_else(|| MEDIA_SERVER_LABEL.to_string());
            let client = Arc::new(MediaServerClient::new(label, &config.media_server)?);

            registry.add(
                PipelineFamily::Media,
                Pipeline::Flat {
                    entity: EntityType::Media,
                    extractors: vec![Box::new(MediaServerExtractor::new(client.clone(), "Movie"))],
                },
            );
            registry.add(
                PipelineFamily::Media,
                Pipeline::Hierarchical {
                    parent_entity: EntityType::Media,
                    child_entity: EntityType::Episode,
                    parents: Box::new(MediaServerExtractor::new(client.clone(), "Series")),
                    children: Box::new(EpisodeSource::new(client)),
                },
            );
        }

        for family in PipelineFamily::ALL {
            info!(family = %family, pipelines = registry.pipelines(family).len(), "pipelines registered");
        }
        Ok(registry)
    }

    fn add_flat(
        &mut self,
        family: PipelineFamily,
        entity: EntityType,
        extractors: Vec<Box<dyn SourceExtractor>>,
    ) {
        if !extractors.is_empty() {
            self.add(family, Pipeline::Flat { entity, extractors });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::error::SyncError;
    use crate::models::TenancyMode;
    use crate::traits::SourceKind;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    struct Fixed {
        name: &'static str,
        records: Vec<Value>,
    }

    #[async_trait]
    impl SourceExtractor for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fixed records"
        }
        fn kind(&self) -> SourceKind {
            SourceKind::ConfigFile
        }
        async fn extract(&self) -> Result<Vec<RawRecord>> {
            Ok(self
                .records
                .iter()
                .map(|v| RawRecord::from_value(self.name, v.clone()))
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl SourceExtractor for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn kind(&self) -> SourceKind {
            SourceKind::QueryStore
        }
        async fn extract(&self) -> Result<Vec<RawRecord>> {
            Err(SyncError::unavailable("broken", "database is locked"))
        }
    }

    struct Episodes(HashMap<&'static str, Vec<Value>>);

    #[async_trait]
    impl ChildSource for Episodes {
        fn name(&self) -> &str {
            "episodes"
        }
        async fn children(&self, parent: &str) -> Result<Vec<RawRecord>> {
            Ok(self
                .0
                .get(parent)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|v| RawRecord::from_value("jellyfin", v))
                .collect())
        }
    }

    fn reconciler(catalog: Arc<MemoryCatalog>) -> Reconciler {
        let config = toml::from_str("url = \"http://catalog.test\"\nprobe_entities = []").unwrap();
        Reconciler::new(catalog, &config, CancellationToken::new())
    }

    fn partition() -> TenantPartition {
        TenantPartition {
            device_identity: "dev".into(),
            partition_ref: "den".into(),
            mode: TenancyMode::Schema,
        }
    }

    #[tokio::test]
    async fn flat_pipeline_isolates_broken_source() {
        let catalog = Arc::new(MemoryCatalog::new());
        let reconciler = reconciler(catalog.clone());
        let p = partition();
        let norm = NormalizeContext::new(None);
        let ctx = RunContext {
            reconciler: &reconciler,
            partition: &p,
            normalize: &norm,
            on_extract: &|_: EntityType| {},
        };

        let pipeline = Pipeline::Flat {
            entity: EntityType::Indexer,
            extractors: vec![
                Box::new(Broken),
                Box::new(Fixed {
                    name: "prowlarr",
                    records: vec![
                        json!({ "Id": 1, "Name": "Nyaa" }),
                        json!({ "Id": 2 }),
                    ],
                }),
            ],
        };

        let counts = pipeline.run(&ctx).await;
        let (entity, counts) = &counts[0];
        assert_eq!(*entity, EntityType::Indexer);
        assert_eq!(counts.unavailable, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.succeeded, 1);
        assert!(counts.last_error.as_deref().unwrap().contains("database is locked"));
    }

    #[tokio::test]
    async fn hierarchical_pipeline_blocks_children_of_failed_parent() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.reject_rows_where("media", "source_item_id", json!("s2"));
        let reconciler = reconciler(catalog.clone());
        let p = partition();
        let norm = NormalizeContext::new(None);
        let ctx = RunContext {
            reconciler: &reconciler,
            partition: &p,
            normalize: &norm,
            on_extract: &|_: EntityType| {},
        };

        let mut episodes = HashMap::new();
        episodes.insert("s1", vec![json!({ "Id": "e1", "Name": "Pilot", "SeriesId": "s1" })]);
        episodes.insert(
            "s2",
            vec![
                json!({ "Id": "e2", "Name": "Pilot", "SeriesId": "s2" }),
                json!({ "Id": "e3", "Name": "Second", "SeriesId": "s2" }),
            ],
        );

        let pipeline = Pipeline::Hierarchical {
            parent_entity: EntityType::Media,
            child_entity: EntityType::Episode,
            parents: Box::new(Fixed {
                name: "jellyfin",
                records: vec![
                    json!({ "Id": "s1", "Name": "Good", "Type": "Series" }),
                    json!({ "Id": "s2", "Name": "Bad", "Type": "Series" }),
                ],
            }),
            children: Box::new(Episodes(episodes)),
        };

        let counts: HashMap<EntityType, EntityCounts> = pipeline.run(&ctx).await.into_iter().collect();
        assert_eq!(counts[&EntityType::Media].succeeded, 1);
        assert_eq!(counts[&EntityType::Media].failed, 1);
        assert_eq!(counts[&EntityType::Episode].attempted, 1);
        assert_eq!(counts[&EntityType::Episode].failed, 2);
    }

    #[test]
    fn registry_from_default_stack() {
        let config: Config = toml::from_str(
            "[catalog]\nurl = \"http://catalog.test\"\n[stack]\nroot = \"/nonexistent\"\n",
        )
        .unwrap();
        let registry = PipelineRegistry::from_config(&config).unwrap();

        let library: Vec<EntityType> = registry
            .pipelines(PipelineFamily::Library)
            .iter()
            .flat_map(|p| p.entities())
            .collect();
        assert_eq!(
            library,
            vec![
                EntityType::MonitoredMovie,
                EntityType::MonitoredSeries,
                EntityType::QualityProfile,
                EntityType::Indexer,
                EntityType::User,
                EntityType::ServiceConfig,
            ]
        );
        assert_eq!(registry.pipelines(PipelineFamily::Backup)[0].extractors().len(), 7);
        assert_eq!(registry.pipelines(PipelineFamily::Media).len(), 2);
    }
}
