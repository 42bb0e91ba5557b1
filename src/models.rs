//! Core data models used throughout stack-sync.
//!
//! Raw records are untyped JSON objects and only exist between an extractor
//! and a normalizer. Everything past normalization is a strictly typed
//! [`CanonicalRecord`] variant that knows its own natural key and row shape.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SyncError;

// ═══════════════════════════════════════════════════════════════════════
// Families and entity types
// ═══════════════════════════════════════════════════════════════════════

/// A group of pipelines that is scheduled and run together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineFamily {
    /// Hashed configuration snapshots of every service.
    Backup,
    /// DVR libraries, quality profiles, indexers, users, service configs.
    Library,
    /// Media-server catalog: movies, series and their episodes.
    Media,
}

impl PipelineFamily {
    pub const ALL: [PipelineFamily; 3] = [
        PipelineFamily::Backup,
        PipelineFamily::Library,
        PipelineFamily::Media,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineFamily::Backup => "backup",
            PipelineFamily::Library => "library",
            PipelineFamily::Media => "media",
        }
    }
}

impl fmt::Display for PipelineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(PipelineFamily::Backup),
            "library" => Ok(PipelineFamily::Library),
            "media" => Ok(PipelineFamily::Media),
            other => Err(format!(
                "unknown pipeline family '{}'. Available: backup, library, media",
                other
            )),
        }
    }
}

/// Every canonical entity shape the engine knows how to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Media,
    Episode,
    MonitoredMovie,
    MonitoredSeries,
    QualityProfile,
    Indexer,
    User,
    ServiceConfig,
    Backup,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Media => "media",
            EntityType::Episode => "episode",
            EntityType::MonitoredMovie => "monitored_movie",
            EntityType::MonitoredSeries => "monitored_series",
            EntityType::QualityProfile => "quality_profile",
            EntityType::Indexer => "indexer",
            EntityType::User => "user",
            EntityType::ServiceConfig => "service_config",
            EntityType::Backup => "backup",
        }
    }

    /// Remote table the entity is written to.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Media | EntityType::Episode => "media",
            EntityType::MonitoredMovie => "movies",
            EntityType::MonitoredSeries => "series",
            EntityType::QualityProfile => "quality_profiles",
            EntityType::Indexer => "indexers",
            EntityType::User => "media_users",
            EntityType::ServiceConfig => "service_configs",
            EntityType::Backup => "backups",
        }
    }

    /// Columns that form the natural key within a partition.
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            EntityType::Media | EntityType::Episode => &["source_item_id"],
            EntityType::MonitoredMovie => &["source_movie_id"],
            EntityType::MonitoredSeries => &["source_series_id"],
            EntityType::QualityProfile => &["service_name", "profile_id"],
            EntityType::Indexer => &["indexer_id"],
            EntityType::User => &["user_id"],
            EntityType::ServiceConfig => &["service_name", "config_type"],
            EntityType::Backup => &["service_name"],
        }
    }

    pub fn family(&self) -> PipelineFamily {
        match self {
            EntityType::Backup => PipelineFamily::Backup,
            EntityType::Media | EntityType::Episode => PipelineFamily::Media,
            _ => PipelineFamily::Library,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            EntityType::Media,
            EntityType::Episode,
            EntityType::MonitoredMovie,
            EntityType::MonitoredSeries,
            EntityType::QualityProfile,
            EntityType::Indexer,
            EntityType::User,
            EntityType::ServiceConfig,
            EntityType::Backup,
        ];
        all.into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown entity type '{}'", s))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Raw records
// ═══════════════════════════════════════════════════════════════════════

/// Record produced by an extractor, in the source's native field names.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Service the record came from (e.g. `"radarr"`, `"media-server"`).
    pub source: String,
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(source: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            source: source.into(),
            fields,
        }
    }

    /// Wrap a JSON value; non-object values become an empty record.
    pub fn from_value(source: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(source, fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Natural keys and tenancy
// ═══════════════════════════════════════════════════════════════════════

/// Deterministic identity of a record within a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalKey {
    pub entity: EntityType,
    pub parts: Vec<(&'static str, Value)>,
}

impl NaturalKey {
    pub fn new(entity: EntityType, values: Vec<Value>) -> Self {
        let parts = entity
            .key_columns()
            .iter()
            .copied()
            .zip(values)
            .collect();
        Self { entity, parts }
    }

    /// Stable string form, used for dedup maps and log fields.
    pub fn fingerprint(&self) -> String {
        self.parts
            .iter()
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .parts
            .iter()
            .map(|(col, v)| format!("{}={}", col, v))
            .collect();
        write!(f, "{}[{}]", self.entity, parts.join(","))
    }
}

/// How a device's records are isolated from other devices remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenancyMode {
    /// One namespace (schema) per device, routed by request headers.
    Schema,
    /// Shared tables with a `device_id` column pointing at a device row.
    DeviceRow,
}

/// The resolved remote partition for this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantPartition {
    pub device_identity: String,
    pub partition_ref: String,
    pub mode: TenancyMode,
}

impl TenantPartition {
    /// Column carrying the partition in `device_row` mode.
    pub const DEVICE_COLUMN: &'static str = "device_id";

    /// Natural key columns including the partition column when rows carry it.
    pub fn conflict_columns(&self, entity: EntityType) -> Vec<&'static str> {
        let mut cols = Vec::with_capacity(entity.key_columns().len() + 1);
        if self.mode == TenancyMode::DeviceRow {
            cols.push(Self::DEVICE_COLUMN);
        }
        cols.extend_from_slice(entity.key_columns());
        cols
    }

    /// Key filter for probes: the natural key plus the partition column.
    pub fn key_filter(&self, key: &NaturalKey) -> Vec<(&'static str, Value)> {
        let mut filter = Vec::with_capacity(key.parts.len() + 1);
        if self.mode == TenancyMode::DeviceRow {
            filter.push((Self::DEVICE_COLUMN, Value::String(self.partition_ref.clone())));
        }
        filter.extend(key.parts.iter().cloned());
        filter
    }

    /// Tag a row with this partition. In `schema` mode the partition
    /// travels as a routing header instead.
    pub fn stamp(&self, row: &mut Map<String, Value>) {
        if self.mode == TenancyMode::DeviceRow {
            row.insert(
                Self::DEVICE_COLUMN.to_string(),
                Value::String(self.partition_ref.clone()),
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Canonical records
// ═══════════════════════════════════════════════════════════════════════

/// Resolution tier derived from the primary video stream width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityTier {
    #[serde(rename = "4K")]
    Uhd4k,
    #[serde(rename = "1080p")]
    Fhd1080,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "SD")]
    Sd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Series,
    Episode,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "series",
            MediaKind::Episode => "episode",
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [MediaKind::Movie, MediaKind::Series, MediaKind::Episode]
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown media type '{}'", s))
    }
}

/// Catalog lifecycle of an item, independent of whether it was watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Unwatched,
    InProgress,
    Watched,
}

/// A movie or series as seen by the media server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaRecord {
    pub media_type: MediaKind,
    pub source_item_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvdb_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityTier>,
    pub is_hd: bool,
    pub is_4k: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub director: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub studio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_companies: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backdrop_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub status: CatalogStatus,
    pub watch_state: WatchState,
    pub watched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watched_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_played_at: Option<String>,
    pub watch_progress_seconds: i64,
    pub progress_percent: f64,
    pub play_count: i64,
    pub favorite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critic_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_rating: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_added_at: Option<String>,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

/// An episode, owned by a series through `series_ref`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeRecord {
    pub media_type: MediaKind,
    pub source_item_id: String,
    /// Media-server id of the owning series. Not a remote column.
    #[serde(skip)]
    pub series_source_id: String,
    /// Remote surrogate id of the owning series, set once it is confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_ref: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvdb_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    pub status: CatalogStatus,
    pub watch_state: WatchState,
    pub watched: bool,
    pub progress_percent: f64,
    pub play_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// A movie tracked by the movie DVR.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoredMovie {
    pub source_movie_id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub studio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_profile_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub monitored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_minutes: Option<i64>,
    pub has_file: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_quality: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A series tracked by the series DVR.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoredSeries {
    pub source_series_id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvdb_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_profile_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub monitored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_file_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_episode_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_on_disk: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityProfile {
    pub service_name: String,
    pub profile_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Indexer {
    pub indexer_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_contract: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_profile_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// A media-server user account. `policy` is redacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaUser {
    pub user_id: String,
    pub username: String,
    pub is_administrator: bool,
    pub is_disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

/// A parsed, redacted configuration file of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub config_type: String,
    pub config_data: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub content: String,
    pub checksum: String,
    pub size: u64,
}

/// Hashed snapshot of one service's important files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRecord {
    pub service_name: String,
    pub captured_at: DateTime<Utc>,
    pub content_checksum: String,
    pub size_bytes: u64,
    pub files: BTreeMap<String, BackupFile>,
    pub updated_at: DateTime<Utc>,
}

/// The normalized shape every source is mapped into before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    Media(MediaRecord),
    Episode(EpisodeRecord),
    MonitoredMovie(MonitoredMovie),
    MonitoredSeries(MonitoredSeries),
    QualityProfile(QualityProfile),
    Indexer(Indexer),
    User(MediaUser),
    ServiceConfig(ServiceConfig),
    Backup(BackupRecord),
}

impl CanonicalRecord {
    pub fn entity_type(&self) -> EntityType {
        match self {
            CanonicalRecord::Media(_) => EntityType::Media,
            CanonicalRecord::Episode(_) => EntityType::Episode,
            CanonicalRecord::MonitoredMovie(_) => EntityType::MonitoredMovie,
            CanonicalRecord::MonitoredSeries(_) => EntityType::MonitoredSeries,
            CanonicalRecord::QualityProfile(_) => EntityType::QualityProfile,
            CanonicalRecord::Indexer(_) => EntityType::Indexer,
            CanonicalRecord::User(_) => EntityType::User,
            CanonicalRecord::ServiceConfig(_) => EntityType::ServiceConfig,
            CanonicalRecord::Backup(_) => EntityType::Backup,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        let values = match self {
            CanonicalRecord::Media(r) => vec![Value::from(r.source_item_id.clone())],
            CanonicalRecord::Episode(r) => vec![Value::from(r.source_item_id.clone())],
            CanonicalRecord::MonitoredMovie(r) => vec![Value::from(r.source_movie_id)],
            CanonicalRecord::MonitoredSeries(r) => vec![Value::from(r.source_series_id)],
            CanonicalRecord::QualityProfile(r) => vec![
                Value::from(r.service_name.clone()),
                Value::from(r.profile_id),
            ],
            CanonicalRecord::Indexer(r) => vec![Value::from(r.indexer_id)],
            CanonicalRecord::User(r) => vec![Value::from(r.user_id.clone())],
            CanonicalRecord::ServiceConfig(r) => vec![
                Value::from(r.service_name.clone()),
                Value::from(r.config_type.clone()),
            ],
            CanonicalRecord::Backup(r) => vec![Value::from(r.service_name.clone())],
        };
        NaturalKey::new(self.entity_type(), values)
    }

    /// Serialize into the remote row shape. Absent fields are omitted.
    pub fn to_row(&self) -> Map<String, Value> {
        let value = match self {
            CanonicalRecord::Media(r) => serde_json::to_value(r),
            CanonicalRecord::Episode(r) => serde_json::to_value(r),
            CanonicalRecord::MonitoredMovie(r) => serde_json::to_value(r),
            CanonicalRecord::MonitoredSeries(r) => serde_json::to_value(r),
            CanonicalRecord::QualityProfile(r) => serde_json::to_value(r),
            CanonicalRecord::Indexer(r) => serde_json::to_value(r),
            CanonicalRecord::User(r) => serde_json::to_value(r),
            CanonicalRecord::ServiceConfig(r) => serde_json::to_value(r),
            CanonicalRecord::Backup(r) => serde_json::to_value(r),
        };
        // Every variant is a plain struct of serializable fields.
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Run summaries
// ═══════════════════════════════════════════════════════════════════════

/// Per-entity counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    /// Records a write was issued for.
    pub attempted: u64,
    pub succeeded: u64,
    /// Rejected writes plus children blocked by a failed parent.
    pub failed: u64,
    /// Raw records dropped by normalization or collapsed as duplicates.
    pub skipped: u64,
    /// Source calls that reported `SourceUnavailable`.
    pub unavailable: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl EntityCounts {
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.unavailable > 0
    }

    pub fn merge(&mut self, other: &EntityCounts) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.unavailable += other.unavailable;
        if other.last_error.is_some() {
            self.last_error = other.last_error.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        })
    }
}

/// Immutable record of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub family: PipelineFamily,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_ref: Option<String>,
    pub entities: BTreeMap<EntityType, EntityCounts>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl RunSummary {
    pub fn total_succeeded(&self) -> u64 {
        self.entities.values().map(|c| c.succeeded).sum()
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }

    /// Entities that recorded failed or unavailable work.
    pub fn failed_entities(&self) -> Vec<EntityType> {
        self.entities
            .iter()
            .filter(|(_, c)| c.has_failures())
            .map(|(e, _)| *e)
            .collect()
    }

    /// `Some` when the run ended `partial`.
    pub fn partial_failure(&self) -> Option<SyncError> {
        (self.status == RunStatus::Partial).then(|| SyncError::PartialRunFailure {
            failed_entities: self
                .failed_entities()
                .iter()
                .map(|e| e.to_string())
                .collect(),
        })
    }
}

/// Accumulates counters while a run is in flight.
#[derive(Debug)]
pub struct RunSummaryBuilder {
    run_id: Uuid,
    family: PipelineFamily,
    started_at: DateTime<Utc>,
    partition_ref: Option<String>,
    entities: BTreeMap<EntityType, EntityCounts>,
    tenancy_error: Option<String>,
}

impl RunSummaryBuilder {
    pub fn start(family: PipelineFamily) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            family,
            started_at: Utc::now(),
            partition_ref: None,
            entities: BTreeMap::new(),
            tenancy_error: None,
        }
    }

    pub fn partition(&mut self, partition_ref: &str) {
        self.partition_ref = Some(partition_ref.to_string());
    }

    pub fn tenancy_failed(&mut self, reason: impl Into<String>) {
        self.tenancy_error = Some(reason.into());
    }

    pub fn record(&mut self, entity: EntityType, counts: &EntityCounts) {
        self.entities.entry(entity).or_default().merge(counts);
    }

    /// Freeze the run. The returned summary is never mutated afterwards.
    pub fn finalize(self) -> RunSummary {
        let status = compute_status(self.tenancy_error.is_some(), &self.entities);
        let error_detail = match &self.tenancy_error {
            Some(reason) => Some(reason.clone()),
            None => {
                let failed: Vec<String> = self
                    .entities
                    .iter()
                    .filter(|(_, c)| c.has_failures())
                    .map(|(e, c)| match &c.last_error {
                        Some(err) => format!("{}: {}", e, err),
                        None => e.to_string(),
                    })
                    .collect();
                if failed.is_empty() {
                    None
                } else {
                    Some(failed.join("; "))
                }
            }
        };

        RunSummary {
            run_id: self.run_id,
            family: self.family,
            started_at: self.started_at,
            finished_at: Utc::now(),
            partition_ref: self.partition_ref,
            entities: self.entities,
            status,
            error_detail,
        }
    }
}

/// Status rule: tenancy failure is always `failed`; otherwise a run with
/// no failures is `success`, a run with failures and at least one
/// succeeded write is `partial`, and a run with failures where nothing
/// succeeded is `failed`. A run that found no records at all is `success`.
pub fn compute_status(
    tenancy_failed: bool,
    entities: &BTreeMap<EntityType, EntityCounts>,
) -> RunStatus {
    if tenancy_failed {
        return RunStatus::Failed;
    }
    let any_failure = entities.values().any(EntityCounts::has_failures);
    let succeeded: u64 = entities.values().map(|c| c.succeeded).sum();
    match (any_failure, succeeded) {
        (false, _) => RunStatus::Success,
        (true, 0) => RunStatus::Failed,
        (true, _) => RunStatus::Partial,
    }
}
