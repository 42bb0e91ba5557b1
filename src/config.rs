use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::{EntityType, TenancyMode};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub media_server: MediaServerConfig,
    #[serde(default)]
    pub stack: StackConfig,
    /// Services keyed by name. Empty means [`default_services`].
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSettings>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    /// Human name of the device; also the source of the schema name.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Explicit device identity. Skips file/NIC/random resolution.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
    /// Network interface whose MAC address seeds the identity hash.
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            identity: None,
            identity_file: default_identity_file(),
            interface: default_interface(),
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "stack".to_string())
}
fn default_identity_file() -> PathBuf {
    PathBuf::from("/var/lib/stacksync/device_uuid")
}
fn default_interface() -> String {
    "eth0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    /// Base URL of the catalog (REST under `/rest/v1`, functions under `/functions/v1`).
    pub url: String,
    /// Environment variable holding the service key.
    #[serde(default = "default_catalog_key_env")]
    pub key_env: String,
    #[serde(default = "default_tenancy")]
    pub tenancy: TenancyMode,
    /// Provisioning function invoked in `schema` mode.
    #[serde(default = "default_provision_function")]
    pub provision_function: String,
    /// Device table used in `device_row` mode.
    #[serde(default = "default_devices_table")]
    pub devices_table: String,
    /// Partition metadata table refreshed by the heartbeat in `schema` mode.
    #[serde(default = "default_partition_table")]
    pub partition_table: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Entities reconciled with probe-then-write instead of upsert.
    #[serde(default = "default_probe_entities")]
    pub probe_entities: Vec<EntityType>,
}

fn default_catalog_key_env() -> String {
    "CATALOG_SERVICE_KEY".to_string()
}
fn default_tenancy() -> TenancyMode {
    TenancyMode::Schema
}
fn default_provision_function() -> String {
    "provision-partition".to_string()
}
fn default_devices_table() -> String {
    "devices".to_string()
}
fn default_partition_table() -> String {
    "config".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_probe_entities() -> Vec<EntityType> {
    vec![EntityType::Media, EntityType::Episode]
}

impl CatalogConfig {
    /// Read the service key from the configured environment variable.
    pub fn service_key(&self) -> Option<String> {
        std::env::var(&self.key_env).ok().filter(|k| !k.is_empty())
    }

    pub fn uses_probe(&self, entity: EntityType) -> bool {
        self.probe_entities.contains(&entity)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_media_server_url")]
    pub url: String,
    #[serde(default = "default_media_key_env")]
    pub key_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_media_server_url(),
            key_env: default_media_key_env(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_media_server_url() -> String {
    "http://localhost:8096".to_string()
}
fn default_media_key_env() -> String {
    "MEDIA_SERVER_API_KEY".to_string()
}
fn default_page_size() -> usize {
    200
}

impl MediaServerConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.key_env).ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StackConfig {
    /// Directory holding one sub-directory per service.
    #[serde(default = "default_stack_root")]
    pub root: PathBuf,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            root: default_stack_root(),
        }
    }
}

fn default_stack_root() -> PathBuf {
    PathBuf::from("/media-stack")
}

/// Role a service plays in the stack. Decides which extractors apply.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    MediaServer,
    MovieDvr,
    SeriesDvr,
    IndexerManager,
    SubtitleManager,
    RequestManager,
    DebridProxy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceSettings {
    pub kind: ServiceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Service directory, relative to `stack.root` unless absolute.
    /// Defaults to the service name.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// SQLite file inside the service directory. Defaults to `<name>.db`
    /// for DVRs and the indexer manager.
    #[serde(default)]
    pub database: Option<String>,
    /// XML/JSON files parsed into service configs.
    #[serde(default)]
    pub config_files: Option<Vec<String>>,
    /// Globs captured into the backup blob.
    #[serde(default)]
    pub important_files: Option<Vec<String>>,
    /// Per-user directory (media server only).
    #[serde(default)]
    pub users_dir: Option<String>,
}

impl ServiceSettings {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            enabled: true,
            path: None,
            database: None,
            config_files: None,
            important_files: None,
            users_dir: None,
        }
    }

    pub fn dir(&self, name: &str, stack_root: &Path) -> PathBuf {
        match &self.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => stack_root.join(p),
            None => stack_root.join(name),
        }
    }

    pub fn database_file(&self, name: &str) -> Option<String> {
        if let Some(db) = &self.database {
            return Some(db.clone());
        }
        match self.kind {
            ServiceKind::MovieDvr | ServiceKind::SeriesDvr | ServiceKind::IndexerManager => {
                Some(format!("{}.db", name))
            }
            _ => None,
        }
    }

    pub fn config_files(&self) -> Vec<String> {
        if let Some(files) = &self.config_files {
            return files.clone();
        }
        let defaults: &[&str] = match self.kind {
            ServiceKind::MediaServer => &[
                "config/system.xml",
                "config/network.xml",
                "config/encoding.xml",
            ],
            ServiceKind::MovieDvr | ServiceKind::SeriesDvr | ServiceKind::IndexerManager => {
                &["config.xml"]
            }
            ServiceKind::DebridProxy => &["config.json"],
            ServiceKind::SubtitleManager | ServiceKind::RequestManager => &[],
        };
        defaults.iter().map(|s| s.to_string()).collect()
    }

    pub fn important_files(&self) -> Vec<String> {
        if let Some(files) = &self.important_files {
            return files.clone();
        }
        let defaults: &[&str] = match self.kind {
            ServiceKind::MediaServer => &["config/system.xml", "config/network.xml"],
            ServiceKind::MovieDvr | ServiceKind::SeriesDvr | ServiceKind::IndexerManager => {
                &["config.xml"]
            }
            ServiceKind::SubtitleManager => &["config/config.yaml"],
            ServiceKind::RequestManager => &["settings.json"],
            ServiceKind::DebridProxy => &["config.json"],
        };
        defaults.iter().map(|s| s.to_string()).collect()
    }

    pub fn users_dir(&self) -> Option<String> {
        match (&self.users_dir, self.kind) {
            (Some(dir), _) => Some(dir.clone()),
            (None, ServiceKind::MediaServer) => Some("users".to_string()),
            _ => None,
        }
    }
}

/// The stack a device ships with when no `[services]` are configured.
pub fn default_services() -> BTreeMap<String, ServiceSettings> {
    [
        ("jellyfin", ServiceKind::MediaServer),
        ("radarr", ServiceKind::MovieDvr),
        ("sonarr", ServiceKind::SeriesDvr),
        ("prowlarr", ServiceKind::IndexerManager),
        ("bazarr", ServiceKind::SubtitleManager),
        ("jellyseerr", ServiceKind::RequestManager),
        ("decypharr", ServiceKind::DebridProxy),
    ]
    .into_iter()
    .map(|(name, kind)| (name.to_string(), ServiceSettings::new(kind)))
    .collect()
}

impl Config {
    /// Enabled services, falling back to the default stack.
    pub fn services(&self) -> BTreeMap<String, ServiceSettings> {
        let services = if self.services.is_empty() {
            default_services()
        } else {
            self.services.clone()
        };
        services.into_iter().filter(|(_, s)| s.enabled).collect()
    }

    pub fn services_of(&self, kind: ServiceKind) -> Vec<(String, ServiceSettings)> {
        self.services()
            .into_iter()
            .filter(|(_, s)| s.kind == kind)
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backup_interval")]
    pub backup_interval_secs: u64,
    #[serde(default = "default_backup_interval")]
    pub library_interval_secs: u64,
    #[serde(default = "default_media_interval")]
    pub media_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_backup_delay")]
    pub backup_initial_delay_secs: u64,
    #[serde(default = "default_backup_delay")]
    pub library_initial_delay_secs: u64,
    #[serde(default = "default_media_delay")]
    pub media_initial_delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_interval_secs: default_backup_interval(),
            library_interval_secs: default_backup_interval(),
            media_interval_secs: default_media_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            backup_initial_delay_secs: default_backup_delay(),
            library_initial_delay_secs: default_backup_delay(),
            media_initial_delay_secs: default_media_delay(),
        }
    }
}

fn default_backup_interval() -> u64 {
    6 * 60 * 60
}
fn default_media_interval() -> u64 {
    30 * 60
}
fn default_heartbeat_interval() -> u64 {
    5 * 60
}
fn default_backup_delay() -> u64 {
    60
}
fn default_media_delay() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
    /// Catalog table receiving a copy of every run summary.
    #[serde(default = "default_history_table")]
    pub table: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
            table: default_history_table(),
        }
    }
}

fn default_history_capacity() -> usize {
    50
}
fn default_history_table() -> String {
    "run_history".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5055".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Catalog
    let url = config.catalog.url.trim();
    if url.is_empty() {
        bail!("catalog.url must not be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("catalog.url must be an http(s) URL, got '{}'", url);
    }
    if config.catalog.batch_size == 0 {
        bail!("catalog.batch_size must be > 0");
    }
    if config.catalog.max_concurrency == 0 {
        bail!("catalog.max_concurrency must be > 0");
    }
    if config.catalog.timeout_secs == 0 {
        bail!("catalog.timeout_secs must be > 0");
    }

    // Media server
    if config.media_server.enabled && config.media_server.page_size == 0 {
        bail!("media_server.page_size must be > 0");
    }

    // Device
    if config.device.name.trim().is_empty() {
        bail!("device.name must not be empty");
    }

    // Schedule
    let intervals = [
        ("backup_interval_secs", config.schedule.backup_interval_secs),
        ("library_interval_secs", config.schedule.library_interval_secs),
        ("media_interval_secs", config.schedule.media_interval_secs),
        ("heartbeat_interval_secs", config.schedule.heartbeat_interval_secs),
    ];
    for (name, secs) in intervals {
        if secs == 0 {
            bail!("schedule.{} must be > 0", name);
        }
    }

    if config.history.capacity == 0 {
        bail!("history.capacity must be >= 1");
    }

    // Services
    for (name, service) in config.services() {
        for pattern in service.important_files() {
            Glob::new(&pattern).with_context(|| {
                format!("services.{}: invalid important_files glob '{}'", name, pattern)
            })?;
        }
    }

    Ok(())
}
