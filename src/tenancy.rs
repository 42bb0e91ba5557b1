//! Tenancy resolution: device identity → remote partition.
//!
//! The partition is resolved on first use and cached for the life of the
//! process in a [`tokio::sync::OnceCell`]. A failed resolution is not
//! cached, so the next run tries again.
//!
//! | Mode         | Partition ref             | Provisioning                          |
//! |--------------|---------------------------|---------------------------------------|
//! | `schema`     | sanitized device name     | provisioning function, create-if-absent |
//! | `device_row` | surrogate id of device row | probe `devices` by uuid, insert if absent |

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::catalog::{CatalogWriter, Row};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::models::{TenancyMode, TenantPartition};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lowercase the device name and replace anything outside `[a-z0-9_]`.
pub fn sanitize_schema_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct TenancyResolver {
    catalog: Arc<dyn CatalogWriter>,
    mode: TenancyMode,
    device_name: String,
    identity: String,
    devices_table: String,
    partition: OnceCell<TenantPartition>,
}

impl TenancyResolver {
    pub fn new(catalog: Arc<dyn CatalogWriter>, config: &Config, identity: String) -> Self {
        Self {
            catalog,
            mode: config.catalog.tenancy,
            device_name: config.device.name.clone(),
            identity,
            devices_table: config.catalog.devices_table.clone(),
            partition: OnceCell::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The partition, if already resolved.
    pub fn cached(&self) -> Option<&TenantPartition> {
        self.partition.get()
    }

    /// Resolve (and on first success, cache) this device's partition.
    pub async fn resolve(&self) -> Result<TenantPartition> {
        self.partition
            .get_or_try_init(|| async {
                match self.mode {
                    TenancyMode::Schema => self.provision_schema().await,
                    TenancyMode::DeviceRow => self.register_device().await,
                }
            })
            .await
            .cloned()
    }

    async fn provision_schema(&self) -> Result<TenantPartition> {
        let schema = sanitize_schema_name(&self.device_name);
        info!(device = %self.device_name, schema = %schema, "provisioning partition");

        let outcome = self
            .catalog
            .provision(&schema)
            .await
            .map_err(|e| SyncError::TenancyUnavailable(format!("provisioning {}: {}", schema, e)))?;

        if outcome.success {
            info!(schema = %schema, tables = ?outcome.tables, "partition ready");
        } else {
            warn!(
                schema = %schema,
                error = outcome.error.as_deref().unwrap_or("unspecified"),
                "provisioning reported failure, continuing"
            );
        }

        Ok(TenantPartition {
            device_identity: self.identity.clone(),
            partition_ref: schema,
            mode: TenancyMode::Schema,
        })
    }

    async fn register_device(&self) -> Result<TenantPartition> {
        info!(device = %self.device_name, identity = %self.identity, "registering device");

        // Lookups against the shared tables need no partition yet.
        let shared = TenantPartition {
            device_identity: self.identity.clone(),
            partition_ref: String::new(),
            mode: TenancyMode::DeviceRow,
        };
        let key = [("device_uuid", Value::from(self.identity.as_str()))];
        let unavailable = |e: crate::error::CatalogError| {
            SyncError::TenancyUnavailable(format!("device registration: {}", e))
        };

        let existing = self
            .catalog
            .find_id(&shared, &self.devices_table, &key)
            .await
            .map_err(unavailable)?;

        let row = self.device_row();
        let id = match existing {
            Some(id) => {
                if let Err(e) = self
                    .catalog
                    .update(&shared, &self.devices_table, &id, &row)
                    .await
                {
                    warn!(device_id = %id, error = %e, "device metadata update failed");
                }
                id
            }
            None => self
                .catalog
                .insert(&shared, &self.devices_table, &row)
                .await
                .map_err(unavailable)?,
        };

        info!(device_id = %id, "device registered");
        Ok(TenantPartition {
            device_identity: self.identity.clone(),
            partition_ref: id,
            mode: TenancyMode::DeviceRow,
        })
    }

    fn device_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("device_uuid".into(), Value::from(self.identity.as_str()));
        row.insert("hostname".into(), Value::from(self.device_name.as_str()));
        row.insert("version".into(), Value::from(VERSION));
        row.insert("last_seen".into(), Value::from(Utc::now().to_rfc3339()));
        row
    }

    /// Refresh last-seen metadata of the partition.
    pub async fn heartbeat(&self) -> Result<()> {
        let partition = self.resolve().await?;
        let mut metadata = Row::new();
        metadata.insert("last_seen".into(), Value::from(Utc::now().to_rfc3339()));
        metadata.insert("status".into(), Value::from("active"));
        metadata.insert("version".into(), Value::from(VERSION));

        self.catalog
            .touch_partition(&partition, &metadata)
            .await
            .map_err(|e| SyncError::TenancyUnavailable(format!("heartbeat: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, ProvisionOutcome};

    fn config(tenancy: &str, name: &str) -> Config {
        toml::from_str(&format!(
            "[device]\nname = \"{}\"\n[catalog]\nurl = \"http://catalog.test\"\ntenancy = \"{}\"\n",
            name, tenancy
        ))
        .unwrap()
    }

    #[test]
    fn schema_names_are_sanitized() {
        assert_eq!(sanitize_schema_name("Living-Room Pi"), "living_room_pi");
        assert_eq!(sanitize_schema_name("den_2"), "den_2");
        assert_eq!(sanitize_schema_name("Café"), "caf_");
    }

    #[tokio::test]
    async fn schema_mode_provisions_once() {
        let catalog = Arc::new(MemoryCatalog::new());
        let resolver = TenancyResolver::new(catalog.clone(), &config("schema", "Den Pi"), "abc".into());

        let first = resolver.resolve().await.unwrap();
        let second = resolver.resolve().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.partition_ref, "den_pi");
        assert_eq!(catalog.provision_calls(), vec!["den_pi".to_string()]);
    }

    #[tokio::test]
    async fn unsuccessful_provisioning_still_proceeds() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.set_provision_reply(ProvisionOutcome {
            success: false,
            error: Some("schema exists".into()),
            ..Default::default()
        });
        let resolver = TenancyResolver::new(catalog, &config("schema", "den"), "abc".into());
        assert_eq!(resolver.resolve().await.unwrap().partition_ref, "den");
    }

    #[tokio::test]
    async fn unreachable_catalog_is_not_cached() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.fail_provisioning();
        let resolver = TenancyResolver::new(catalog.clone(), &config("schema", "den"), "abc".into());

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, SyncError::TenancyUnavailable(_)));
        assert!(resolver.cached().is_none());
        assert!(resolver.resolve().await.is_err());
        assert_eq!(catalog.provision_calls().len(), 2);
    }

    #[tokio::test]
    async fn device_row_mode_registers_once_across_processes() {
        let catalog = Arc::new(MemoryCatalog::new());

        let a = TenancyResolver::new(catalog.clone(), &config("device_row", "den"), "uuid-1".into());
        let first = a.resolve().await.unwrap();
        assert_eq!(first.mode, TenancyMode::DeviceRow);

        // A fresh process with the same identity reuses the device row.
        let b = TenancyResolver::new(catalog.clone(), &config("device_row", "den"), "uuid-1".into());
        let second = b.resolve().await.unwrap();
        assert_eq!(first.partition_ref, second.partition_ref);

        let devices = catalog.rows_in("public", "devices");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["hostname"], "den");
    }

    #[tokio::test]
    async fn heartbeat_touches_partition() {
        let catalog = Arc::new(MemoryCatalog::new());
        let resolver = TenancyResolver::new(catalog.clone(), &config("schema", "den"), "abc".into());
        resolver.heartbeat().await.unwrap();
        assert_eq!(catalog.touch_calls(), 1);
        let meta = catalog.rows_in("den", "partition_meta");
        assert_eq!(meta[0]["status"], "active");
    }
}
