//! Stable device identity.
//!
//! Resolution order, first hit wins:
//!
//! 1. `device.identity` from config
//! 2. the persisted identity file
//! 3. SHA-256 of the primary NIC's MAC address, first 32 hex chars
//! 4. a random UUID (simple form)
//!
//! Identities derived in steps 3 and 4 are written back to the identity
//! file so the next start finds them in step 2. Persisting is best-effort.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::normalize::sha256_hex;

/// Length of identities derived from a MAC address.
const MAC_IDENTITY_LEN: usize = 32;

/// Where identity candidates are read from.
#[derive(Debug, Clone)]
pub struct IdentitySources {
    pub explicit: Option<String>,
    pub identity_file: PathBuf,
    /// sysfs file holding the MAC address of the primary interface.
    pub mac_file: PathBuf,
}

impl IdentitySources {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            explicit: config.identity.clone(),
            identity_file: config.identity_file.clone(),
            mac_file: Path::new("/sys/class/net")
                .join(&config.interface)
                .join("address"),
        }
    }
}

/// Where the resolved identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    Config,
    File,
    MacAddress,
    Random,
}

impl IdentityOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityOrigin::Config => "config",
            IdentityOrigin::File => "identity file",
            IdentityOrigin::MacAddress => "mac address",
            IdentityOrigin::Random => "random",
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn identity_from_mac(mac: &str) -> Option<String> {
    let mac = mac.trim().to_ascii_lowercase();
    if mac.is_empty() || mac.chars().all(|c| c == '0' || c == ':') {
        return None;
    }
    let mut hash = sha256_hex(mac.as_bytes());
    hash.truncate(MAC_IDENTITY_LEN);
    Some(hash)
}

fn persist(path: &Path, identity: &str) {
    let result = path
        .parent()
        .map(std::fs::create_dir_all)
        .transpose()
        .and_then(|_| std::fs::write(path, identity));
    match result {
        Ok(()) => debug!(path = %path.display(), "persisted device identity"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not persist device identity"),
    }
}

/// Resolve the identity of this device.
pub fn resolve_identity(sources: &IdentitySources) -> (String, IdentityOrigin) {
    if let Some(id) = sources
        .explicit
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return (id.to_string(), IdentityOrigin::Config);
    }

    if let Some(id) = read_trimmed(&sources.identity_file) {
        return (id, IdentityOrigin::File);
    }

    let (id, origin) = match read_trimmed(&sources.mac_file).and_then(|m| identity_from_mac(&m)) {
        Some(id) => (id, IdentityOrigin::MacAddress),
        None => (Uuid::new_v4().simple().to_string(), IdentityOrigin::Random),
    };
    info!(origin = origin.as_str(), "generated device identity");
    persist(&sources.identity_file, &id);
    (id, origin)
}
