//! Backup extractor: captures a service's important files as one blob.
//!
//! Patterns are relative to the service directory. Plain paths are read
//! directly; patterns containing glob metacharacters walk the directory.
//! Only UTF-8 files are captured.

use async_trait::async_trait;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::models::{BackupFile, RawRecord};
use crate::normalize::sha256_hex;
use crate::traits::{SourceExtractor, SourceKind};

/// Files larger than this are left out of the blob.
const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;

pub struct BackupExtractor {
    service: String,
    dir: PathBuf,
    patterns: Vec<String>,
    description: String,
}

impl BackupExtractor {
    pub fn new(service: impl Into<String>, dir: PathBuf, patterns: Vec<String>) -> Self {
        let description = format!("backup of {} in {}", patterns.join(", "), dir.display());
        Self {
            service: service.into(),
            dir,
            patterns,
            description,
        }
    }

    fn read_file(&self, path: &Path, rel: &str) -> Option<BackupFile> {
        let size = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(e) => {
                warn!(source = %self.service, file = rel, error = %e, "cannot stat file");
                return None;
            }
        };
        if size > MAX_FILE_BYTES {
            warn!(source = %self.service, file = rel, size, "file too large for backup");
            return None;
        }
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(source = %self.service, file = rel, error = %e, "cannot read file");
                return None;
            }
        };
        let checksum = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        match String::from_utf8(bytes) {
            Ok(content) => Some(BackupFile {
                content,
                checksum,
                size,
            }),
            Err(_) => {
                warn!(source = %self.service, file = rel, "skipping non UTF-8 file");
                None
            }
        }
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn build_globset(patterns: &[&String]) -> std::result::Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[async_trait]
impl SourceExtractor for BackupExtractor {
    fn name(&self) -> &str {
        &self.service
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ConfigFile
    }

    async fn extract(&self) -> Result<Vec<RawRecord>> {
        if !self.dir.is_dir() {
            debug!(source = %self.service, path = %self.dir.display(), "service directory not present");
            return Ok(Vec::new());
        }

        let mut files: BTreeMap<String, BackupFile> = BTreeMap::new();

        let (globs, literals): (Vec<&String>, Vec<&String>) =
            self.patterns.iter().partition(|p| is_glob(p));

        for rel in literals {
            let path = self.dir.join(rel);
            if !path.is_file() {
                debug!(source = %self.service, file = %rel, "important file not present");
                continue;
            }
            if let Some(file) = self.read_file(&path, rel) {
                files.insert(rel.clone(), file);
            }
        }

        if !globs.is_empty() {
            let set = build_globset(&globs).map_err(|e| SyncError::unavailable(&self.service, e))?;
            for entry in WalkDir::new(&self.dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let rel = path
                    .strip_prefix(&self.dir)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .replace('\\', "/");
                if files.contains_key(&rel) || !set.is_match(&rel) {
                    continue;
                }
                if let Some(file) = self.read_file(path, &rel) {
                    files.insert(rel, file);
                }
            }
        }

        if files.is_empty() {
            debug!(source = %self.service, "no important files captured");
            return Ok(Vec::new());
        }

        info!(source = %self.service, files = files.len(), "captured backup files");

        let files = serde_json::to_value(&files).map_err(|e| SyncError::unavailable(&self.service, e))?;
        let mut fields = Map::new();
        fields.insert("captured_at".into(), Value::from(Utc::now().to_rfc3339()));
        fields.insert("files".into(), files);
        Ok(vec![RawRecord::new(&self.service, fields)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn captures_literal_and_globbed_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("bazarr");
        std::fs::create_dir_all(dir.join("config")).unwrap();
        std::fs::create_dir_all(dir.join("db")).unwrap();
        std::fs::write(dir.join("config/config.yaml"), "general:\n  port: 6767\n").unwrap();
        std::fs::write(dir.join("config/extra.ini"), "[x]\n").unwrap();
        std::fs::write(dir.join("db/bazarr.db"), [0xff, 0xfe, 0x00]).unwrap();

        let ex = BackupExtractor::new(
            "bazarr",
            dir,
            vec![
                "config/config.yaml".into(),
                "config/*.ini".into(),
                "db/*".into(),
                "missing.json".into(),
            ],
        );
        let records = ex.extract().await.unwrap();
        assert_eq!(records.len(), 1);
        let files = records[0].fields["files"].as_object().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(
            files["config/config.yaml"]["checksum"],
            sha256_hex(b"general:\n  port: 6767\n")
        );
        assert_eq!(files["config/extra.ini"]["size"], 4);
        assert!(!files.contains_key("db/bazarr.db"));
    }

    #[tokio::test]
    async fn nothing_read_means_no_record() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("radarr")).unwrap();
        let ex = BackupExtractor::new(
            "radarr",
            tmp.path().join("radarr"),
            vec!["config.xml".into()],
        );
        assert!(ex.extract().await.unwrap().is_empty());

        let ex = BackupExtractor::new("sonarr", tmp.path().join("sonarr"), vec!["config.xml".into()]);
        assert!(ex.extract().await.unwrap().is_empty());
    }
}
