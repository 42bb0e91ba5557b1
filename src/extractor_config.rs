//! Config-file extractors: flat XML/JSON service configs and per-user
//! config directories.
//!
//! Missing or unreadable files are skipped with a warning; a service with
//! no readable config simply yields nothing.

use async_trait::async_trait;
use quick_xml::events::Event;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::RawRecord;
use crate::traits::{SourceExtractor, SourceKind};

/// Parse the direct children of the XML root into a flat `name → text`
/// map. Elements without text map to `null`; deeper nesting is ignored.
pub fn parse_flat_xml(xml: &str) -> std::result::Result<Map<String, Value>, String> {
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);

    let mut map = Map::new();
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<(String, String)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 2 {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    current = Some((name, String::new()));
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    map.insert(name, Value::Null);
                }
            }
            Ok(Event::Text(t)) if depth == 2 => {
                if let Some((_, text)) = current.as_mut() {
                    text.push_str(&t.unescape().map_err(|e| e.to_string())?);
                }
            }
            Ok(Event::CData(c)) if depth == 2 => {
                if let Some((_, text)) = current.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    if let Some((name, text)) = current.take() {
                        let value = if text.is_empty() {
                            Value::Null
                        } else {
                            Value::String(text)
                        };
                        map.insert(name, value);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    if depth != 0 {
        return Err("unexpected end of document".to_string());
    }
    Ok(map)
}

/// `config.xml` / `settings.json` are the service's main config; anything
/// else is named after its file stem (`system`, `network`, ...).
pub fn config_type(file: &str) -> String {
    let stem = Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match stem.as_str() {
        "config" | "settings" => "main".to_string(),
        _ => stem,
    }
}

fn parse_file(path: &Path) -> std::result::Result<Value, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("xml") => parse_flat_xml(&content).map(Value::Object),
        Some("json") => serde_json::from_str(&content).map_err(|e| e.to_string()),
        other => Err(format!("unsupported config format {:?}", other)),
    }
}

// ============ Service config files ============

pub struct ConfigFileExtractor {
    service: String,
    dir: PathBuf,
    files: Vec<String>,
    description: String,
}

impl ConfigFileExtractor {
    pub fn new(service: impl Into<String>, dir: PathBuf, files: Vec<String>) -> Self {
        let description = format!("config files ({}) in {}", files.join(", "), dir.display());
        Self {
            service: service.into(),
            dir,
            files,
            description,
        }
    }
}

#[async_trait]
impl SourceExtractor for ConfigFileExtractor {
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
        let mut records = Vec::new();
        for file in &self.files {
            let path = self.dir.join(file);
            if !path.is_file() {
                debug!(source = %self.service, path = %path.display(), "config file not present");
                continue;
            }
            match parse_file(&path) {
                Ok(data) => {
                    let mut fields = Map::new();
                    fields.insert("config_type".into(), Value::from(config_type(file)));
                    fields.insert("file".into(), Value::from(file.as_str()));
                    fields.insert("config_data".into(), data);
                    records.push(RawRecord::new(&self.service, fields));
                }
                Err(e) => {
                    warn!(source = %self.service, path = %path.display(), error = %e, "skipping unreadable config file");
                }
            }
        }
        Ok(records)
    }
}

// ============ User directories ============

/// Reads `<users_dir>/<user>/config.json`, one record per user.
pub struct UserDirectoryExtractor {
    service: String,
    users_dir: PathBuf,
    description: String,
}

impl UserDirectoryExtractor {
    pub fn new(service: impl Into<String>, users_dir: PathBuf) -> Self {
        let description = format!("user configs under {}", users_dir.display());
        Self {
            service: service.into(),
            users_dir,
            description,
        }
    }
}

#[async_trait]
impl SourceExtractor for UserDirectoryExtractor {
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
        let entries = match std::fs::read_dir(&self.users_dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(source = %self.service, path = %self.users_dir.display(), "users directory not present");
                return Ok(Vec::new());
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut records = Vec::new();
        for dir in dirs {
            let config = dir.join("config.json");
            if !config.is_file() {
                continue;
            }
            let parsed = std::fs::read_to_string(&config)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<Value>(&s).map_err(|e| e.to_string()));
            match parsed {
                Ok(Value::Object(mut fields)) => {
                    if !fields.contains_key("Name") {
                        let name = dir
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default();
                        fields.insert("Name".into(), Value::from(name));
                    }
                    records.push(RawRecord::new(&self.service, fields));
                }
                Ok(_) => {
                    warn!(source = %self.service, path = %config.display(), "user config is not a JSON object");
                }
                Err(e) => {
                    warn!(source = %self.service, path = %config.display(), error = %e, "skipping unreadable user config");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn flat_xml_takes_root_children() {
        let xml = r#"<?xml version="1.0"?>
<Config>
  <Port>7878</Port>
  <ApiKey>0123abcd</ApiKey>
  <UrlBase></UrlBase>
  <AuthenticationMethod/>
  <Nested><Inner>x</Inner></Nested>
  <Branch>master &amp; co</Branch>
</Config>"#;
        let map = parse_flat_xml(xml).unwrap();
        assert_eq!(map["Port"], "7878");
        assert_eq!(map["ApiKey"], "0123abcd");
        assert_eq!(map["UrlBase"], Value::Null);
        assert_eq!(map["AuthenticationMethod"], Value::Null);
        assert_eq!(map["Nested"], Value::Null);
        assert_eq!(map["Branch"], "master & co");
        assert!(!map.contains_key("Inner"));
    }

    #[test]
    fn broken_xml_is_an_error() {
        assert!(parse_flat_xml("<Config><Port>1</Config>").is_err());
    }

    #[test]
    fn config_type_names() {
        assert_eq!(config_type("config.xml"), "main");
        assert_eq!(config_type("settings.json"), "main");
        assert_eq!(config_type("config/system.xml"), "system");
        assert_eq!(config_type("config/network.xml"), "network");
    }

    #[tokio::test]
    async fn config_files_skip_missing_and_broken() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("config")).unwrap();
        std::fs::write(
            tmp.path().join("config/system.xml"),
            "<ServerConfiguration><ServerName>den</ServerName></ServerConfiguration>",
        )
        .unwrap();
        std::fs::write(tmp.path().join("config/network.xml"), "<Network><Port>1").unwrap();

        let ex = ConfigFileExtractor::new(
            "jellyfin",
            tmp.path().to_path_buf(),
            vec![
                "config/system.xml".into(),
                "config/network.xml".into(),
                "config/encoding.xml".into(),
            ],
        );
        let records = ex.extract().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["config_type"], "system");
        assert_eq!(records[0].fields["config_data"]["ServerName"], "den");
    }

    #[tokio::test]
    async fn json_config_parsed_whole() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{"debrids":[{"name":"rd","api_key":"k"}],"port":8282}"#,
        )
        .unwrap();
        let ex = ConfigFileExtractor::new(
            "decypharr",
            tmp.path().to_path_buf(),
            vec!["config.json".into()],
        );
        let records = ex.extract().await.unwrap();
        assert_eq!(records[0].fields["config_type"], "main");
        assert_eq!(records[0].fields["config_data"]["port"], 8282);
    }

    #[tokio::test]
    async fn user_directories() {
        let tmp = TempDir::new().unwrap();
        let users = tmp.path().join("users");
        std::fs::create_dir_all(users.join("alice")).unwrap();
        std::fs::create_dir_all(users.join("bob")).unwrap();
        std::fs::create_dir_all(users.join("empty")).unwrap();
        std::fs::write(
            users.join("alice/config.json"),
            r#"{"Id":"a1","Policy":{"IsAdministrator":true}}"#,
        )
        .unwrap();
        std::fs::write(users.join("bob/config.json"), "{not json").unwrap();

        let records = UserDirectoryExtractor::new("jellyfin", users)
            .extract()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["Name"], "alice");
        assert_eq!(records[0].fields["Id"], "a1");
    }

    #[tokio::test]
    async fn missing_users_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let records = UserDirectoryExtractor::new("jellyfin", tmp.path().join("users"))
            .extract()
            .await
            .unwrap();
        assert!(records.is_empty());
    }
}
