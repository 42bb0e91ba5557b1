//! Raw record → canonical record mapping.
//!
//! Every function here is pure: the same raw record and context always give
//! the same output. A record that cannot form its natural key (or has no
//! title) becomes [`Normalized::Skip`] with a reason, which the coordinator
//! counts as `skipped`.
//!
//! Media-server items live in [`crate::normalize_media`]; this module
//! covers DVR libraries, users, service configs and backup blobs, plus the
//! field accessors shared by both.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{
    BackupFile, BackupRecord, CanonicalRecord, EntityType, Indexer, MediaUser, MonitoredMovie,
    MonitoredSeries, QualityProfile, RawRecord, ServiceConfig,
};
use crate::normalize_media;
use crate::redact::redact;

/// Outcome of normalizing one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(CanonicalRecord),
    Skip(String),
}

/// Inputs shared by every normalizer call in a run.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    /// Stamped into `updated_at` on every record.
    pub now: DateTime<Utc>,
    /// Public base URL of the media server, used for image links.
    pub media_server_url: Option<String>,
}

impl NormalizeContext {
    pub fn new(media_server_url: Option<String>) -> Self {
        Self {
            now: Utc::now(),
            media_server_url,
        }
    }
}

/// Map a raw record onto the canonical shape for `entity`.
pub fn normalize(raw: &RawRecord, entity: EntityType, ctx: &NormalizeContext) -> Normalized {
    match entity {
        EntityType::Media => normalize_media::media(raw, ctx),
        EntityType::Episode => normalize_media::episode(raw, ctx),
        EntityType::MonitoredMovie => monitored_movie(raw, ctx),
        EntityType::MonitoredSeries => monitored_series(raw, ctx),
        EntityType::QualityProfile => quality_profile(raw, ctx),
        EntityType::Indexer => indexer(raw, ctx),
        EntityType::User => user(raw, ctx),
        EntityType::ServiceConfig => service_config(raw, ctx),
        EntityType::Backup => backup(raw, ctx),
    }
}

// ============ Field accessors ============

/// Non-empty, trimmed string.
pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer from a JSON number or numeric string (provider ids arrive as strings).
pub(crate) fn int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Boolean from JSON bools, SQLite 0/1 integers, or `"true"`/`"false"`.
pub(crate) fn flag(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// JSON payload, parsing strings that hold serialized JSON. Empty arrays
/// and objects are treated as absent.
pub(crate) fn json(value: Option<&Value>) -> Option<Value> {
    let value = match value? {
        Value::String(s) => serde_json::from_str(s).ok()?,
        Value::Null => return None,
        other => other.clone(),
    };
    match &value {
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        _ => Some(value),
    }
}

/// Non-empty list of strings, or absent.
pub(crate) fn string_list(items: impl IntoIterator<Item = Option<String>>) -> Option<Vec<String>> {
    let list: Vec<String> = items.into_iter().flatten().collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

// ============ Checksums ============

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Checksum over the sorted `(path, file checksum)` pairs, so equal file
/// sets give equal checksums regardless of capture order.
pub fn content_checksum(files: &BTreeMap<String, BackupFile>) -> String {
    let mut hasher = Sha256::new();
    for (path, file) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.checksum.as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

// ============ DVR libraries ============

fn monitored_movie(raw: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(id) = int(raw.get("Id")) else {
        return Normalized::Skip("movie without Id".into());
    };
    let Some(title) = text(raw.get("Title")) else {
        return Normalized::Skip(format!("movie {} has no title", id));
    };

    Normalized::Record(CanonicalRecord::MonitoredMovie(MonitoredMovie {
        source_movie_id: id,
        title,
        original_title: text(raw.get("OriginalTitle")),
        year: int(raw.get("Year")).filter(|y| *y > 0),
        tmdb_id: int(raw.get("TmdbId")).filter(|id| *id > 0),
        imdb_id: text(raw.get("ImdbId")),
        overview: text(raw.get("Overview")),
        studio: text(raw.get("Studio")),
        quality_profile_id: int(raw.get("QualityProfileId")),
        path: text(raw.get("Path")),
        monitored: flag(raw.get("Monitored")).unwrap_or(false),
        status: raw.get("Status").cloned(),
        runtime_minutes: int(raw.get("Runtime")),
        has_file: flag(raw.get("HasFile")).unwrap_or(false),
        file_size: int(raw.get("FileSize")),
        file_quality: json(raw.get("FileQuality")),
        added_at: text(raw.get("Added")),
        updated_at: ctx.now,
    }))
}

fn monitored_series(raw: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(id) = int(raw.get("Id")) else {
        return Normalized::Skip("series without Id".into());
    };
    let Some(title) = text(raw.get("Title")) else {
        return Normalized::Skip(format!("series {} has no title", id));
    };

    Normalized::Record(CanonicalRecord::MonitoredSeries(MonitoredSeries {
        source_series_id: id,
        title,
        title_slug: text(raw.get("TitleSlug")),
        year: int(raw.get("Year")).filter(|y| *y > 0),
        tvdb_id: int(raw.get("TvdbId")).filter(|id| *id > 0),
        imdb_id: text(raw.get("ImdbId")),
        overview: text(raw.get("Overview")),
        network: text(raw.get("Network")),
        quality_profile_id: int(raw.get("QualityProfileId")),
        path: text(raw.get("Path")),
        monitored: flag(raw.get("Monitored")).unwrap_or(false),
        status: raw.get("Status").cloned(),
        season_count: int(raw.get("SeasonCount")),
        episode_count: int(raw.get("EpisodeCount")),
        episode_file_count: int(raw.get("EpisodeFileCount")),
        total_episode_count: int(raw.get("TotalEpisodeCount")),
        size_on_disk: int(raw.get("SizeOnDisk")),
        added_at: text(raw.get("Added")),
        updated_at: ctx.now,
    }))
}

fn quality_profile(raw: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(id) = int(raw.get("Id")) else {
        return Normalized::Skip(format!("{} quality profile without Id", raw.source));
    };
    let Some(name) = text(raw.get("Name")) else {
        return Normalized::Skip(format!("{} quality profile {} has no name", raw.source, id));
    };

    Normalized::Record(CanonicalRecord::QualityProfile(QualityProfile {
        service_name: raw.source.clone(),
        profile_id: id,
        name,
        cutoff: int(raw.get("Cutoff")),
        upgrade_allowed: flag(raw.get("UpgradeAllowed")),
        items: json(raw.get("Items")),
        updated_at: ctx.now,
    }))
}

fn indexer(raw: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(id) = int(raw.get("Id")) else {
        return Normalized::Skip("indexer without Id".into());
    };
    let Some(name) = text(raw.get("Name")) else {
        return Normalized::Skip(format!("indexer {} has no name", id));
    };

    Normalized::Record(CanonicalRecord::Indexer(Indexer {
        indexer_id: id,
        name,
        implementation: text(raw.get("Implementation")),
        config_contract: text(raw.get("ConfigContract")),
        enabled: flag(raw.get("Enable")).unwrap_or(false),
        priority: int(raw.get("Priority")),
        app_profile_id: int(raw.get("AppProfileId")),
        updated_at: ctx.now,
    }))
}

// ============ Users and configs ============

fn user(raw: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(id) = text(raw.get("Id")) else {
        return Normalized::Skip("user config without Id".into());
    };
    let Some(name) = text(raw.get("Name")) else {
        return Normalized::Skip(format!("user {} has no name", id));
    };
    let policy = raw.get("Policy");

    Normalized::Record(CanonicalRecord::User(MediaUser {
        user_id: id,
        username: name,
        is_administrator: flag(policy.and_then(|p| p.get("IsAdministrator"))).unwrap_or(false),
        is_disabled: flag(policy.and_then(|p| p.get("IsDisabled"))).unwrap_or(false),
        policy: json(policy).map(|p| redact(&p)),
        updated_at: ctx.now,
    }))
}

fn service_config(raw: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(config_type) = text(raw.get("config_type")) else {
        return Normalized::Skip(format!("{} config without type", raw.source));
    };
    let Some(data) = json(raw.get("config_data")) else {
        return Normalized::Skip(format!("{}/{} config is empty", raw.source, config_type));
    };

    Normalized::Record(CanonicalRecord::ServiceConfig(ServiceConfig {
        service_name: raw.source.clone(),
        config_type,
        config_data: redact(&data),
        updated_at: ctx.now,
    }))
}

// ============ Backups ============

fn backup(raw: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let files: BTreeMap<String, BackupFile> = match raw.get("files") {
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(files) => files,
            Err(e) => return Normalized::Skip(format!("{} backup files malformed: {}", raw.source, e)),
        },
        None => BTreeMap::new(),
    };
    if files.is_empty() {
        return Normalized::Skip(format!("{} backup captured no files", raw.source));
    }

    let captured_at = raw
        .get("captured_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(ctx.now);

    Normalized::Record(CanonicalRecord::Backup(BackupRecord {
        service_name: raw.source.clone(),
        captured_at,
        content_checksum: content_checksum(&files),
        size_bytes: files.values().map(|f| f.size).sum(),
        files,
        updated_at: ctx.now,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> NormalizeContext {
        NormalizeContext::new(None)
    }

    fn raw(source: &str, value: Value) -> RawRecord {
        RawRecord::from_value(source, value)
    }

    fn unwrap_record(n: Normalized) -> CanonicalRecord {
        match n {
            Normalized::Record(r) => r,
            Normalized::Skip(reason) => panic!("unexpected skip: {}", reason),
        }
    }

    #[test]
    fn accessors_accept_source_quirks() {
        assert_eq!(int(Some(&json!("603"))), Some(603));
        assert_eq!(int(Some(&json!(12.0))), Some(12));
        assert_eq!(flag(Some(&json!(1))), Some(true));
        assert_eq!(flag(Some(&json!("False"))), Some(false));
        assert_eq!(text(Some(&json!("  "))), None);
        assert_eq!(json(Some(&json!("[]"))), None);
        assert_eq!(json(Some(&json!("[{\"a\":1}]"))), Some(json!([{ "a": 1 }])));
        assert_eq!(json(Some(&json!("not json"))), None);
    }

    #[test]
    fn monitored_movie_maps_fields() {
        let r = raw(
            "radarr",
            json!({
                "Id": 7, "Title": "Arrival", "Year": 2016, "TmdbId": 329865,
                "ImdbId": "tt2543164", "Monitored": 1, "HasFile": 0,
                "FileQuality": "{\"quality\":{\"name\":\"Bluray-1080p\"}}"
            }),
        );
        let CanonicalRecord::MonitoredMovie(m) = unwrap_record(normalize(&r, EntityType::MonitoredMovie, &ctx())) else {
            panic!("wrong variant");
        };
        assert_eq!(m.source_movie_id, 7);
        assert!(m.monitored);
        assert!(!m.has_file);
        assert_eq!(m.file_quality.unwrap()["quality"]["name"], "Bluray-1080p");
    }

    #[test]
    fn missing_title_skips() {
        let r = raw("radarr", json!({ "Id": 7, "Title": "" }));
        assert!(matches!(
            normalize(&r, EntityType::MonitoredMovie, &ctx()),
            Normalized::Skip(_)
        ));
        let r = raw("sonarr", json!({ "Title": "No id" }));
        assert!(matches!(
            normalize(&r, EntityType::MonitoredSeries, &ctx()),
            Normalized::Skip(_)
        ));
    }

    #[test]
    fn quality_profile_key_includes_service() {
        let r = raw(
            "sonarr",
            json!({ "Id": 4, "Name": "HD-1080p", "Cutoff": 9, "UpgradeAllowed": 1, "Items": "[]" }),
        );
        let record = unwrap_record(normalize(&r, EntityType::QualityProfile, &ctx()));
        let key = record.natural_key();
        assert_eq!(key.fingerprint(), "sonarr/4");
        let CanonicalRecord::QualityProfile(p) = record else {
            panic!("wrong variant");
        };
        assert_eq!(p.items, None);
        assert_eq!(p.upgrade_allowed, Some(true));
    }

    #[test]
    fn user_policy_is_redacted() {
        let r = raw(
            "jellyfin",
            json!({
                "Id": "u1", "Name": "alice",
                "Policy": { "IsAdministrator": true, "AuthenticationProviderId": "x", "Password": "pw" }
            }),
        );
        let CanonicalRecord::User(u) = unwrap_record(normalize(&r, EntityType::User, &ctx())) else {
            panic!("wrong variant");
        };
        assert!(u.is_administrator);
        assert!(!u.is_disabled);
        assert_eq!(u.policy.unwrap()["Password"], crate::redact::MASK);
    }

    #[test]
    fn service_config_is_redacted() {
        let r = raw(
            "radarr",
            json!({ "config_type": "main", "config_data": { "Port": "7878", "ApiKey": "secret-key" } }),
        );
        let record = unwrap_record(normalize(&r, EntityType::ServiceConfig, &ctx()));
        let row = Value::Object(record.to_row()).to_string();
        assert!(!row.contains("secret-key"));
        assert!(row.contains("7878"));
    }

    #[test]
    fn backup_checksum_ignores_capture_order() {
        let a = raw(
            "radarr",
            json!({ "files": {
                "config.xml": { "content": "<Config/>", "checksum": sha256_hex(b"<Config/>"), "size": 9 },
                "extra.json": { "content": "{}", "checksum": sha256_hex(b"{}"), "size": 2 }
            }}),
        );
        let b = raw(
            "radarr",
            json!({ "files": {
                "extra.json": { "content": "{}", "checksum": sha256_hex(b"{}"), "size": 2 },
                "config.xml": { "content": "<Config/>", "checksum": sha256_hex(b"<Config/>"), "size": 9 }
            }}),
        );
        let (CanonicalRecord::Backup(ra), CanonicalRecord::Backup(rb)) = (
            unwrap_record(normalize(&a, EntityType::Backup, &ctx())),
            unwrap_record(normalize(&b, EntityType::Backup, &ctx())),
        ) else {
            panic!("wrong variant");
        };
        assert_eq!(ra.content_checksum, rb.content_checksum);
        assert_eq!(ra.size_bytes, 11);
    }

    #[test]
    fn backup_checksum_changes_with_content() {
        let mut files = BTreeMap::new();
        files.insert(
            "config.xml".to_string(),
            BackupFile {
                content: "a".into(),
                checksum: sha256_hex(b"a"),
                size: 1,
            },
        );
        let before = content_checksum(&files);
        files.get_mut("config.xml").unwrap().checksum = sha256_hex(b"b");
        assert_ne!(before, content_checksum(&files));
    }

    #[test]
    fn empty_backup_skips() {
        let r = raw("bazarr", json!({ "files": {} }));
        assert!(matches!(
            normalize(&r, EntityType::Backup, &ctx()),
            Normalized::Skip(_)
        ));
    }
}
