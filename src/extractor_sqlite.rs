//! Query-store extractor: fixed projections over a service's SQLite file.
//!
//! The DVRs and the indexer manager keep their state in SQLite. Each
//! [`Projection`] is one versioned query; rows come back as raw records
//! keyed by the service's own column names.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::models::RawRecord;
use crate::traits::{SourceExtractor, SourceKind};

/// A fixed query against a known service schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Movies,
    Series,
    QualityProfiles,
    Indexers,
}

impl Projection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Projection::Movies => "movies",
            Projection::Series => "series",
            Projection::QualityProfiles => "quality_profiles",
            Projection::Indexers => "indexers",
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            Projection::Movies => {
                "SELECT m.Id, m.Title, m.OriginalTitle, m.Year, mm.TmdbId, mm.ImdbId, \
                        mm.Overview, mm.Studio, m.QualityProfileId, m.Path, m.Monitored, \
                        mm.Status, mm.Runtime, m.Added, \
                        EXISTS(SELECT 1 FROM MovieFiles mf WHERE mf.MovieId = m.Id) AS HasFile, \
                        (SELECT Size FROM MovieFiles mf WHERE mf.MovieId = m.Id LIMIT 1) AS FileSize, \
                        (SELECT Quality FROM MovieFiles mf WHERE mf.MovieId = m.Id LIMIT 1) AS FileQuality \
                 FROM Movies m \
                 LEFT JOIN MovieMetadata mm ON m.MovieMetadataId = mm.Id \
                 ORDER BY m.Id"
            }
            Projection::Series => {
                "SELECT Id, Title, TitleSlug, Year, TvdbId, ImdbId, Overview, Network, \
                        QualityProfileId, Path, Monitored, Status, SeasonCount, EpisodeCount, \
                        EpisodeFileCount, TotalEpisodeCount, SizeOnDisk, Added \
                 FROM Series ORDER BY Id"
            }
            Projection::QualityProfiles => {
                "SELECT Id, Name, Cutoff, UpgradeAllowed, Items FROM QualityProfiles ORDER BY Id"
            }
            Projection::Indexers => {
                "SELECT Id, Name, Implementation, ConfigContract, Enable, Priority, AppProfileId \
                 FROM Indexers ORDER BY Id"
            }
        }
    }
}

pub struct SqliteExtractor {
    service: String,
    db_path: PathBuf,
    projection: Projection,
    description: String,
}

impl SqliteExtractor {
    pub fn new(service: impl Into<String>, db_path: PathBuf, projection: Projection) -> Self {
        let service = service.into();
        let description = format!(
            "{} from {}",
            projection.as_str().replace('_', " "),
            db_path.display()
        );
        Self {
            service,
            db_path,
            projection,
            description,
        }
    }
}

#[async_trait]
impl SourceExtractor for SqliteExtractor {
    fn name(&self) -> &str {
        &self.service
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> SourceKind {
        SourceKind::QueryStore
    }

    async fn extract(&self) -> Result<Vec<RawRecord>> {
        if !self.db_path.exists() {
            debug!(
                source = %self.service,
                path = %self.db_path.display(),
                "database not present, nothing to extract"
            );
            return Ok(Vec::new());
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| SyncError::unavailable(&self.service, e))?;

        let rows = sqlx::query(self.projection.sql()).fetch_all(&pool).await;
        pool.close().await;
        let rows = rows.map_err(|e| {
            SyncError::unavailable(
                &self.service,
                format!("{} query failed: {}", self.projection.as_str(), e),
            )
        })?;

        let records: Vec<RawRecord> = rows
            .iter()
            .map(|row| RawRecord::new(&self.service, row_to_map(row)))
            .collect();

        info!(
            source = %self.service,
            projection = self.projection.as_str(),
            rows = records.len(),
            "extracted"
        );
        Ok(records)
    }
}

/// Convert a row to JSON by the storage class of each value.
fn row_to_map(row: &SqliteRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => {
                let type_name = raw.type_info().name().to_string();
                match type_name.as_str() {
                    "INTEGER" | "BOOLEAN" => row
                        .try_get::<i64, _>(i)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    "REAL" => row
                        .try_get::<f64, _>(i)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    "BLOB" => row
                        .try_get::<Vec<u8>, _>(i)
                        .map(|b| match String::from_utf8(b) {
                            Ok(s) => Value::from(s),
                            Err(e) => Value::from(hex::encode(e.into_bytes())),
                        })
                        .unwrap_or(Value::Null),
                    _ => row
                        .try_get::<String, _>(i)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                }
            }
            Err(_) => Value::Null,
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePool;
    use std::path::Path;
    use tempfile::TempDir;

    async fn create_db(path: &Path, statements: &[&str]) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        for stmt in statements {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn missing_database_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        let ex = SqliteExtractor::new(
            "prowlarr",
            tmp.path().join("prowlarr.db"),
            Projection::Indexers,
        );
        assert!(ex.extract().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_indexers_with_native_columns() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("prowlarr.db");
        create_db(
            &db,
            &[
                "CREATE TABLE Indexers (Id INTEGER PRIMARY KEY, Name TEXT, Implementation TEXT, \
                 ConfigContract TEXT, Enable INTEGER, Priority INTEGER, AppProfileId INTEGER)",
                "INSERT INTO Indexers VALUES (1, 'Nyaa', 'Cardigann', 'CardigannSettings', 1, 25, 1)",
                "INSERT INTO Indexers VALUES (2, 'Broken', NULL, NULL, 0, NULL, NULL)",
            ],
        )
        .await;

        let ex = SqliteExtractor::new("prowlarr", db, Projection::Indexers);
        let records = ex.extract().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, "prowlarr");
        assert_eq!(records[0].fields["Name"], "Nyaa");
        assert_eq!(records[0].fields["Enable"], 1);
        assert_eq!(records[1].fields["Implementation"], Value::Null);
    }

    #[tokio::test]
    async fn movies_join_metadata_and_files() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("radarr.db");
        create_db(
            &db,
            &[
                "CREATE TABLE MovieMetadata (Id INTEGER PRIMARY KEY, TmdbId INTEGER, ImdbId TEXT, \
                 Overview TEXT, Studio TEXT, Status INTEGER, Runtime INTEGER)",
                "CREATE TABLE Movies (Id INTEGER PRIMARY KEY, Title TEXT, OriginalTitle TEXT, \
                 Year INTEGER, MovieMetadataId INTEGER, QualityProfileId INTEGER, Path TEXT, \
                 Monitored INTEGER, Added TEXT)",
                "CREATE TABLE MovieFiles (Id INTEGER PRIMARY KEY, MovieId INTEGER, Size INTEGER, Quality TEXT)",
                "INSERT INTO MovieMetadata VALUES (10, 603, 'tt0133093', 'Neo', 'WB', 3, 136)",
                "INSERT INTO Movies VALUES (1, 'The Matrix', 'The Matrix', 1999, 10, 4, '/movies/matrix', 1, '2024-01-01')",
                "INSERT INTO Movies VALUES (2, 'Unreleased', NULL, 2030, NULL, 4, NULL, 0, NULL)",
                "INSERT INTO MovieFiles VALUES (1, 1, 123456, '{\"quality\":{\"name\":\"Bluray-1080p\"}}')",
            ],
        )
        .await;

        let records = SqliteExtractor::new("radarr", db, Projection::Movies)
            .extract()
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields["TmdbId"], 603);
        assert_eq!(records[0].fields["HasFile"], 1);
        assert_eq!(records[0].fields["FileSize"], 123456);
        assert_eq!(records[1].fields["HasFile"], 0);
        assert_eq!(records[1].fields["TmdbId"], Value::Null);
    }

    #[tokio::test]
    async fn schema_mismatch_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("sonarr.db");
        create_db(&db, &["CREATE TABLE Unrelated (Id INTEGER)"]).await;

        let err = SqliteExtractor::new("sonarr", db, Projection::Series)
            .extract()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable { ref source_name, .. } if source_name == "sonarr"));
    }
}
