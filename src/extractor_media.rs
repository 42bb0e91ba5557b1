//! Remote-API extractor for the media server.
//!
//! Items are listed through `GET /Items`, filtered by type. Episodes of a
//! series come from `GET /Shows/{id}/Episodes` through [`ChildSource`].
//! Both are paged with `StartIndex`/`Limit`. Every call carries
//! the API key in the `X-Emby-Token` header and a client-wide timeout.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::MediaServerConfig;
use crate::error::{Result, SyncError};
use crate::models::RawRecord;
use crate::traits::{ChildSource, SourceExtractor, SourceKind};

const AUTH_HEADER: &str = "X-Emby-Token";

/// Fields requested for movies and series.
const ITEM_FIELDS: &[&str] = &[
    "ProviderIds",
    "Path",
    "MediaSources",
    "Overview",
    "Genres",
    "GenreItems",
    "People",
    "Studios",
    "Tags",
    "DateCreated",
    "PremiereDate",
    "CriticRating",
    "CommunityRating",
    "OfficialRating",
    "Taglines",
    "ExternalUrls",
    "MediaStreams",
    "Width",
    "Height",
    "RunTimeTicks",
    "UserData",
    "RemoteTrailers",
    "OriginalTitle",
    "SortName",
    "HasSubtitles",
    "HasLocalTrailer",
    "IsHD",
    "ParentId",
];

const EPISODE_FIELDS: &[&str] = &["ProviderIds", "Path", "MediaSources", "Overview", "UserData"];

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(rename = "Items", default)]
    items: Vec<Value>,
    #[serde(rename = "TotalRecordCount")]
    total: Option<usize>,
}

/// HTTP client for the media server's read API.
pub struct MediaServerClient {
    service: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    page_size: usize,
}

impl MediaServerClient {
    pub fn new(service: impl Into<String>, config: &MediaServerConfig) -> Result<Self> {
        let service = service.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::unavailable(&service, e))?;
        Ok(Self {
            service,
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key(),
            page_size: config.page_size.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<ItemsPage> {
        let Some(key) = &self.api_key else {
            return Err(SyncError::unavailable(&self.service, "no API key configured"));
        };

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header(AUTH_HEADER, key)
            .query(query)
            .send()
            .await
            .map_err(|e| SyncError::unavailable(&self.service, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::unavailable(
                &self.service,
                format!("GET {} returned {}", path, status),
            ));
        }

        response
            .json::<ItemsPage>()
            .await
            .map_err(|e| SyncError::unavailable(&self.service, format!("bad response from {}: {}", path, e)))
    }

    /// Follow `StartIndex`/`Limit` pages of `path` until exhausted.
    async fn paged(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        let mut start = 0usize;

        loop {
            let mut page_query = query.to_vec();
            page_query.push(("StartIndex", start.to_string()));
            page_query.push(("Limit", self.page_size.to_string()));
            let page = self.get(path, &page_query).await?;

            let count = page.items.len();
            all.extend(page.items);
            start += count;
            debug!(source = %self.service, path, fetched = start, total = ?page.total, "page");

            let exhausted = page.total.is_some_and(|t| start >= t);
            if count < self.page_size || count == 0 || exhausted {
                break;
            }
        }

        Ok(all)
    }

    /// Every item of one type.
    pub async fn items(&self, item_type: &str) -> Result<Vec<Value>> {
        self.paged(
            "/Items",
            &[
                ("IncludeItemTypes", item_type.to_string()),
                ("Recursive", "true".to_string()),
                ("Fields", ITEM_FIELDS.join(",")),
            ],
        )
        .await
    }

    pub async fn episodes(&self, series_id: &str) -> Result<Vec<Value>> {
        self.paged(
            &format!("/Shows/{}/Episodes", series_id),
            &[("Fields", EPISODE_FIELDS.join(","))],
        )
        .await
    }
}

// ============ Extractors ============

/// Lists one item type (`Movie` or `Series`).
pub struct MediaServerExtractor {
    client: Arc<MediaServerClient>,
    item_type: &'static str,
    description: String,
}

impl MediaServerExtractor {
    pub fn new(client: Arc<MediaServerClient>, item_type: &'static str) -> Self {
        let description = format!("{} items from {}", item_type, client.base_url());
        Self {
            client,
            item_type,
            description,
        }
    }
}

#[async_trait]
impl SourceExtractor for MediaServerExtractor {
    fn name(&self) -> &str {
        &self.client.service
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> SourceKind {
        SourceKind::RemoteApi
    }

    async fn extract(&self) -> Result<Vec<RawRecord>> {
        let items = self.client.items(self.item_type).await?;
        info!(source = %self.client.service, item_type = self.item_type, items = items.len(), "extracted");
        Ok(items
            .into_iter()
            .map(|item| RawRecord::from_value(&self.client.service, item))
            .collect())
    }
}

/// Episodes of one series.
pub struct EpisodeSource {
    client: Arc<MediaServerClient>,
}

impl EpisodeSource {
    pub fn new(client: Arc<MediaServerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChildSource for EpisodeSource {
    fn name(&self) -> &str {
        &self.client.service
    }

    async fn children(&self, parent_source_id: &str) -> Result<Vec<RawRecord>> {
        let items = self.client.episodes(parent_source_id).await?;
        Ok(items
            .into_iter()
            .map(|item| {
                let mut record = RawRecord::from_value(&self.client.service, item);
                record
                    .fields
                    .entry("SeriesId")
                    .or_insert_with(|| Value::from(parent_source_id));
                record
            })
            .collect())
    }
}
