//! PostgREST-style catalog client.
//!
//! Tables live under `<url>/rest/v1/<table>`, provisioning functions under
//! `<url>/functions/v1/<name>`. In `schema` tenancy every request carries
//! `Accept-Profile`/`Content-Profile` headers naming the partition; in
//! `device_row` tenancy requests go to the shared schema and rows carry a
//! `device_id` column instead.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;

use super::{scalar_text, CatalogWriter, ProvisionOutcome, Row, Selection};
use crate::config::CatalogConfig;
use crate::error::CatalogError;
use crate::models::{TenancyMode, TenantPartition};

pub struct RestCatalog {
    client: Client,
    base_url: String,
    service_key: String,
    provision_function: String,
    partition_table: String,
    devices_table: String,
}

impl RestCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key().unwrap_or_default(),
            provision_function: config.provision_function.clone(),
            partition_table: config.partition_table.clone(),
            devices_table: config.devices_table.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
    }

    /// Attach auth plus schema routing for the partition.
    fn routed(&self, builder: RequestBuilder, partition: &TenantPartition) -> RequestBuilder {
        let builder = self.authed(builder);
        match partition.mode {
            TenancyMode::Schema => builder
                .header("Accept-Profile", &partition.partition_ref)
                .header("Content-Profile", &partition.partition_ref),
            TenancyMode::DeviceRow => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, CatalogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CatalogError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn first_id(response: Response) -> Result<Option<String>, CatalogError> {
        let rows: Vec<Value> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("id"))
            .filter(|id| !id.is_null())
            .map(scalar_text))
    }

    async fn patch_by_id(
        &self,
        partition: &TenantPartition,
        table: &str,
        id: &str,
        row: &Row,
    ) -> Result<(), CatalogError> {
        let response = self
            .routed(self.client.patch(self.table_url(table)), partition)
            .header("Prefer", "return=minimal")
            .query(&[("id", format!("eq.{}", id))])
            .json(row)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Union of the keys of every row, so a bulk write names all columns even
/// when individual rows omit absent fields.
fn column_list(rows: &[Row]) -> String {
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .collect();
    columns.into_iter().collect::<Vec<_>>().join(",")
}

#[async_trait]
impl CatalogWriter for RestCatalog {
    async fn upsert(
        &self,
        partition: &TenantPartition,
        table: &str,
        conflict_columns: &[&str],
        rows: &[Row],
    ) -> Result<(), CatalogError> {
        if rows.is_empty() {
            return Ok(());
        }
        let response = self
            .routed(self.client.post(self.table_url(table)), partition)
            .header(
                "Prefer",
                "resolution=merge-duplicates,missing=default,return=minimal",
            )
            .query(&[
                ("on_conflict", conflict_columns.join(",")),
                ("columns", column_list(rows)),
            ])
            .json(rows)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn find_id(
        &self,
        partition: &TenantPartition,
        table: &str,
        key: &[(&str, Value)],
    ) -> Result<Option<String>, CatalogError> {
        let mut query: Vec<(String, String)> = vec![
            ("select".to_string(), "id".to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        for (column, value) in key {
            query.push((column.to_string(), format!("eq.{}", scalar_text(value))));
        }
        let response = self
            .routed(self.client.get(self.table_url(table)), partition)
            .query(&query)
            .send()
            .await?;
        Self::first_id(response).await
    }

    async fn insert(
        &self,
        partition: &TenantPartition,
        table: &str,
        row: &Row,
    ) -> Result<String, CatalogError> {
        let response = self
            .routed(self.client.post(self.table_url(table)), partition)
            .header("Prefer", "return=representation")
            .query(&[("select", "id")])
            .json(row)
            .send()
            .await?;
        Self::first_id(response)
            .await?
            .ok_or_else(|| CatalogError::Decode(format!("insert into {} returned no id", table)))
    }

    async fn update(
        &self,
        partition: &TenantPartition,
        table: &str,
        id: &str,
        row: &Row,
    ) -> Result<(), CatalogError> {
        self.patch_by_id(partition, table, id, row).await
    }

    async fn provision(&self, partition_name: &str) -> Result<ProvisionOutcome, CatalogError> {
        let url = format!("{}/functions/v1/{}", self.base_url, self.provision_function);
        let response = self
            .authed(self.client.post(url))
            .json(&json!({ "name": partition_name }))
            .send()
            .await?;
        Self::check(response)
            .await?
            .json::<ProvisionOutcome>()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))
    }

    async fn touch_partition(
        &self,
        partition: &TenantPartition,
        metadata: &Row,
    ) -> Result<(), CatalogError> {
        match partition.mode {
            TenancyMode::DeviceRow => {
                self.patch_by_id(partition, &self.devices_table, &partition.partition_ref, metadata)
                    .await
            }
            TenancyMode::Schema => {
                let response = self
                    .routed(self.client.get(self.table_url(&self.partition_table)), partition)
                    .query(&[("select", "id"), ("limit", "1")])
                    .send()
                    .await?;
                match Self::first_id(response).await? {
                    Some(id) => {
                        self.patch_by_id(partition, &self.partition_table, &id, metadata)
                            .await
                    }
                    None => {
                        let mut row = metadata.clone();
                        row.entry("created_at")
                            .or_insert_with(|| Value::from(Utc::now().to_rfc3339()));
                        self.insert(partition, &self.partition_table, &row)
                            .await
                            .map(|_| ())
                    }
                }
            }
        }
    }

    async fn select(
        &self,
        partition: &TenantPartition,
        table: &str,
        selection: &Selection<'_>,
    ) -> Result<Vec<Row>, CatalogError> {
        let columns = if selection.columns.is_empty() {
            "*".to_string()
        } else {
            selection.columns.join(",")
        };
        let mut query: Vec<(String, String)> = vec![
            ("select".to_string(), columns),
            ("order".to_string(), format!("{}.desc", selection.newest_first_by)),
            ("limit".to_string(), selection.limit.to_string()),
        ];
        for (column, value) in &selection.filter {
            query.push((column.to_string(), format!("eq.{}", scalar_text(value))));
        }
        let response = self
            .routed(self.client.get(self.table_url(table)), partition)
            .query(&query)
            .send()
            .await?;
        Self::check(response)
            .await?
            .json::<Vec<Row>>()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))
    }

    async fn append(
        &self,
        partition: &TenantPartition,
        table: &str,
        row: &Row,
    ) -> Result<(), CatalogError> {
        let response = self
            .routed(self.client.post(self.table_url(table)), partition)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Seen {
        requests: Vec<(HashMap<String, String>, HashMap<String, String>, Value)>,
    }

    type Shared = Arc<Mutex<Seen>>;

    fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn catalog(url: String) -> RestCatalog {
        let config: CatalogConfig = toml::from_str(&format!(
            "url = \"{}\"\nkey_env = \"STACKSYNC_TEST_REST_KEY_UNSET\"",
            url
        ))
        .unwrap();
        RestCatalog::new(&config).unwrap()
    }

    fn schema_partition() -> TenantPartition {
        TenantPartition {
            device_identity: "dev".into(),
            partition_ref: "living_room".into(),
            mode: TenancyMode::Schema,
        }
    }

    #[tokio::test]
    async fn upsert_sends_conflict_target_and_routing() {
        let seen: Shared = Arc::default();
        let app = Router::new()
            .route(
                "/rest/v1/indexers",
                post(
                    |State(seen): State<Shared>,
                     headers: HeaderMap,
                     Query(q): Query<HashMap<String, String>>,
                     Json(body): Json<Value>| async move {
                        seen.lock().unwrap().requests.push((header_map(&headers), q, body));
                        StatusCode::CREATED
                    },
                ),
            )
            .with_state(seen.clone());
        let url = serve(app).await;

        let mut a = Row::new();
        a.insert("indexer_id".into(), json!(1));
        a.insert("name".into(), json!("Nyaa"));
        let mut b = Row::new();
        b.insert("indexer_id".into(), json!(2));
        b.insert("priority".into(), json!(25));

        catalog(url)
            .upsert(&schema_partition(), "indexers", &["indexer_id"], &[a, b])
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let (headers, query, body) = &seen.requests[0];
        assert_eq!(query["on_conflict"], "indexer_id");
        assert_eq!(query["columns"], "indexer_id,name,priority");
        assert_eq!(headers["content-profile"], "living_room");
        assert_eq!(headers["accept-profile"], "living_room");
        assert!(headers["prefer"].contains("resolution=merge-duplicates"));
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejection_carries_status() {
        let app = Router::new().route(
            "/rest/v1/media",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad column") }),
        );
        let url = serve(app).await;
        let err = catalog(url)
            .upsert(&schema_partition(), "media", &["source_item_id"], &[Row::new()])
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(err.to_string().contains("bad column"));
    }

    #[tokio::test]
    async fn find_id_distinguishes_missing() {
        let app = Router::new().route(
            "/rest/v1/media",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("source_item_id").map(String::as_str) == Some("eq.abc") {
                    Json(json!([{ "id": 17 }]))
                } else {
                    Json(json!([]))
                }
            }),
        );
        let url = serve(app).await;
        let cat = catalog(url);
        let p = schema_partition();
        assert_eq!(
            cat.find_id(&p, "media", &[("source_item_id", json!("abc"))])
                .await
                .unwrap(),
            Some("17".to_string())
        );
        assert_eq!(
            cat.find_id(&p, "media", &[("source_item_id", json!("zzz"))])
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn select_sends_order_limit_and_filter() {
        let seen: Shared = Arc::default();
        let app = Router::new()
            .route(
                "/rest/v1/media",
                get(
                    |State(seen): State<Shared>,
                     headers: HeaderMap,
                     Query(q): Query<HashMap<String, String>>| async move {
                        seen.lock()
                            .unwrap()
                            .requests
                            .push((header_map(&headers), q, Value::Null));
                        Json(json!([{ "id": 3, "title": "Heat" }]))
                    },
                ),
            )
            .with_state(seen.clone());
        let url = serve(app).await;

        let rows = catalog(url)
            .select(
                &schema_partition(),
                "media",
                &Selection {
                    columns: &["id", "title"],
                    filter: vec![("media_type", json!("movie"))],
                    newest_first_by: "updated_at",
                    limit: 5,
                },
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Heat");

        let seen = seen.lock().unwrap();
        let (headers, query, _) = &seen.requests[0];
        assert_eq!(query["select"], "id,title");
        assert_eq!(query["order"], "updated_at.desc");
        assert_eq!(query["limit"], "5");
        assert_eq!(query["media_type"], "eq.movie");
        assert_eq!(headers["accept-profile"], "living_room");
    }

    #[tokio::test]
    async fn unreachable_catalog_is_transport_error() {
        let err = catalog("http://127.0.0.1:1".into())
            .provision("den")
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Transport(_)));
        assert!(!err.is_rejection());
    }
}
