//! Dashboard JSON API.
//!
//! Read-only views over the coordinator plus a manual trigger. Triggered
//! runs are spawned off the request path; the handler only reports whether
//! the run was accepted.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/status` | Device, partition and per-family state |
//! | `GET`  | `/api/history?family=` | Run summaries, newest first |
//! | `GET`  | `/api/media?type=&limit=` | Catalog media rows, most recently synced first |
//! | `POST` | `/api/sync/{family}` | Start a run: `202` accepted, `409` if one is active |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown pipeline family 'x'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `run_in_progress` (409),
//! `catalog_unavailable` (502).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::coordinator::{RunCoordinator, StatusReport};
use crate::error::SyncError;
use crate::catalog::Row;
use crate::models::{MediaKind, PipelineFamily, RunSummary};

const DEFAULT_MEDIA_LIMIT: usize = 100;
const MAX_MEDIA_LIMIT: usize = 1000;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<RunCoordinator>,
}

/// Build the dashboard router around a shared coordinator.
pub fn router(coordinator: Arc<RunCoordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/status", get(handle_status))
        .route("/api/history", get(handle_history))
        .route("/api/media", get(handle_media))
        .route("/api/sync/{family}", post(handle_sync))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { coordinator })
}

/// Serve the dashboard on `bind` until `shutdown` is cancelled.
pub async fn run_server(
    bind: &str,
    coordinator: Arc<RunCoordinator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "dashboard listening");

    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "run_in_progress".to_string(),
        message: message.into(),
    }
}

fn bad_gateway(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "catalog_unavailable".to_string(),
        message: message.into(),
    }
}

fn parse_family(raw: &str) -> Result<PipelineFamily, AppError> {
    raw.parse::<PipelineFamily>().map_err(bad_request)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/status ============

async fn handle_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.coordinator.status())
}

// ============ GET /api/history ============

#[derive(Deserialize)]
struct HistoryQuery {
    family: Option<String>,
}

#[derive(Serialize)]
struct HistoryResponse {
    runs: Vec<RunSummary>,
}

async fn handle_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let family = query.family.as_deref().map(parse_family).transpose()?;
    Ok(Json(HistoryResponse {
        runs: state.coordinator.history(family),
    }))
}

// ============ GET /api/media ============

#[derive(Deserialize)]
struct MediaQuery {
    #[serde(rename = "type")]
    media_type: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct MediaResponse {
    items: Vec<Row>,
}

async fn handle_media(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<MediaResponse>, AppError> {
    let kind = query
        .media_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(str::parse::<MediaKind>)
        .transpose()
        .map_err(bad_request)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MEDIA_LIMIT)
        .clamp(1, MAX_MEDIA_LIMIT);

    let items = state
        .coordinator
        .media(kind, limit)
        .await
        .map_err(|e| bad_gateway(format!("{:#}", e)))?;
    Ok(Json(MediaResponse { items }))
}

// ============ POST /api/sync/{family} ============

#[derive(Serialize)]
struct SyncAccepted {
    family: PipelineFamily,
    status: String,
}

async fn handle_sync(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<(StatusCode, Json<SyncAccepted>), AppError> {
    let family = parse_family(&raw)?;
    if state.coordinator.is_running(family) {
        return Err(conflict(format!("a {} run is already in progress", family)));
    }

    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        match coordinator.run_once(family).await {
            Ok(_) => {}
            Err(SyncError::RunInProgress(_)) => {
                info!(family = %family, "manual trigger lost the race to another run");
            }
            Err(e) => warn!(family = %family, error = %e, "manual run failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAccepted {
            family,
            status: "accepted".to_string(),
        }),
    ))
}
