use crate::{connection::handle_socket, hub::InsightHub, store::StoreHandle};
use aoc_core::sql_guard::{GuardError, QueryGuard, DEFAULT_MAX_ROWS};
use aoc_storage::StorageError;
use axum::{
    extract::{
        rejection::JsonRejection, ws::WebSocketUpgrade, ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tracing::{info, warn};

const DEFAULT_PAGE: u64 = 20;
const MAX_PAGE: u64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<InsightHub>,
    pub store: StoreHandle,
    pub guard: QueryGuard,
    pub started: Instant,
    pub allow_remote: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(session_detail))
        .route("/api/sql", post(run_query))
        .route("/api/raw-data/query", post(run_query))
        .route("/api/raw-data/tables", get(list_tables))
        .route("/api/raw-data", get(browse_raw_data))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Guard(GuardError),
    Storage(StorageError),
    BadRequest(String),
    NotFound(&'static str),
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        ApiError::Guard(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Storage(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Guard(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Storage(StorageError::InvalidTable(_)) => {
                (StatusCode::BAD_REQUEST, "Invalid table name".to_string())
            }
            ApiError::Storage(err) => {
                warn!(event = "api_storage_error", error = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !state.allow_remote && !addr.ip().is_loopback() {
        warn!(event = "remote_refused", remote = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(hub, socket, addr))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.connection_count().await,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct PageParams {
    limit: Option<String>,
    offset: Option<String>,
}

impl PageParams {
    fn limit(&self) -> u64 {
        self.limit
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|value| value.clamp(1, MAX_PAGE as i64) as u64)
            .unwrap_or(DEFAULT_PAGE)
    }

    fn offset(&self) -> u64 {
        self.offset
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|value| value.max(0) as u64)
            .unwrap_or(0)
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Response, ApiError> {
    let (limit, offset) = (params.limit() as usize, params.offset() as usize);
    let sessions = state
        .store
        .run(move |store| store.recent_sessions(limit, offset))
        .await?;
    Ok(Json(sessions).into_response())
}

async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let detail = state
        .store
        .run(move |store| store.session_detail(&session_id))
        .await?;
    match detail {
        Some(detail) => Ok(Json(detail).into_response()),
        None => Err(ApiError::NotFound("Session not found")),
    }
}

#[derive(Debug, Default, Deserialize)]
struct QueryRequest {
    #[serde(default)]
    query: Option<String>,
}

async fn run_query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let raw = request.query.unwrap_or_default();
    let guarded = state.guard.guard(&raw).map_err(|err| {
        info!(event = "query_rejected", reason = %err);
        err
    })?;
    let rows = state
        .store
        .run(move |store| store.readonly_query(&guarded))
        .await?;
    Ok(Json(json!({ "rows": rows })).into_response())
}

#[derive(Debug, Serialize)]
struct TableName {
    name: String,
}

async fn list_tables(State(state): State<AppState>) -> Result<Response, ApiError> {
    let tables: Vec<TableName> = state
        .store
        .run(|store| store.table_names())
        .await?
        .into_iter()
        .map(|name| TableName { name })
        .collect();
    Ok(Json(json!({ "tables": tables })).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct BrowseParams {
    table: Option<String>,
}

async fn browse_raw_data(
    State(state): State<AppState>,
    Query(params): Query<BrowseParams>,
) -> Result<Response, ApiError> {
    let Some(table) = params.table.filter(|table| !table.is_empty()) else {
        return list_tables(State(state)).await;
    };
    let rows = state
        .store
        .run(move |store| store.browse_table(&table, DEFAULT_MAX_ROWS))
        .await?;
    Ok(Json(json!({ "rows": rows })).into_response())
}
