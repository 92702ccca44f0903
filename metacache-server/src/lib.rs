//! HTTP tool-serving layer for metacache.
//!
//! Exposes the query, label, sync-control and statistics surfaces of one
//! environment under `/api/v1`.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use metacache_store::{
    EnvironmentStatistics, FactKind, LabelCache, MetadataStore, QueryResult, SearchHit,
    StoreError, StoreStatistics, MAX_QUERY_ROWS,
};
use metacache_sync::{
    CacheConfig, EntitySearch, LabelResolver, Lookup, MetadataQuery, MetadataSource,
    ResolvedLabel, SmartSyncEngine, SyncError, SyncRequest, SyncResult, SyncSession,
    SyncSessionManager,
};
use metacache_types::{BindingKind, EntityCategory, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 200;

/// Everything the handlers need for one environment.
pub struct AppState {
    pub engine: Arc<SmartSyncEngine>,
    pub sessions: SyncSessionManager,
    pub query: MetadataQuery,
    pub labels: LabelResolver,
    pub language: String,
}

impl AppState {
    /// Registers the environment and wires the components around `store`.
    pub async fn new(
        store: Arc<MetadataStore>,
        source: Arc<dyn MetadataSource>,
        base_url: &str,
        name: &str,
        config: CacheConfig,
    ) -> SyncResult<Self> {
        let cache = LabelCache::new(Arc::clone(&store), config.label_ttl());
        let sessions = SyncSessionManager::new(config.history_capacity);
        let language = config.language.clone();
        let engine = SmartSyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&source),
            base_url,
            name,
            config,
        )
        .await?;
        let query = MetadataQuery::new(store, cache.clone(), engine.environment().id);
        Ok(Self {
            engine: Arc::new(engine),
            sessions,
            query,
            labels: LabelResolver::new(cache, source),
            language,
        })
    }

    pub fn label_cache(&self) -> &LabelCache {
        self.labels.cache()
    }
}

// ── Errors ───────────────────────────────────────────────────────

/// JSON error response: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        let status = match &e {
            SyncError::SessionConflict { .. } => StatusCode::CONFLICT,
            SyncError::SessionNotFound(_) | SyncError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            SyncError::Store(StoreError::QuerySafety(_)) | SyncError::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %e, "request failed");
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_session_id(raw: &str) -> ApiResult<SessionId> {
    SessionId::parse(raw)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid session id: {raw}")))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT)
}

/// Hits answer 200; suggestions and misses answer 404 with the same body
/// shape so callers can fall back to the remote API.
fn lookup_response<T: Serialize>(lookup: Lookup<T>) -> Response {
    let status = if lookup.is_hit() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(lookup)).into_response()
}

// ── Search ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EntitySearchParams {
    q: String,
    category: Option<EntityCategory>,
    read_only: Option<bool>,
    kind: Option<FactKind>,
    limit: Option<usize>,
}

async fn search_entities(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EntitySearchParams>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let filter = EntitySearch {
        category: params.category,
        is_read_only: params.read_only,
        kind: params.kind,
    };
    let hits = state
        .query
        .search_entities(&params.q, &filter, clamp_limit(params.limit))
        .await?;
    Ok(Json(hits))
}

#[derive(Debug, Deserialize)]
struct ActionSearchParams {
    q: String,
    binding_kind: Option<BindingKind>,
    limit: Option<usize>,
}

async fn search_actions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActionSearchParams>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let hits = state
        .query
        .search_actions(&params.q, params.binding_kind, clamp_limit(params.limit))
        .await?;
    Ok(Json(hits))
}

#[derive(Debug, Deserialize)]
struct TextSearchParams {
    q: String,
    limit: Option<usize>,
}

async fn search_enumerations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TextSearchParams>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let hits = state
        .query
        .search_enumerations(&params.q, clamp_limit(params.limit))
        .await?;
    Ok(Json(hits))
}

// ── Point lookups ────────────────────────────────────────────────

async fn entity_schema(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(lookup_response(state.query.get_entity_schema(&name).await?))
}

async fn enumeration_info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(lookup_response(state.query.get_enumeration_info(&name).await?))
}

// ── Labels ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LabelParams {
    language: Option<String>,
}

async fn get_label(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LabelParams>,
) -> ApiResult<Json<ResolvedLabel>> {
    let language = params.language.unwrap_or_else(|| state.language.clone());
    let version = state.query.current_version().await?.map(|v| v.id);
    state
        .labels
        .resolve(version, &id, &language)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("label {id} ({language}) not found")))
}

#[derive(Debug, Deserialize)]
struct LabelBatchRequest {
    ids: Vec<String>,
    language: Option<String>,
}

async fn get_labels_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LabelBatchRequest>,
) -> ApiResult<Json<HashMap<String, ResolvedLabel>>> {
    let language = request.language.unwrap_or_else(|| state.language.clone());
    let version = state.query.current_version().await?.map(|v| v.id);
    let labels = state
        .labels
        .resolve_batch(version, &request.ids, &language)
        .await?;
    Ok(Json(labels))
}

// ── Sync control ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStarted {
    pub session_id: SessionId,
}

/// An empty body runs a default `full` sync.
async fn start_sync(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SyncStarted>)> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("invalid sync request: {e}"))
        })?
    };
    let session_id = state.sessions.start(Arc::clone(&state.engine), request)?;
    Ok((StatusCode::ACCEPTED, Json(SyncStarted { session_id })))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SyncSession>> {
    Json(state.sessions.list())
}

async fn session_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SyncSession>> {
    let id = parse_session_id(&id)?;
    state
        .sessions
        .get_progress(id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("sync session not found: {id}")))
}

async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_session_id(&id)?;
    if state.sessions.cancel(id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::not_found(format!("no active sync session {id}")))
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn session_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<SyncSession>> {
    Json(state.sessions.history(params.limit.unwrap_or(usize::MAX)))
}

// ── Statistics and ad-hoc queries ────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub store: StoreStatistics,
    pub environments: Vec<EnvironmentStatistics>,
}

async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsResponse>> {
    Ok(Json(StatsResponse {
        store: state.query.statistics().await?,
        environments: state.query.environment_statistics().await?,
    }))
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    sql: String,
    max_rows: Option<usize>,
}

async fn readonly_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryResult>> {
    let result = state
        .query
        .execute_readonly_query(&request.sql, request.max_rows.unwrap_or(MAX_QUERY_ROWS))
        .await?;
    Ok(Json(result))
}

/// Build the HTTP API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/entities/search", get(search_entities))
        .route("/api/v1/entities/{name}/schema", get(entity_schema))
        .route("/api/v1/actions/search", get(search_actions))
        .route("/api/v1/enumerations/search", get(search_enumerations))
        .route("/api/v1/enumerations/{name}", get(enumeration_info))
        .route("/api/v1/labels/batch", post(get_labels_batch))
        .route("/api/v1/labels/{id}", get(get_label))
        .route("/api/v1/sync", post(start_sync))
        .route("/api/v1/sync/sessions", get(list_sessions))
        .route(
            "/api/v1/sync/sessions/{id}",
            get(session_progress).delete(cancel_session),
        )
        .route("/api/v1/sync/history", get(session_history))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/query", post(readonly_query))
        .with_state(state)
}
