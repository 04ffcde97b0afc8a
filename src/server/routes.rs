//! Pipeline HTTP routes.
//!
//! Endpoints for submitting download requests, polling queue/batch progress,
//! browsing history and stats, cancelling/retrying jobs, and manually
//! triggering a library rescan.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::download_manager::{
    Batch, CancelOutcome, Job, JobState, OrchestrationError,
};

use super::ServerState;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RequestTrackBody {
    pub source_ref: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestPlaylistBody {
    pub playlist_ref: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestSyncBody {
    pub library_ref: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    #[serde(flatten)]
    pub batch: Batch,
    pub percentage: u8,
}

impl From<Batch> for BatchResponse {
    fn from(batch: Batch) -> Self {
        let percentage = batch.percentage();
        Self { batch, percentage }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    /// FIFO position within the job's lane, for queued jobs.
    pub queue_position: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Map internal errors onto HTTP statuses: upstream resolution failures are
/// a bad gateway, everything else is a 500.
fn internal_error(e: anyhow::Error) -> Response {
    let status = if e.downcast_ref::<OrchestrationError>().is_some() {
        StatusCode::BAD_GATEWAY
    } else {
        warn!("Request failed: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{} not found", what),
        }),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn search(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state.manager.search(&query.q, query.limit).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn request_track(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RequestTrackBody>,
) -> Response {
    match state
        .manager
        .request_track(body.source_ref, body.title, body.artist, body.album)
        .await
    {
        Ok(batch) => (StatusCode::ACCEPTED, Json(BatchResponse::from(batch))).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn request_playlist(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RequestPlaylistBody>,
) -> Response {
    match state
        .manager
        .request_playlist(body.playlist_ref, body.description)
        .await
    {
        Ok(batch) => (StatusCode::ACCEPTED, Json(BatchResponse::from(batch))).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn request_sync(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RequestSyncBody>,
) -> Response {
    match state
        .manager
        .request_bulk_sync(body.library_ref, body.description)
        .await
    {
        Ok(batch) => (StatusCode::ACCEPTED, Json(BatchResponse::from(batch))).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_jobs(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    match state.manager.list_jobs(query.state, query.limit, query.offset) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_job(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    match state.manager.get_job(&id) {
        Ok(Some(job)) => {
            let queue_position = state.manager.queue_position(&id).unwrap_or(None);
            Json(JobResponse {
                job,
                queue_position,
            })
            .into_response()
        }
        Ok(None) => not_found("Job"),
        Err(e) => internal_error(e),
    }
}

async fn cancel_job(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    match state.manager.cancel_job(&id).await {
        Ok(CancelOutcome::NotFound) => not_found("Job"),
        Ok(outcome) => Json(serde_json::json!({ "outcome": outcome })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn retry_job(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    match state.manager.retry_job(&id).await {
        Ok(batch) => (StatusCode::ACCEPTED, Json(BatchResponse::from(batch))).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn queue_stats(State(state): State<Arc<ServerState>>) -> Response {
    match state.manager.queue_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn pipeline_stats(State(state): State<Arc<ServerState>>) -> Response {
    match state.manager.pipeline_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_batches(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PaginationQuery>,
) -> Response {
    match state.manager.list_batches(query.limit, query.offset) {
        Ok(batches) => Json(
            batches
                .into_iter()
                .map(BatchResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_batch(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    match state.manager.get_batch(&id) {
        Ok(Some(batch)) => Json(BatchResponse::from(batch)).into_response(),
        Ok(None) => not_found("Batch"),
        Err(e) => internal_error(e),
    }
}

async fn batch_jobs(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    match state.manager.jobs_for_batch(&id) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn batch_history(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.history_for_batch(&id) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Unix timestamp lower bound (inclusive).
    #[serde(default)]
    pub since: Option<i64>,
    /// Unix timestamp upper bound (exclusive); defaults to now.
    #[serde(default)]
    pub until: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

async fn recent_history(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let result = match query.since {
        Some(since) => {
            let until = query
                .until
                .unwrap_or_else(|| chrono::Utc::now().timestamp() + 1);
            state.manager.history_in_range(since, until, query.limit)
        }
        None => state.manager.recent_history(query.limit),
    };
    match result {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn trigger_rescan(State(state): State<Arc<ServerState>>) -> Response {
    state.manager.trigger_rescan().await;
    StatusCode::ACCEPTED.into_response()
}

async fn duplicate_report(State(state): State<Arc<ServerState>>) -> Response {
    Json(state.manager.duplicate_report()).into_response()
}

/// Build the API router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search", get(search))
        .route("/downloads/track", post(request_track))
        .route("/downloads/playlist", post(request_playlist))
        .route("/downloads/sync", post(request_sync))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/retry", post(retry_job))
        .route("/queue/stats", get(queue_stats))
        .route("/stats", get(pipeline_stats))
        .route("/batches", get(list_batches))
        .route("/batches/{id}", get(get_batch))
        .route("/batches/{id}/jobs", get(batch_jobs))
        .route("/batches/{id}/history", get(batch_history))
        .route("/history", get(recent_history))
        .route("/library/rescan", post(trigger_rescan))
        .route("/library/duplicates", get(duplicate_report))
        .with_state(state)
}
