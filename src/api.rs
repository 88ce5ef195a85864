use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use crate::events::ServerEvent;
use crate::models::{ConnectStatus, LeadSource, RunStatus, SearchRequest, WorkerState};
use crate::pacing::PacingUpdate;
use crate::runs::{ExtractionRequest, ExtractionStartError, start_extraction};
use crate::state::AppState;
use crate::worker::WorkerStartError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/session/status", get(session_status))
        .route("/api/search", post(start_search))
        .route("/api/search-navigator", post(start_navigator_search))
        .route("/api/company-employees", post(start_company_search))
        .route("/api/scrape-url", post(scrape_url))
        .route("/api/search/stream", get(search_stream))
        .route("/api/runs", get(list_runs))
        .route("/api/leads", get(list_leads))
        .route("/api/connect/enqueue", post(enqueue_connects))
        .route("/api/connect/retry", post(retry_connect))
        .route("/api/connect/start", post(start_worker))
        .route("/api/connect/stop", post(stop_worker))
        .route("/api/connect/pause", post(pause_worker))
        .route("/api/connect/resume", post(resume_worker))
        .route("/api/connect/status", get(worker_status))
        .route("/api/connect/queue", get(connect_queue))
        .route(
            "/api/settings/connect",
            get(get_connect_settings).put(update_connect_settings),
        )
        .route("/api/events", get(event_stream))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Session ──────────────────────────────────────────────────────────

async fn session_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.driver.session_status().await?;
    Ok(Json(json!({"status": status})))
}

// ── Search ───────────────────────────────────────────────────────────

async fn start_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    begin_extraction(&state, LeadSource::LinkedinSearch, req.describe(), req.max_pages).await
}

async fn start_navigator_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    begin_extraction(&state, LeadSource::SalesNavigator, req.describe(), req.max_pages).await
}

async fn start_company_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.company.trim().is_empty() {
        return Err(ApiError::bad_request("company slug is required"));
    }
    begin_extraction(
        &state,
        LeadSource::CompanyEmployees,
        req.company.trim().to_string(),
        req.max_pages,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct ScrapeUrlRequest {
    url: String,
    #[serde(default)]
    max_pages: Option<u32>,
}

async fn scrape_url(
    State(state): State<AppState>,
    Json(req): Json<ScrapeUrlRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = req.url.trim().to_string();
    if url.is_empty() || !url.contains("linkedin.com") {
        return Err(ApiError::bad_request("please provide a valid LinkedIn URL"));
    }
    let source = LeadSource::from_url(&url);
    begin_extraction(&state, source, url, req.max_pages.unwrap_or(5)).await
}

async fn begin_extraction(
    state: &AppState,
    source: LeadSource,
    input: String,
    max_pages: u32,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = ExtractionRequest {
        source,
        input,
        max_pages: max_pages.clamp(1, 100),
    };
    match start_extraction(state, request).await {
        Ok(run_id) => Ok(Json(json!({
            "status": "started",
            "source": source,
            "run_id": run_id,
        }))),
        Err(ExtractionStartError::AlreadyRunning) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "a search is already running",
        )),
        Err(ExtractionStartError::Internal(err)) => Err(ApiError::internal(err)),
    }
}

async fn search_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream! {
        loop {
            let Some(progress) = state.active_search.snapshot() else {
                yield Ok(Event::default().event("status").data(r#"{"idle": true}"#));
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            let payload = serde_json::to_string(&progress).unwrap_or_else(|_| "{}".to_string());
            if progress.done {
                yield Ok(Event::default().event("done").data(payload));
                break;
            }
            yield Ok(Event::default().event("progress").data(payload));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

// ── Runs ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RunListQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<RunStatus>()
                .map_err(|_| ApiError::bad_request(format!("unknown run status: {raw}")))?,
        ),
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let runs = state.registry.list(status, limit, offset).await?;
    let total = state.registry.count(status).await?;

    Ok(Json(json!({
        "runs": runs,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

// ── Leads ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LeadListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_leads(
    State(state): State<AppState>,
    Query(query): Query<LeadListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);

    let leads = state.db.list_leads(limit, offset).await?;
    let total = state.db.count_leads().await?;

    Ok(Json(json!({
        "leads": leads,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

// ── Connect queue ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    lead_ids: Vec<i64>,
    #[serde(default)]
    note: Option<String>,
}

async fn enqueue_connects(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.lead_ids.is_empty() {
        return Err(ApiError::bad_request("no lead ids provided"));
    }

    let outcome = state
        .db
        .enqueue_connects(&req.lead_ids, req.note.as_deref())
        .await?;
    let stats = state.db.queue_stats().await?;
    let _ = state.events.send(ServerEvent::Queue(stats));
    state.worker.nudge();

    Ok(Json(json!({
        "added": outcome.added(),
        "total_queued": stats.pending,
    })))
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    lead_id: i64,
    #[serde(default)]
    note: Option<String>,
}

async fn retry_connect(
    State(state): State<AppState>,
    Json(req): Json<RetryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .db
        .enqueue_connects(&[req.lead_id], req.note.as_deref())
        .await?;

    if outcome.added() > 0 {
        if !state.worker.is_running() {
            state.worker.start().await.map_err(ApiError::from)?;
        }
        state.worker.nudge();
    }

    Ok(Json(json!({
        "added": outcome.added(),
        "running": state.worker.is_running(),
        "queue": state.db.queue_stats().await?,
    })))
}

// ── Worker control ───────────────────────────────────────────────────

async fn start_worker(State(state): State<AppState>) -> Result<Json<WorkerState>, ApiError> {
    let snapshot = state.worker.start().await?;
    let _ = state.events.send(ServerEvent::Worker(snapshot.clone()));
    Ok(Json(snapshot))
}

async fn stop_worker(State(state): State<AppState>) -> Result<Json<WorkerState>, ApiError> {
    let snapshot = state.worker.stop().await?;
    let _ = state.events.send(ServerEvent::Worker(snapshot.clone()));
    Ok(Json(snapshot))
}

async fn pause_worker(State(state): State<AppState>) -> Result<Json<WorkerState>, ApiError> {
    let snapshot = state.worker.pause().await?;
    let _ = state.events.send(ServerEvent::Worker(snapshot.clone()));
    Ok(Json(snapshot))
}

async fn resume_worker(State(state): State<AppState>) -> Result<Json<WorkerState>, ApiError> {
    let snapshot = state.worker.resume().await?;
    let _ = state.events.send(ServerEvent::Worker(snapshot.clone()));
    Ok(Json(snapshot))
}

async fn worker_status(State(state): State<AppState>) -> Result<Json<WorkerState>, ApiError> {
    Ok(Json(state.worker.status().await?))
}

#[derive(Debug, Deserialize)]
struct QueueListQuery {
    status: Option<String>,
}

async fn connect_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<ConnectStatus>()
                .map_err(|_| ApiError::bad_request(format!("unknown queue status: {raw}")))?,
        ),
    };

    let queue = state.db.list_queue(status, 500).await?;
    let stats = state.db.queue_stats().await?;

    Ok(Json(json!({"queue": queue, "stats": stats})))
}

// ── Settings ─────────────────────────────────────────────────────────

async fn get_connect_settings(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = state.worker.configured_settings().await?;
    Ok(Json(serde_json::to_value(settings).map_err(ApiError::internal)?))
}

async fn update_connect_settings(
    State(state): State<AppState>,
    Json(update): Json<PacingUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = state.worker.update_settings(update).await?;
    Ok(Json(serde_json::to_value(settings).map_err(ApiError::internal)?))
}

// ── Events ───────────────────────────────────────────────────────────

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    yield Ok(Event::default().data(event.as_json_value().to_string()));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged by {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct ApiError {
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

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value)
    }
}

impl From<WorkerStartError> for ApiError {
    fn from(value: WorkerStartError) -> Self {
        match value {
            WorkerStartError::InvalidSettings(message) => Self::bad_request(message),
            WorkerStartError::Internal(err) => Self::internal(err),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message.clone(),
            detail: self.message,
        });
        (self.status, body).into_response()
    }
}
