use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{QueueError, Result};
use crate::queue::{Job, JobQueue, JobState, QueueStatus, Run};
use crate::store::{JobFilter, DEFAULT_LIST_LIMIT};

/// Upper bound on any listing the dashboard returns.
const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct DashboardState {
    pub queue: JobQueue,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub job_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// `QueueError` rendered as a JSON HTTP error.
pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(value: QueueError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::Validation(_) => StatusCode::BAD_REQUEST,
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Dashboard request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Read-only routes. Nothing here mutates jobs.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/runs", get(list_runs_handler))
        .route("/api/dlq", get(list_dlq_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(
    addr: SocketAddr,
    state: DashboardState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting dashboard server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Dashboard server stopped");
    Ok(())
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIMIT)
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

/// Run a queue call off the runtime threads; SQLite may block on a busy lock.
async fn blocking<T, F>(state: &DashboardState, op: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce(&JobQueue) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let queue = state.queue.clone();
    let result = tokio::task::spawn_blocking(move || op(&queue))
        .await
        .map_err(QueueError::from)?;
    Ok(result?)
}

async fn status_handler(
    State(state): State<DashboardState>,
) -> std::result::Result<Json<QueueStatus>, ApiError> {
    Ok(Json(blocking(&state, |queue| queue.status()).await?))
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<JobsQuery>,
) -> std::result::Result<Json<Vec<Job>>, ApiError> {
    let state_filter = query
        .state
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<JobState>)
        .transpose()?;
    let filter = JobFilter {
        state: state_filter,
        limit: clamp_limit(query.limit),
    };
    Ok(Json(blocking(&state, move |queue| queue.list(&filter)).await?))
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Job>, ApiError> {
    Ok(Json(blocking(&state, move |queue| queue.get(&id)).await?))
}

async fn list_runs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<RunsQuery>,
) -> std::result::Result<Json<Vec<Run>>, ApiError> {
    let limit = clamp_limit(query.limit);
    let runs = blocking(&state, move |queue| queue.runs(query.job_id.as_deref(), limit)).await?;
    Ok(Json(runs))
}

async fn list_dlq_handler(
    State(state): State<DashboardState>,
    Query(query): Query<JobsQuery>,
) -> std::result::Result<Json<Vec<Job>>, ApiError> {
    let limit = clamp_limit(query.limit);
    Ok(Json(blocking(&state, move |queue| queue.dlq().list_dead_jobs(limit)).await?))
}
