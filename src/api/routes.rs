use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::middleware::request_logging_simple;
use crate::models::{ReversalReport, ReversalRequest, SessionReport, SessionRequest};
use crate::monitor::{MonitorInfo, ResetAlert, StateChange};
use crate::service::{MonitorStart, ResetGuard};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<ResetGuard>,
}

/// Create the API router
pub fn create_router(guard: Arc<ResetGuard>) -> Router {
    let state = AppState { guard };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/sessions", post(post_session))
        .route("/api/reversals", post(post_reversal))
        .route("/api/monitors", get(list_monitors))
        .route(
            "/api/monitors/:group_id",
            post(create_monitor).delete(delete_monitor),
        )
        .route("/api/monitors/:group_id/readings", post(post_reading))
        .layer(middleware::from_fn(request_logging_simple))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus text exposition
async fn get_metrics(State(state): State<AppState>) -> String {
    state.guard.metrics.to_prometheus()
}

/// Run a correction session. Guard faults come back as `200` with `error` set.
async fn post_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionReport>, ApiError> {
    let report = state.guard.run_session(&request).await?;
    Ok(Json(report))
}

async fn post_reversal(
    State(state): State<AppState>,
    Json(request): Json<ReversalRequest>,
) -> Json<ReversalReport> {
    Json(state.guard.handle_reversal(request).await)
}

async fn create_monitor(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<(StatusCode, Json<MonitorInfo>), ApiError> {
    match state.guard.start_monitor(&group_id).await? {
        MonitorStart::Created(info) => Ok((StatusCode::CREATED, Json(info))),
        MonitorStart::AlreadyRunning(info) => Ok((StatusCode::OK, Json(info))),
        MonitorStart::UnknownGroup => Err(ApiError::NotFound(format!("group '{}' not found", group_id))),
        MonitorStart::NoMainCounter => Err(ApiError::BadRequest(format!(
            "no main counter found in group '{}'",
            group_id
        ))),
    }
}

async fn list_monitors(State(state): State<AppState>) -> Json<MonitorsResponse> {
    let monitors = state.guard.monitors.list();
    Json(MonitorsResponse {
        count: monitors.len(),
        monitors,
    })
}

/// Feed one state change to the group's monitor
async fn post_reading(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(change): Json<StateChange>,
) -> Result<Json<ReadingResponse>, ApiError> {
    state
        .guard
        .monitors
        .observe(&group_id, &change)
        .map(|alert| Json(ReadingResponse { alert }))
        .ok_or(ApiError::NotFound(format!("no monitor for group '{}'", group_id)))
}

async fn delete_monitor(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.guard.monitors.teardown(&group_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no monitor for group '{}'", group_id)))
    }
}

// ===== Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct MonitorsResponse {
    count: usize,
    monitors: Vec<MonitorInfo>,
}

#[derive(Serialize)]
struct ReadingResponse {
    alert: Option<ResetAlert>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Request failed: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
