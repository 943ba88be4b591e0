//! HTTP router for the admin API
//!
//! This module defines the axum router that exposes:
//! - Health check
//! - Job status introspection
//! - Manual sync triggers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::sync::orchestrator::{Orchestrator, DAILY_SYNC, HISTORICAL_SYNC};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Orchestrator the handlers inspect and trigger
    pub orchestrator: Arc<Orchestrator>,

    /// Parent token for runs started over HTTP
    pub cancel: CancellationToken,
}

impl AppState {
    /// Create state with a fresh cancellation token
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            cancel: CancellationToken::new(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Build the admin router
///
/// # Arguments
///
/// * `state` - Application state holding the orchestrator
///
/// # Returns
///
/// An axum Router configured with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync/status", get(api_status_handler))
        .route("/api/sync/status/:job", get(api_job_status_handler))
        .route("/api/sync/running", get(api_running_handler))
        .route("/api/sync/historical/:year", post(api_historical_handler))
        .route("/api/sync/:sync_type", post(api_trigger_handler))
        .with_state(state)
}

/// Health check endpoint handler
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// All job statuses plus composite flags
async fn api_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let orch = &state.orchestrator;
    Json(serde_json::json!({
        "statuses": orch.get_all_statuses(),
        "running": orch.get_running_jobs(),
        "daily_running": orch.is_daily_sync_running(),
        "historical_running": orch.is_historical_sync_running(),
        "historical_year": orch.get_historical_sync_year(),
    }))
}

/// Status of a single job
async fn api_job_status_handler(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.get_status(&job) {
        Some(status) => (StatusCode::OK, Json(serde_json::json!({ "status": status }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("No status for {}", job) })),
        ),
    }
}

/// Names of running jobs
async fn api_running_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "jobs": state.orchestrator.get_running_jobs() }))
}

/// Trigger a plan or a single job in the background
async fn api_trigger_handler(
    State(state): State<AppState>,
    Path(sync_type): Path<String>,
) -> impl IntoResponse {
    start_sync(state, sync_type, None)
}

/// Trigger the historical plan for one year in the background
async fn api_historical_handler(
    State(state): State<AppState>,
    Path(year): Path<i32>,
) -> impl IntoResponse {
    if !(1900..=9999).contains(&year) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("Invalid year: {}", year) })),
        );
    }
    start_sync(state, HISTORICAL_SYNC.to_string(), Some(year))
}

fn start_sync(
    state: AppState,
    sync_type: String,
    year: Option<i32>,
) -> (StatusCode, Json<serde_json::Value>) {
    let orch = state.orchestrator;

    if !orch.is_known_sync_type(&sync_type) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Unknown sync type: {}", sync_type) })),
        );
    }

    if sync_type == HISTORICAL_SYNC && year.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("{} requires a year: POST /api/sync/historical/:year", sync_type)
            })),
        );
    }

    let blocked_by = if orch.is_running(&sync_type) {
        Some(sync_type.as_str())
    } else if sync_type == DAILY_SYNC && orch.is_historical_sync_running() {
        Some(HISTORICAL_SYNC)
    } else if sync_type == HISTORICAL_SYNC && orch.is_daily_sync_running() {
        Some(DAILY_SYNC)
    } else {
        None
    };
    if let Some(running) = blocked_by {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": format!("{} is already running", running) })),
        );
    }

    let cancel = state.cancel.child_token();
    let task_type = sync_type.clone();
    tokio::spawn(async move {
        if let Err(e) = orch.trigger_sync_for_year(&task_type, year, cancel).await {
            tracing::warn!(sync_type = %task_type, error = %e, "Manual sync failed");
        }
    });

    tracing::info!(sync_type = %sync_type, year = ?year, "Manual sync triggered");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": format!("Sync triggered for {}", sync_type),
            "sync_type": sync_type,
            "year": year,
        })),
    )
}
