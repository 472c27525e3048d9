//! REST endpoints for scans and devices.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use super::coordinator::ScanCoordinator;
use super::model::ScanOptions;
use crate::error::ScanError;
use crate::identity::Principal;

/// Build the router for `/api/scan/*`, `/api/devices` and `/health`.
pub fn scan_routes(coordinator: Arc<ScanCoordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/scan/start", post(start_scan))
        .route("/api/scan/status/{id}", get(scan_status))
        .route("/api/scan/history", get(scan_history))
        .route("/api/scan/results/{id}", get(scan_results))
        .route("/api/scan/cancel/{id}", post(cancel_scan))
        .route("/api/devices", get(list_devices))
        .with_state(coordinator)
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScanError::Validation(_) => StatusCode::BAD_REQUEST,
            ScanError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ScanError::Conflict { .. } => StatusCode::CONFLICT,
            ScanError::NotFound { .. } | ScanError::NoResult { .. } => StatusCode::NOT_FOUND,
            ScanError::Database(e) => {
                error!(error = %e, "Scan request failed on storage");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        match &self {
            ScanError::Conflict { active, .. } => (
                status,
                Json(serde_json::json!({ "error": self.to_string(), "active_scan_id": active })),
            )
                .into_response(),
            _ => error_body(status, &self),
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid scan ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(coordinator): State<Arc<ScanCoordinator>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lanscan",
        "worker_connected": coordinator.worker_connected(),
    }))
}

// ── Scans ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StartRequest {
    location_id: String,
    #[serde(flatten)]
    options: ScanOptions,
}

async fn start_scan(
    State(coordinator): State<Arc<ScanCoordinator>>,
    principal: Principal,
    Json(body): Json<StartRequest>,
) -> Response {
    match coordinator
        .start_scan(&principal, &body.location_id, body.options)
        .await
    {
        Ok(job) => {
            info!(scan_id = %job.id, status = %job.status, "Scan start requested via REST");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "scan_id": job.id, "status": job.status })),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn scan_status(
    State(coordinator): State<Arc<ScanCoordinator>>,
    _principal: Principal,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match coordinator.get_job(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    location_id: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn scan_history(
    State(coordinator): State<Arc<ScanCoordinator>>,
    _principal: Principal,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match coordinator
        .list_jobs(query.location_id.as_deref(), query.limit, query.offset)
        .await
    {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn scan_results(
    State(coordinator): State<Arc<ScanCoordinator>>,
    _principal: Principal,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match coordinator.job_result(id).await {
        Ok(changes) => Json(changes).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cancel_scan(
    State(coordinator): State<Arc<ScanCoordinator>>,
    principal: Principal,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match coordinator.cancel_scan(&principal, id).await {
        Ok(status) => Json(serde_json::json!({ "scan_id": id, "status": status })).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Devices ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DevicesQuery {
    location_id: Option<String>,
}

async fn list_devices(
    State(coordinator): State<Arc<ScanCoordinator>>,
    _principal: Principal,
    Query(query): Query<DevicesQuery>,
) -> Response {
    match coordinator.devices(query.location_id.as_deref()).await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => e.into_response(),
    }
}
