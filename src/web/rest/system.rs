//! Health, statistics, and device-log endpoints
//!
//! The health/stats surface is read-only and side-effect free; it is the
//! operator's monitoring contract.

use crate::driver::ProcessInfo;
use crate::error::Result;
use crate::web::AppState;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "totals": {
            "sessions": state.sessions.session_count(),
            "connections": state.connections.total_connections(),
            "capture_services": state.resources.service_count(),
            "active_recordings": state.recordings.active_count().await,
        },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "sessions": state.sessions.session_count(),
        "connections": state.connections.stats(),
        "resources": state.resources.stats(),
    }))
}

pub async fn log_processes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ProcessInfo>>> {
    let session = state.session(&id)?;
    Ok(Json(state.driver.list_processes(&session.udid).await?))
}

pub async fn clear_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    state.driver.clear_logs(&session.udid).await?;
    Ok(Json(json!({ "ok": true })))
}
