//! Session lifecycle endpoints

use crate::error::Result;
use crate::session::manager::Configurations;
use crate::session::Session;
use crate::web::AppState;
use axum::extract::{Path, State};
use axum::Json;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn configurations(State(state): State<Arc<AppState>>) -> Result<Json<Configurations>> {
    Ok(Json(state.sessions.list_configurations().await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub device_type: String,
    pub os_version: String,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<Session>> {
    info!("Creating session: {} / {}", req.device_type, req.os_version);
    let session = state.sessions.create(&req.device_type, &req.os_version).await?;
    Ok(Json(session))
}

pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list().await?))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>> {
    // Cross-check the stored UDID against the live device list so a stale
    // record is reported as missing rather than served.
    if !state.sessions.validate(&id).await? {
        return Err(crate::error::Error::NotFound(format!(
            "device for session {} no longer exists",
            id
        )));
    }
    Ok(Json(state.session(&id)?))
}

pub async fn delete_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    // Capture and recording pipelines go first so no child process holds
    // the device while it shuts down.
    state.recordings.discard(&id).await;
    state.resources.detach_device(&session.udid);
    state.sessions.delete(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_all(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    for session in state.sessions.all() {
        state.recordings.discard(&session.id).await;
        state.resources.detach_device(&session.udid);
    }
    let deleted = state.sessions.delete_all().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn recover_orphaned(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Session>>> {
    Ok(Json(state.sessions.recover_orphaned().await?))
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Session>>> {
    Ok(Json(state.sessions.refresh().await?))
}
