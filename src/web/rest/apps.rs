//! App lifecycle endpoints

use super::read_multipart;
use crate::error::{Error, Result};
use crate::session::InstalledApp;
use crate::web::AppState;
use axum::extract::{Multipart, Path, State};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    let form = read_multipart(multipart).await?;
    let upload = form
        .files
        .first()
        .ok_or_else(|| Error::Protocol("no app archive in request".into()))?;

    let info = state.driver.install_app(&session.udid, &upload.path).await?;
    state
        .sessions
        .record_installed_app(
            &id,
            InstalledApp {
                bundle_id: info.bundle_id.clone(),
                name: info.name,
                installed_at: Utc::now(),
            },
        )
        .await?;

    Ok(Json(json!({ "bundle_id": info.bundle_id })))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<InstalledApp>>> {
    let session = state.session(&id)?;
    let mut apps: Vec<InstalledApp> = session.installed_apps.into_values().collect();
    apps.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
    Ok(Json(apps))
}

pub async fn launch(
    State(state): State<Arc<AppState>>,
    Path((id, bundle)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    let pid = state.driver.launch_app(&session.udid, &bundle).await?;
    Ok(Json(json!({ "pid": pid })))
}

pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Path((id, bundle)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    state.driver.terminate_app(&session.udid, &bundle).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn uninstall(
    State(state): State<Arc<AppState>>,
    Path((id, bundle)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    state.driver.uninstall_app(&session.udid, &bundle).await?;
    state.sessions.remove_installed_app(&id, &bundle).await?;
    Ok(Json(json!({ "ok": true })))
}
