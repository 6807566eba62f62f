//! Recording endpoints

use crate::error::Result;
use crate::recording::RecordingStatus;
use crate::web::AppState;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    state.recordings.start(&id, &session.udid).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.session(&id)?;
    let bytes = state.recordings.stop(&id).await?;
    let disposition = format!("attachment; filename=\"{}.mp4\"", id);
    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RecordingStatus>> {
    state.session(&id)?;
    Ok(Json(state.recordings.status(&id).await))
}

pub async fn cleanup(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let max_age = Duration::from_secs(state.config.recording.emergency_max_age_hours * 3600);
    let removed = state.recordings.cleanup_emergency(max_age);
    Ok(Json(json!({ "removed": removed })))
}
