//! File transfer endpoints

use super::read_multipart;
use crate::error::{Error, Result};
use crate::web::AppState;
use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn push(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    let form = read_multipart(multipart).await?;
    let upload = form
        .files
        .first()
        .ok_or_else(|| Error::Protocol("no file in request".into()))?;
    let device_path = form
        .fields
        .get("device_path")
        .ok_or_else(|| Error::Protocol("device_path is required".into()))?;
    let bundle_id = form.fields.get("bundle_id").map(|s| s.as_str());

    state
        .driver
        .push_file(&session.udid, &upload.path, device_path, bundle_id)
        .await?;
    Ok(Json(json!({ "filename": upload.file_name })))
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub device_path: String,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

pub async fn pull(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PullRequest>,
) -> Result<impl IntoResponse> {
    let session = state.session(&id)?;
    let bytes = state
        .driver
        .pull_file(&session.udid, &req.device_path, req.bundle_id.as_deref())
        .await?;

    let filename = req.filename.unwrap_or_else(|| {
        req.device_path
            .rsplit('/')
            .next()
            .unwrap_or("file")
            .to_string()
    });
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}
