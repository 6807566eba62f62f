//! Screenshot, orientation, URL, location, and media-library endpoints

use super::read_multipart;
use crate::driver::ScreenshotFormat;
use crate::error::{Error, Result};
use crate::web::AppState;
use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn screenshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state.session(&id)?;
    let png = state
        .driver
        .screenshot(&session.udid, ScreenshotFormat::Png)
        .await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

const ORIENTATIONS: [&str; 4] = [
    "portrait",
    "landscape-left",
    "landscape-right",
    "portrait-upside-down",
];

#[derive(Debug, Deserialize)]
pub struct OrientationRequest {
    pub orientation: String,
}

pub async fn orientation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<OrientationRequest>,
) -> Result<Json<Value>> {
    if !ORIENTATIONS.contains(&req.orientation.as_str()) {
        return Err(Error::Protocol(format!(
            "unknown orientation: {}",
            req.orientation
        )));
    }
    let session = state.session(&id)?;
    state
        .driver
        .set_orientation(&session.udid, &req.orientation)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct OpenUrlRequest {
    pub url: String,
}

pub async fn open_url(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<OpenUrlRequest>,
) -> Result<Json<Value>> {
    if req.url.is_empty() {
        return Err(Error::Protocol("url must not be empty".into()));
    }
    let session = state.session(&id)?;
    state.driver.open_url(&session.udid, &req.url).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub latitude: f64,
    pub longitude: f64,
}

pub async fn set_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LocationRequest>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    state
        .driver
        .set_location(&session.udid, req.latitude, req.longitude)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn clear_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    state.driver.clear_location(&session.udid).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationPreset {
    pub name: &'static str,
    pub latitude: f64,
    pub longitude: f64,
}

const LOCATION_PRESETS: [LocationPreset; 8] = [
    LocationPreset { name: "San Francisco", latitude: 37.7749, longitude: -122.4194 },
    LocationPreset { name: "New York", latitude: 40.7128, longitude: -74.0060 },
    LocationPreset { name: "London", latitude: 51.5074, longitude: -0.1278 },
    LocationPreset { name: "Paris", latitude: 48.8566, longitude: 2.3522 },
    LocationPreset { name: "Berlin", latitude: 52.5200, longitude: 13.4050 },
    LocationPreset { name: "Tokyo", latitude: 35.6762, longitude: 139.6503 },
    LocationPreset { name: "Sydney", latitude: -33.8688, longitude: 151.2093 },
    LocationPreset { name: "São Paulo", latitude: -23.5505, longitude: -46.6333 },
];

pub async fn location_presets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LocationPreset>>> {
    state.session(&id)?;
    Ok(Json(LOCATION_PRESETS.to_vec()))
}

pub async fn add_photos(
    state: State<Arc<AppState>>,
    path: Path<String>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    add_media(state, path, multipart).await
}

pub async fn add_videos(
    state: State<Arc<AppState>>,
    path: Path<String>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    add_media(state, path, multipart).await
}

async fn add_media(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let session = state.session(&id)?;
    let form = read_multipart(multipart).await?;
    if form.files.is_empty() {
        return Err(Error::Protocol("no media files in request".into()));
    }
    let paths: Vec<&std::path::Path> = form.files.iter().map(|f| f.path.as_path()).collect();
    state.driver.add_media(&session.udid, &paths).await?;
    Ok(Json(json!({ "count": form.files.len() })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_vocabulary_is_closed() {
        assert!(ORIENTATIONS.contains(&"portrait"));
        assert!(ORIENTATIONS.contains(&"landscape-left"));
        assert!(!ORIENTATIONS.contains(&"upside"));
    }

    #[test]
    fn presets_have_valid_coordinates() {
        for p in &LOCATION_PRESETS {
            assert!((-90.0..=90.0).contains(&p.latitude), "{}", p.name);
            assert!((-180.0..=180.0).contains(&p.longitude), "{}", p.name);
        }
    }
}
