//! Transport layer: REST surface and WebSocket endpoints
//!
//! Every endpoint authenticates the session, reserves a connection slot,
//! acquires the services it needs, and unwinds through the scoped
//! registration guard on every exit path.

pub mod rest;
pub mod ws;

use crate::config::Config;
use crate::connections::ConnectionManager;
use crate::driver::HostDriver;
use crate::error::Error;
use crate::recording::RecordingService;
use crate::resources::ResourceManager;
use crate::session::{Session, SessionManager};
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Uploaded app archives can be large.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Process-wide services, constructed in `main` and shared by reference.
pub struct AppState {
    pub config: Arc<Config>,
    pub driver: Arc<HostDriver>,
    pub sessions: Arc<SessionManager>,
    pub resources: Arc<ResourceManager>,
    pub connections: Arc<ConnectionManager>,
    pub recordings: Arc<RecordingService>,
    pub started_at: Instant,
}

impl AppState {
    /// Resolve a session or fail with `not-found`.
    pub fn session(&self, id: &str) -> Result<Session, Error> {
        self.sessions
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Configuration(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadState(_) => StatusCode::CONFLICT,
            Error::RateLimited | Error::CapExceeded => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Internal error surfaced to client: {}", self);
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Assemble the full REST + WebSocket router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(rest::system::health))
        .route("/stats", get(rest::system::stats))
        .route(
            "/api/sessions/configurations",
            get(rest::sessions::configurations),
        )
        .route("/api/sessions/create", post(rest::sessions::create))
        .route(
            "/api/sessions/",
            get(rest::sessions::list).delete(rest::sessions::delete_all),
        )
        .route(
            "/api/sessions/recover-orphaned",
            post(rest::sessions::recover_orphaned),
        )
        .route("/api/sessions/refresh", get(rest::sessions::refresh))
        .route(
            "/api/sessions/cleanup-recordings",
            post(rest::recording::cleanup),
        )
        .route(
            "/api/sessions/{id}",
            get(rest::sessions::get_one).delete(rest::sessions::delete_one),
        )
        .route("/api/sessions/{id}/apps/install", post(rest::apps::install))
        .route("/api/sessions/{id}/apps", get(rest::apps::list))
        .route(
            "/api/sessions/{id}/apps/{bundle}/launch",
            post(rest::apps::launch),
        )
        .route(
            "/api/sessions/{id}/apps/{bundle}/terminate",
            post(rest::apps::terminate),
        )
        .route(
            "/api/sessions/{id}/apps/{bundle}",
            axum::routing::delete(rest::apps::uninstall),
        )
        .route("/api/sessions/{id}/screenshot", post(rest::media::screenshot))
        .route("/api/sessions/{id}/orientation", post(rest::media::orientation))
        .route("/api/sessions/{id}/url/open", post(rest::media::open_url))
        .route(
            "/api/sessions/{id}/location/set",
            post(rest::media::set_location),
        )
        .route(
            "/api/sessions/{id}/location/clear",
            post(rest::media::clear_location),
        )
        .route(
            "/api/sessions/{id}/location/presets",
            get(rest::media::location_presets),
        )
        .route(
            "/api/sessions/{id}/media/photos/add",
            post(rest::media::add_photos),
        )
        .route(
            "/api/sessions/{id}/media/videos/add",
            post(rest::media::add_videos),
        )
        .route("/api/sessions/{id}/files/push", post(rest::files::push))
        .route("/api/sessions/{id}/files/pull", post(rest::files::pull))
        .route(
            "/api/sessions/{id}/logs/processes",
            get(rest::system::log_processes),
        )
        .route("/api/sessions/{id}/logs/clear", post(rest::system::clear_logs))
        .route(
            "/api/sessions/{id}/recording/start",
            post(rest::recording::start),
        )
        .route(
            "/api/sessions/{id}/recording/stop",
            post(rest::recording::stop),
        )
        .route(
            "/api/sessions/{id}/recording/status",
            get(rest::recording::status),
        )
        .route("/ws/{id}/control", get(ws::control::handler))
        .route("/ws/{id}/video", get(ws::video::handler))
        .route("/ws/{id}/ultra-low-latency", get(ws::ultra::handler))
        .route("/ws/{id}/webrtc", get(ws::webrtc::handler))
        .route("/ws/{id}/screenshot", get(ws::screenshot::handler))
        .route("/ws/{id}/logs", get(ws::logs::handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
