//! Screenshot pull endpoint
//!
//! Pull model: the client requests a refresh and receives one screenshot
//! message. Taps may arrive on the same socket and trigger an implicit
//! refresh after execution.

use super::{authorize, error_json};
use crate::connections::ConnectionKind;
use crate::driver::ScreenshotFormat;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::web::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::Response;
use base64::Engine;
use image::GenericImageView;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
enum ScreenshotRequest {
    Refresh,
    Tap { x: f64, y: f64 },
}

pub async fn handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run(socket, state, session_id, addr))
}

async fn run(mut socket: WebSocket, state: Arc<AppState>, session_id: String, addr: SocketAddr) {
    let Some((session, _scoped)) = authorize(
        &state,
        &mut socket,
        &session_id,
        ConnectionKind::Screenshot,
        addr.ip(),
    )
    .await
    else {
        return;
    };

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = handle_request(&state, &session, &text).await;
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
}

async fn handle_request(state: &AppState, session: &Session, text: &str) -> String {
    let request: ScreenshotRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => return error_json(&Error::Protocol(e.to_string())),
    };

    let result = match request {
        ScreenshotRequest::Refresh => capture(state, session).await,
        ScreenshotRequest::Tap { x, y } => {
            match state.driver.tap(&session.udid, x, y).await {
                // Implicit refresh so the client sees the effect of the tap.
                Ok(()) => capture(state, session).await,
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(reply) => reply,
        Err(e) => error_json(&e),
    }
}

async fn capture(state: &AppState, session: &Session) -> Result<String> {
    let png = state
        .driver
        .screenshot(&session.udid, ScreenshotFormat::Png)
        .await?;
    let (width, height) = image::load_from_memory(&png)
        .map(|img| img.dimensions())
        .unwrap_or((session.pixel_width, session.pixel_height));

    Ok(json!({
        "type": "screenshot",
        "data": base64::engine::general_purpose::STANDARD.encode(&png),
        "width": width,
        "height": height,
    })
    .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_refresh_and_tap() {
        let r: ScreenshotRequest = serde_json::from_str(r#"{"t":"refresh"}"#).unwrap();
        assert!(matches!(r, ScreenshotRequest::Refresh));

        let r: ScreenshotRequest = serde_json::from_str(r#"{"t":"tap","x":10,"y":20}"#).unwrap();
        assert!(matches!(r, ScreenshotRequest::Tap { x, y } if x == 10.0 && y == 20.0));

        assert!(serde_json::from_str::<ScreenshotRequest>(r#"{"t":"zoom"}"#).is_err());
    }
}
