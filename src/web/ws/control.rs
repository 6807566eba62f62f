//! Control channel: taps, swipes, buttons, keys, text
//!
//! Messages on one socket execute in arrival order; the per-device mutex in
//! the host driver serializes across sockets. A busy device fails the
//! message after 2 s instead of queueing. Malformed messages are reported
//! on the socket and never close it.

use super::{authorize, error_json};
use crate::connections::ConnectionKind;
use crate::driver::HardwareButton;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::web::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
enum ControlMessage {
    Tap {
        x: f64,
        y: f64,
    },
    Swipe {
        start_x: f64,
        start_y: f64,
        end_x: f64,
        end_y: f64,
        #[serde(default)]
        duration: Option<f64>,
    },
    Button {
        button: HardwareButton,
    },
    Key {
        key: String,
        #[serde(default)]
        duration: Option<f64>,
    },
    Text {
        text: String,
    },
}

impl ControlMessage {
    fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Tap { .. } => "tap",
            ControlMessage::Swipe { .. } => "swipe",
            ControlMessage::Button { .. } => "button",
            ControlMessage::Key { .. } => "key",
            ControlMessage::Text { .. } => "text",
        }
    }
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
        ConnectionKind::Control,
        addr.ip(),
    )
    .await
    else {
        return;
    };

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = handle_message(&state, &session, &text).await;
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
}

async fn handle_message(state: &AppState, session: &Session, text: &str) -> String {
    let cmd: ControlMessage = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(e) => return error_json(&Error::Protocol(e.to_string())),
    };
    let tag = cmd.tag();
    match execute(state, session, cmd).await {
        Ok(()) => json!({ "type": "ack", "t": tag }).to_string(),
        Err(e) => error_json(&e),
    }
}

async fn execute(state: &AppState, session: &Session, cmd: ControlMessage) -> Result<()> {
    let udid = &session.udid;
    match cmd {
        ControlMessage::Tap { x, y } => {
            check_point(session, x, y)?;
            state.driver.tap(udid, x, y).await
        }
        ControlMessage::Swipe {
            start_x,
            start_y,
            end_x,
            end_y,
            duration,
        } => {
            check_point(session, start_x, start_y)?;
            check_point(session, end_x, end_y)?;
            state
                .driver
                .swipe(udid, start_x, start_y, end_x, end_y, duration)
                .await
        }
        ControlMessage::Button { button } => state.driver.press_button(udid, button).await,
        ControlMessage::Key { key, duration } => state.driver.press_key(udid, &key, duration).await,
        ControlMessage::Text { text } => state.driver.input_text(udid, &text).await,
    }
}

/// Input coordinates are logical points and must land on the device.
fn check_point(session: &Session, x: f64, y: f64) -> Result<()> {
    if x < 0.0 || y < 0.0 || x > session.point_width as f64 || y > session.point_height as f64 {
        return Err(Error::Protocol(format!(
            "coordinates ({}, {}) outside {}x{}",
            x, y, session.point_width, session.point_height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;

    #[test]
    fn parses_tagged_control_messages() {
        let msg: ControlMessage = serde_json::from_str(r#"{"t":"tap","x":100,"y":200}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Tap { x, y } if x == 100.0 && y == 200.0));

        let msg: ControlMessage = serde_json::from_str(
            r#"{"t":"swipe","start_x":0,"start_y":0,"end_x":50,"end_y":80,"duration":0.3}"#,
        )
        .unwrap();
        assert_eq!(msg.tag(), "swipe");

        let msg: ControlMessage =
            serde_json::from_str(r#"{"t":"button","button":"volume-down"}"#).unwrap();
        assert!(matches!(
            msg,
            ControlMessage::Button {
                button: HardwareButton::VolumeDown
            }
        ));

        let msg: ControlMessage = serde_json::from_str(r#"{"t":"key","key":"40"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Key { .. }));
    }

    #[test]
    fn unknown_tags_fail_to_parse() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"t":"pinch","x":1}"#).is_err());
        assert!(serde_json::from_str::<ControlMessage>(r#"{"x":1,"y":2}"#).is_err());
    }

    #[test]
    fn coordinates_are_bounded_by_point_size() {
        let session = test_session("s1", "U1");
        assert!(check_point(&session, 100.0, 200.0).is_ok());
        assert!(check_point(&session, 393.0, 852.0).is_ok());
        assert!(check_point(&session, 394.0, 10.0).is_err());
        assert!(check_point(&session, -1.0, 10.0).is_err());
    }
}
