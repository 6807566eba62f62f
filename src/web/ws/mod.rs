//! WebSocket endpoints
//!
//! Every endpoint runs the same preamble on open: verify the session,
//! reserve a connection slot, then enter its loop. A failed preamble
//! closes the socket with a distinct close code; an invalid session uses
//! 4004 so clients can tell it apart from capacity denials.

pub mod control;
pub mod logs;
pub mod screenshot;
pub mod ultra;
pub mod video;
pub mod webrtc;

use crate::capture::Frame;
use crate::connections::{ConnectionKind, ScopedConnection};
use crate::error::Error;
use crate::session::Session;
use crate::web::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::Engine;
use log::debug;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;

/// Close code for an unknown or invalidated session.
pub const CLOSE_SESSION_INVALID: u16 = 4004;
/// Close code for the per-session connection cap.
pub const CLOSE_CAP_EXCEEDED: u16 = 4010;
/// Close code for the sliding-window rate limiter.
pub const CLOSE_RATE_LIMITED: u16 = 4029;

/// Shared endpoint preamble. On failure the socket is closed with the
/// appropriate code and `None` is returned.
pub(crate) async fn authorize(
    state: &Arc<AppState>,
    socket: &mut WebSocket,
    session_id: &str,
    kind: ConnectionKind,
    source: IpAddr,
) -> Option<(Session, ScopedConnection)> {
    let Some(session) = state.sessions.get(session_id) else {
        close_with(socket, CLOSE_SESSION_INVALID, "session invalid").await;
        return None;
    };

    match state.connections.clone().try_register(session_id, kind, source) {
        Ok(scoped) => Some((session, scoped)),
        Err(e) => {
            let code = match e {
                Error::RateLimited => CLOSE_RATE_LIMITED,
                Error::CapExceeded => CLOSE_CAP_EXCEEDED,
                _ => 1011,
            };
            debug!(
                "Rejected {} connection for session {}: {}",
                kind.as_str(),
                session_id,
                e
            );
            close_with(socket, code, e.kind()).await;
            None
        }
    }
}

pub(crate) async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Error frame sent on a live socket; never closes it. The
/// `{error, kind, message}` field set is part of the wire contract.
pub(crate) fn error_json(err: &Error) -> String {
    json!({
        "error": true,
        "kind": err.kind(),
        "message": err.to_string(),
    })
    .to_string()
}

/// The frame-push message shape. Field names are part of the wire
/// contract and must not change.
pub(crate) fn frame_message(frame: &Frame, fps: serde_json::Value) -> String {
    json!({
        "type": "video_frame",
        "data": base64::engine::general_purpose::STANDARD.encode(&frame.data),
        "pixel_width": frame.pixel_width,
        "pixel_height": frame.pixel_height,
        "point_width": frame.point_width,
        "point_height": frame.point_height,
        "frame": frame.sequence,
        "timestamp": frame.timestamp_ms,
        "fps": fps,
        "format": "jpeg",
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn frame_message_preserves_wire_field_names() {
        let frame = Frame {
            data: Bytes::from_static(b"\xff\xd8\xff\xd9"),
            pixel_width: 1179,
            pixel_height: 2556,
            point_width: 393,
            point_height: 852,
            sequence: 42,
            timestamp_ms: 1_700_000_000_000,
        };
        let msg = frame_message(&frame, json!(59.5));
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["type"], "video_frame");
        assert_eq!(v["pixel_width"], 1179);
        assert_eq!(v["point_height"], 852);
        assert_eq!(v["frame"], 42);
        assert_eq!(v["fps"], 59.5);
        assert_eq!(v["format"], "jpeg");
        assert!(v["data"].as_str().unwrap().len() > 0);
        assert_eq!(v["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn error_frames_carry_kind_and_message() {
        let msg = error_json(&Error::Protocol("bad tag".into()));
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["error"], true);
        assert_eq!(v["kind"], "protocol");
        assert!(v["message"].as_str().unwrap().contains("bad tag"));
    }
}
