//! Frame-push video endpoint
//!
//! Pulls frames from the client's dedicated ring and pushes them as JSON
//! messages. A consumer that falls behind wall clock has stale frames
//! skipped so it catches up; the sequence gap tells the client frames were
//! dropped.

use super::{authorize, frame_message};
use crate::connections::ConnectionKind;
use crate::web::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ring depth for the standard frame-push transport.
const RING_CAPACITY: usize = 3;

/// Frame dequeue timeout.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

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
        ConnectionKind::Video,
        addr.ip(),
    )
    .await
    else {
        return;
    };

    let client_id = format!("video-{}", uuid::Uuid::new_v4());
    let (service, ring) = state.resources.get_video(&session, &client_id, RING_CAPACITY);

    let (mut sender, mut receiver) = socket.split();
    let closed = Arc::new(AtomicBool::new(false));
    let closed_reader = closed.clone();
    let reader = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        closed_reader.store(true, Ordering::SeqCst);
    });

    while !closed.load(Ordering::SeqCst) {
        let Some(frame) = ring.recv(RECV_TIMEOUT).await else {
            continue;
        };

        // Slow-consumer catch-up: skip frames already two periods stale.
        let period_ms = 1000 / service.settings().fps.max(1) as u64;
        let age_ms = crate::capture::frame::now_ms().saturating_sub(frame.timestamp_ms);
        if age_ms > period_ms * 2 {
            continue;
        }

        let msg = frame_message(&frame, json!(service.rolling_fps()));
        if sender.send(Message::Text(msg.into())).await.is_err() {
            break;
        }
    }

    state.resources.release_video(&session.udid, &client_id);
    reader.abort();
    let _ = sender.close().await;
}
