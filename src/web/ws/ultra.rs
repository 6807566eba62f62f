//! Ultra-low-latency video endpoint
//!
//! Same message shape as the frame-push endpoint, tuned for minimum
//! end-to-end latency: ring depth 1, 1 ms dequeue timeout, integer FPS.
//! Dropped frames are counted and reported in periodic status messages.

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
use std::time::{Duration, Instant};

/// The latest frame is the only one worth sending.
const RING_CAPACITY: usize = 1;

const RECV_TIMEOUT: Duration = Duration::from_millis(1);

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

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
        ConnectionKind::UltraVideo,
        addr.ip(),
    )
    .await
    else {
        return;
    };

    let client_id = format!("ultra-{}", uuid::Uuid::new_v4());
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

    let mut last_status = Instant::now();
    while !closed.load(Ordering::SeqCst) {
        if let Some(frame) = ring.recv(RECV_TIMEOUT).await {
            let fps = service.rolling_fps().round() as u64;
            let msg = frame_message(&frame, json!(fps));
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let status = json!({
                "type": "status",
                "dropped_frames": ring.dropped(),
                "fps": service.rolling_fps().round() as u64,
            })
            .to_string();
            if sender.send(Message::Text(status.into())).await.is_err() {
                break;
            }
        }
    }

    state.resources.release_video(&session.udid, &client_id);
    reader.abort();
    let _ = sender.close().await;
}
