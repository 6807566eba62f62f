//! Log streaming endpoint
//!
//! Follows the device log as a lazy, infinite stream. A per-connection
//! predicate (severity floor plus substring match) is applied server-side
//! and can be updated over the socket at any time.

use super::{authorize, error_json};
use crate::connections::ConnectionKind;
use crate::driver::{io::parse_log_line, LogEntry};
use crate::error::Error;
use crate::web::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::warn;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LogsInbound {
    Filter {
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        filter: Option<String>,
    },
}

/// Per-connection log predicate.
#[derive(Debug, Default, Clone)]
struct LogFilter {
    min_level: Option<u8>,
    substring: Option<String>,
}

impl LogFilter {
    fn update(&mut self, level: Option<String>, filter: Option<String>) {
        self.min_level = level.as_deref().map(level_rank);
        self.substring = filter.map(|f| f.to_lowercase()).filter(|f| !f.is_empty());
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(min) = self.min_level {
            if level_rank(&entry.level) < min {
                return false;
            }
        }
        if let Some(ref needle) = self.substring {
            let in_message = entry.message.to_lowercase().contains(needle);
            let in_process = entry.process.to_lowercase().contains(needle);
            if !in_message && !in_process {
                return false;
            }
        }
        true
    }
}

fn level_rank(level: &str) -> u8 {
    match level.to_ascii_lowercase().as_str() {
        "debug" => 0,
        "info" | "default" => 1,
        "error" => 2,
        "fault" => 3,
        _ => 1,
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
        ConnectionKind::Logs,
        addr.ip(),
    )
    .await
    else {
        return;
    };

    let mut child = match state.driver.start_log_stream(&session.udid) {
        Ok(c) => c,
        Err(e) => {
            let _ = socket.send(Message::Text(error_json(&e).into())).await;
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    let (mut sender, mut receiver) = socket.split();
    let mut filter = LogFilter::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let Some(entry) = parse_log_line(&line) else { continue };
                        if !filter.matches(&entry) {
                            continue;
                        }
                        let msg = json!({ "type": "log", "entry": entry }).to_string();
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("Log stream for {} ended", session.udid);
                        break;
                    }
                    Err(e) => {
                        warn!("Log stream read error for {}: {}", session.udid, e);
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<LogsInbound>(&text) {
                            Ok(LogsInbound::Filter { level, filter: f }) => {
                                filter.update(level, f);
                            }
                            Err(e) => {
                                let err = error_json(&Error::Protocol(e.to_string()));
                                if sender.send(Message::Text(err.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: &str, process: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: "2024-05-01 10:00:00".to_string(),
            level: level.to_string(),
            process: process.to_string(),
            pid: 1,
            message: message.to_string(),
        }
    }

    #[test]
    fn default_filter_passes_everything() {
        let f = LogFilter::default();
        assert!(f.matches(&entry("Debug", "app", "hello")));
        assert!(f.matches(&entry("Fault", "kernel", "boom")));
    }

    #[test]
    fn level_floor_filters_below() {
        let mut f = LogFilter::default();
        f.update(Some("error".to_string()), None);
        assert!(!f.matches(&entry("Info", "app", "fine")));
        assert!(f.matches(&entry("Error", "app", "broken")));
        assert!(f.matches(&entry("Fault", "app", "dead")));
    }

    #[test]
    fn substring_matches_message_or_process() {
        let mut f = LogFilter::default();
        f.update(None, Some("Spring".to_string()));
        assert!(f.matches(&entry("Info", "SpringBoard", "launch")));
        assert!(f.matches(&entry("Info", "app", "springtime is here")));
        assert!(!f.matches(&entry("Info", "backboardd", "wake")));
    }

    #[test]
    fn empty_filter_string_clears_substring() {
        let mut f = LogFilter::default();
        f.update(None, Some(String::new()));
        assert!(f.substring.is_none());
    }
}
