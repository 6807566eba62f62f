//! WebRTC signaling endpoint
//!
//! Exchanges SDP and ICE over the socket and attaches the device's shared
//! H.264 track to a per-connection peer connection. Quality and FPS
//! changes apply to the device service between frames.

use super::{authorize, error_json};
use crate::capture::WebRtcService;
use crate::config::Quality;
use crate::connections::ConnectionKind;
use crate::error::Error;
use crate::web::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum SignalMessage {
    StartStream {
        #[serde(default)]
        quality: Option<String>,
        #[serde(default)]
        fps: Option<u32>,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: serde_json::Value,
    },
    QualityChange {
        quality: String,
    },
    FpsChange {
        fps: u32,
    },
    StreamReady,
    Error {
        message: String,
    },
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
        ConnectionKind::WebrtcSignaling,
        addr.ip(),
    )
    .await
    else {
        return;
    };

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let client_id = format!("webrtc-{}", uuid::Uuid::new_v4());
    let mut service: Option<Arc<WebRtcService>> = None;
    let mut peer: Option<Arc<RTCPeerConnection>> = None;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let parsed: SignalMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                let _ = out_tx.send(error_json(&Error::Protocol(e.to_string())));
                continue;
            }
        };

        match parsed {
            SignalMessage::StartStream { quality, fps } => {
                if service.is_some() {
                    let _ = out_tx.send(signal_error("stream already started"));
                    continue;
                }
                let svc = state.resources.get_webrtc(&session, &client_id);
                apply_settings(&svc, quality.as_deref(), fps, &out_tx);

                match build_peer(svc.clone(), out_tx.clone()).await {
                    Ok(pc) => {
                        peer = Some(pc);
                        service = Some(svc);
                        let ready = serde_json::to_string(&SignalMessage::StreamReady)
                            .unwrap_or_default();
                        let _ = out_tx.send(ready);
                        info!("WebRTC stream ready for session {}", session.id);
                    }
                    Err(e) => {
                        warn!("Peer connection setup failed: {}", e);
                        state.resources.release_webrtc(&session.udid, &client_id);
                        let _ = out_tx.send(signal_error(&format!("peer setup failed: {}", e)));
                    }
                }
            }
            SignalMessage::Offer { sdp } => {
                let Some(pc) = peer.as_ref() else {
                    let _ = out_tx.send(signal_error("no stream started"));
                    continue;
                };
                match answer_offer(pc, sdp).await {
                    Ok(answer_sdp) => {
                        let msg = serde_json::to_string(&SignalMessage::Answer { sdp: answer_sdp })
                            .unwrap_or_default();
                        let _ = out_tx.send(msg);
                    }
                    Err(e) => {
                        warn!("Offer handling failed: {}", e);
                        let _ = out_tx.send(signal_error(&format!("offer failed: {}", e)));
                    }
                }
            }
            SignalMessage::Answer { .. } => {
                // The server is always the answerer in this protocol.
                let _ = out_tx.send(signal_error("unexpected answer"));
            }
            SignalMessage::IceCandidate { candidate } => {
                let Some(pc) = peer.as_ref() else {
                    continue;
                };
                match serde_json::from_value::<RTCIceCandidateInit>(candidate) {
                    Ok(init) => {
                        if let Err(e) = pc.add_ice_candidate(init).await {
                            debug!("add_ice_candidate: {}", e);
                        }
                    }
                    Err(e) => {
                        let _ = out_tx.send(error_json(&Error::Protocol(e.to_string())));
                    }
                }
            }
            SignalMessage::QualityChange { quality } => {
                if let Some(svc) = service.as_ref() {
                    apply_settings(svc, Some(&quality), None, &out_tx);
                }
            }
            SignalMessage::FpsChange { fps } => {
                if let Some(svc) = service.as_ref() {
                    svc.set_fps(fps);
                }
            }
            SignalMessage::StreamReady | SignalMessage::Error { .. } => {}
        }
    }

    if let Some(pc) = peer.take() {
        let _ = pc.close().await;
    }
    if service.is_some() {
        state.resources.release_webrtc(&session.udid, &client_id);
    }
    writer.abort();
}

fn apply_settings(
    service: &Arc<WebRtcService>,
    quality: Option<&str>,
    fps: Option<u32>,
    out_tx: &mpsc::UnboundedSender<String>,
) {
    if let Some(q) = quality {
        match Quality::parse(q) {
            Some(q) => service.set_quality(q),
            None => {
                let _ = out_tx.send(signal_error(&format!("unknown quality: {}", q)));
            }
        }
    }
    if let Some(fps) = fps {
        service.set_fps(fps);
    }
}

fn signal_error(message: &str) -> String {
    serde_json::to_string(&SignalMessage::Error {
        message: message.to_string(),
    })
    .unwrap_or_default()
}

/// Build a peer connection carrying the service's video track, wired to
/// trickle ICE candidates back over the socket.
async fn build_peer(
    service: Arc<WebRtcService>,
    out_tx: mpsc::UnboundedSender<String>,
) -> crate::error::Result<Arc<RTCPeerConnection>> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

    let rtp_sender = pc
        .add_track(service.track() as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    // RTCP must be drained for interceptors (NACK, receiver reports) to run.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while rtp_sender.read(&mut buf).await.is_ok() {}
    });

    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let out_tx = out_tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                if let Ok(init) = candidate.to_json() {
                    if let Ok(value) = serde_json::to_value(init) {
                        let msg = serde_json::to_string(&SignalMessage::IceCandidate {
                            candidate: value,
                        })
                        .unwrap_or_default();
                        let _ = out_tx.send(msg);
                    }
                }
            }
        })
    }));

    Ok(pc)
}

async fn answer_offer(
    pc: &Arc<RTCPeerConnection>,
    offer_sdp: String,
) -> crate::error::Result<String> {
    let offer = RTCSessionDescription::offer(offer_sdp)?;
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| Error::internal("peer has no local description"))?;
    Ok(local.sdp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_messages_use_kebab_case_tags() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"start-stream","quality":"high","fps":30}"#).unwrap();
        assert!(matches!(
            msg,
            SignalMessage::StartStream {
                quality: Some(_),
                fps: Some(30)
            }
        ));

        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"quality-change","quality":"low"}"#).unwrap();
        assert!(matches!(msg, SignalMessage::QualityChange { .. }));

        let json = serde_json::to_string(&SignalMessage::StreamReady).unwrap();
        assert!(json.contains("stream-ready"));

        let json = serde_json::to_string(&SignalMessage::IceCandidate {
            candidate: serde_json::json!({"candidate": "candidate:1"}),
        })
        .unwrap();
        assert!(json.contains("ice-candidate"));
    }

    #[test]
    fn offer_and_answer_round_trip_sdp_field() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        match msg {
            SignalMessage::Offer { sdp } => assert!(sdp.starts_with("v=0")),
            _ => panic!("expected offer"),
        }
    }
}
