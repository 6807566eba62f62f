//! Per-device WebRTC video source
//!
//! A `WebRtcService` owns one H.264 sample track per UDID, fed from the
//! driver's H.264 video stream. Signaling endpoints attach the track to
//! their peer connections; the service itself never owns a peer connection.

use super::frame::StreamSettings;
use crate::driver::{HostDriver, StreamFormat};
use bytes::Bytes;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Sample queue bound; a full queue drops the oldest access unit.
const SAMPLE_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct WebRtcServiceStats {
    pub udid: String,
    pub clients: usize,
    pub dropped: u64,
    pub failed: bool,
}

pub struct WebRtcService {
    udid: String,
    clients: Mutex<HashSet<String>>,
    track: Arc<TrackLocalStaticSample>,

    settings: Mutex<StreamSettings>,
    epoch: AtomicU64,

    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    dropped: AtomicU64,

    idle_since: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    failed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcService {
    pub fn spawn(driver: Arc<HostDriver>, udid: String, settings: StreamSettings) -> Arc<Self> {
        let service = Arc::new(Self::new(udid, settings));
        let reader = tokio::spawn(service.clone().run_reader(driver));
        let writer = tokio::spawn(service.clone().run_writer());
        *service.workers.lock() = vec![reader, writer];
        service
    }

    fn new(udid: String, settings: StreamSettings) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            format!("simbridge-{}", udid),
        ));
        Self {
            udid,
            clients: Mutex::new(HashSet::new()),
            track,
            settings: Mutex::new(settings),
            epoch: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::with_capacity(SAMPLE_QUEUE_DEPTH)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_detached(udid: &str, settings: StreamSettings) -> Arc<Self> {
        Arc::new(Self::new(udid.to_string(), settings))
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// The shared H.264 track that signaling endpoints attach.
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn add_client(&self, client_id: &str) {
        self.clients.lock().insert(client_id.to_string());
        *self.idle_since.lock() = None;
    }

    pub fn remove_client(&self, client_id: &str) {
        let mut clients = self.clients.lock();
        clients.remove(client_id);
        if clients.is_empty() {
            *self.idle_since.lock() = Some(Instant::now());
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn idle_expired(&self, grace: Duration, now: Instant) -> bool {
        self.idle_since
            .lock()
            .map(|t| now.duration_since(t) >= grace)
            .unwrap_or(false)
    }

    pub fn set_quality(&self, quality: crate::config::Quality) {
        let mut s = self.settings.lock();
        if s.quality != quality {
            s.quality = quality;
            self.epoch.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_fps(&self, fps: u32) {
        let mut s = self.settings.lock();
        if fps > 0 && s.fps != fps {
            s.fps = fps;
            self.epoch.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn settings(&self) -> StreamSettings {
        *self.settings.lock()
    }

    pub fn stats(&self) -> WebRtcServiceStats {
        WebRtcServiceStats {
            udid: self.udid.clone(),
            clients: self.client_count(),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }

    fn enqueue(&self, unit: Bytes) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= SAMPLE_QUEUE_DEPTH {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(unit);
        }
        self.notify.notify_one();
    }

    fn try_dequeue(&self) -> Option<Bytes> {
        self.queue.lock().pop_front()
    }

    /// Read the driver's H.264 elementary stream and enqueue NAL units.
    async fn run_reader(self: Arc<Self>, driver: Arc<HostDriver>) {
        let mut failures = 0u32;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let settings = self.settings();
            let epoch = self.epoch.load(Ordering::Relaxed);
            let quality = settings.quality.jpeg_quality() as f32 / 100.0;

            let mut child = match driver.start_video_stream(
                &self.udid,
                StreamFormat::H264,
                settings.fps,
                quality,
            ) {
                Ok(c) => c,
                Err(e) => {
                    failures += 1;
                    if failures > 1 {
                        self.failed.store(true, Ordering::SeqCst);
                        error!("H.264 stream for {} failed persistently: {}", self.udid, e);
                        return;
                    }
                    warn!("H.264 stream spawn for {} failed: {}; retrying", self.udid, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let Some(mut stdout) = child.stdout.take() else {
                self.failed.store(true, Ordering::SeqCst);
                return;
            };
            info!("H.264 stream started for {} ({} fps)", self.udid, settings.fps);

            let mut splitter = AnnexBSplitter::new();
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return;
                }
                if self.epoch.load(Ordering::Relaxed) != epoch {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break; // respawn with new settings
                }
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = child.wait().await;
                        failures += 1;
                        if failures > 1 {
                            self.failed.store(true, Ordering::SeqCst);
                            error!("H.264 stream for {} ended; giving up", self.udid);
                            return;
                        }
                        warn!("H.264 stream for {} ended; restarting once", self.udid);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        break;
                    }
                    Ok(n) => {
                        failures = 0;
                        for unit in splitter.feed(&buf[..n]) {
                            self.enqueue(unit);
                        }
                    }
                }
            }
        }
    }

    /// Drain the sample queue into the track.
    async fn run_writer(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let Some(unit) = self.try_dequeue() else {
                let _ = tokio::time::timeout(Duration::from_millis(100), self.notify.notified()).await;
                continue;
            };
            let fps = self.settings().fps.max(1);
            let sample = Sample {
                data: unit,
                duration: Duration::from_micros(1_000_000 / fps as u64),
                ..Default::default()
            };
            if let Err(e) = self.track.write_sample(&sample).await {
                // No bound peer yet, or a peer went away; both are routine.
                log::debug!("write_sample for {}: {}", self.udid, e);
            }
        }
    }
}

/// Incremental Annex-B splitter: yields NAL units (without start codes)
/// from an H.264 elementary stream.
pub struct AnnexBSplitter {
    buf: Vec<u8>,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut units = Vec::new();

        loop {
            let Some(first) = find_start_code(&self.buf, 0) else {
                break;
            };
            let payload_start = first.0 + first.1;
            let Some(next) = find_start_code(&self.buf, payload_start) else {
                // Drop leading garbage so the buffer stays rooted at a start code.
                if first.0 > 0 {
                    self.buf.drain(..first.0);
                }
                break;
            };
            let unit = self.buf[payload_start..next.0].to_vec();
            if !unit.is_empty() {
                units.push(Bytes::from(unit));
            }
            self.buf.drain(..next.0);
        }
        units
    }
}

impl Default for AnnexBSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the next 3- or 4-byte start code at or after `from`; returns
/// (offset, length).
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= buf.len() && buf[i + 2] == 0 && buf[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Quality;

    #[test]
    fn splits_nal_units_on_start_codes() {
        let mut s = AnnexBSplitter::new();
        let mut input = vec![0, 0, 0, 1, 0x67, 0xAA, 0xBB];
        input.extend_from_slice(&[0, 0, 1, 0x68, 0xCC]);
        input.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x01, 0x02, 0x03]);

        let units = s.feed(&input);
        // The last unit stays buffered until the next start code arrives.
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].as_ref(), &[0x67, 0xAA, 0xBB]);
        assert_eq!(units[1].as_ref(), &[0x68, 0xCC]);

        let more = s.feed(&[0, 0, 1, 0x41]);
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].as_ref(), &[0x65, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn handles_units_split_across_reads() {
        let mut s = AnnexBSplitter::new();
        assert!(s.feed(&[0, 0, 0, 1, 0x67]).is_empty());
        assert!(s.feed(&[0xAA]).is_empty());
        let units = s.feed(&[0, 0, 1, 0x68]);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].as_ref(), &[0x67, 0xAA]);
    }

    #[test]
    fn sample_queue_drops_oldest_at_depth() {
        let svc = WebRtcService::new_detached("U1", StreamSettings::new(Quality::Medium, 0));
        svc.enqueue(Bytes::from_static(b"a"));
        svc.enqueue(Bytes::from_static(b"b"));
        svc.enqueue(Bytes::from_static(b"c"));

        assert_eq!(svc.stats().dropped, 1);
        assert_eq!(svc.try_dequeue().unwrap().as_ref(), b"b");
        assert_eq!(svc.try_dequeue().unwrap().as_ref(), b"c");
        assert!(svc.try_dequeue().is_none());
    }

    #[test]
    fn client_refcounting_drives_idle_state() {
        let svc = WebRtcService::new_detached("U1", StreamSettings::new(Quality::Medium, 0));
        svc.add_client("a");
        svc.add_client("b");
        assert_eq!(svc.client_count(), 2);
        svc.remove_client("a");
        assert!(!svc.idle_expired(Duration::ZERO, Instant::now()));
        svc.remove_client("b");
        assert!(svc.idle_expired(Duration::ZERO, Instant::now()));
    }
}
