//! Per-device JPEG frame service
//!
//! One `VideoService` exists per UDID. A background worker acquires frames
//! by walking the capture ladder: the driver's continuous MJPEG stream
//! first, then driver-encoded JPEG screenshots, then PNG screenshots
//! re-encoded in process, and finally a minimal screenshot loop. A method
//! that fails is disqualified for the lifetime of the ladder; a crashed
//! worker restarts once before surfacing a persistent failure.
//!
//! Fan-out is one bounded ring per client so a slow consumer only ever
//! loses its own frames.

use super::frame::{now_ms, Frame, FrameRing, StreamSettings};
use super::CaptureMethod;
use crate::driver::{HostDriver, ScreenshotFormat, StreamFormat};
use crate::error::{Error, Result};
use bytes::Bytes;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

/// Stall threshold for the MJPEG stream reader.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive screenshot failures before a method is disqualified.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

enum MethodExit {
    /// Service stop requested
    Stopped,
    /// Settings changed; restart the same method
    Reconfigure,
    /// Method is no longer viable
    Failed(Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoServiceStats {
    pub udid: String,
    pub clients: usize,
    pub frames: u64,
    pub dropped: u64,
    pub fps: f64,
    pub method: Option<CaptureMethod>,
    pub failed: bool,
}

pub struct VideoService {
    udid: String,
    point_width: u32,
    point_height: u32,
    pixel_width: u32,
    pixel_height: u32,

    clients: Mutex<HashMap<String, Arc<FrameRing>>>,
    settings: Mutex<StreamSettings>,
    /// Bumped on every settings change; the stream worker reconfigures
    /// between frames, never mid-frame.
    epoch: AtomicU64,

    sequence: AtomicU64,
    dropped_total: AtomicU64,
    publish_times: Mutex<VecDeque<Instant>>,
    current_method: Mutex<Option<CaptureMethod>>,

    idle_since: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    failed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VideoService {
    /// Create the service and start its capture worker.
    pub fn spawn(
        driver: Arc<HostDriver>,
        udid: String,
        point: (u32, u32),
        pixel: (u32, u32),
        settings: StreamSettings,
    ) -> Arc<Self> {
        let service = Arc::new(Self::new(udid, point, pixel, settings));
        let worker = tokio::spawn(service.clone().run(driver));
        *service.worker.lock() = Some(worker);
        service
    }

    fn new(udid: String, point: (u32, u32), pixel: (u32, u32), settings: StreamSettings) -> Self {
        Self {
            udid,
            point_width: point.0,
            point_height: point.1,
            pixel_width: pixel.0,
            pixel_height: pixel.1,
            clients: Mutex::new(HashMap::new()),
            settings: Mutex::new(settings),
            epoch: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            publish_times: Mutex::new(VecDeque::new()),
            current_method: Mutex::new(None),
            idle_since: Mutex::new(Some(Instant::now())),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_detached(udid: &str, settings: StreamSettings) -> Arc<Self> {
        Arc::new(Self::new(udid.to_string(), (393, 852), (1179, 2556), settings))
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Register a client and hand it a dedicated ring.
    pub fn add_client(&self, client_id: &str, ring_capacity: usize) -> Arc<FrameRing> {
        let ring = Arc::new(FrameRing::new(ring_capacity));
        self.clients
            .lock()
            .insert(client_id.to_string(), ring.clone());
        *self.idle_since.lock() = None;
        ring
    }

    /// Remove a client. When the set empties the idle grace window starts.
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

    /// True when the service has had zero clients for longer than `grace`.
    pub fn idle_expired(&self, grace: Duration, now: Instant) -> bool {
        self.idle_since
            .lock()
            .map(|t| now.duration_since(t) >= grace)
            .unwrap_or(false)
    }

    pub fn settings(&self) -> StreamSettings {
        *self.settings.lock()
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

    /// Frames published in the last second.
    pub fn rolling_fps(&self) -> f64 {
        let now = Instant::now();
        let mut times = self.publish_times.lock();
        while times
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(1))
            .unwrap_or(false)
        {
            times.pop_front();
        }
        times.len() as f64
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> VideoServiceStats {
        VideoServiceStats {
            udid: self.udid.clone(),
            clients: self.client_count(),
            frames: self.sequence.load(Ordering::Relaxed),
            dropped: self.dropped(),
            fps: self.rolling_fps(),
            method: *self.current_method.lock(),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and close the pipeline. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    fn publish(&self, data: Bytes, pixel_width: u32, pixel_height: u32) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Arc::new(Frame {
            data,
            pixel_width,
            pixel_height,
            point_width: self.point_width,
            point_height: self.point_height,
            sequence,
            timestamp_ms: now_ms(),
        });

        let rings: Vec<Arc<FrameRing>> = self.clients.lock().values().cloned().collect();
        for ring in rings {
            if ring.push(frame.clone()) {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        let now = Instant::now();
        let mut times = self.publish_times.lock();
        times.push_back(now);
        while times
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(1))
            .unwrap_or(false)
        {
            times.pop_front();
        }
    }

    async fn run(self: Arc<Self>, driver: Arc<HostDriver>) {
        for attempt in 0..2u32 {
            let exhausted = self.run_ladder(&driver).await;
            if self.stopped.load(Ordering::SeqCst) || !exhausted {
                return;
            }
            if attempt == 0 {
                warn!("Capture worker for {} exhausted all methods; restarting once", self.udid);
            }
        }
        self.failed.store(true, Ordering::SeqCst);
        error!("Capture for {} failed persistently; no frames will be produced", self.udid);
    }

    /// Walk the method ladder until stopped or every method is disqualified.
    /// Returns true when exhausted.
    async fn run_ladder(&self, driver: &Arc<HostDriver>) -> bool {
        let mut disqualified: HashSet<CaptureMethod> = HashSet::new();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return false;
            }
            let method = match CaptureMethod::LADDER
                .iter()
                .find(|m| !disqualified.contains(*m))
            {
                Some(m) => *m,
                None => return true,
            };

            *self.current_method.lock() = Some(method);
            let exit = match method {
                CaptureMethod::Stream => self.run_stream(driver).await,
                _ => self.run_screenshot_loop(driver, method).await,
            };
            match exit {
                MethodExit::Stopped => return false,
                MethodExit::Reconfigure => continue,
                MethodExit::Failed(e) => {
                    warn!(
                        "Capture method {} failed for {}: {}; falling back",
                        method.as_str(),
                        self.udid,
                        e
                    );
                    disqualified.insert(method);
                }
            }
        }
    }

    /// Primary method: the driver's continuous MJPEG stream.
    async fn run_stream(&self, driver: &Arc<HostDriver>) -> MethodExit {
        let settings = self.settings();
        let epoch = self.epoch.load(Ordering::Relaxed);
        let quality = settings.quality.jpeg_quality() as f32 / 100.0;

        let mut child = match driver.start_video_stream(
            &self.udid,
            StreamFormat::Mjpeg,
            settings.fps,
            quality,
        ) {
            Ok(c) => c,
            Err(e) => return MethodExit::Failed(e),
        };
        let mut stdout = match child.stdout.take() {
            Some(s) => s,
            None => return MethodExit::Failed(Error::internal("stream child has no stdout")),
        };
        info!(
            "MJPEG stream started for {} ({} fps, {})",
            self.udid,
            settings.fps,
            settings.quality.as_str()
        );

        let mut splitter = MjpegSplitter::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return MethodExit::Stopped;
            }
            if self.epoch.load(Ordering::Relaxed) != epoch {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return MethodExit::Reconfigure;
            }

            match tokio::time::timeout(STREAM_READ_TIMEOUT, stdout.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    let _ = child.wait().await;
                    return MethodExit::Failed(Error::driver("video stream ended"));
                }
                Ok(Ok(n)) => {
                    for jpeg in splitter.feed(&buf[..n]) {
                        self.publish(Bytes::from(jpeg), self.pixel_width, self.pixel_height);
                    }
                }
                Ok(Err(e)) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return MethodExit::Failed(Error::Io(e));
                }
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return MethodExit::Failed(Error::Timeout("video stream stalled".into()));
                }
            }
        }
    }

    /// Screenshot-based fallbacks, paced to the target FPS.
    async fn run_screenshot_loop(&self, driver: &Arc<HostDriver>, method: CaptureMethod) -> MethodExit {
        let mut failures = 0u32;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return MethodExit::Stopped;
            }
            let settings = self.settings();
            let started = Instant::now();

            let result = match method {
                CaptureMethod::HwEncode => driver
                    .screenshot(&self.udid, ScreenshotFormat::Jpeg)
                    .await
                    .map(|jpeg| (jpeg, self.pixel_width, self.pixel_height)),
                CaptureMethod::SwEncode => {
                    let factor = settings.quality.resolution_factor();
                    let jpeg_q = settings.quality.jpeg_quality();
                    match driver.screenshot(&self.udid, ScreenshotFormat::Png).await {
                        Ok(png) => {
                            tokio::task::spawn_blocking(move || transcode(&png, factor, jpeg_q))
                                .await
                                .unwrap_or_else(|e| Err(Error::internal(e.to_string())))
                        }
                        Err(e) => Err(e),
                    }
                }
                _ => match driver.screenshot(&self.udid, ScreenshotFormat::Png).await {
                    Ok(png) => tokio::task::spawn_blocking(move || transcode(&png, 1.0, 70))
                        .await
                        .unwrap_or_else(|e| Err(Error::internal(e.to_string()))),
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok((jpeg, w, h)) => {
                    failures = 0;
                    self.publish(Bytes::from(jpeg), w, h);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return MethodExit::Failed(e);
                    }
                }
            }

            let elapsed = started.elapsed();
            let interval = settings.frame_interval();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
    }
}

/// Decode a PNG screenshot, optionally rescale, and encode to JPEG.
fn transcode(png: &[u8], factor: f32, jpeg_quality: u8) -> Result<(Vec<u8>, u32, u32)> {
    use image::GenericImageView;

    let img = image::load_from_memory(png)
        .map_err(|e| Error::driver(format!("unreadable screenshot: {}", e)))?;

    let img = if (factor - 1.0).abs() > f32::EPSILON {
        let (w0, h0) = img.dimensions();
        let w = ((w0 as f32 * factor).round() as u32).max(1);
        let h = ((h0 as f32 * factor).round() as u32).max(1);
        img.resize_exact(w, h, image::imageops::FilterType::Triangle)
    } else {
        img
    };

    let (w, h) = img.dimensions();
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, jpeg_quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| Error::internal(format!("jpeg encode: {}", e)))?;
    Ok((out, w, h))
}

/// Incremental splitter for an MJPEG byte stream: extracts complete JPEG
/// images delimited by SOI/EOI markers.
pub struct MjpegSplitter {
    buf: Vec<u8>,
}

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Discard threshold for a frame that never terminates.
const MAX_PENDING: usize = 16 * 1024 * 1024;

impl MjpegSplitter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, &SOI) else {
                self.buf.clear();
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }
            match find_marker(&self.buf[2..], &EOI) {
                Some(rel) => {
                    let end = 2 + rel + 2;
                    frames.push(self.buf[..end].to_vec());
                    self.buf.drain(..end);
                }
                None => {
                    if self.buf.len() > MAX_PENDING {
                        warn!("Discarding {} unterminated MJPEG bytes", self.buf.len());
                        self.buf.clear();
                    }
                    break;
                }
            }
        }
        frames
    }
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Quality;

    fn fake_jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[test]
    fn splitter_extracts_back_to_back_frames() {
        let mut s = MjpegSplitter::new();
        let a = fake_jpeg(b"aaaa");
        let b = fake_jpeg(b"bbbb");
        let mut input = a.clone();
        input.extend_from_slice(&b);

        let frames = s.feed(&input);
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn splitter_handles_frames_split_across_reads() {
        let mut s = MjpegSplitter::new();
        let frame = fake_jpeg(b"payload");
        let (first, second) = frame.split_at(5);

        assert!(s.feed(first).is_empty());
        let frames = s.feed(second);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn splitter_skips_leading_garbage() {
        let mut s = MjpegSplitter::new();
        let frame = fake_jpeg(b"x");
        let mut input = b"garbage".to_vec();
        input.extend_from_slice(&frame);
        assert_eq!(s.feed(&input), vec![frame]);
    }

    #[test]
    fn transcode_scales_and_reencodes() {
        let img = image::RgbImage::from_pixel(10, 20, image::Rgb([200, 10, 10]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let (jpeg, w, h) = transcode(&png, 0.5, 60).unwrap();
        assert_eq!((w, h), (5, 10));
        assert_eq!(&jpeg[..2], &SOI);

        let (_, w, h) = transcode(&png, 1.0, 60).unwrap();
        assert_eq!((w, h), (10, 20));
    }

    #[test]
    fn fan_out_reaches_every_client_ring() {
        let svc = VideoService::new_detached("U1", StreamSettings::new(Quality::Medium, 0));
        let a = svc.add_client("a", 3);
        let b = svc.add_client("b", 3);

        svc.publish(Bytes::from_static(b"\xff\xd8\xff\xd9"), 1179, 2556);
        assert_eq!(a.pop().unwrap().sequence, 1);
        assert_eq!(b.pop().unwrap().sequence, 1);
    }

    #[test]
    fn sequence_is_strictly_increasing() {
        let svc = VideoService::new_detached("U1", StreamSettings::new(Quality::Medium, 0));
        let ring = svc.add_client("a", 8);
        for _ in 0..4 {
            svc.publish(Bytes::from_static(b"\xff\xd8\xff\xd9"), 1179, 2556);
        }
        let mut last = 0;
        while let Some(f) = ring.pop() {
            assert!(f.sequence > last);
            last = f.sequence;
        }
        assert_eq!(last, 4);
    }

    #[test]
    fn slow_client_does_not_block_fast_client() {
        let svc = VideoService::new_detached("U1", StreamSettings::new(Quality::Medium, 0));
        let slow = svc.add_client("slow", 1);
        let fast = svc.add_client("fast", 8);
        for _ in 0..5 {
            svc.publish(Bytes::from_static(b"\xff\xd8\xff\xd9"), 1179, 2556);
        }
        // Slow ring kept only the newest frame; fast ring kept all five.
        assert_eq!(slow.len(), 1);
        assert_eq!(slow.pop().unwrap().sequence, 5);
        assert_eq!(fast.len(), 5);
        assert_eq!(slow.dropped(), 4);
        assert_eq!(svc.dropped(), 4);
    }

    #[test]
    fn idle_window_starts_when_last_client_leaves() {
        let svc = VideoService::new_detached("U1", StreamSettings::new(Quality::Medium, 0));
        svc.add_client("a", 1);
        assert!(!svc.idle_expired(Duration::ZERO, Instant::now()));
        svc.remove_client("a");
        assert!(svc.idle_expired(Duration::ZERO, Instant::now()));
    }

    #[test]
    fn settings_changes_bump_epoch() {
        let svc = VideoService::new_detached("U1", StreamSettings::new(Quality::Medium, 0));
        let before = svc.epoch.load(Ordering::Relaxed);
        svc.set_quality(Quality::High);
        svc.set_fps(24);
        // Unchanged values do not bump.
        svc.set_quality(Quality::High);
        svc.set_fps(24);
        assert_eq!(svc.epoch.load(Ordering::Relaxed), before + 2);
    }
}
