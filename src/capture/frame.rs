//! Frame data structure and the bounded per-client ring
//!
//! Frames are transient: produced by a capture worker, fanned out to one
//! ring per client, and dropped oldest-first when a slow client falls
//! behind. A slow client never slows the others.

use crate::config::Quality;
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A single JPEG-encoded snapshot of the device screen.
#[derive(Clone)]
pub struct Frame {
    /// JPEG payload
    pub data: Bytes,

    /// Frame dimensions in pixels
    pub pixel_width: u32,
    pub pixel_height: u32,

    /// Device logical dimensions in points
    pub point_width: u32,
    pub point_height: u32,

    /// Strictly increasing per service lifetime; gaps indicate drops
    pub sequence: u64,

    /// Capture time, milliseconds since the epoch
    pub timestamp_ms: u64,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({}x{}, {} bytes, seq={})",
            self.pixel_width,
            self.pixel_height,
            self.data.len(),
            self.sequence
        )
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Capture settings shared by the worker and its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub quality: Quality,
    pub fps: u32,
}

impl StreamSettings {
    pub fn new(quality: Quality, fps: u32) -> Self {
        Self {
            quality,
            fps: if fps == 0 { quality.fps() } else { fps },
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }
}

/// Bounded frame ring, one per client. Pushing into a full ring drops
/// exactly one older frame.
pub struct FrameRing {
    queue: ArrayQueue<Arc<Frame>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish a frame. Returns true if an older frame was dropped.
    pub fn push(&self, frame: Arc<Frame>) -> bool {
        let mut pending = frame;
        let mut dropped = false;
        loop {
            match self.queue.push(pending) {
                Ok(()) => break,
                Err(rejected) => {
                    let _ = self.queue.pop();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    dropped = true;
                    pending = rejected;
                }
            }
        }
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<Arc<Frame>> {
        self.queue.pop()
    }

    /// Dequeue the next frame, waiting at most `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Option<Arc<Frame>> {
        if let Some(frame) = self.queue.pop() {
            return Some(frame);
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.queue.pop()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Arc<Frame> {
        Arc::new(Frame {
            data: Bytes::from_static(b"\xff\xd8\xff\xd9"),
            pixel_width: 10,
            pixel_height: 20,
            point_width: 10,
            point_height: 20,
            sequence: seq,
            timestamp_ms: now_ms(),
        })
    }

    #[test]
    fn full_ring_drops_exactly_one_oldest() {
        let ring = FrameRing::new(3);
        for seq in 1..=3 {
            assert!(!ring.push(frame(seq)));
        }
        assert!(ring.push(frame(4)));
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.len(), 3);
        // Oldest (seq 1) is gone.
        assert_eq!(ring.pop().unwrap().sequence, 2);
    }

    #[test]
    fn pop_returns_in_order() {
        let ring = FrameRing::new(2);
        ring.push(frame(1));
        ring.push(frame(2));
        assert_eq!(ring.pop().unwrap().sequence, 1);
        assert_eq!(ring.pop().unwrap().sequence, 2);
        assert!(ring.pop().is_none());
    }

    #[tokio::test]
    async fn recv_times_out_when_empty() {
        let ring = FrameRing::new(1);
        let got = ring.recv(Duration::from_millis(5)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let ring = Arc::new(FrameRing::new(1));
        let r = ring.clone();
        let waiter = tokio::spawn(async move { r.recv(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ring.push(frame(7));
        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().sequence, 7);
    }

    #[test]
    fn settings_default_fps_comes_from_preset() {
        let s = StreamSettings::new(Quality::High, 0);
        assert_eq!(s.fps, Quality::High.fps());
        let s = StreamSettings::new(Quality::High, 24);
        assert_eq!(s.fps, 24);
    }
}
