//! Device frame capture
//!
//! Per-device services producing JPEG frames (and an H.264 WebRTC track)
//! with bounded memory. Services are created and destroyed only by the
//! resource manager.

pub mod frame;
pub mod video;
pub mod webrtc;

pub use frame::{Frame, FrameRing, StreamSettings};
pub use video::VideoService;
pub use webrtc::WebRtcService;

use serde::Serialize;

/// How frames are being acquired from the device. A method that fails is
/// permanently disqualified for the service's lifetime; acquisition walks
/// down this ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMethod {
    /// Continuous MJPEG stream from the host driver
    Stream,
    /// Driver-encoded JPEG screenshots
    HwEncode,
    /// PNG screenshots re-encoded in process
    SwEncode,
    /// High-frequency PNG screenshot loop, minimal transform
    Screenshot,
}

impl CaptureMethod {
    pub const LADDER: [CaptureMethod; 4] = [
        CaptureMethod::Stream,
        CaptureMethod::HwEncode,
        CaptureMethod::SwEncode,
        CaptureMethod::Screenshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Stream => "stream",
            CaptureMethod::HwEncode => "hw-encode",
            CaptureMethod::SwEncode => "sw-encode",
            CaptureMethod::Screenshot => "screenshot",
        }
    }
}
