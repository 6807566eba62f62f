//! Device I/O: screenshots, video streams, files, media, location, logs

use super::{command, with_retry, HostDriver, ACTION_TIMEOUT};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Child;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenshotFormat {
    Png,
    Jpeg,
}

impl ScreenshotFormat {
    fn as_arg(&self) -> &'static str {
        match self {
            ScreenshotFormat::Png => "png",
            ScreenshotFormat::Jpeg => "jpeg",
        }
    }
}

/// Encoding of the continuous device video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Mjpeg,
    H264,
}

impl StreamFormat {
    fn as_arg(&self) -> &'static str {
        match self {
            StreamFormat::Mjpeg => "mjpeg",
            StreamFormat::H264 => "h264",
        }
    }
}

/// One parsed line of the device log stream.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub process: String,
    pub pid: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogLine {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    process_image_path: Option<String>,
    #[serde(default)]
    process_i_d: Option<i64>,
    #[serde(default)]
    event_message: Option<String>,
}

/// Parse one ndjson log line; returns None for stream chatter that is not
/// a log event.
pub fn parse_log_line(line: &str) -> Option<LogEntry> {
    let raw: RawLogLine = serde_json::from_str(line).ok()?;
    let message = raw.event_message?;
    let process = raw
        .process_image_path
        .as_deref()
        .and_then(|p| p.rsplit('/').next())
        .unwrap_or("unknown")
        .to_string();
    Some(LogEntry {
        timestamp: raw.timestamp,
        level: raw.message_type.unwrap_or_else(|| "Default".to_string()),
        process,
        pid: raw.process_i_d.unwrap_or(-1),
        message,
    })
}

/// A process visible inside the simulator.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub process: String,
    pub pid: i64,
}

/// Parse `launchctl list` output: `PID\tStatus\tLabel` rows after a header.
pub fn parse_process_list(text: &str) -> Vec<ProcessInfo> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse::<i64>().ok()?;
            parts.next()?;
            let label = parts.next()?;
            Some(ProcessInfo {
                process: label.to_string(),
                pid,
            })
        })
        .collect()
}

impl HostDriver {
    /// Capture a single screenshot.
    pub async fn screenshot(&self, udid: &str, format: ScreenshotFormat) -> Result<Vec<u8>> {
        with_retry("screenshot", || async {
            let file = tempfile::Builder::new()
                .prefix("simbridge-shot-")
                .suffix(&format!(".{}", format.as_arg()))
                .tempfile()?;
            let path = file.path().to_string_lossy().into_owned();
            command::run_ok(
                "xcrun",
                &[
                    "simctl",
                    "io",
                    udid,
                    "screenshot",
                    "--type",
                    format.as_arg(),
                    &path,
                ],
                ACTION_TIMEOUT,
            )
            .await?;
            let bytes = std::fs::read(file.path())?;
            if bytes.is_empty() {
                return Err(Error::Driver("screenshot produced no data".into()));
            }
            Ok(bytes)
        })
        .await
    }

    /// Probe device dimensions from a screenshot: pixel size read from the
    /// image, scale inferred, point size derived.
    pub async fn device_dimensions(&self, udid: &str) -> Result<(u32, u32, u32, u32, u32)> {
        use image::GenericImageView;

        let png = self.screenshot(udid, ScreenshotFormat::Png).await?;
        let img = image::load_from_memory(&png)
            .map_err(|e| Error::Driver(format!("unreadable screenshot: {}", e)))?;
        let (ppw, pph) = img.dimensions();
        let scale = infer_scale(ppw);
        Ok((ppw / scale, pph / scale, ppw, pph, scale))
    }

    /// Start a continuous video stream child. The caller owns the child and
    /// reads encoded data from its stdout.
    pub fn start_video_stream(
        &self,
        udid: &str,
        format: StreamFormat,
        fps: u32,
        quality: f32,
    ) -> Result<Child> {
        let fps_s = fps.max(1).to_string();
        let q_s = format!("{:.2}", quality.clamp(0.05, 1.0));
        command::spawn_streaming(
            "idb",
            &[
                "video-stream",
                "--udid",
                udid,
                "--format",
                format.as_arg(),
                "--fps",
                &fps_s,
                "--compression-quality",
                &q_s,
            ],
        )
    }

    /// Start an MP4 recorder child writing to `out_path`.
    pub fn start_recording(&self, udid: &str, out_path: &Path) -> Result<Child> {
        let path = out_path.to_string_lossy().into_owned();
        command::spawn_streaming(
            "xcrun",
            &["simctl", "io", udid, "recordVideo", "--codec", "h264", "--force", &path],
        )
    }

    /// Push a file onto the device, optionally into an app's container.
    pub async fn push_file(
        &self,
        udid: &str,
        local: &Path,
        device_path: &str,
        bundle_id: Option<&str>,
    ) -> Result<()> {
        let local_s = local.to_string_lossy().into_owned();
        let mut args = vec!["file", "push", local_s.as_str(), device_path];
        if let Some(b) = bundle_id {
            args.push("--bundle-id");
            args.push(b);
        }
        args.push("--udid");
        args.push(udid);
        command::run_ok("idb", &args, ACTION_TIMEOUT).await?;
        Ok(())
    }

    /// Pull a file from the device and return its bytes.
    pub async fn pull_file(
        &self,
        udid: &str,
        device_path: &str,
        bundle_id: Option<&str>,
    ) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let dir_s = dir.path().to_string_lossy().into_owned();
        let mut args = vec!["file", "pull", device_path, dir_s.as_str()];
        if let Some(b) = bundle_id {
            args.push("--bundle-id");
            args.push(b);
        }
        args.push("--udid");
        args.push(udid);
        command::run_ok("idb", &args, ACTION_TIMEOUT).await?;

        let name = device_path.rsplit('/').next().unwrap_or(device_path);
        let pulled = dir.path().join(name);
        let bytes = std::fs::read(&pulled)
            .map_err(|_| Error::NotFound(format!("file not found on device: {}", device_path)))?;
        Ok(bytes)
    }

    /// Add photos or videos to the device's media library.
    pub async fn add_media(&self, udid: &str, paths: &[&Path]) -> Result<()> {
        let mut args: Vec<String> = vec!["simctl".into(), "addmedia".into(), udid.into()];
        for p in paths {
            args.push(p.to_string_lossy().into_owned());
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        command::run_ok("xcrun", &arg_refs, ACTION_TIMEOUT).await?;
        Ok(())
    }

    pub async fn open_url(&self, udid: &str, url: &str) -> Result<()> {
        command::run_ok("xcrun", &["simctl", "openurl", udid, url], ACTION_TIMEOUT).await?;
        Ok(())
    }

    /// Simulate a GPS fix.
    pub async fn set_location(&self, udid: &str, latitude: f64, longitude: f64) -> Result<()> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::Protocol(format!(
                "invalid coordinates: {}, {}",
                latitude, longitude
            )));
        }
        let coord = format!("{},{}", latitude, longitude);
        command::run_ok(
            "xcrun",
            &["simctl", "location", udid, "set", &coord],
            ACTION_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn clear_location(&self, udid: &str) -> Result<()> {
        command::run_ok("xcrun", &["simctl", "location", udid, "clear"], ACTION_TIMEOUT).await?;
        Ok(())
    }

    /// Rotate the device. The companion rejects values it does not support.
    pub async fn set_orientation(&self, udid: &str, orientation: &str) -> Result<()> {
        command::run_ok(
            "idb",
            &["ui", "orientation", orientation, "--udid", udid],
            ACTION_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Start a log-follow child emitting ndjson on stdout.
    pub fn start_log_stream(&self, udid: &str) -> Result<Child> {
        command::spawn_streaming(
            "xcrun",
            &["simctl", "spawn", udid, "log", "stream", "--style", "ndjson"],
        )
    }

    pub async fn clear_logs(&self, udid: &str) -> Result<()> {
        command::run_ok(
            "xcrun",
            &["simctl", "spawn", udid, "log", "erase", "--all"],
            ACTION_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// List processes running inside the simulator.
    pub async fn list_processes(&self, udid: &str) -> Result<Vec<ProcessInfo>> {
        let out = command::run_ok(
            "xcrun",
            &["simctl", "spawn", udid, "launchctl", "list"],
            ACTION_TIMEOUT,
        )
        .await?;
        Ok(parse_process_list(&out.stdout_str()))
    }
}

/// Infer the device scale factor from a pixel width. Simulator devices are
/// 1x, 2x, or 3x; prefer the largest factor that yields a plausible logical
/// width.
pub fn infer_scale(pixel_width: u32) -> u32 {
    for scale in [3u32, 2] {
        if pixel_width % scale == 0 {
            let points = pixel_width / scale;
            if (320..=1100).contains(&points) {
                return scale;
            }
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_common_scales() {
        // iPhone 15 Pro: 1179 px = 393 pt @3x
        assert_eq!(infer_scale(1179), 3);
        // iPhone SE: 750 px = 375 pt @2x
        assert_eq!(infer_scale(750), 2);
        // iPad 9.7": 768 pt @1x
        assert_eq!(infer_scale(768), 2); // 384 pt @2x also plausible; 2 wins
        assert_eq!(infer_scale(1024), 2);
        assert_eq!(infer_scale(333), 1);
    }

    #[test]
    fn parses_log_lines() {
        let line = r#"{"timestamp":"2024-05-01 10:00:00.000000-0700","messageType":"Error","processImagePath":"/usr/libexec/backboardd","processID":77,"eventMessage":"display wake"}"#;
        let entry = parse_log_line(line).unwrap();
        assert_eq!(entry.level, "Error");
        assert_eq!(entry.process, "backboardd");
        assert_eq!(entry.pid, 77);
        assert_eq!(entry.message, "display wake");
    }

    #[test]
    fn non_event_lines_are_skipped() {
        assert!(parse_log_line("Filtering the log data").is_none());
        assert!(parse_log_line(r#"{"timestamp":"t"}"#).is_none());
    }

    #[test]
    fn parses_launchctl_output() {
        let text = "PID\tStatus\tLabel\n123\t0\tcom.apple.SpringBoard\n-\t0\tcom.apple.idle\n456\t0\tcom.example.app\n";
        let procs = parse_process_list(text);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].process, "com.apple.SpringBoard");
        assert_eq!(procs[1].pid, 456);
    }

    #[tokio::test]
    async fn rejects_bad_coordinates() {
        let driver = HostDriver::new();
        let err = driver.set_location("U", 91.0, 0.0).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
