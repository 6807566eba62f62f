//! Recording service: per-session MP4 capture with emergency persistence
//!
//! One recorder child per session writes into a per-session scratch
//! directory. A normal stop signals the child, waits for the container to
//! finalize, streams the file to the caller, and removes the scratch. On
//! shutdown every active recording is stopped with a longer grace and the
//! file, even if truncated, is moved to a durable emergency directory.

use crate::driver::HostDriver;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::process::Child;

/// Grace between SIGINT and SIGKILL on a normal stop.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Longer grace used during emergency save.
const EMERGENCY_GRACE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingState {
    Idle,
    Recording,
    EmergencySaved,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub state: RecordingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

struct ActiveRecording {
    child: Child,
    path: PathBuf,
    started_at: DateTime<Utc>,
}

pub struct RecordingService {
    driver: Arc<HostDriver>,
    recordings_dir: PathBuf,
    active: tokio::sync::Mutex<HashMap<String, ActiveRecording>>,
}

impl RecordingService {
    pub fn new(driver: Arc<HostDriver>, state_dir: &std::path::Path) -> Result<Self> {
        let recordings_dir = state_dir.join("recordings");
        std::fs::create_dir_all(&recordings_dir)?;
        Ok(Self {
            driver,
            recordings_dir,
            active: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn scratch_dir(&self, session_id: &str) -> PathBuf {
        self.recordings_dir.join(session_id)
    }

    fn emergency_dir(&self) -> PathBuf {
        self.recordings_dir.join("_emergency")
    }

    /// Start recording a session's device.
    pub async fn start(&self, session_id: &str, udid: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.contains_key(session_id) {
            return Err(Error::Busy(format!(
                "recording already active for session {}",
                session_id
            )));
        }

        let scratch = self.scratch_dir(session_id);
        std::fs::create_dir_all(&scratch)?;
        let path = scratch.join("recording.mp4");

        let child = self.driver.start_recording(udid, &path)?;
        info!("Recording started for session {} -> {:?}", session_id, path);
        active.insert(
            session_id.to_string(),
            ActiveRecording {
                child,
                path,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Stop a recording and return the finalized MP4 bytes. The scratch
    /// directory is removed afterwards.
    pub async fn stop(&self, session_id: &str) -> Result<Vec<u8>> {
        let mut recording = {
            let mut active = self.active.lock().await;
            active.remove(session_id).ok_or_else(|| {
                Error::BadState(format!("no recording active for session {}", session_id))
            })?
        };

        finalize_child(&mut recording.child, STOP_GRACE).await;

        let bytes = std::fs::read(&recording.path)
            .map_err(|e| Error::Internal(format!("recording file unreadable: {}", e)))?;
        if bytes.is_empty() {
            return Err(Error::Internal("recording file is empty".into()));
        }
        let _ = std::fs::remove_dir_all(self.scratch_dir(session_id));
        info!(
            "Recording stopped for session {} ({} bytes)",
            session_id,
            bytes.len()
        );
        Ok(bytes)
    }

    /// Drop an active recording without returning its data. Used when the
    /// session itself is deleted.
    pub async fn discard(&self, session_id: &str) {
        let recording = self.active.lock().await.remove(session_id);
        if let Some(mut recording) = recording {
            let _ = recording.child.start_kill();
            let _ = recording.child.wait().await;
            let _ = std::fs::remove_dir_all(self.scratch_dir(session_id));
            info!("Discarded recording for deleted session {}", session_id);
        }
    }

    pub async fn status(&self, session_id: &str) -> RecordingStatus {
        if let Some(rec) = self.active.lock().await.get(session_id) {
            return RecordingStatus {
                state: RecordingState::Recording,
                started_at: Some(rec.started_at),
            };
        }
        if self.has_emergency_file(session_id) {
            return RecordingStatus {
                state: RecordingState::EmergencySaved,
                started_at: None,
            };
        }
        RecordingStatus {
            state: RecordingState::Idle,
            started_at: None,
        }
    }

    fn has_emergency_file(&self, session_id: &str) -> bool {
        let prefix = format!("{}-", session_id);
        std::fs::read_dir(self.emergency_dir())
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            })
            .unwrap_or(false)
    }

    /// Stop every active recording and persist the files, truncated or not,
    /// under the emergency directory. Shutdown path.
    pub async fn emergency_save_all(&self) {
        let drained: Vec<(String, ActiveRecording)> =
            self.active.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        let emergency = self.emergency_dir();
        if let Err(e) = std::fs::create_dir_all(&emergency) {
            warn!("Cannot create emergency dir {:?}: {}", emergency, e);
            return;
        }

        for (session_id, mut recording) in drained {
            finalize_child(&mut recording.child, EMERGENCY_GRACE).await;

            let name = emergency_file_name(&session_id, Utc::now());
            let dest = emergency.join(&name);
            match std::fs::rename(&recording.path, &dest) {
                Ok(()) => info!("Emergency-saved recording for {} -> {:?}", session_id, dest),
                Err(e) => warn!(
                    "Failed to save recording for {} to {:?}: {}",
                    session_id, dest, e
                ),
            }
            let _ = std::fs::remove_dir_all(self.scratch_dir(&session_id));
        }
    }

    /// Remove emergency recordings older than `max_age`. Returns the count
    /// removed.
    pub fn cleanup_emergency(&self, max_age: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(self.emergency_dir()) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let old_enough = now
                .duration_since(modified)
                .map(|age| age > max_age)
                .unwrap_or(false);
            if old_enough && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} expired emergency recordings", removed);
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

/// Signal the recorder to finalize, then kill it if the grace expires.
async fn finalize_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // SIGINT lets the recorder close the MP4 container cleanly.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("Recorder did not finalize within {:?}; killing", grace);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn emergency_file_name(session_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.mp4", session_id, at.format("%Y%m%dT%H%M%SZ"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> RecordingService {
        RecordingService::new(Arc::new(HostDriver::new()), dir).unwrap()
    }

    #[tokio::test]
    async fn stop_without_start_is_bad_state() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc.stop("s1").await.unwrap_err();
        assert_eq!(err.kind(), "bad-state");
    }

    #[tokio::test]
    async fn status_is_idle_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let status = svc.status("s1").await;
        assert_eq!(status.state, RecordingState::Idle);
        assert!(status.started_at.is_none());
    }

    #[tokio::test]
    async fn status_reports_emergency_saved_files() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let emergency = dir.path().join("recordings/_emergency");
        std::fs::create_dir_all(&emergency).unwrap();
        std::fs::write(emergency.join("s1-20240501T100000Z.mp4"), b"mp4").unwrap();

        assert_eq!(svc.status("s1").await.state, RecordingState::EmergencySaved);
        assert_eq!(svc.status("s2").await.state, RecordingState::Idle);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let emergency = dir.path().join("recordings/_emergency");
        std::fs::create_dir_all(&emergency).unwrap();
        std::fs::write(emergency.join("s1-a.mp4"), b"old").unwrap();
        std::fs::write(emergency.join("s2-b.mp4"), b"new").unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(svc.cleanup_emergency(Duration::from_secs(3600)), 0);
        // Everything is older than zero.
        assert_eq!(svc.cleanup_emergency(Duration::ZERO), 2);
        assert_eq!(std::fs::read_dir(&emergency).unwrap().count(), 0);
    }

    #[test]
    fn emergency_names_carry_session_and_timestamp() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            emergency_file_name("abc", at),
            "abc-20240501T100000Z.mp4"
        );
    }
}
