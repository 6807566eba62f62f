//! Host driver: typed surface over the simulator command-line tools
//!
//! Every operation shells out to `xcrun simctl` or the `idb` companion and
//! treats the child process as fallible: stdout, stderr, exit code, and
//! duration are captured, and every call carries a wall-clock deadline.
//! Automation calls against a single device are serialized through a
//! per-UDID mutex; calls against distinct devices proceed in parallel.

pub mod app;
pub mod command;
pub mod device;
pub mod input;
pub mod io;

pub use app::InstalledAppInfo;
pub use device::{DeviceInfo, DeviceState, DeviceTypeInfo, RuntimeInfo};
pub use input::HardwareButton;
pub use io::{LogEntry, ProcessInfo, ScreenshotFormat, StreamFormat};

use crate::error::{Error, Result};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Default deadline for device automation calls.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for device creation and boot.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a control call waits for the per-device mutex before failing
/// with `busy`.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HostDriver {
    /// Per-UDID serialization of automation calls
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HostDriver {
    pub fn new() -> Self {
        Self {
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Verify the simulator toolchain is present. Called once at startup.
    pub async fn probe(&self) -> Result<()> {
        command::run("xcrun", &["simctl", "help"], ACTION_TIMEOUT)
            .await
            .map_err(|e| Error::Driver(format!("simctl unavailable: {}", e)))?;
        Ok(())
    }

    fn device_lock(&self, udid: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.device_locks.lock();
        locks
            .entry(udid.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Acquire the per-device mutex, failing fast with `busy` after
    /// [`BUSY_TIMEOUT`]. Control messages do not queue behind a slow device.
    pub(crate) async fn lock_device(&self, udid: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self.device_lock(udid);
        tokio::time::timeout(BUSY_TIMEOUT, lock.lock_owned())
            .await
            .map_err(|_| Error::Busy(format!("device {} is busy", udid)))
    }

    /// Drop the lock entry for a deleted device.
    pub(crate) fn forget_device(&self, udid: &str) {
        self.device_locks.lock().remove(udid);
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry an idempotent driver call up to 3 times with exponential backoff.
/// Non-transient errors surface immediately.
pub(crate) async fn with_retry<T, F, Fut>(op: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < 2 => {
                attempt += 1;
                warn!("{} failed (attempt {}): {}; retrying", op, attempt, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("gone".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Timeout("slow".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn busy_lock_times_out() {
        let driver = HostDriver::new();
        let held = driver.lock_device("UDID-1").await.unwrap();
        let second = driver.lock_device("UDID-1").await;
        assert!(matches!(second, Err(Error::Busy(_))));
        drop(held);
        assert!(driver.lock_device("UDID-1").await.is_ok());
    }

    #[tokio::test]
    async fn distinct_devices_do_not_contend() {
        let driver = HostDriver::new();
        let _a = driver.lock_device("UDID-A").await.unwrap();
        assert!(driver.lock_device("UDID-B").await.is_ok());
    }
}
