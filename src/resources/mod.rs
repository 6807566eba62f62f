//! Resource manager: ownership of all capture services
//!
//! The pool is the single owner of `VideoService` and `WebRtcService`
//! instances; services exist exactly while they are reachable from here.
//! Releasing the last client starts the idle grace window rather than
//! destroying the service, so a quick browser refresh does not pay capture
//! startup cost again. A background sampler watches resident memory and
//! sheds idle services under pressure.

use crate::capture::{
    frame::StreamSettings, video::VideoServiceStats, webrtc::WebRtcServiceStats, FrameRing,
    VideoService, WebRtcService,
};
use crate::config::{CaptureConfig, MemoryConfig};
use crate::driver::HostDriver;
use crate::session::Session;
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Idle sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Services closed per emergency pass, at most.
const EMERGENCY_CLOSE_LIMIT: usize = 3;

#[derive(Debug, Default, Serialize)]
pub struct ResourceMetrics {
    pub services_created: u64,
    pub services_destroyed: u64,
    pub idle_cleanups: u64,
    pub emergency_cleanups: u64,
}

#[derive(Debug, Serialize)]
pub struct MemoryStats {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub percent_of_limit: f64,
    pub limit_mb: u64,
}

#[derive(Debug, Serialize)]
pub struct ResourceStats {
    pub video_services: Vec<VideoServiceStats>,
    pub webrtc_services: Vec<WebRtcServiceStats>,
    pub metrics: ResourceMetrics,
    pub memory: MemoryStats,
}

struct Metrics {
    created: AtomicU64,
    destroyed: AtomicU64,
    idle_cleanups: AtomicU64,
    emergency_cleanups: AtomicU64,
}

pub struct ResourceManager {
    driver: Arc<HostDriver>,
    idle_grace: Duration,
    memory_cfg: MemoryConfig,
    default_settings: StreamSettings,

    video: Mutex<HashMap<String, Arc<VideoService>>>,
    webrtc: Mutex<HashMap<String, Arc<WebRtcService>>>,

    metrics: Metrics,
    system: Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
}

impl ResourceManager {
    pub fn new(driver: Arc<HostDriver>, capture: &CaptureConfig, memory: MemoryConfig) -> Self {
        Self {
            driver,
            idle_grace: Duration::from_secs(capture.service_idle_timeout_secs),
            memory_cfg: memory,
            default_settings: StreamSettings::new(capture.default_quality, capture.default_fps),
            video: Mutex::new(HashMap::new()),
            webrtc: Mutex::new(HashMap::new()),
            metrics: Metrics {
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                idle_cleanups: AtomicU64::new(0),
                emergency_cleanups: AtomicU64::new(0),
            },
            system: Mutex::new(sysinfo::System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Acquire the frame service for a session's device. Creates the
    /// singleton on first use; always returns a ring dedicated to this
    /// client.
    pub fn get_video(
        &self,
        session: &Session,
        client_id: &str,
        ring_capacity: usize,
    ) -> (Arc<VideoService>, Arc<FrameRing>) {
        let service = {
            let mut pool = self.video.lock();
            pool.entry(session.udid.clone())
                .or_insert_with(|| {
                    self.metrics.created.fetch_add(1, Ordering::Relaxed);
                    info!("Starting video service for {}", session.udid);
                    VideoService::spawn(
                        self.driver.clone(),
                        session.udid.clone(),
                        (session.point_width, session.point_height),
                        (session.pixel_width, session.pixel_height),
                        self.default_settings,
                    )
                })
                .clone()
        };
        let ring = service.add_client(client_id, ring_capacity);
        (service, ring)
    }

    pub fn release_video(&self, udid: &str, client_id: &str) {
        if let Some(service) = self.video.lock().get(udid) {
            service.remove_client(client_id);
        }
    }

    pub fn get_webrtc(&self, session: &Session, client_id: &str) -> Arc<WebRtcService> {
        let service = {
            let mut pool = self.webrtc.lock();
            pool.entry(session.udid.clone())
                .or_insert_with(|| {
                    self.metrics.created.fetch_add(1, Ordering::Relaxed);
                    info!("Starting WebRTC service for {}", session.udid);
                    WebRtcService::spawn(
                        self.driver.clone(),
                        session.udid.clone(),
                        self.default_settings,
                    )
                })
                .clone()
        };
        service.add_client(client_id);
        service
    }

    pub fn release_webrtc(&self, udid: &str, client_id: &str) {
        if let Some(service) = self.webrtc.lock().get(udid) {
            service.remove_client(client_id);
        }
    }

    /// Tear down every service for a device. Used when its session is
    /// deleted; active clients lose their source and unwind via their own
    /// socket paths.
    pub fn detach_device(&self, udid: &str) {
        if let Some(service) = self.video.lock().remove(udid) {
            service.stop();
            self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(service) = self.webrtc.lock().remove(udid) {
            service.stop();
            self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict services whose idle grace window has expired.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;

        let expired: Vec<String> = self
            .video
            .lock()
            .iter()
            .filter(|(_, s)| s.client_count() == 0 && s.idle_expired(self.idle_grace, now))
            .map(|(udid, _)| udid.clone())
            .collect();
        for udid in expired {
            if let Some(service) = self.video.lock().remove(&udid) {
                info!("Evicting idle video service for {}", udid);
                service.stop();
                evicted += 1;
            }
        }

        let expired: Vec<String> = self
            .webrtc
            .lock()
            .iter()
            .filter(|(_, s)| s.client_count() == 0 && s.idle_expired(self.idle_grace, now))
            .map(|(udid, _)| udid.clone())
            .collect();
        for udid in expired {
            if let Some(service) = self.webrtc.lock().remove(&udid) {
                info!("Evicting idle WebRTC service for {}", udid);
                service.stop();
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.metrics
                .destroyed
                .fetch_add(evicted as u64, Ordering::Relaxed);
            self.metrics
                .idle_cleanups
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Close up to three zero-client services regardless of grace. Never
    /// touches a service with active clients.
    pub fn emergency_cleanup(&self) -> usize {
        let mut candidates: Vec<(usize, String, bool)> = Vec::new();
        for (udid, s) in self.video.lock().iter() {
            candidates.push((s.client_count(), udid.clone(), true));
        }
        for (udid, s) in self.webrtc.lock().iter() {
            candidates.push((s.client_count(), udid.clone(), false));
        }
        candidates.sort_by_key(|(clients, _, _)| *clients);

        let mut closed = 0;
        for (clients, udid, is_video) in candidates {
            if closed >= EMERGENCY_CLOSE_LIMIT {
                break;
            }
            if clients > 0 {
                break;
            }
            let stopped = if is_video {
                self.video.lock().remove(&udid).map(|s| s.stop()).is_some()
            } else {
                self.webrtc.lock().remove(&udid).map(|s| s.stop()).is_some()
            };
            if stopped {
                warn!("Emergency cleanup closed capture service for {}", udid);
                closed += 1;
            }
        }

        if closed > 0 {
            self.metrics
                .destroyed
                .fetch_add(closed as u64, Ordering::Relaxed);
            self.metrics
                .emergency_cleanups
                .fetch_add(closed as u64, Ordering::Relaxed);
        }
        closed
    }

    /// Sample resident memory and apply the pressure policy: idle eviction
    /// at 80% of the cap, emergency cleanup at 100%.
    pub fn check_memory(&self) {
        let stats = self.memory_stats();
        let limit_bytes = self.memory_cfg.max_memory_mb * 1024 * 1024;
        if limit_bytes == 0 {
            return;
        }
        if stats.resident_bytes >= limit_bytes {
            warn!(
                "Resident memory {} MB at/above cap {} MB; emergency cleanup",
                stats.resident_bytes / (1024 * 1024),
                self.memory_cfg.max_memory_mb
            );
            self.emergency_cleanup();
        } else if stats.resident_bytes * 10 >= limit_bytes * 8 {
            info!(
                "Resident memory {} MB above 80% of cap; evicting idle services",
                stats.resident_bytes / (1024 * 1024)
            );
            self.sweep_idle();
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let (resident, virtual_mem) = match self.pid {
            Some(pid) => {
                let mut system = self.system.lock();
                system.refresh_process(pid);
                system
                    .process(pid)
                    .map(|p| (p.memory(), p.virtual_memory()))
                    .unwrap_or((0, 0))
            }
            None => (0, 0),
        };
        let limit_bytes = self.memory_cfg.max_memory_mb * 1024 * 1024;
        MemoryStats {
            resident_bytes: resident,
            virtual_bytes: virtual_mem,
            percent_of_limit: if limit_bytes > 0 {
                resident as f64 * 100.0 / limit_bytes as f64
            } else {
                0.0
            },
            limit_mb: self.memory_cfg.max_memory_mb,
        }
    }

    pub fn service_count(&self) -> usize {
        self.video.lock().len() + self.webrtc.lock().len()
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            video_services: self.video.lock().values().map(|s| s.stats()).collect(),
            webrtc_services: self.webrtc.lock().values().map(|s| s.stats()).collect(),
            metrics: ResourceMetrics {
                services_created: self.metrics.created.load(Ordering::Relaxed),
                services_destroyed: self.metrics.destroyed.load(Ordering::Relaxed),
                idle_cleanups: self.metrics.idle_cleanups.load(Ordering::Relaxed),
                emergency_cleanups: self.metrics.emergency_cleanups.load(Ordering::Relaxed),
            },
            memory: self.memory_stats(),
        }
    }

    /// Stop and drop every service. Shutdown path.
    pub fn cleanup_all(&self) {
        let video: Vec<_> = self.video.lock().drain().collect();
        for (udid, service) in video {
            info!("Stopping video service for {}", udid);
            service.stop();
            self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        let webrtc: Vec<_> = self.webrtc.lock().drain().collect();
        for (udid, service) in webrtc {
            info!("Stopping WebRTC service for {}", udid);
            service.stop();
            self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Spawn the idle sweep and memory monitor. Handles are owned by the
    /// caller and aborted on shutdown.
    pub fn spawn_background(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweep = {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    manager.sweep_idle();
                }
            })
        };
        let memory = {
            let manager = self.clone();
            let period = Duration::from_secs(self.memory_cfg.check_interval_secs.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    manager.check_memory();
                }
            })
        };
        vec![sweep, memory]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, Quality};
    use crate::session::test_session;

    fn manager(idle_secs: u64) -> Arc<ResourceManager> {
        let capture = CaptureConfig {
            default_quality: Quality::Medium,
            default_fps: 0,
            service_idle_timeout_secs: idle_secs,
        };
        Arc::new(ResourceManager::new(
            Arc::new(HostDriver::new()),
            &capture,
            MemoryConfig {
                max_memory_mb: 2048,
                check_interval_secs: 30,
            },
        ))
    }

    #[tokio::test]
    async fn video_service_is_a_singleton_per_udid() {
        let rm = manager(300);
        let session = test_session("s1", "U1");
        let (a, _) = rm.get_video(&session, "client-a", 3);
        let (b, _) = rm.get_video(&session, "client-b", 3);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.client_count(), 2);
        assert_eq!(rm.service_count(), 1);
        rm.cleanup_all();
    }

    #[tokio::test]
    async fn release_does_not_destroy_within_grace() {
        let rm = manager(300);
        let session = test_session("s1", "U1");
        let (_, _ring) = rm.get_video(&session, "client-a", 3);
        rm.release_video("U1", "client-a");
        // Still pooled: the idle grace window keeps it alive.
        assert_eq!(rm.service_count(), 1);
        assert_eq!(rm.sweep_idle(), 0);
        rm.cleanup_all();
    }

    #[tokio::test]
    async fn sweep_evicts_expired_idle_services() {
        let rm = manager(0);
        let session = test_session("s1", "U1");
        let (_, _ring) = rm.get_video(&session, "client-a", 3);
        rm.release_video("U1", "client-a");
        assert_eq!(rm.sweep_idle(), 1);
        assert_eq!(rm.service_count(), 0);
        assert_eq!(rm.stats().metrics.idle_cleanups, 1);
    }

    #[tokio::test]
    async fn emergency_cleanup_never_touches_active_services() {
        let rm = manager(300);
        let active = test_session("s1", "U1");
        let idle = test_session("s2", "U2");
        let (_, _ring) = rm.get_video(&active, "client-a", 3);
        let (_, _r2) = rm.get_video(&idle, "client-b", 3);
        rm.release_video("U2", "client-b");

        let closed = rm.emergency_cleanup();
        assert_eq!(closed, 1);
        assert_eq!(rm.service_count(), 1);
        assert!(rm.video.lock().contains_key("U1"));
        rm.cleanup_all();
    }

    #[tokio::test]
    async fn emergency_cleanup_is_bounded_per_pass() {
        let rm = manager(300);
        for i in 0..5 {
            let s = test_session(&format!("s{}", i), &format!("U{}", i));
            let (_, _r) = rm.get_video(&s, "c", 3);
            rm.release_video(&s.udid, "c");
        }
        assert_eq!(rm.emergency_cleanup(), 3);
        assert_eq!(rm.service_count(), 2);
        rm.cleanup_all();
    }

    #[tokio::test]
    async fn detach_device_removes_both_kinds() {
        let rm = manager(300);
        let session = test_session("s1", "U1");
        let (_, _ring) = rm.get_video(&session, "a", 3);
        let _svc = rm.get_webrtc(&session, "a");
        assert_eq!(rm.service_count(), 2);
        rm.detach_device("U1");
        assert_eq!(rm.service_count(), 0);
    }
}
