//! Session manager: sole authority over session identity and lifecycle
//!
//! Mutations serialize through a single writer lock and commit to the store
//! before the in-memory snapshot is swapped; readers clone an `Arc` of the
//! latest snapshot and never block.

use super::store::SessionStore;
use super::{InstalledApp, Session};
use crate::driver::{DeviceInfo, DeviceState, HostDriver};
use crate::error::{Error, Result};
use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Device types and OS versions available on the host.
#[derive(Debug, Clone, Serialize)]
pub struct Configurations {
    pub device_types: Vec<String>,
    pub os_versions: Vec<String>,
}

pub struct SessionManager {
    driver: Arc<HostDriver>,
    store: SessionStore,
    sessions: RwLock<Arc<HashMap<String, Session>>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(driver: Arc<HostDriver>, store: SessionStore) -> Self {
        Self {
            driver,
            store,
            sessions: RwLock::new(Arc::new(HashMap::new())),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Startup protocol: load the store, validate every record against the
    /// live device list, recover orphaned booted simulators, log a summary.
    /// Per-record failures drop the record and never abort startup.
    pub async fn startup(&self) -> Result<()> {
        let loaded = self.store.load();
        let loaded_count = loaded.len();
        *self.sessions.write() = Arc::new(loaded);

        let mut dropped = 0;
        match self.driver.list_devices().await {
            Ok(live) => {
                let dead = dead_session_ids(&self.snapshot(), &live);
                dropped = dead.len();
                let now = Utc::now();
                self.commit(|map| {
                    for id in &dead {
                        map.remove(id);
                    }
                    for s in map.values_mut() {
                        s.last_validated = Some(now);
                    }
                })
                .await?;
            }
            Err(e) => {
                // Validation is skipped rather than treating every record
                // as dead; refresh() will prune once the driver recovers.
                warn!("Device list unavailable at startup: {}; keeping stored sessions", e);
            }
        }

        let recovered = match self.recover_orphaned().await {
            Ok(r) => r.len(),
            Err(e) => {
                warn!("Orphan recovery failed: {}", e);
                0
            }
        };

        info!(
            "Session startup: {} loaded, {} dropped (device gone), recovered {} orphaned session{}",
            loaded_count,
            dropped,
            recovered,
            if recovered == 1 { "" } else { "s" }
        );
        Ok(())
    }

    fn snapshot(&self) -> Arc<HashMap<String, Session>> {
        self.sessions.read().clone()
    }

    /// Serialize a mutation: persist to the store first, then swap the
    /// snapshot so readers observe the committed state.
    async fn commit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, Session>),
    {
        let _guard = self.write_lock.lock().await;
        let mut map = (*self.snapshot()).clone();
        f(&mut map);
        self.store.save(&map)?;
        *self.sessions.write() = Arc::new(map);
        Ok(())
    }

    pub async fn list_configurations(&self) -> Result<Configurations> {
        let device_types = self
            .driver
            .list_device_types()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();
        let os_versions = self
            .driver
            .list_runtimes()
            .await?
            .into_iter()
            .map(|r| r.version)
            .collect();
        Ok(Configurations {
            device_types,
            os_versions,
        })
    }

    /// Create and boot a new simulator, returning the persisted session.
    pub async fn create(&self, device_type: &str, os_version: &str) -> Result<Session> {
        let udid = self.driver.create_device(device_type, os_version).await?;

        if let Err(e) = self.driver.boot(&udid).await {
            warn!("Boot failed for {}; deleting device: {}", udid, e);
            let _ = self.driver.delete_device(&udid).await;
            return Err(e);
        }

        let (pw, ph, ppw, pph, scale) = match self.driver.device_dimensions(&udid).await {
            Ok(dims) => dims,
            Err(e) => {
                warn!("Dimension probe failed for {}; deleting device: {}", udid, e);
                let _ = self.driver.shutdown(&udid).await;
                let _ = self.driver.delete_device(&udid).await;
                return Err(e);
            }
        };

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            udid: udid.clone(),
            device_type: device_type.to_string(),
            os_version: os_version.to_string(),
            point_width: pw,
            point_height: ph,
            pixel_width: ppw,
            pixel_height: pph,
            scale_factor: scale,
            created_at: Utc::now(),
            last_validated: Some(Utc::now()),
            installed_apps: HashMap::new(),
        };
        debug_assert!(session.invariants_hold());

        let persisted = session.clone();
        self.commit(move |map| {
            map.insert(persisted.id.clone(), persisted);
        })
        .await?;

        info!("Created session {} on device {}", session.id, udid);
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.snapshot().get(id).cloned()
    }

    /// List sessions whose devices still exist on the host.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let live: HashSet<String> = self
            .driver
            .list_devices()
            .await?
            .into_iter()
            .map(|d| d.udid)
            .collect();
        let mut sessions: Vec<Session> = self
            .snapshot()
            .values()
            .filter(|s| live.contains(&s.udid))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Shut down and erase the device, then remove the record.
    pub async fn delete(&self, id: &str) -> Result<Session> {
        let session = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;

        if let Err(e) = self.driver.shutdown(&session.udid).await {
            warn!("Shutdown of {} failed during delete: {}", session.udid, e);
        }
        if let Err(e) = self.driver.erase(&session.udid).await {
            warn!("Erase of {} failed during delete: {}", session.udid, e);
        }
        if let Err(e) = self.driver.delete_device(&session.udid).await {
            warn!("Device delete of {} failed: {}", session.udid, e);
        }

        self.commit(|map| {
            map.remove(id);
        })
        .await?;
        info!("Deleted session {} (device {})", id, session.udid);
        Ok(session)
    }

    /// Cross-check a session's UDID against the live device list.
    pub async fn validate(&self, id: &str) -> Result<bool> {
        let session = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;
        let live = self.driver.list_devices().await?;
        let valid = live.iter().any(|d| d.udid == session.udid);
        if valid {
            let now = Utc::now();
            self.commit(|map| {
                if let Some(s) = map.get_mut(id) {
                    s.last_validated = Some(now);
                }
            })
            .await?;
        }
        Ok(valid)
    }

    /// Synthesize sessions for booted devices no record covers. Idempotent:
    /// a second run with no external change recovers nothing.
    pub async fn recover_orphaned(&self) -> Result<Vec<Session>> {
        let booted = self.driver.list_booted().await?;
        let orphans = find_orphans(&self.snapshot(), &booted);

        let mut recovered = Vec::new();
        for device in orphans {
            let (pw, ph, ppw, pph, scale) = match self.driver.device_dimensions(&device.udid).await
            {
                Ok(dims) => dims,
                Err(e) => {
                    warn!("Skipping orphan {}: dimension probe failed: {}", device.udid, e);
                    continue;
                }
            };
            let session = Session {
                id: uuid::Uuid::new_v4().to_string(),
                udid: device.udid.clone(),
                device_type: device_type_name(&device.device_type),
                os_version: runtime_version(&device.runtime),
                point_width: pw,
                point_height: ph,
                pixel_width: ppw,
                pixel_height: pph,
                scale_factor: scale,
                created_at: Utc::now(),
                last_validated: Some(Utc::now()),
                installed_apps: HashMap::new(),
            };
            info!(
                "Recovered orphaned device {} (pid {}) as session {}",
                device.udid,
                device.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
                session.id
            );
            recovered.push(session);
        }

        if !recovered.is_empty() {
            let batch = recovered.clone();
            self.commit(move |map| {
                for s in batch {
                    map.insert(s.id.clone(), s);
                }
            })
            .await?;
        }
        Ok(recovered)
    }

    /// Re-validate every record, dropping those whose devices are gone.
    /// Returns the surviving sessions.
    pub async fn refresh(&self) -> Result<Vec<Session>> {
        let live = self.driver.list_devices().await?;
        let dead = dead_session_ids(&self.snapshot(), &live);
        let now = Utc::now();
        self.commit(|map| {
            for id in &dead {
                warn!("Dropping session {}: device no longer exists", id);
                map.remove(id);
            }
            for s in map.values_mut() {
                s.last_validated = Some(now);
            }
        })
        .await?;
        Ok(self.snapshot().values().cloned().collect())
    }

    /// Remove every session (and its device). Returns how many went away.
    pub async fn delete_all(&self) -> Result<usize> {
        let ids: Vec<String> = self.snapshot().keys().cloned().collect();
        let mut deleted = 0;
        for id in ids {
            match self.delete(&id).await {
                Ok(_) => deleted += 1,
                Err(e) => warn!("Delete of {} failed: {}", id, e),
            }
        }
        Ok(deleted)
    }

    pub async fn record_installed_app(&self, id: &str, app: InstalledApp) -> Result<()> {
        self.commit(|map| {
            if let Some(s) = map.get_mut(id) {
                s.installed_apps.insert(app.bundle_id.clone(), app);
            }
        })
        .await
    }

    pub async fn remove_installed_app(&self, id: &str, bundle_id: &str) -> Result<()> {
        self.commit(|map| {
            if let Some(s) = map.get_mut(id) {
                s.installed_apps.remove(bundle_id);
            }
        })
        .await
    }

    pub fn session_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Every stored session, no liveness filter. Used by teardown paths.
    pub fn all(&self) -> Vec<Session> {
        self.snapshot().values().cloned().collect()
    }

    /// Persist the current snapshot. Used during shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.commit(|_| {}).await
    }
}

/// Session IDs whose UDID is absent from the live device list.
fn dead_session_ids(sessions: &HashMap<String, Session>, live: &[DeviceInfo]) -> Vec<String> {
    let live_udids: HashSet<&str> = live.iter().map(|d| d.udid.as_str()).collect();
    sessions
        .values()
        .filter(|s| !live_udids.contains(s.udid.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

/// Booted devices not covered by any session record.
fn find_orphans(sessions: &HashMap<String, Session>, booted: &[DeviceInfo]) -> Vec<DeviceInfo> {
    let covered: HashSet<&str> = sessions.values().map(|s| s.udid.as_str()).collect();
    booted
        .iter()
        .filter(|d| d.state == DeviceState::Booted && !covered.contains(d.udid.as_str()))
        .cloned()
        .collect()
}

/// `com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro` -> `iPhone 15 Pro`
fn device_type_name(identifier: &str) -> String {
    identifier
        .rsplit('.')
        .next()
        .unwrap_or(identifier)
        .replace('-', " ")
}

/// `com.apple.CoreSimulator.SimRuntime.iOS-17-0` -> `17.0`
fn runtime_version(identifier: &str) -> String {
    let tail = identifier.rsplit('.').next().unwrap_or(identifier);
    tail.strip_prefix("iOS-")
        .unwrap_or(tail)
        .replace('-', ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;

    fn device(udid: &str, state: DeviceState) -> DeviceInfo {
        DeviceInfo {
            udid: udid.to_string(),
            name: "iPhone 15 Pro".to_string(),
            runtime: "com.apple.CoreSimulator.SimRuntime.iOS-17-0".to_string(),
            device_type: "com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro".to_string(),
            state,
            pid: if state == DeviceState::Booted { Some(100) } else { None },
        }
    }

    #[test]
    fn dead_sessions_are_those_without_devices() {
        let mut sessions = HashMap::new();
        sessions.insert("s1".to_string(), test_session("s1", "U1"));
        sessions.insert("s2".to_string(), test_session("s2", "U2"));
        let live = vec![device("U1", DeviceState::Booted)];

        let dead = dead_session_ids(&sessions, &live);
        assert_eq!(dead, vec!["s2".to_string()]);
    }

    #[test]
    fn orphans_are_booted_and_uncovered() {
        let mut sessions = HashMap::new();
        sessions.insert("s1".to_string(), test_session("s1", "U1"));
        let booted = vec![
            device("U1", DeviceState::Booted),
            device("U2", DeviceState::Booted),
            device("U3", DeviceState::Shutdown),
        ];

        let orphans = find_orphans(&sessions, &booted);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].udid, "U2");
    }

    #[test]
    fn orphan_recovery_is_idempotent_over_records() {
        let mut sessions = HashMap::new();
        sessions.insert("s1".to_string(), test_session("s1", "U1"));
        let booted = vec![device("U1", DeviceState::Booted)];
        // All booted devices covered: nothing to recover.
        assert!(find_orphans(&sessions, &booted).is_empty());
    }

    #[test]
    fn identifier_prettifiers() {
        assert_eq!(
            device_type_name("com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro"),
            "iPhone 15 Pro"
        );
        assert_eq!(
            runtime_version("com.apple.CoreSimulator.SimRuntime.iOS-17-0"),
            "17.0"
        );
        assert_eq!(runtime_version("weird"), "weird");
    }
}
