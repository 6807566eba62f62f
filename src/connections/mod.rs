//! Connection manager: authorization and tracking of transport connections
//!
//! Every endpoint reserves a slot through [`ConnectionManager::try_register`]
//! and holds the returned [`ScopedConnection`] for the life of the socket;
//! dropping it on any exit path (including panics and abrupt closes)
//! unregisters the connection. Handles are stored weakly so a leaked socket
//! cannot pin registry memory; a periodic reaper removes entries whose
//! handle is gone.

use crate::config::ConnectionsConfig;
use crate::error::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Transport connection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    Control,
    Video,
    UltraVideo,
    WebrtcSignaling,
    Screenshot,
    Logs,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Control => "control",
            ConnectionKind::Video => "video",
            ConnectionKind::UltraVideo => "ultra-video",
            ConnectionKind::WebrtcSignaling => "webrtc-signaling",
            ConnectionKind::Screenshot => "screenshot",
            ConnectionKind::Logs => "logs",
        }
    }
}

/// Identity of one live connection. Endpoints hold the only strong
/// reference (inside their [`ScopedConnection`]).
#[derive(Debug)]
pub struct ConnectionHandle {
    pub session_id: String,
    pub kind: ConnectionKind,
    pub source: IpAddr,
    pub opened_at: Instant,
}

#[derive(Debug)]
struct Entry {
    kind: ConnectionKind,
    source: IpAddr,
    handle: Weak<ConnectionHandle>,
}

/// RAII registration: dropping this unregisters the connection.
#[derive(Debug)]
pub struct ScopedConnection {
    manager: Arc<ConnectionManager>,
    handle: Arc<ConnectionHandle>,
}

impl ScopedConnection {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.manager.unregister(&self.handle);
    }
}

#[derive(Debug, Serialize)]
pub struct SessionConnectionStats {
    pub session_id: String,
    pub total: usize,
    pub by_kind: HashMap<&'static str, usize>,
    pub distinct_sources: usize,
}

#[derive(Debug, Serialize)]
pub struct RateBucketStats {
    pub session_id: String,
    pub source: String,
    pub events_in_window: usize,
}

#[derive(Debug, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub sessions: Vec<SessionConnectionStats>,
    pub rate_buckets: Vec<RateBucketStats>,
}

#[derive(Debug)]
pub struct ConnectionManager {
    max_per_session: usize,
    max_per_window: usize,
    window: Duration,
    reap_interval: Duration,

    registry: Mutex<HashMap<String, Vec<Entry>>>,
    rate: Mutex<HashMap<(String, IpAddr), Vec<Instant>>>,
}

impl ConnectionManager {
    pub fn new(config: &ConnectionsConfig) -> Self {
        Self {
            max_per_session: config.max_per_session,
            max_per_window: config.max_per_minute,
            window: Duration::from_secs(config.rate_limit_window_secs),
            reap_interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            registry: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a slot for a new connection. Rate limiting is checked first,
    /// then the per-session cap; each denial carries a distinct error kind.
    /// The receiver is cloned into the returned guard so the unregister on
    /// drop can never dangle.
    pub fn try_register(
        self: Arc<Self>,
        session_id: &str,
        kind: ConnectionKind,
        source: IpAddr,
    ) -> Result<ScopedConnection> {
        self.check_rate(session_id, source)?;

        let handle = Arc::new(ConnectionHandle {
            session_id: session_id.to_string(),
            kind,
            source,
            opened_at: Instant::now(),
        });

        {
            let mut registry = self.registry.lock();
            let entries = registry.entry(session_id.to_string()).or_default();
            entries.retain(|e| e.handle.strong_count() > 0);
            if entries.len() >= self.max_per_session {
                return Err(Error::CapExceeded);
            }
            entries.push(Entry {
                kind,
                source,
                handle: Arc::downgrade(&handle),
            });
        }

        self.record_attempt(session_id, source);
        debug!(
            "Registered {} connection for session {} from {}",
            kind.as_str(),
            session_id,
            source
        );
        Ok(ScopedConnection {
            manager: self,
            handle,
        })
    }

    fn check_rate(&self, session_id: &str, source: IpAddr) -> Result<()> {
        let now = Instant::now();
        let mut rate = self.rate.lock();
        let bucket = rate
            .entry((session_id.to_string(), source))
            .or_default();
        bucket.retain(|t| now.duration_since(*t) < self.window);
        if bucket.len() >= self.max_per_window {
            return Err(Error::RateLimited);
        }
        Ok(())
    }

    fn record_attempt(&self, session_id: &str, source: IpAddr) {
        let mut rate = self.rate.lock();
        if let Some(bucket) = rate.get_mut(&(session_id.to_string(), source)) {
            bucket.push(Instant::now());
        }
    }

    fn unregister(&self, handle: &Arc<ConnectionHandle>) {
        let mut registry = self.registry.lock();
        if let Some(entries) = registry.get_mut(&handle.session_id) {
            entries.retain(|e| {
                e.handle
                    .upgrade()
                    .map(|h| !Arc::ptr_eq(&h, handle))
                    .unwrap_or(false)
            });
            if entries.is_empty() {
                registry.remove(&handle.session_id);
            }
        }
        debug!(
            "Unregistered {} connection for session {}",
            handle.kind.as_str(),
            handle.session_id
        );
    }

    /// Remove entries whose handle can no longer be resolved and prune
    /// empty rate windows.
    pub fn reap(&self) -> usize {
        let mut removed = 0;
        {
            let mut registry = self.registry.lock();
            registry.retain(|_, entries| {
                let before = entries.len();
                entries.retain(|e| e.handle.strong_count() > 0);
                removed += before - entries.len();
                !entries.is_empty()
            });
        }
        {
            let now = Instant::now();
            let mut rate = self.rate.lock();
            rate.retain(|_, bucket| {
                bucket.retain(|t| now.duration_since(*t) < self.window);
                !bucket.is_empty()
            });
        }
        removed
    }

    pub fn count_for_session(&self, session_id: &str) -> usize {
        self.registry
            .lock()
            .get(session_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.handle.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.registry
            .lock()
            .values()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.handle.strong_count() > 0)
                    .count()
            })
            .sum()
    }

    pub fn stats(&self) -> ConnectionStats {
        let registry = self.registry.lock();
        let mut sessions = Vec::new();
        let mut total = 0;
        for (session_id, entries) in registry.iter() {
            let mut by_kind: HashMap<&'static str, usize> = HashMap::new();
            let mut sources: std::collections::HashSet<IpAddr> = std::collections::HashSet::new();
            let mut count = 0;
            for entry in entries {
                if entry.handle.strong_count() == 0 {
                    continue;
                }
                count += 1;
                *by_kind.entry(entry.kind.as_str()).or_default() += 1;
                sources.insert(entry.source);
            }
            total += count;
            sessions.push(SessionConnectionStats {
                session_id: session_id.clone(),
                total: count,
                by_kind,
                distinct_sources: sources.len(),
            });
        }
        drop(registry);

        let rate = self.rate.lock();
        let now = Instant::now();
        let rate_buckets = rate
            .iter()
            .map(|((session_id, source), bucket)| RateBucketStats {
                session_id: session_id.clone(),
                source: source.to_string(),
                events_in_window: bucket
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count(),
            })
            .collect();

        ConnectionStats {
            total,
            sessions,
            rate_buckets,
        }
    }

    /// Spawn the periodic weak-handle reaper. The handle is owned by the
    /// caller and aborted on shutdown.
    pub fn spawn_reaper(self: Arc<Self>) -> JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.reap_interval);
            loop {
                interval.tick().await;
                let removed = manager.reap();
                if removed > 0 {
                    debug!("Connection reaper removed {} dead entries", removed);
                }
            }
        })
    }

    #[cfg(test)]
    fn insert_leaked_entry(&self, session_id: &str, kind: ConnectionKind, source: IpAddr) {
        // Simulates a transport that lost its handle without unregistering.
        let handle = Arc::new(ConnectionHandle {
            session_id: session_id.to_string(),
            kind,
            source,
            opened_at: Instant::now(),
        });
        self.registry
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(Entry {
                kind,
                source,
                handle: Arc::downgrade(&handle),
            });
        // handle drops here; the weak entry is now dead.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn manager() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(&ConnectionsConfig {
            max_per_session: 10,
            max_per_minute: 20,
            rate_limit_window_secs: 60,
            cleanup_interval_secs: 30,
        }))
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn eleventh_connection_exceeds_cap() {
        let m = manager();
        let mut held = Vec::new();
        for i in 0..10u8 {
            // Distinct sources so the rate limiter is not the constraint.
            held.push(
                m.clone().try_register("s1", ConnectionKind::Video, addr(i))
                    .unwrap(),
            );
        }
        let err = m
            .clone()
            .try_register("s1", ConnectionKind::Control, addr(100))
            .unwrap_err();
        assert!(matches!(err, Error::CapExceeded));
        assert_eq!(m.count_for_session("s1"), 10);
    }

    #[test]
    fn twenty_first_attempt_in_window_is_rate_limited() {
        let m = manager();
        let source = addr(1);
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(m.clone().try_register("s1", ConnectionKind::Video, source).unwrap());
        }
        // Churn through ten more short-lived connections from the same source.
        for _ in 0..10 {
            let c = m.clone().try_register("s1", ConnectionKind::Video, source).unwrap();
            drop(c);
        }
        let err = m
            .clone()
            .try_register("s1", ConnectionKind::Video, source)
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited));
        // The previously accepted connections remain live.
        assert_eq!(m.count_for_session("s1"), 10);
    }

    #[test]
    fn denied_attempts_do_not_grow_the_window() {
        let m = manager();
        let source = addr(1);
        for _ in 0..20 {
            drop(m.clone().try_register("s1", ConnectionKind::Video, source).unwrap());
        }
        for _ in 0..5 {
            assert!(m.clone().try_register("s1", ConnectionKind::Video, source).is_err());
        }
        let stats = m.stats();
        assert_eq!(stats.rate_buckets.len(), 1);
        assert!(stats.rate_buckets[0].events_in_window <= 20);
    }

    #[test]
    fn scoped_drop_unregisters() {
        let m = manager();
        let c = m.clone().try_register("s1", ConnectionKind::Control, addr(1)).unwrap();
        assert_eq!(m.count_for_session("s1"), 1);
        drop(c);
        assert_eq!(m.count_for_session("s1"), 0);
        assert_eq!(m.total_connections(), 0);
    }

    #[test]
    fn distinct_sources_have_independent_buckets() {
        let m = manager();
        for _ in 0..20 {
            drop(m.clone().try_register("s1", ConnectionKind::Video, addr(1)).unwrap());
        }
        assert!(m.clone().try_register("s1", ConnectionKind::Video, addr(1)).is_err());
        assert!(m.clone().try_register("s1", ConnectionKind::Video, addr(2)).is_ok());
    }

    #[test]
    fn reaper_removes_dead_entries() {
        let m = manager();
        m.insert_leaked_entry("s1", ConnectionKind::Logs, addr(1));
        // The dead entry is invisible to counters but still stored.
        assert_eq!(m.count_for_session("s1"), 0);
        assert_eq!(m.reap(), 1);
        assert!(m.registry.lock().is_empty());
    }

    #[test]
    fn stats_report_per_kind_counts() {
        let m = manager();
        let _a = m.clone().try_register("s1", ConnectionKind::Video, addr(1)).unwrap();
        let _b = m.clone().try_register("s1", ConnectionKind::Video, addr(2)).unwrap();
        let _c = m.clone().try_register("s1", ConnectionKind::Control, addr(3)).unwrap();

        let stats = m.stats();
        assert_eq!(stats.total, 3);
        let s1 = &stats.sessions[0];
        assert_eq!(s1.by_kind.get("video"), Some(&2));
        assert_eq!(s1.by_kind.get("control"), Some(&1));
    }
}
