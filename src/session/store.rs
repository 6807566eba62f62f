//! Durable session persistence
//!
//! One JSON document, written via temp-file + atomic rename so a crash at
//! any byte offset leaves either the old or new document intact. The
//! previous N documents are retained as rotating backups; a corrupt primary
//! falls back to the newest valid backup.

use super::Session;
use crate::error::{Error, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    sessions: HashMap<String, Session>,
}

pub struct SessionStore {
    path: PathBuf,
    backups: usize,
}

impl SessionStore {
    /// Open a store rooted at `<state_dir>/sessions.json`.
    pub fn open(state_dir: &Path, backups: usize) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            path: state_dir.join("sessions.json"),
            backups,
        })
    }

    /// Load the current document, falling back through backups. A store with
    /// no readable document opens empty.
    pub fn load(&self) -> HashMap<String, Session> {
        match self.try_load(&self.path) {
            Ok(Some(sessions)) => return sessions,
            Ok(None) => {
                info!("Session store {:?} does not exist; starting empty", self.path);
                return HashMap::new();
            }
            Err(e) => {
                error!("Session store {:?} is unreadable: {}", self.path, e);
            }
        }

        for n in 1..=self.backups {
            let backup = self.backup_path(n);
            match self.try_load(&backup) {
                Ok(Some(sessions)) => {
                    warn!("Recovered session store from backup {:?}", backup);
                    return sessions;
                }
                Ok(None) => continue,
                Err(e) => warn!("Backup {:?} is also unreadable: {}", backup, e),
            }
        }

        error!(
            "Session store {:?} and all backups are unreadable; OPENING EMPTY — \
             existing simulators may be recovered as orphans",
            self.path
        );
        HashMap::new()
    }

    fn try_load(&self, path: &Path) -> Result<Option<HashMap<String, Session>>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let doc: StoreDocument = serde_json::from_str(&content)
            .map_err(|e| Error::Internal(format!("corrupt store document: {}", e)))?;
        if doc.version != STORE_VERSION {
            return Err(Error::Internal(format!(
                "unsupported store version {}",
                doc.version
            )));
        }
        let mut sessions = doc.sessions;
        sessions.retain(|id, s| {
            if s.invariants_hold() {
                true
            } else {
                warn!("Dropping stored session {} with invalid dimensions", id);
                false
            }
        });
        Ok(Some(sessions))
    }

    /// Persist the full session map atomically and rotate backups.
    pub fn save(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let doc = StoreDocument {
            version: STORE_VERSION,
            sessions: sessions.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::Internal(format!("store serialization: {}", e)))?;

        // Backups first: only ever copies/renames of backup files, so the
        // primary stays intact until the final rename.
        self.rotate_backups();

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn rotate_backups(&self) {
        if self.backups == 0 || !self.path.exists() {
            return;
        }
        let _ = fs::remove_file(self.backup_path(self.backups));
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                let _ = fs::rename(&from, self.backup_path(n + 1));
            }
        }
        if let Err(e) = fs::copy(&self.path, self.backup_path(1)) {
            warn!("Failed to write store backup: {}", e);
        }
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        self.path.with_file_name(format!("sessions.{}.json", n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;

    fn store(dir: &Path) -> SessionStore {
        SessionStore::open(dir, 3).unwrap()
    }

    #[test]
    fn round_trips_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut sessions = HashMap::new();
        sessions.insert("s1".to_string(), test_session("s1", "U1"));
        sessions.insert("s2".to_string(), test_session("s2", "U2"));
        store.save(&sessions).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["s1"].udid, "U1");
    }

    #[test]
    fn missing_store_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load().is_empty());
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut sessions = HashMap::new();
        sessions.insert("s1".to_string(), test_session("s1", "U1"));
        store.save(&sessions).unwrap();
        // Second save pushes the first document into sessions.1.json.
        sessions.insert("s2".to_string(), test_session("s2", "U2"));
        store.save(&sessions).unwrap();

        fs::write(dir.path().join("sessions.json"), b"{trunc").unwrap();
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("s1"));
    }

    #[test]
    fn corrupt_everything_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(dir.path().join("sessions.json"), b"junk").unwrap();
        fs::write(dir.path().join("sessions.1.json"), b"junk").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn backups_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut sessions = HashMap::new();
        for i in 0..6 {
            sessions.insert(format!("s{}", i), test_session(&format!("s{}", i), "U"));
            store.save(&sessions).unwrap();
        }
        assert!(dir.path().join("sessions.1.json").exists());
        assert!(dir.path().join("sessions.3.json").exists());
        assert!(!dir.path().join("sessions.4.json").exists());
    }

    #[test]
    fn invalid_records_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut bad = test_session("s1", "U1");
        bad.scale_factor = 9;
        let mut sessions = HashMap::new();
        sessions.insert("s1".to_string(), bad);
        sessions.insert("s2".to_string(), test_session("s2", "U2"));
        store.save(&sessions).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("s2"));
    }

    #[test]
    fn leftover_tmp_file_does_not_break_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut sessions = HashMap::new();
        sessions.insert("s1".to_string(), test_session("s1", "U1"));
        store.save(&sessions).unwrap();
        // Simulate a crash mid-write: stale tmp alongside a good primary.
        fs::write(dir.path().join("sessions.json.tmp"), b"partial").unwrap();
        assert_eq!(store.load().len(), 1);
    }
}
