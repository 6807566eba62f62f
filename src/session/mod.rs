//! Session model and lifecycle
//!
//! A session is the server-managed handle to one simulator device. Records
//! are owned exclusively by the [`SessionManager`]; everything else sees
//! immutable snapshots.

pub mod manager;
pub mod store;

pub use manager::SessionManager;
pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An app installed through this server, recorded on the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledApp {
    pub bundle_id: String,
    pub name: String,
    pub installed_at: DateTime<Utc>,
}

/// Server-managed handle to a single simulator device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique identifier; never reused
    pub id: String,

    /// Host-assigned device identifier
    pub udid: String,

    pub device_type: String,
    pub os_version: String,

    /// Logical point dimensions (input coordinate space)
    pub point_width: u32,
    pub point_height: u32,

    /// Native pixel dimensions (frame coordinate space)
    pub pixel_width: u32,
    pub pixel_height: u32,

    /// pixel / point ratio; 1, 2, or 3
    pub scale_factor: u32,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub last_validated: Option<DateTime<Utc>>,

    /// bundle identifier -> metadata
    #[serde(default)]
    pub installed_apps: HashMap<String, InstalledApp>,
}

impl Session {
    /// Check the structural invariants every stored record must satisfy.
    pub fn invariants_hold(&self) -> bool {
        self.point_width > 0
            && self.point_height > 0
            && self.pixel_width > 0
            && self.pixel_height > 0
            && matches!(self.scale_factor, 1 | 2 | 3)
            && self.pixel_width == self.point_width * self.scale_factor
    }
}

#[cfg(test)]
pub(crate) fn test_session(id: &str, udid: &str) -> Session {
    Session {
        id: id.to_string(),
        udid: udid.to_string(),
        device_type: "iPhone 15 Pro".to_string(),
        os_version: "17.0".to_string(),
        point_width: 393,
        point_height: 852,
        pixel_width: 1179,
        pixel_height: 2556,
        scale_factor: 3,
        created_at: Utc::now(),
        last_validated: None,
        installed_apps: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariants_accept_sane_sessions() {
        assert!(test_session("s1", "U1").invariants_hold());
    }

    #[test]
    fn invariants_reject_bad_scale() {
        let mut s = test_session("s1", "U1");
        s.scale_factor = 4;
        assert!(!s.invariants_hold());
        s.scale_factor = 3;
        s.pixel_width = 1000;
        assert!(!s.invariants_hold());
    }

    #[test]
    fn session_round_trips_through_json() {
        let s = test_session("s1", "U1");
        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.udid, "U1");
        assert_eq!(back.scale_factor, 3);
    }
}
