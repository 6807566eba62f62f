//! Configuration management for simbridge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stream quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Ultra => "ultra",
        }
    }

    /// Scale applied to the device's native pixel size.
    pub fn resolution_factor(&self) -> f32 {
        match self {
            Quality::Low => 0.60,
            Quality::Medium => 0.80,
            Quality::High => 1.00,
            Quality::Ultra => 1.20,
        }
    }

    /// Target capture FPS for this preset.
    pub fn fps(&self) -> u32 {
        match self {
            Quality::Low => 45,
            Quality::Medium => 60,
            Quality::High => 75,
            Quality::Ultra => 90,
        }
    }

    /// JPEG quality (1-100) for this preset.
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            Quality::Low => 50,
            Quality::Medium => 65,
            Quality::High => 80,
            Quality::Ultra => 95,
        }
    }

    pub fn parse(s: &str) -> Option<Quality> {
        match s {
            "low" => Some(Quality::Low),
            "medium" => Some(Quality::Medium),
            "high" => Some(Quality::High),
            "ultra" => Some(Quality::Ultra),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network bind configuration
    pub server: ServerConfig,

    /// Persistent state locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Connection caps and rate limiting
    #[serde(default)]
    pub connections: ConnectionsConfig,

    /// Memory pressure policy
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Capture pipeline defaults
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Recording service
    #[serde(default)]
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Location of the session store and recording scratch
    pub state_dir: PathBuf,

    /// Rotating backups retained for the session store
    #[serde(default = "default_backup_retention")]
    pub backup_retention_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    /// Per-session cap across all connection kinds
    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,

    /// Per (session, source) connection attempts per window
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: usize,

    /// Sliding window length in seconds
    #[serde(default = "default_rate_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Dead weak-handle reaper interval in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Soft cap in MB driving cleanup
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// Resident memory sampling interval in seconds
    #[serde(default = "default_memory_check_secs")]
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Initial quality preset
    #[serde(default)]
    pub default_quality: Quality,

    /// Initial FPS (0 means use the preset's FPS)
    #[serde(default)]
    pub default_fps: u32,

    /// Idle grace window before a capture service is evicted, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub service_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Emergency recordings older than this are removed by cleanup
    #[serde(default = "default_emergency_max_age_hours")]
    pub emergency_max_age_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/simbridge"),
            backup_retention_count: default_backup_retention(),
        }
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_max_per_session(),
            max_per_minute: default_max_per_minute(),
            rate_limit_window_secs: default_rate_window_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            check_interval_secs: default_memory_check_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_quality: Quality::Medium,
            default_fps: 0,
            service_idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            emergency_max_age_hours: default_emergency_max_age_hours(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8888,
            },
            storage: StorageConfig::default(),
            connections: ConnectionsConfig::default(),
            memory: MemoryConfig::default(),
            capture: CaptureConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.host.is_empty() {
            return Err("Server host must not be empty".into());
        }

        if self.storage.state_dir.as_os_str().is_empty() {
            return Err("state_dir must not be empty".into());
        }

        if self.connections.max_per_session == 0 {
            return Err("max_per_session must be non-zero".into());
        }

        if self.connections.max_per_minute == 0 {
            return Err("max_per_minute must be non-zero".into());
        }

        if self.connections.rate_limit_window_secs == 0 {
            return Err("rate_limit_window_secs must be non-zero".into());
        }

        if self.memory.max_memory_mb == 0 {
            return Err("max_memory_mb must be non-zero".into());
        }

        if self.memory.check_interval_secs == 0 {
            return Err("memory check_interval_secs must be non-zero".into());
        }

        if self.capture.default_fps > 120 {
            return Err("default_fps must be at most 120".into());
        }

        Ok(())
    }

    /// Effective initial FPS: the configured override, or the preset's.
    pub fn initial_fps(&self) -> u32 {
        if self.capture.default_fps > 0 {
            self.capture.default_fps
        } else {
            self.capture.default_quality.fps()
        }
    }
}

fn default_backup_retention() -> usize {
    5
}

fn default_max_per_session() -> usize {
    10
}

fn default_max_per_minute() -> usize {
    20
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

fn default_max_memory_mb() -> u64 {
    2048
}

fn default_memory_check_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_emergency_max_age_hours() -> u64 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.connections.max_per_session, 10);
        assert_eq!(cfg.connections.max_per_minute, 20);
        assert_eq!(cfg.capture.service_idle_timeout_secs, 300);
        assert_eq!(cfg.storage.backup_retention_count, 5);
    }

    #[test]
    fn validate_rejects_zero_caps() {
        let mut cfg = Config::default();
        cfg.connections.max_per_session = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_excessive_fps() {
        let mut cfg = Config::default();
        cfg.capture.default_fps = 500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn quality_preset_table() {
        assert_eq!(Quality::Low.fps(), 45);
        assert_eq!(Quality::Medium.jpeg_quality(), 65);
        assert_eq!(Quality::High.resolution_factor(), 1.00);
        assert_eq!(Quality::Ultra.fps(), 90);
        assert_eq!(Quality::parse("ultra"), Some(Quality::Ultra));
        assert_eq!(Quality::parse("4k"), None);
    }

    #[test]
    fn initial_fps_prefers_override() {
        let mut cfg = Config::default();
        assert_eq!(cfg.initial_fps(), Quality::Medium.fps());
        cfg.capture.default_fps = 30;
        assert_eq!(cfg.initial_fps(), 30);
    }
}
