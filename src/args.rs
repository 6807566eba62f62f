use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "simbridge")]
#[command(author = "Simbridge Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "iOS simulator control plane", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/simbridge.toml")]
    pub config: PathBuf,

    /// Bind address
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port
    #[arg(long)]
    pub port: Option<u16>,

    /// State directory for the session store and recordings
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Per-session connection cap
    #[arg(long)]
    pub max_connections_per_session: Option<usize>,

    /// Per-source connection attempts per rate-limit window
    #[arg(long)]
    pub max_connections_per_minute: Option<usize>,

    /// Soft memory cap in MB
    #[arg(long)]
    pub max_memory_mb: Option<u64>,

    /// Initial quality preset (low, medium, high, ultra)
    #[arg(long)]
    pub default_quality: Option<String>,

    /// Initial capture FPS
    #[arg(long)]
    pub default_fps: Option<u32>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply CLI overrides onto a loaded configuration.
    pub fn apply_overrides(&self, config: &mut config::Config) -> Result<(), String> {
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref dir) = self.state_dir {
            config.storage.state_dir = dir.clone();
        }
        if let Some(cap) = self.max_connections_per_session {
            config.connections.max_per_session = cap;
        }
        if let Some(rate) = self.max_connections_per_minute {
            config.connections.max_per_minute = rate;
        }
        if let Some(mb) = self.max_memory_mb {
            config.memory.max_memory_mb = mb;
        }
        if let Some(ref q) = self.default_quality {
            config.capture.default_quality = config::Quality::parse(q)
                .ok_or_else(|| format!("Unknown quality preset: {}", q))?;
        }
        if let Some(fps) = self.default_fps {
            config.capture.default_fps = fps;
        }
        Ok(())
    }
}
