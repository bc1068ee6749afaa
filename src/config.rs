//! Configuration for KeyHive
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::Sid;

/// Declared architecture of a persistent prefix, or of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    Win32,
    Win64,
}

impl Arch {
    /// Architecture of the host process, from pointer width.
    pub fn native() -> Self {
        if std::mem::size_of::<usize>() > 4 {
            Arch::Win64
        } else {
            Arch::Win32
        }
    }
}

/// Main configuration for a KeyHive instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Persistence Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the branch files (system.reg, userdef.reg, user.reg)
    pub config_dir: PathBuf,

    /// Delay between periodic saves of dirty branches
    pub save_interval: Duration,

    /// Forced prefix architecture; `None` derives it from the environment
    /// (`WINEARCH=win32`) or the host pointer width
    pub arch: Option<Arch>,

    /// SID of the user whose branch is mounted under `User\<sid>`
    pub user_sid: Sid,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds)
    pub write_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("./keyhive_data"),
            save_interval: Duration::from_secs(30),
            arch: None,
            user_sid: Sid::local_user(),
            listen_addr: "127.0.0.1:6479".to_string(),
            max_connections: 1024,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.config_dir = dir.into();
        self
    }

    pub fn save_interval(mut self, interval: Duration) -> Self {
        self.config.save_interval = interval;
        self
    }

    pub fn arch(mut self, arch: Arch) -> Self {
        self.config.arch = Some(arch);
        self
    }

    pub fn user_sid(mut self, sid: Sid) -> Self {
        self.config.user_sid = sid;
        self
    }

    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
