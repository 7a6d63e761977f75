// Session configuration.
//
// `HostConfig` and `PeerConfig` carry everything a role needs to start. Both
// have working defaults and can be loaded from a TOML file with `[host]` and
// `[peer]` tables; any key left out keeps its default. The CLI layers its
// flag overrides on top of whatever the file produced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::transport::Timeouts;

pub const DEFAULT_PORT: u16 = 5000;

fn default_bind_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("server.lock")
}

fn default_idle_timeout_ms() -> u64 {
    250
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_monitor_interval_ms() -> u64 {
    2_000
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub bind_address: String,
    /// 0 lets the OS pick a free port.
    pub port: u16,
    /// Single-host lock file.
    pub lock_path: PathBuf,
    pub idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How often the monitor thread samples the registry size.
    pub monitor_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            lock_path: default_lock_path(),
            idle_timeout_ms: default_idle_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl HostConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            idle: Duration::from_millis(self.idle_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl PeerConfig {
    pub fn host_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            idle: Duration::from_millis(self.idle_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

/// Contents of a session config file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFileConfig {
    pub host: HostConfig,
    pub peer: PeerConfig,
}

impl SessionFileConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let config_err = |reason: String| SessionError::Config {
            path: path.to_owned(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        Self::from_toml(&text).map_err(|e| config_err(e.to_string()))
    }
}
