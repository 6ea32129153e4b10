//! Global configuration for debug-host
//!
//! Located at `~/.config/debughost/config.toml`

use crate::stacks::StacksConfig;
use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global debug-host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Override for the data directory holding `projects.json` / `ports.json`.
    /// Supports `~` expansion. Defaults to the platform data dir.
    pub data_dir: Option<String>,
    pub engine: EngineConfig,
    pub network: NetworkConfig,
    pub ports: PortsConfig,
    pub health: HealthConfig,
    pub logs: LogsConfig,
    pub stacks: StacksConfig,
}

/// Container engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Docker socket path (Unix socket, or named pipe on Windows)
    pub socket: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
        }
    }
}

#[cfg(windows)]
fn default_docker_socket() -> String {
    "//./pipe/docker_engine".to_string()
}

#[cfg(not(windows))]
fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

/// The single bridge network all project containers attach to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "debug-host-network".to_string(),
            subnet: "172.28.0.0/16".to_string(),
            gateway: "172.28.0.1".to_string(),
        }
    }
}

/// Port allocation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// How long a released port stays quarantined before reuse.
    /// Covers the prior socket's TIME_WAIT.
    pub recycle_quarantine_secs: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            recycle_quarantine_secs: 30,
        }
    }
}

/// Health monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between probes of a monitored container
    pub interval_secs: u64,
    /// Per-probe HTTP timeout in seconds
    pub probe_timeout_secs: u64,
    /// Consecutive failures before a container is reported unhealthy
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy container is reported recovered
    pub healthy_threshold: u32,
    /// Minimum seconds between monitor-driven restarts of the same project
    pub restart_cooldown_secs: u64,
    /// Settle delay after the engine reports running, for non-static stacks
    pub settle_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            probe_timeout_secs: 3,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
            restart_cooldown_secs: 60,
            settle_secs: 2,
        }
    }
}

/// Log collector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Ring buffer capacity per container
    pub buffer_capacity: usize,
    /// Bounded queue depth per log subscription
    pub subscriber_capacity: usize,
    /// Lines of history requested when attaching to a container
    pub attach_tail: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            subscriber_capacity: 1024,
            attach_tail: 100,
        }
    }
}

impl GlobalConfig {
    /// Load global configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load global configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.clone(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.clone(),
            source: e,
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.clone(),
                source: e,
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.clone(),
            source: e,
        })
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "debughost").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Resolve the data directory, honoring the `data_dir` override
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            let expanded = shellexpand::tilde(dir);
            return Ok(PathBuf::from(expanded.as_ref()));
        }
        let dirs = ProjectDirs::from("", "", "debughost").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Path of the persisted project registry document
    pub fn projects_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_data_dir()?.join("projects.json"))
    }

    /// Path of the persisted port allocation document
    pub fn ports_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_data_dir()?.join("ports.json"))
    }

    fn validate(&self) -> Result<()> {
        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if self.logs.buffer_capacity == 0 || self.logs.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid(
                "log capacities must be at least 1".to_string(),
            ));
        }
        self.stacks.validate()
    }
}
