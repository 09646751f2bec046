//! Turntable configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project-local config file name
pub const LOCAL_CONFIG: &str = "turntable.yml";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Port selection and line settings
    pub port: PortConfig,

    /// Command and rotation timing
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.port.target.trim().is_empty() {
            return Err(eyre::eyre!("No port configured. Set port.target or pass --port."));
        }
        if self.port.baud_rate == 0 {
            return Err(eyre::eyre!("port.baud-rate must be greater than zero"));
        }
        if self.port.write_timeout_ms == 0 {
            return Err(eyre::eyre!("port.write-timeout-ms must be greater than zero"));
        }
        if self.protocol.command_timeout_ms == 0 {
            return Err(eyre::eyre!("protocol.command-timeout-ms must be greater than zero"));
        }
        if self.protocol.stall_interval_ms == 0 {
            return Err(eyre::eyre!("protocol.stall-interval-ms must be greater than zero"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // An explicit path must load
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::fallback_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let paths: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => Self::fallback_paths(),
        };

        paths
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| Self::load_from_file(p).ok())
            .and_then(|config| config.log_level)
    }

    /// Apply command-line overrides on top of the loaded file
    pub fn with_overrides(mut self, port: Option<&str>, baud_rate: Option<u32>) -> Self {
        if let Some(port) = port {
            self.port.target = port.to_string();
        }
        if let Some(baud_rate) = baud_rate {
            self.port.baud_rate = baud_rate;
        }
        self
    }

    fn fallback_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("turntable").join(LOCAL_CONFIG));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Port selection and line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Serial device path, or `tcp://host:port`
    pub target: String,

    /// Line speed for serial devices
    #[serde(rename = "baud-rate")]
    pub baud_rate: u32,

    /// Upper bound for writing one command line
    #[serde(rename = "write-timeout-ms")]
    pub write_timeout_ms: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            target: default_port_target().to_string(),
            baud_rate: 115_200,
            write_timeout_ms: 100,
        }
    }
}

impl PortConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_port_target() -> &'static str {
    if cfg!(windows) { "COM1" } else { "/dev/ttyUSB0" }
}

/// Command and rotation timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long to wait for a reply to a command
    #[serde(rename = "command-timeout-ms")]
    pub command_timeout_ms: u64,

    /// Silence during rotation before warning the operator
    #[serde(rename = "stall-interval-ms")]
    pub stall_interval_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 500,
            stall_interval_ms: 3000,
        }
    }
}

impl ProtocolConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn stall_interval(&self) -> Duration {
        Duration::from_millis(self.stall_interval_ms)
    }
}
