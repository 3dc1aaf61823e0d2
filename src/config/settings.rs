//! Application settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::logger::LogFormat;
use crate::core::protocol::ProtocolConfig;
use crate::core::scheduler::SchedulerSettings;
use crate::core::transport::SerialConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Wire protocol constants
    pub protocol: ProtocolConfig,
    /// Serial parameters used for discovery (`port` is ignored there)
    pub serial: SerialConfig,
    /// Device family behaviour
    pub device: DeviceConfig,
    /// File locations
    pub paths: PathsConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Test-run options
    pub run: RunConfig,
}

/// Device family behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Family name, informational
    pub family: String,
    /// Bootstrap call timeout
    pub bootstrap_timeout_ms: u64,
    /// Default call timeout
    pub call_timeout_ms: u64,
    /// Operation that resets a device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_operation: Option<String>,
    /// Reset every device after a blocked case
    pub reset_on_error: bool,
    /// Reset every device right after discovery
    pub reset_on_connect: bool,
    /// Operation catalog (YAML, JSON or TOML)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            family: "ble".to_string(),
            bootstrap_timeout_ms: 1000,
            call_timeout_ms: 2000,
            reset_operation: Some("reset".to_string()),
            reset_on_error: true,
            reset_on_connect: true,
            catalog: None,
        }
    }
}

/// File locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the per-run traffic logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Where JSON-lines reports go; no report file when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
    /// Diagnostic field-description table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diag_table: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: super::log_dir(),
            report_dir: None,
            diag_table: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Traffic log format
    pub format: LogFormat,
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub level: String,
    /// Also write the application log to a daily file under the log directory
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
            file: false,
        }
    }
}

/// Test-run options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Repeat count handed to repeatable cases
    pub circle: u32,
    /// Write `costtime.txt`
    pub record_cost_time: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            circle: 3,
            record_cost_time: false,
        }
    }
}

impl AppConfig {
    /// Default location: `config.toml` in the platform config directory
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(super::config_dir().ok_or(ConfigError::NoConfigDir)?.join("config.toml"))
    }

    /// Load from the default location; defaults when the file is missing
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from `path`; `.yaml`/`.yml` and `.json` select those formats,
    /// anything else is TOML
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Save to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    /// Save as TOML
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Shared protocol constants
    pub fn protocol(&self) -> Arc<ProtocolConfig> {
        Arc::new(self.protocol.clone())
    }

    /// Bootstrap call timeout
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.device.bootstrap_timeout_ms)
    }

    /// Default call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.device.call_timeout_ms)
    }

    /// Scheduler settings derived from this configuration
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            log_dir: self.paths.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs")),
            report_dir: self.paths.report_dir.clone(),
            log_format: self.logging.format,
            circle: self.run.circle.max(1),
            record_cost_time: self.run.record_cost_time,
            reset_operation: self
                .device
                .reset_operation
                .clone()
                .filter(|_| self.device.reset_on_error),
            reset_on_connect: self.device.reset_on_connect,
            bootstrap_timeout: self.bootstrap_timeout(),
            call_timeout: self.call_timeout(),
        }
    }
}
