//! Coordinator configuration

use crate::error::ConfigError;
use crate::logging::{LogConfig, LogFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwServerConfig {
    /// Directory holding the registration database; memory-only when unset
    pub registration_database_directory: Option<PathBuf>,

    /// Delay before workers of an origin with no clients left are stopped
    pub idle_termination_timeout_ms: u64,

    /// Script fetches bypass the HTTP cache once the last update is older
    /// than this many seconds
    pub update_bypass_cache_after_secs: u64,

    /// Logging settings
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level name (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (pretty, compact, json)
    pub format: String,

    /// Optional `EnvFilter` directive overriding `level`
    pub filter: Option<String>,
}

impl Default for SwServerConfig {
    fn default() -> Self {
        Self {
            registration_database_directory: None,
            idle_termination_timeout_ms: 10_000,
            update_bypass_cache_after_secs: 86_400, // 24 hours
            log: LogSettings::default(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            filter: None,
        }
    }
}

impl SwServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn idle_termination_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_termination_timeout_ms)
    }

    pub fn update_bypass_cache_after(&self) -> Duration {
        Duration::from_secs(self.update_bypass_cache_after_secs)
    }

    pub fn with_idle_termination_timeout(mut self, timeout: Duration) -> Self {
        self.idle_termination_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_registration_database_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.registration_database_directory = Some(directory.into());
        self
    }

    pub fn log_config(&self) -> Result<LogConfig, ConfigError> {
        let level: Level = self
            .log
            .level
            .parse()
            .map_err(|_| ConfigError::Log(format!("unknown level '{}'", self.log.level)))?;
        let format: LogFormat = self.log.format.parse()?;
        Ok(LogConfig {
            level,
            format,
            filter: self.log.filter.clone(),
        })
    }
}
