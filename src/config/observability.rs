//! Observability configuration: logging and the health endpoint

use super::ConfigError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// When the JSON log file rolls over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    /// One file for the life of the install
    Never,
}

impl LogRotation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Never => "never",
        }
    }
}

/// `[logging]`: console verbosity plus the optional JSON file
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for hookq's own targets; `RUST_LOG` still wins when set
    pub level: String,
    pub file_enabled: bool,
    pub file_dir: PathBuf,
    pub file_rotation: LogRotation,
    /// File names become `{prefix}.{date}`
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            file_dir: super::data_dir().join("logs"),
            file_rotation: LogRotation::default(),
            file_prefix: "hookq".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileLogging {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<PathBuf>,
    pub file_rotation: Option<LogRotation>,
    pub file_prefix: Option<String>,
}

impl LoggingConfig {
    pub fn from_file(file: Option<FileLogging>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            level: file.level.unwrap_or(defaults.level),
            file_enabled: file.file_enabled.unwrap_or(defaults.file_enabled),
            file_dir: file.file_dir.unwrap_or(defaults.file_dir),
            file_rotation: file.file_rotation.unwrap_or(defaults.file_rotation),
            file_prefix: file.file_prefix.unwrap_or(defaults.file_prefix),
        }
    }

    /// Rejects levels `tracing` does not know (from the file or `HOOKQ_LOG_LEVEL`)
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("expected trace, debug, info, warn or error, got {:?}", self.level),
            ));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains(['/', '\\']) {
            return Err(ConfigError::invalid("logging.file_prefix", "must be a plain file name"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Endpoint
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Serve GET /health while the daemon runs
    pub enabled: bool,
    /// Localhost only by default
    pub bind_addr: SocketAddr,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileHealth {
    pub enabled: Option<bool>,
    pub bind_addr: Option<String>,
}

impl HealthConfig {
    pub fn from_file(file: Option<FileHealth>) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let bind_addr = match file.bind_addr {
            Some(addr) => addr
                .parse()
                .map_err(|_| ConfigError::invalid("health.bind_addr", format!("not an address: {addr:?}")))?,
            None => defaults.bind_addr,
        };

        Ok(Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            bind_addr,
        })
    }
}
