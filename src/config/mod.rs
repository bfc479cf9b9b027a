//! Configuration for the queue, daemon and hook
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/hookq/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod capture;
mod observability;
mod queue;
mod serialization;
mod storage;


// ─────────────────────────────────────────────────────────────────────────────
// Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use capture::{CaptureConfig, FileCapture};
pub use observability::{FileHealth, FileLogging, HealthConfig, LogRotation, LoggingConfig};
pub use queue::{FilePipeline, FileQueue, PipelineConfig, QueueConfig};
pub use storage::{CorrelationConfig, FileCorrelation, FileStore, StoreConfig};

use crate::daemon::DaemonConfig;
use crate::pipeline::{PipelineOptions, RetryPolicy};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-user data directory: queue, database and log files live here
pub(crate) fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hookq")
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Print the error the way a broken config should fail: loudly, with the
    /// file and a hint, on stderr
    pub fn report(&self) {
        eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
        match self {
            Self::Read { .. } => {
                eprintln!("║  CONFIG ERROR - Cannot read configuration file              ║")
            }
            Self::Parse { .. } => {
                eprintln!("║  CONFIG ERROR - Failed to parse configuration file          ║")
            }
            Self::Invalid { .. } => {
                eprintln!("║  CONFIG ERROR - Invalid configuration value                 ║")
            }
        }
        eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
        match self {
            Self::Read { path, source } => {
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", source);
            }
            Self::Parse { path, source } => {
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", source);
                eprintln!("  Tip: Check for:\n");
                eprintln!("    - Missing quotes around string values");
                eprintln!("    - Invalid boolean values (use true/false)");
                eprintln!("    - Unknown retention or rotation values");
                eprintln!("    - Typos in section names\n");
                eprintln!("  To reset, run `hookq config --reset`.\n");
            }
            Self::Invalid { key, reason } => {
                eprintln!("  Setting: {}\n", key);
                eprintln!("  Error: {}\n", reason);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Queue directory tree and file retention
    pub queue: QueueConfig,

    /// Worker pool and retry behavior
    pub pipeline: PipelineConfig,

    /// Out-of-order buffering
    pub correlator: CorrelationConfig,

    /// SQLite database
    pub store: StoreConfig,

    /// GET /health endpoint
    pub health: HealthConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// What `hookq capture` records
    pub capture: CaptureConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure; every section and key is optional
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub queue: Option<FileQueue>,
    pub pipeline: Option<FilePipeline>,
    pub correlator: Option<FileCorrelation>,
    pub store: Option<FileStore>,
    pub health: Option<FileHealth>,
    pub logging: Option<FileLogging>,
    pub capture: Option<FileCapture>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/hookq/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("hookq").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Config is optional
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Load configuration: env > ~/.config/hookq/config.toml > defaults
    pub fn load() -> Result<Self, ConfigError> {
        let file = match Self::config_path() {
            Some(path) => Self::read_file(&path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Load from an explicit file (missing file = defaults), env applied on top
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve(Self::read_file(path)?, |key| std::env::var(key).ok())
    }

    pub(crate) fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Merge a parsed file with environment overrides
    ///
    /// `env` is injected so tests don't have to mutate the process
    /// environment.
    pub(crate) fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut queue = QueueConfig::from_file(file.queue);
        let mut pipeline = PipelineConfig::from_file(file.pipeline);
        let correlator = CorrelationConfig::from_file(file.correlator);
        let mut store = StoreConfig::from_file(file.store);
        let mut health = HealthConfig::from_file(file.health)?;
        let mut logging = LoggingConfig::from_file(file.logging);
        let capture = CaptureConfig::from_file(file.capture);

        if let Some(root) = env("HOOKQ_ROOT") {
            queue.root = PathBuf::from(root);
        }
        if let Some(db) = env("HOOKQ_DB") {
            store.db_path = PathBuf::from(db);
        }
        if let Some(workers) = env("HOOKQ_WORKERS") {
            pipeline.workers = workers
                .parse()
                .map_err(|_| ConfigError::invalid("HOOKQ_WORKERS", format!("not a number: {workers:?}")))?;
        }
        if let Some(bind) = env("HOOKQ_HEALTH_BIND") {
            health.bind_addr = bind
                .parse()
                .map_err(|_| ConfigError::invalid("HOOKQ_HEALTH_BIND", format!("not an address: {bind:?}")))?;
        }
        if let Some(level) = env("HOOKQ_LOG_LEVEL") {
            logging.level = level;
        }

        let config = Self {
            queue,
            pipeline,
            correlator,
            store,
            health,
            logging,
            capture,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.workers == 0 {
            return Err(ConfigError::invalid("pipeline.workers", "must be at least 1"));
        }
        if self.pipeline.work_queue_capacity == 0 {
            return Err(ConfigError::invalid("pipeline.work_queue_capacity", "must be at least 1"));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(ConfigError::invalid("pipeline.max_attempts", "must be at least 1"));
        }
        if self.pipeline.base_backoff_ms > self.pipeline.max_backoff_ms {
            return Err(ConfigError::invalid(
                "pipeline.base_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }
        if self.correlator.pending_capacity == 0 {
            return Err(ConfigError::invalid("correlator.pending_capacity", "must be at least 1"));
        }
        if self.queue.reconcile_interval_secs == 0 {
            return Err(ConfigError::invalid("queue.reconcile_interval_secs", "must be at least 1"));
        }
        self.logging.validate()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Runtime views
    // ─────────────────────────────────────────────────────────────────────────

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            retry: RetryPolicy {
                max_attempts: self.pipeline.max_attempts,
                base_backoff: Duration::from_millis(self.pipeline.base_backoff_ms),
                max_backoff: Duration::from_millis(self.pipeline.max_backoff_ms),
            },
            stale_after: Duration::from_secs(self.pipeline.stale_after_secs),
            retention: self.queue.retention,
        }
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            queue_root: self.queue.root.clone(),
            workers: self.pipeline.workers,
            work_queue_capacity: self.pipeline.work_queue_capacity,
            reconcile_interval: Duration::from_secs(self.queue.reconcile_interval_secs),
            pipeline: self.pipeline_options(),
            correlator: self.correlator.to_runtime(),
            archive_max_age: self.queue.archive_max_age(),
            watch: self.queue.watch,
        }
    }
}
