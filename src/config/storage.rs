//! Store and correlator configuration

use crate::correlator::CorrelatorConfig;
use crate::store::StoreOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: PathBuf,
    /// SQLite busy timeout; a lock held longer is a transient failure
    pub busy_timeout_ms: u64,
    /// Pooled connections
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: super::data_dir().join("hookq.db"),
            busy_timeout_ms: 5_000,
            pool_size: 4,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileStore {
    pub db_path: Option<String>,
    pub busy_timeout_ms: Option<u64>,
    pub pool_size: Option<u32>,
}

impl StoreConfig {
    pub fn from_file(file: Option<FileStore>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            db_path: file.db_path.map(PathBuf::from).unwrap_or(defaults.db_path),
            busy_timeout_ms: file.busy_timeout_ms.unwrap_or(defaults.busy_timeout_ms),
            pool_size: file.pool_size.unwrap_or(defaults.pool_size),
        }
    }

    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            pool_size: self.pool_size,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Correlator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// How long an envelope waits for its predecessor before it is applied
    /// with a gap flag
    pub pending_timeout_secs: u64,
    /// Held envelopes per session before the oldest is forced through
    pub pending_capacity: usize,
    /// Sessions with nothing held are dropped from memory after this long
    pub session_idle_evict_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            pending_timeout_secs: 30,
            pending_capacity: 256,
            session_idle_evict_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileCorrelation {
    pub pending_timeout_secs: Option<u64>,
    pub pending_capacity: Option<usize>,
    pub session_idle_evict_secs: Option<u64>,
}

impl CorrelationConfig {
    pub fn from_file(file: Option<FileCorrelation>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            pending_timeout_secs: file
                .pending_timeout_secs
                .unwrap_or(defaults.pending_timeout_secs),
            pending_capacity: file.pending_capacity.unwrap_or(defaults.pending_capacity),
            session_idle_evict_secs: file
                .session_idle_evict_secs
                .unwrap_or(defaults.session_idle_evict_secs),
        }
    }

    pub fn to_runtime(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            pending_timeout: Duration::from_secs(self.pending_timeout_secs),
            pending_capacity: self.pending_capacity,
            session_idle: Duration::from_secs(self.session_idle_evict_secs),
        }
    }
}
