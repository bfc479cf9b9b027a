//! Queue and pipeline configuration

use crate::pipeline::Retention;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Root of the queue tree (incoming/, processing/, failed/, archive/, tmp/)
    pub root: PathBuf,
    /// Keep committed files in archive/ or delete them
    pub retention: Retention,
    /// Prune archive/ files older than this many days (0 = keep forever)
    pub archive_retention_days: u32,
    /// Full re-listing of incoming/ (the correctness backstop for notify)
    pub reconcile_interval_secs: u64,
    /// Use OS file notifications in addition to polling
    pub watch: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root: super::data_dir().join("queue"),
            retention: Retention::Archive,
            archive_retention_days: 30,
            reconcile_interval_secs: 5,
            watch: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileQueue {
    pub root: Option<String>,
    pub retention: Option<Retention>,
    pub archive_retention_days: Option<u32>,
    pub reconcile_interval_secs: Option<u64>,
    pub watch: Option<bool>,
}

impl QueueConfig {
    pub fn from_file(file: Option<FileQueue>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            root: file.root.map(PathBuf::from).unwrap_or(defaults.root),
            retention: file.retention.unwrap_or(defaults.retention),
            archive_retention_days: file
                .archive_retention_days
                .unwrap_or(defaults.archive_retention_days),
            reconcile_interval_secs: file
                .reconcile_interval_secs
                .unwrap_or(defaults.reconcile_interval_secs),
            watch: file.watch.unwrap_or(defaults.watch),
        }
    }

    /// Age after which archived files are pruned; None = never
    pub fn archive_max_age(&self) -> Option<Duration> {
        match (self.retention, self.archive_retention_days) {
            (Retention::Delete, _) | (_, 0) => None,
            (Retention::Archive, days) => Some(Duration::from_secs(u64::from(days) * 86_400)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker threads processing queue files
    pub workers: usize,
    /// Bound of the work channel between watcher and workers
    pub work_queue_capacity: usize,
    /// Attempts per file for transient store failures (including the first)
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub base_backoff_ms: u64,
    /// Retry delay ceiling
    pub max_backoff_ms: u64,
    /// A claimed file untouched for this long is considered abandoned
    pub stale_after_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            work_queue_capacity: 1024,
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            stale_after_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FilePipeline {
    pub workers: Option<usize>,
    pub work_queue_capacity: Option<usize>,
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub stale_after_secs: Option<u64>,
}

impl PipelineConfig {
    pub fn from_file(file: Option<FilePipeline>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            workers: file.workers.unwrap_or(defaults.workers),
            work_queue_capacity: file
                .work_queue_capacity
                .unwrap_or(defaults.work_queue_capacity),
            max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts),
            base_backoff_ms: file.base_backoff_ms.unwrap_or(defaults.base_backoff_ms),
            max_backoff_ms: file.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            stale_after_secs: file.stale_after_secs.unwrap_or(defaults.stale_after_secs),
        }
    }
}
