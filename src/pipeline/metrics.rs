//! Counters for the pipeline itself

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared between workers, the scheduler and the health endpoint
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Files committed (archived or deleted)
    pub archived: AtomicU64,
    /// Committed files whose envelope had already been applied
    pub duplicates: AtomicU64,
    /// Committed files whose envelope is waiting for a predecessor
    pub buffered: AtomicU64,
    /// Moved to failed/ after retries, fatal errors or repeated stalls
    pub dead_lettered: AtomicU64,
    /// Moved to failed/ because the content is invalid
    pub rejected: AtomicU64,
    /// Transient failures that were retried
    pub retries: AtomicU64,
    /// Stale files moved back to incoming/
    pub recovered: AtomicU64,
    /// Unix millis of the last committed file, 0 = never
    last_success_ms: AtomicI64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub archived: u64,
    pub duplicates: u64,
    pub buffered: u64,
    pub dead_lettered: u64,
    pub rejected: u64,
    pub retries: u64,
    pub recovered: u64,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl PipelineMetrics {
    pub fn record_success(&self, at: DateTime<Utc>) {
        self.archived.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms
            .fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        match self.last_success_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            archived: self.archived.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            last_success_at: self.last_success_at(),
        }
    }
}
