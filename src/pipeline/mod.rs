//! Processing pipeline: takes one queue file from `incoming/` to its end state
//!
//! ```text
//! incoming/<name>
//!     │ claim (rename)
//!     ↓
//! processing/<name> ──parse──→ Correlator ──ok──→ archive/<name> (or deleted)
//!     │                 │          │
//!     │ invalid         │          └─transient─→ backoff, retry up to max_attempts
//!     ↓                 ↓                         │
//! failed/<name> ←───────┴─────────────────────────┘ (exhausted / fatal)
//! ```
//!
//! Archiving is the commit point. A crash before it leaves the file in
//! `processing/`; the staleness sweep puts it back in `incoming/` and the
//! correlator recognizes the replay by `event_id`.

mod inflight;
mod metrics;
mod signal;

pub use inflight::InFlight;
pub use metrics::{PipelineMetrics, PipelineSnapshot};
pub use signal::CompletionSignal;

use crate::correlator::{CorrelateOutcome, Correlator};
use crate::envelope::EventEnvelope;
use crate::queue::{ErrorDetail, FailureKind, QueueError, QueueLayout, QueueState};
use crate::util::lock;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Exponential backoff for transient correlator failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per file, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): base * 2^(attempt-1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// What happens to a file once its envelope is committed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    #[default]
    Archive,
    Delete,
}

impl Retention {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub retry: RetryPolicy,
    /// processing/ files older than this are considered abandoned
    pub stale_after: Duration,
    pub retention: Retention,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(300),
            retention: Retention::Archive,
        }
    }
}

/// End state of one `process_file` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Committed; archived or deleted per retention
    Archived(CorrelateOutcome),
    /// Moved to failed/ after retries or a fatal store error
    DeadLettered(FailureKind),
    /// Invalid content, moved to failed/ without retrying
    Rejected,
    /// Another worker (or the sweep) got there first
    NotClaimed,
    /// Shutdown arrived during backoff; left in processing/
    Abandoned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub recovered: usize,
    pub dead_lettered: usize,
}

/// Totals from one [`Pipeline::drain`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub duplicates: usize,
    pub buffered: usize,
    pub dead_lettered: usize,
    pub rejected: usize,
    pub not_claimed: usize,
    pub abandoned: usize,
    pub recovered: usize,
    pub gap_flushed: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Archived(CorrelateOutcome::Applied) => self.applied += 1,
            FileOutcome::Archived(CorrelateOutcome::Duplicate) => self.duplicates += 1,
            FileOutcome::Archived(CorrelateOutcome::Buffered) => self.buffered += 1,
            FileOutcome::DeadLettered(_) => self.dead_lettered += 1,
            FileOutcome::Rejected => self.rejected += 1,
            FileOutcome::NotClaimed => self.not_claimed += 1,
            FileOutcome::Abandoned => self.abandoned += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.applied + self.duplicates + self.buffered + self.dead_lettered + self.rejected
    }
}

pub struct Pipeline {
    layout: QueueLayout,
    correlator: Arc<Correlator>,
    options: PipelineOptions,
    metrics: Arc<PipelineMetrics>,
    /// Times this daemon has pulled each file back out of processing/
    recoveries: Mutex<HashMap<String, u32>>,
}

impl Pipeline {
    pub fn new(layout: QueueLayout, correlator: Arc<Correlator>, options: PipelineOptions) -> Self {
        Self {
            layout,
            correlator,
            options,
            metrics: Arc::new(PipelineMetrics::default()),
            recoveries: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Claim and process one file from `incoming/`
    ///
    /// Errors are queue I/O failures only; every envelope-level problem ends
    /// in a [`FileOutcome`].
    pub fn process_file(
        &self,
        name: &str,
        shutdown: &CompletionSignal,
    ) -> Result<FileOutcome, QueueError> {
        if !self.layout.claim(name)? {
            return Ok(FileOutcome::NotClaimed);
        }

        let path = self.layout.path(QueueState::Processing, name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            // Recovered by a sweep between our claim and read
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(FileOutcome::NotClaimed),
            Err(source) => return Err(QueueError::Read { path, source }),
        };

        let envelope = match EventEnvelope::from_json(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(file = name, "Rejecting malformed queue file: {}", e);
                self.layout
                    .dead_letter(name, &ErrorDetail::new(FailureKind::Malformed, e.to_string(), 1))?;
                self.forget_recoveries(name);
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return Ok(FileOutcome::Rejected);
            }
        };

        let retry = self.options.retry;
        let mut attempt = 1;
        loop {
            match self.correlator.correlate(envelope.clone()) {
                Ok(outcome) => {
                    self.commit(name)?;
                    match outcome {
                        CorrelateOutcome::Duplicate => {
                            self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                        }
                        CorrelateOutcome::Buffered => {
                            self.metrics.buffered.fetch_add(1, Ordering::Relaxed);
                        }
                        CorrelateOutcome::Applied => {}
                    }
                    tracing::debug!(file = name, "Processed ({:?})", outcome);
                    return Ok(FileOutcome::Archived(outcome));
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        file = name,
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        retry.max_attempts,
                        e,
                        delay
                    );
                    if shutdown.wait(delay) {
                        tracing::debug!(file = name, "Shutdown during backoff, leaving in processing/");
                        return Ok(FileOutcome::Abandoned);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    let kind = if e.is_transient() {
                        FailureKind::Exhausted
                    } else {
                        FailureKind::Fatal
                    };
                    tracing::error!(
                        file = name,
                        event_id = %envelope.event_id,
                        "Dead-lettering after {} attempt(s): {}",
                        attempt,
                        e
                    );
                    self.layout
                        .dead_letter(name, &ErrorDetail::new(kind, e.to_string(), attempt))?;
                    self.forget_recoveries(name);
                    self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    return Ok(FileOutcome::DeadLettered(kind));
                }
            }
        }
    }

    fn commit(&self, name: &str) -> Result<(), QueueError> {
        let moved = match self.options.retention {
            Retention::Archive => self.layout.archive(name)?,
            Retention::Delete => self.layout.discard(name)?,
        };
        if !moved {
            // The envelope is applied; the replay will be a duplicate
            tracing::warn!(file = name, "File left processing/ before it could be committed");
        }
        self.forget_recoveries(name);
        self.metrics.record_success(Utc::now());
        Ok(())
    }

    /// Drop the stall count once a file has reached a terminal state
    fn forget_recoveries(&self, name: &str) {
        lock(&self.recoveries).remove(name);
    }

    /// Return abandoned `processing/` files to `incoming/`
    ///
    /// Files in `in_flight` are being worked on here and are left alone. A
    /// file recovered more than `max_attempts` times keeps crashing whoever
    /// picks it up, so it is dead-lettered instead.
    pub fn sweep_stale(&self, in_flight: &InFlight) -> Result<SweepReport, QueueError> {
        let mut report = SweepReport::default();
        for name in self.layout.stale_processing(self.options.stale_after)? {
            if in_flight.contains(&name) {
                continue;
            }

            let recoveries = {
                let mut map = lock(&self.recoveries);
                let count = map.entry(name.clone()).or_insert(0);
                *count += 1;
                *count
            };

            if recoveries > self.options.retry.max_attempts {
                let detail = ErrorDetail::new(
                    FailureKind::Stalled,
                    format!("abandoned in processing/ {recoveries} times"),
                    recoveries,
                );
                if self.layout.dead_letter(&name, &detail)? {
                    tracing::error!(file = %name, "Dead-lettering file that keeps stalling");
                    self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    report.dead_lettered += 1;
                }
                self.forget_recoveries(&name);
            } else if self.layout.recover(&name)? {
                tracing::warn!(file = %name, "Recovered stale file (recovery {})", recoveries);
                self.metrics.recovered.fetch_add(1, Ordering::Relaxed);
                report.recovered += 1;
            }
        }
        Ok(report)
    }

    /// One synchronous pass: sweep, process everything in `incoming/`, flush
    /// expired held envelopes
    pub fn drain(&self) -> Result<DrainReport, QueueError> {
        let shutdown = CompletionSignal::new();
        let mut report = DrainReport {
            recovered: self.sweep_stale(&InFlight::new())?.recovered,
            ..Default::default()
        };

        for name in self.layout.list(QueueState::Incoming)? {
            report.record(self.process_file(&name, &shutdown)?);
        }
        report.gap_flushed = self.correlator.flush_expired();

        Ok(report)
    }
}
