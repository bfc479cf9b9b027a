//! Queue state machine
//!
//! ```text
//!              claim                 archive
//!  incoming ──────────→ processing ──────────→ archive
//!     ↑  ↑                 │    │
//!     │  └── recover ──────┘    │ dead_letter
//!     │                         ↓
//!     └────── requeue ────── failed   (+ <name>.error.json)
//! ```
//!
//! `requeue` (failed → incoming) is an operator action only; the daemon never
//! takes a file out of `failed/` on its own.

use super::layout::{ParsedName, ERROR_SUFFIX};
use super::writer::write_atomic;
use super::{QueueError, QueueLayout};
use crate::util::truncate_utf8_safe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::time::{Duration, SystemTime};

/// Longest error message stored in an error-detail file
const MAX_ERROR_LEN: usize = 4096;

/// Lifecycle state of a queue file (= the directory it lives in)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Incoming,
    Processing,
    Failed,
    Archive,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Incoming,
        QueueState::Processing,
        QueueState::Failed,
        QueueState::Archive,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Archive => "archive",
        }
    }

    /// Edges of the state machine
    pub fn can_transition_to(&self, to: QueueState) -> bool {
        matches!(
            (self, to),
            (Self::Incoming, Self::Processing)
                | (Self::Processing, Self::Archive)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Incoming)
                | (Self::Failed, Self::Incoming)
        )
    }
}

/// Why a file was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Unparseable or invalid content; never retried
    Malformed,
    /// Transient failures on every attempt up to the ceiling
    Exhausted,
    /// Non-transient store failure
    Fatal,
    /// Repeatedly abandoned in processing/ by crashed workers
    Stalled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Exhausted => "exhausted",
            Self::Fatal => "fatal",
            Self::Stalled => "stalled",
        }
    }
}

/// Contents of `failed/<name>.error.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl ErrorDetail {
    pub fn new(kind: FailureKind, error: impl AsRef<str>, attempts: u32) -> Self {
        Self {
            kind,
            error: truncate_utf8_safe(error.as_ref(), MAX_ERROR_LEN).to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// One entry of `failed/`, for operators
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub file: String,
    /// Decoded from the file name; absent for names the writer did not produce
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_hint: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
}

impl QueueLayout {
    /// Atomically move `name` between states
    ///
    /// Returns `Ok(false)` when the source file is gone, which means another
    /// worker (or the sweep) moved it first.
    pub fn transition(
        &self,
        name: &str,
        from: QueueState,
        to: QueueState,
    ) -> Result<bool, QueueError> {
        if !from.can_transition_to(to) {
            return Err(QueueError::IllegalTransition { from, to });
        }
        let src = self.path(from, name);
        let dst = self.path(to, name);
        match fs::rename(&src, &dst) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(QueueError::Rename {
                from: src,
                to: dst,
                source,
            }),
        }
    }

    /// Claim an incoming file for processing
    ///
    /// rename() keeps the old mtime, so the claimed file is stamped with the
    /// claim time; staleness is then measured from the claim, not from when the
    /// producer wrote it.
    pub fn claim(&self, name: &str) -> Result<bool, QueueError> {
        if !self.transition(name, QueueState::Incoming, QueueState::Processing)? {
            return Ok(false);
        }
        let path = self.path(QueueState::Processing, name);
        if let Err(e) = File::options()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(SystemTime::now()))
        {
            tracing::debug!(file = name, "Could not stamp claim time: {}", e);
        }
        Ok(true)
    }

    pub fn archive(&self, name: &str) -> Result<bool, QueueError> {
        self.transition(name, QueueState::Processing, QueueState::Archive)
    }

    /// Delete a processed file instead of archiving it
    pub fn discard(&self, name: &str) -> Result<bool, QueueError> {
        let path = self.path(QueueState::Processing, name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(QueueError::Write { path, source }),
        }
    }

    /// Move a processing file to `failed/` with its error detail
    ///
    /// The detail is written first so a dead-lettered file is never visible
    /// without its explanation.
    pub fn dead_letter(&self, name: &str, detail: &ErrorDetail) -> Result<bool, QueueError> {
        let detail_path = self.error_detail_path(name);
        let bytes = serde_json::to_vec_pretty(detail)?;
        write_atomic(&self.tmp_dir(), &detail_path, &bytes, true)?;

        let moved = self.transition(name, QueueState::Processing, QueueState::Failed)?;
        if !moved {
            let _ = fs::remove_file(&detail_path);
        }
        Ok(moved)
    }

    /// Put a stale processing file back in `incoming/`
    pub fn recover(&self, name: &str) -> Result<bool, QueueError> {
        self.transition(name, QueueState::Processing, QueueState::Incoming)
    }

    /// Operator retry: move a failed file back to `incoming/`
    pub fn requeue_failed(&self, name: &str) -> Result<bool, QueueError> {
        let moved = self.transition(name, QueueState::Failed, QueueState::Incoming)?;
        if moved {
            let _ = fs::remove_file(self.error_detail_path(name));
        }
        Ok(moved)
    }

    pub fn error_detail_path(&self, name: &str) -> std::path::PathBuf {
        self.path(QueueState::Failed, &format!("{name}{ERROR_SUFFIX}"))
    }

    pub fn read_error_detail(&self, name: &str) -> Option<ErrorDetail> {
        let bytes = fs::read(self.error_detail_path(name)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Everything in `failed/` with its error detail, in file name order
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self
            .list(QueueState::Failed)?
            .into_iter()
            .map(|file| {
                let parsed = ParsedName::parse(&file);
                DeadLetter {
                    session_id: parsed.as_ref().map(|p| p.session_id.clone()),
                    event_kind: parsed.as_ref().map(|p| p.event_kind.as_str().to_string()),
                    sequence_hint: parsed.map(|p| p.sequence_hint),
                    detail: self.read_error_detail(&file),
                    file,
                }
            })
            .collect())
    }

    /// Files in `processing/` whose mtime is older than `stale_after`
    pub fn stale_processing(&self, stale_after: Duration) -> Result<Vec<String>, QueueError> {
        let now = SystemTime::now();
        Ok(self
            .list_with_mtime(QueueState::Processing)?
            .into_iter()
            .filter(|(_, modified)| {
                now.duration_since(*modified)
                    .map(|age| age >= stale_after)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name)
            .collect())
    }

    /// Delete archived files older than `max_age`; returns how many went
    pub fn prune_archive(&self, max_age: Duration) -> Result<usize, QueueError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for (name, modified) in self.list_with_mtime(QueueState::Archive)? {
            let expired = now
                .duration_since(modified)
                .map(|age| age >= max_age)
                .unwrap_or(false);
            if expired && fs::remove_file(self.path(QueueState::Archive, &name)).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
