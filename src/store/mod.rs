//! Persistence boundary for correlated conversations
//!
//! The correlator talks to storage only through [`PersistenceAdapter`]. The
//! contract that makes at-least-once delivery safe:
//!
//! - `apply` is idempotent on `event_id`: the second call for an id returns
//!   `AlreadyApplied` and changes nothing.
//! - a mutation is applied completely or not at all (one transaction).
//! - "try again later" failures (busy database, pool exhausted, timeouts) are
//!   `StoreError::Transient`; everything else is `Fatal`.

mod model;
mod schema;
mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

pub use model::{
    AppliedEvent, CloseReason, ConversationChange, ConversationStatus, ConversationView,
    EventView, ExchangeStatus, ExchangeStatusChange, ExchangeView, GapKind, Mutation,
    PendingEnvelope, Reassign, SessionSnapshot, StoreStats,
};
pub use sqlite::{SqliteStore, StoreOptions};

use crate::envelope::EventEnvelope;

/// Result of a successful `apply`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Worth retrying: busy/locked database, pool timeout
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    /// Retrying will not help
    #[error("store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Fatal(format!("serialization: {e}"))
    }
}

/// Storage used by the correlator
pub trait PersistenceAdapter: Send + Sync {
    /// Has an envelope with this id been applied?
    fn is_applied(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Apply one correlated envelope transactionally
    fn apply(&self, mutation: &Mutation) -> Result<ApplyOutcome, StoreError>;

    /// Durably park an envelope whose predecessor has not arrived yet
    fn stash_pending(&self, envelope: &EventEnvelope) -> Result<(), StoreError>;

    /// Everything the correlator needs to rebuild a session in memory
    fn load_session(&self, session_id: &str) -> Result<SessionSnapshot, StoreError>;

    /// Sessions that still have stashed envelopes
    fn pending_sessions(&self) -> Result<Vec<String>, StoreError>;

    fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Reconstructed conversation for display
    fn conversation(&self, session_id: &str) -> Result<Option<ConversationView>, StoreError>;
}
