//! Test doubles for the persistence boundary

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

/// Open a store in a fresh temp directory
pub(crate) fn temp_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("hookq.db"), StoreOptions::default()).unwrap();
    (dir, store)
}

/// Wraps a real store and fails `apply` with a transient error on demand
pub(crate) struct FlakyStore {
    pub inner: SqliteStore,
    failures_left: AtomicU32,
    pub apply_calls: AtomicU32,
}

impl FlakyStore {
    /// Fail the first `n` applies, then behave normally
    pub fn failing_first(inner: SqliteStore, n: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(n),
            apply_calls: AtomicU32::new(0),
        }
    }

    pub fn always_failing(inner: SqliteStore) -> Self {
        Self::failing_first(inner, u32::MAX)
    }

    pub fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }
}

impl PersistenceAdapter for FlakyStore {
    fn is_applied(&self, event_id: &str) -> Result<bool, StoreError> {
        self.inner.is_applied(event_id)
    }

    fn apply(&self, mutation: &Mutation) -> Result<ApplyOutcome, StoreError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Transient("database is locked".to_string()));
        }
        self.inner.apply(mutation)
    }

    fn stash_pending(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        self.inner.stash_pending(envelope)
    }

    fn load_session(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        self.inner.load_session(session_id)
    }

    fn pending_sessions(&self) -> Result<Vec<String>, StoreError> {
        self.inner.pending_sessions()
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats()
    }

    fn conversation(&self, session_id: &str) -> Result<Option<ConversationView>, StoreError> {
        self.inner.conversation(session_id)
    }
}
