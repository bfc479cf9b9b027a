//! Correlator: places envelopes into conversations and exchanges
//!
//! Envelopes arrive from many workers, possibly out of order and possibly
//! more than once. For each one the correlator:
//!
//! 1. drops it if the store (or the pending buffer) already has its id
//! 2. applies it immediately when its causal predecessor is known
//! 3. otherwise stashes it durably and holds it until the predecessor shows
//!    up, the hold times out, or the session's buffer overflows; the last
//!    two apply it anyway, flagged with a [`GapKind`]
//!
//! State is per session and guarded by a per-session lock, so different
//! sessions correlate in parallel while one session is strictly serialized.
//! Sessions are loaded lazily from the store and evicted when idle.

mod session;

use crate::envelope::EventEnvelope;
use crate::store::{ApplyOutcome, GapKind, PendingEnvelope, PersistenceAdapter, StoreError};
use crate::util::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use session::SessionState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// How long an envelope may wait for its predecessor
    pub pending_timeout: Duration,
    /// Held envelopes per session before the oldest is forced through
    pub pending_capacity: usize,
    /// Unused sessions are dropped from memory after this long
    pub session_idle: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(30),
            pending_capacity: 256,
            session_idle: Duration::from_secs(600),
        }
    }
}

/// What happened to one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelateOutcome {
    /// Written to the store
    Applied,
    /// Already applied or already held; nothing changed
    Duplicate,
    /// Durably stashed until its predecessor arrives
    Buffered,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CorrelateError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CorrelateError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
        }
    }
}

/// Running counters, read by the health endpoint and `status`
#[derive(Debug, Default)]
pub struct CorrelatorMetrics {
    applied: AtomicU64,
    duplicates: AtomicU64,
    buffered: AtomicU64,
    released: AtomicU64,
    gap_applied: AtomicU64,
    pending: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub buffered: u64,
    pub released: u64,
    pub gap_applied: u64,
    pub pending: usize,
}

impl CorrelatorMetrics {
    pub fn snapshot(&self) -> CorrelatorSnapshot {
        CorrelatorSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            gap_applied: self.gap_applied.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

type Slot = Arc<Mutex<Option<SessionState>>>;

pub struct Correlator {
    store: Arc<dyn PersistenceAdapter>,
    config: CorrelatorConfig,
    sessions: Mutex<HashMap<String, Slot>>,
    metrics: CorrelatorMetrics,
}

impl Correlator {
    pub fn new(store: Arc<dyn PersistenceAdapter>, config: CorrelatorConfig) -> Self {
        Self {
            store,
            config,
            sessions: Mutex::new(HashMap::new()),
            metrics: CorrelatorMetrics::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceAdapter> {
        &self.store
    }

    pub fn metrics(&self) -> CorrelatorSnapshot {
        self.metrics.snapshot()
    }

    /// Envelopes currently held across all loaded sessions
    pub fn pending_count(&self) -> usize {
        self.metrics.pending.load(Ordering::Relaxed)
    }

    /// Correlate one envelope
    ///
    /// On error nothing has been committed for this envelope and the caller
    /// may retry it (if the error is transient).
    pub fn correlate(&self, envelope: EventEnvelope) -> Result<CorrelateOutcome, CorrelateError> {
        let slot = self.slot(&envelope.session_id);
        let mut guard = lock(&slot);
        let state = self.loaded(&mut guard, &envelope.session_id)?;
        state.touch();

        if state.is_pending(&envelope.event_id) || self.store.is_applied(&envelope.event_id)? {
            self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event_id = %envelope.event_id, "Duplicate envelope ignored");
            return Ok(CorrelateOutcome::Duplicate);
        }

        match state.missing_predecessor(&envelope) {
            None => {
                self.apply(state, envelope, None, false)?;
                self.release_ready(state);
                Ok(CorrelateOutcome::Applied)
            }
            Some(waiting_for) => {
                self.store.stash_pending(&envelope)?;
                tracing::debug!(
                    event_id = %envelope.event_id,
                    session_id = %envelope.session_id,
                    "Holding {} ({})",
                    envelope.kind(),
                    waiting_for.as_str()
                );
                if state.hold(PendingEnvelope {
                    envelope,
                    stashed_at: Utc::now(),
                }) {
                    self.metrics.pending.fetch_add(1, Ordering::Relaxed);
                }
                self.metrics.buffered.fetch_add(1, Ordering::Relaxed);
                self.enforce_capacity(state);
                Ok(CorrelateOutcome::Buffered)
            }
        }
    }

    /// Apply every held envelope whose wait has exceeded the timeout
    pub fn flush_expired(&self) -> usize {
        self.flush_expired_at(Utc::now())
    }

    /// [`flush_expired`](Self::flush_expired) against an explicit clock
    pub fn flush_expired_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::from_std(self.config.pending_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let deadline = now - timeout;

        let mut flushed = 0;
        for slot in self.slots() {
            let mut guard = lock(&slot);
            let Some(state) = guard.as_mut() else {
                continue;
            };
            for envelope in state.expired(deadline) {
                // An earlier forced apply may have satisfied it already
                if !state.is_pending(&envelope.event_id) {
                    continue;
                }
                let gap = state.missing_predecessor(&envelope);
                let event_id = envelope.event_id.clone();
                match self.apply(state, envelope, gap, true) {
                    Ok(_) => {
                        if gap.is_some() {
                            flushed += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(event_id = %event_id, "Failed to flush held envelope: {}", e);
                        break;
                    }
                }
            }
            self.release_ready(state);
        }

        if flushed > 0 {
            tracing::info!("Applied {} held envelope(s) with missing predecessors", flushed);
        }
        flushed
    }

    /// Load every session that still has stashed envelopes
    ///
    /// Run once at startup so held envelopes from a previous run time out
    /// (or get released) even if their session never sends another event.
    pub fn recover_pending(&self) -> Result<usize, CorrelateError> {
        let sessions = self.store.pending_sessions()?;
        for session_id in &sessions {
            let slot = self.slot(session_id);
            let mut guard = lock(&slot);
            self.loaded(&mut guard, session_id)?;
        }
        if !sessions.is_empty() {
            tracing::info!(
                "Recovered {} held envelope(s) across {} session(s)",
                self.pending_count(),
                sessions.len()
            );
        }
        Ok(sessions.len())
    }

    /// Drop idle sessions with nothing held; returns how many were evicted
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, slot| {
            // Someone else holds the slot: in use
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => guard
                    .as_ref()
                    .is_some_and(|state| !state.is_idle(now, self.config.session_idle)),
                Err(_) => true,
            }
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} idle session(s)", evicted);
        }
        evicted
    }

    /// Sessions currently held in memory
    pub fn loaded_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn slot(&self, session_id: &str) -> Slot {
        let mut sessions = lock(&self.sessions);
        sessions.entry(session_id.to_string()).or_default().clone()
    }

    fn slots(&self) -> Vec<Slot> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Rehydrate a session from the store on first use
    fn loaded<'a>(
        &self,
        slot: &'a mut Option<SessionState>,
        session_id: &str,
    ) -> Result<&'a mut SessionState, CorrelateError> {
        let state = match slot.take() {
            Some(state) => state,
            None => {
                let snapshot = self.store.load_session(session_id)?;
                let mut state = SessionState::from_snapshot(snapshot);
                self.metrics
                    .pending
                    .fetch_add(state.pending_len(), Ordering::Relaxed);
                // A crash between applying a predecessor and releasing its
                // successors leaves ready envelopes in the stash
                self.release_ready(&mut state);
                state
            }
        };
        Ok(slot.insert(state))
    }

    fn apply(
        &self,
        state: &mut SessionState,
        envelope: EventEnvelope,
        gap: Option<GapKind>,
        from_pending: bool,
    ) -> Result<ApplyOutcome, CorrelateError> {
        let mutation = state.plan(envelope, gap, from_pending);
        let outcome = self.store.apply(&mutation)?;

        // Recording is idempotent, so an AlreadyApplied envelope (applied by
        // a previous run we never saw) is folded in the same way
        if state.commit(&mutation.envelope) {
            self.metrics.pending.fetch_sub(1, Ordering::Relaxed);
        }
        match outcome {
            ApplyOutcome::Applied => {
                self.metrics.applied.fetch_add(1, Ordering::Relaxed);
                if let Some(gap) = gap {
                    self.metrics.gap_applied.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_id = %mutation.envelope.event_id,
                        session_id = %mutation.envelope.session_id,
                        "Applied {} without predecessor ({})",
                        mutation.envelope.kind(),
                        gap.as_str()
                    );
                }
            }
            ApplyOutcome::AlreadyApplied => {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(outcome)
    }

    /// Apply held envelopes that have become ready, lowest sequence first
    ///
    /// Failures stay in the buffer for the next attempt; they belong to
    /// envelopes whose queue files are already archived, so there is no
    /// caller to report them to.
    fn release_ready(&self, state: &mut SessionState) {
        while let Some(envelope) = state.next_ready() {
            let event_id = envelope.event_id.clone();
            match self.apply(state, envelope, None, true) {
                Ok(_) => {
                    self.metrics.released.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(event_id = %event_id, "Failed to release held envelope: {}", e);
                    break;
                }
            }
        }
    }

    /// Force the oldest held envelopes through until the buffer fits
    fn enforce_capacity(&self, state: &mut SessionState) {
        while state.pending_len() > self.config.pending_capacity {
            let Some(envelope) = state.oldest_pending() else {
                break;
            };
            let gap = state.missing_predecessor(&envelope);
            let event_id = envelope.event_id.clone();
            if let Err(e) = self.apply(state, envelope, gap, true) {
                tracing::warn!(event_id = %event_id, "Failed to apply overflowing envelope: {}", e);
                break;
            }
            self.release_ready(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::*;
    use crate::store::testing::{temp_store, FlakyStore};
    use crate::store::SqliteStore;
    use serde_json::json;

    fn env(id: &str, seq: u64, payload: EventPayload) -> EventEnvelope {
        EventEnvelope {
            event_id: id.to_string(),
            session_id: "sess".to_string(),
            sequence_hint: seq,
            captured_at: Utc::now(),
            payload,
        }
    }

    fn prompt(id: &str, seq: u64, text: &str) -> EventEnvelope {
        env(
            id,
            seq,
            EventPayload::PromptSubmitted(PromptSubmitted {
                prompt: text.to_string(),
                context: SessionContext::default(),
            }),
        )
    }

    fn invoked(id: &str, seq: u64, tool: &str) -> EventEnvelope {
        env(
            id,
            seq,
            EventPayload::ToolInvoked(ToolInvoked {
                tool_name: "Bash".to_string(),
                tool_use_id: Some(tool.to_string()),
                arguments: json!({"command": "ls"}),
                context: SessionContext::default(),
            }),
        )
    }

    fn completed(id: &str, seq: u64, tool: &str) -> EventEnvelope {
        env(
            id,
            seq,
            EventPayload::ToolCompleted(ToolCompleted {
                tool_name: "Bash".to_string(),
                tool_use_id: Some(tool.to_string()),
                result: json!("ok"),
                duration_ms: Some(40),
                success: true,
                context: SessionContext::default(),
            }),
        )
    }

    fn response(id: &str, seq: u64) -> EventEnvelope {
        env(id, seq, EventPayload::ResponseEmitted(ResponseEmitted::default()))
    }

    fn ended(id: &str, seq: u64) -> EventEnvelope {
        env(id, seq, EventPayload::SessionEnded(SessionEnded::default()))
    }

    fn correlator(store: SqliteStore) -> (Correlator, Arc<SqliteStore>) {
        correlator_with(store, CorrelatorConfig::default())
    }

    fn correlator_with(store: SqliteStore, config: CorrelatorConfig) -> (Correlator, Arc<SqliteStore>) {
        let store = Arc::new(store);
        (Correlator::new(store.clone(), config), store)
    }

    fn sequences(store: &SqliteStore) -> Vec<Vec<u64>> {
        let view = store.conversation("sess").unwrap().unwrap();
        view.exchanges
            .iter()
            .map(|x| x.events.iter().map(|e| e.sequence_hint).collect())
            .collect()
    }

    #[test]
    fn test_out_of_order_converges() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        // tool_completed, prompt, tool_invoked
        assert_eq!(c.correlate(completed("c", 3, "t1")).unwrap(), CorrelateOutcome::Buffered);
        assert_eq!(c.correlate(prompt("p", 1, "list files")).unwrap(), CorrelateOutcome::Applied);
        assert_eq!(c.pending_count(), 1);
        assert_eq!(c.correlate(invoked("i", 2, "t1")).unwrap(), CorrelateOutcome::Applied);

        assert_eq!(c.pending_count(), 0);
        assert_eq!(sequences(&store), vec![vec![1, 2, 3]]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.gaps, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(c.metrics().released, 1);
    }

    #[test]
    fn test_next_prompt_closes_previous_exchange() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        c.correlate(prompt("p1", 1, "first")).unwrap();
        c.correlate(invoked("i1", 2, "t1")).unwrap();
        c.correlate(prompt("p2", 5, "second")).unwrap();

        let view = store.conversation("sess").unwrap().unwrap();
        assert_eq!(view.exchanges.len(), 2);
        assert_eq!(view.exchanges[0].status, "closed");
        assert_eq!(view.exchanges[0].close_reason.as_deref(), Some("next_prompt"));
        assert_eq!(view.exchanges[1].status, "open");
        assert_eq!(view.title.as_deref(), Some("first"));
        assert_eq!(view.prompt_count, 2);
    }

    #[test]
    fn test_response_closes_exchange() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        c.correlate(prompt("p1", 1, "hi")).unwrap();
        c.correlate(response("r1", 2)).unwrap();

        let view = store.conversation("sess").unwrap().unwrap();
        assert_eq!(view.exchanges[0].close_reason.as_deref(), Some("response"));
        assert_eq!(view.status, "active");
    }

    #[test]
    fn test_replay_is_duplicate() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        let p = prompt("p1", 1, "hi");
        assert_eq!(c.correlate(p.clone()).unwrap(), CorrelateOutcome::Applied);
        assert_eq!(c.correlate(p).unwrap(), CorrelateOutcome::Duplicate);

        // Replaying a held envelope is also a duplicate
        let done = completed("c1", 9, "missing");
        assert_eq!(c.correlate(done.clone()).unwrap(), CorrelateOutcome::Buffered);
        assert_eq!(c.correlate(done).unwrap(), CorrelateOutcome::Duplicate);

        let stats = store.stats().unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(store.conversation("sess").unwrap().unwrap().prompt_count, 1);
    }

    #[test]
    fn test_duplicate_across_restart() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);

        let first = Correlator::new(store.clone(), CorrelatorConfig::default());
        first.correlate(prompt("p1", 1, "hi")).unwrap();
        drop(first);

        let second = Correlator::new(store.clone(), CorrelatorConfig::default());
        assert_eq!(
            second.correlate(prompt("p1", 1, "hi")).unwrap(),
            CorrelateOutcome::Duplicate
        );
        assert_eq!(store.stats().unwrap().events, 1);
    }

    #[test]
    fn test_held_first_envelope_creates_conversation() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        let mut first = completed("c3", 3, "t1");
        if let EventPayload::ToolCompleted(p) = &mut first.payload {
            p.context.cwd = Some("/work".to_string());
        }
        assert_eq!(c.correlate(first).unwrap(), CorrelateOutcome::Buffered);

        let view = store.conversation("sess").unwrap().unwrap();
        assert_eq!(view.status, "active");
        assert_eq!(view.cwd.as_deref(), Some("/work"));
        assert!(view.exchanges.is_empty());
        assert_eq!(store.stats().unwrap().conversations, 1);

        // The prompt arriving later neither duplicates nor overwrites the seed
        c.correlate(prompt("p1", 1, "hi")).unwrap();
        c.correlate(invoked("i2", 2, "t1")).unwrap();
        let view = store.conversation("sess").unwrap().unwrap();
        assert_eq!(view.cwd.as_deref(), Some("/work"));
        assert_eq!(sequences(&store), vec![vec![1, 2, 3]]);
        assert_eq!(store.stats().unwrap().conversations, 1);
    }

    #[test]
    fn test_expired_pending_applied_with_gap() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        c.correlate(prompt("p1", 1, "hi")).unwrap();
        c.correlate(completed("c1", 5, "never-invoked")).unwrap();

        // Not yet expired
        assert_eq!(c.flush_expired_at(Utc::now()), 0);
        assert_eq!(c.pending_count(), 1);

        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(c.flush_expired_at(later), 1);
        assert_eq!(c.pending_count(), 0);

        let view = store.conversation("sess").unwrap().unwrap();
        let done = &view.exchanges[0].events[1];
        assert_eq!(done.gap, Some(GapKind::MissingToolInvocation));
        assert_eq!(store.stats().unwrap().pending, 0);
        assert_eq!(c.metrics().gap_applied, 1);
    }

    #[test]
    fn test_capacity_overflow_forces_oldest() {
        let (_dir, store) = temp_store();
        let config = CorrelatorConfig {
            pending_capacity: 2,
            ..Default::default()
        };
        let (c, store) = correlator_with(store, config);

        for (id, seq) in [("c3", 3), ("c4", 4), ("c5", 5)] {
            c.correlate(completed(id, seq, "orphan")).unwrap();
        }

        assert_eq!(c.pending_count(), 2);
        let stats = store.stats().unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.gaps, 1);
        assert!(store.is_applied("c3").unwrap());
        assert!(!store.is_applied("c5").unwrap());
    }

    #[test]
    fn test_late_prompt_takes_over_events() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        c.correlate(prompt("p1", 1, "first")).unwrap();
        c.correlate(invoked("i6", 6, "t6")).unwrap();
        c.correlate(response("r7", 7)).unwrap();
        // Prompt 4 was delayed; 6 and 7 belong to it
        c.correlate(prompt("p4", 4, "second")).unwrap();

        assert_eq!(sequences(&store), vec![vec![1], vec![4, 6, 7]]);
        let view = store.conversation("sess").unwrap().unwrap();
        assert_eq!(view.exchanges[0].close_reason.as_deref(), Some("next_prompt"));
        assert_eq!(view.exchanges[1].close_reason.as_deref(), Some("response"));
    }

    #[test]
    fn test_session_end_then_prompt_reopens() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);

        c.correlate(prompt("p1", 1, "hi")).unwrap();
        c.correlate(ended("end", 2)).unwrap();
        let view = store.conversation("sess").unwrap().unwrap();
        assert_eq!(view.status, "closed");
        assert!(view.ended_at.is_some());
        assert_eq!(view.exchanges[0].close_reason.as_deref(), Some("session_ended"));

        c.correlate(prompt("p3", 3, "back again")).unwrap();
        let view = store.conversation("sess").unwrap().unwrap();
        assert_eq!(view.status, "active");
        assert_eq!(view.ended_at, None);
    }

    #[test]
    fn test_pending_survives_restart() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);

        let first = Correlator::new(store.clone(), CorrelatorConfig::default());
        first.correlate(prompt("p1", 1, "hi")).unwrap();
        first.correlate(completed("c3", 3, "t1")).unwrap();
        drop(first);

        let second = Correlator::new(store.clone(), CorrelatorConfig::default());
        assert_eq!(second.recover_pending().unwrap(), 1);
        assert_eq!(second.pending_count(), 1);

        second.correlate(invoked("i2", 2, "t1")).unwrap();
        assert_eq!(second.pending_count(), 0);
        assert_eq!(sequences(&store), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_transient_failure_commits_nothing() {
        let (_dir, store) = temp_store();
        let store = Arc::new(FlakyStore::failing_first(store, 1));
        let c = Correlator::new(store.clone(), CorrelatorConfig::default());

        let err = c.correlate(prompt("p1", 1, "hi")).unwrap_err();
        assert!(err.is_transient());
        assert!(!store.is_applied("p1").unwrap());

        // The retry sees a clean state and applies normally
        assert_eq!(c.correlate(prompt("p1", 1, "hi")).unwrap(), CorrelateOutcome::Applied);
        assert_eq!(store.apply_calls(), 2);
    }

    #[test]
    fn test_idle_sessions_evicted() {
        let (_dir, store) = temp_store();
        let config = CorrelatorConfig {
            session_idle: Duration::from_millis(0),
            ..Default::default()
        };
        let (c, _store) = correlator_with(store, config);

        c.correlate(prompt("p1", 1, "hi")).unwrap();
        let mut held = prompt("p2", 2, "x");
        held.session_id = "other".to_string();
        c.correlate(held).unwrap();
        let mut orphan = completed("c9", 9, "t");
        orphan.session_id = "other".to_string();
        c.correlate(orphan).unwrap();

        assert_eq!(c.loaded_sessions(), 2);
        // "other" still holds an envelope
        assert_eq!(c.evict_idle(Instant::now()), 1);
        assert_eq!(c.loaded_sessions(), 1);
    }

    #[test]
    fn test_sessions_are_independent() {
        let (_dir, store) = temp_store();
        let (c, store) = correlator(store);
        let c = Arc::new(c);

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for seq in 1..=10u64 {
                        let mut e = if seq == 1 {
                            prompt(&format!("p-{n}"), seq, "go")
                        } else {
                            invoked(&format!("i-{n}-{seq}"), seq, &format!("t{seq}"))
                        };
                        e.session_id = format!("s{n}");
                        c.correlate(e).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.conversations, 4);
        assert_eq!(stats.events, 40);
        assert_eq!(stats.gaps, 0);
    }
}
