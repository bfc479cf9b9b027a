// Per-session correlation state
//
// Only what is needed to place the next envelope is kept: the sequence
// numbers of prompts, responses and session ends, plus which tool keys have
// been invoked. Exchange status is always derived from these sets, so
// applying envelopes in any order converges on the same result:
//
//   exchange(p) = [p, next prompt)
//   closed by response      if a response_emitted falls inside
//   closed by session end   if a session_ended falls inside
//   closed by next prompt   if a later prompt exists
//   open                    otherwise (only ever the last exchange)

use crate::envelope::{EventEnvelope, EventKind, EventPayload};
use crate::store::{
    AppliedEvent, CloseReason, ConversationChange, ConversationStatus, ExchangeStatus,
    ExchangeStatusChange, GapKind, Mutation, PendingEnvelope, Reassign, SessionSnapshot,
};
use crate::util::truncate_chars;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::time::{Duration, Instant};

/// Conversation titles are the first prompt, cut to this many characters
pub(crate) const TITLE_CHARS: usize = 50;

/// Sequence numbers that decide exchange boundaries
#[derive(Debug, Clone, Default)]
struct Timeline {
    prompts: BTreeSet<u64>,
    responses: BTreeSet<u64>,
    ends: BTreeMap<u64, DateTime<Utc>>,
}

impl Timeline {
    fn record(&mut self, kind: EventKind, seq: u64, captured_at: DateTime<Utc>) {
        match kind {
            EventKind::PromptSubmitted => {
                self.prompts.insert(seq);
            }
            EventKind::ResponseEmitted => {
                self.responses.insert(seq);
            }
            EventKind::SessionEnded => {
                self.ends.insert(seq, captured_at);
            }
            EventKind::ToolInvoked | EventKind::ToolCompleted | EventKind::SessionStarted => {}
        }
    }

    /// Prompt owning `seq`: the latest prompt at or before it
    fn owner(&self, seq: u64) -> Option<u64> {
        self.prompts.range(..=seq).next_back().copied()
    }

    fn next_prompt_after(&self, seq: u64) -> Option<u64> {
        self.prompts.range((Excluded(seq), Unbounded)).next().copied()
    }

    fn status_of(&self, prompt: u64) -> ExchangeStatus {
        let next = self.next_prompt_after(prompt);
        let upper = next.map(Excluded).unwrap_or(Unbounded);
        let range = (Excluded(prompt), upper);

        if self.responses.range(range).next().is_some() {
            ExchangeStatus::Closed(CloseReason::Response)
        } else if self.ends.range(range).next().is_some() {
            ExchangeStatus::Closed(CloseReason::SessionEnded)
        } else if next.is_some() {
            ExchangeStatus::Closed(CloseReason::NextPrompt)
        } else {
            ExchangeStatus::Open
        }
    }

    /// Closed once a session_ended follows the last prompt; a later prompt
    /// reopens it
    fn conversation(&self) -> (ConversationStatus, Option<DateTime<Utc>>) {
        let last_end = self.ends.iter().next_back();
        let last_prompt = self.prompts.last();
        match (last_end, last_prompt) {
            (Some((end, at)), Some(prompt)) if end > prompt => {
                (ConversationStatus::Closed, Some(*at))
            }
            (Some((_, at)), None) => (ConversationStatus::Closed, Some(*at)),
            _ => (ConversationStatus::Active, None),
        }
    }
}

pub(crate) struct SessionState {
    timeline: Timeline,
    /// tool key -> sequences of its tool_invoked events
    invocations: HashMap<String, BTreeSet<u64>>,
    /// Held envelopes, kept sorted by sequence
    pending: Vec<PendingEnvelope>,
    pub last_touched: Instant,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            timeline: Timeline::default(),
            invocations: HashMap::new(),
            pending: Vec::new(),
            last_touched: Instant::now(),
        }
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut state = Self::new();
        for AppliedEvent {
            sequence_hint,
            kind,
            tool_key,
            captured_at,
        } in snapshot.events
        {
            state.timeline.record(kind, sequence_hint, captured_at);
            if let (EventKind::ToolInvoked, Some(key)) = (kind, tool_key) {
                state.invocations.entry(key).or_default().insert(sequence_hint);
            }
        }
        for entry in snapshot.pending {
            state.hold(entry);
        }
        state
    }

    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, event_id: &str) -> bool {
        self.pending.iter().any(|p| p.envelope.event_id == event_id)
    }

    pub fn is_idle(&self, now: Instant, idle_after: Duration) -> bool {
        self.pending.is_empty() && now.saturating_duration_since(self.last_touched) >= idle_after
    }

    /// The causal predecessor this envelope is still waiting for, if any
    pub fn missing_predecessor(&self, envelope: &EventEnvelope) -> Option<GapKind> {
        let seq = envelope.sequence_hint;
        match &envelope.payload {
            EventPayload::ToolCompleted(_) => {
                let invoked = envelope
                    .payload
                    .tool_key()
                    .and_then(|key| self.invocations.get(key))
                    .is_some_and(|seqs| seqs.range(..seq).next().is_some());
                (!invoked).then_some(GapKind::MissingToolInvocation)
            }
            EventPayload::ToolInvoked(_) | EventPayload::ResponseEmitted(_) => {
                let prompted = self.timeline.prompts.range(..seq).next().is_some();
                (!prompted).then_some(GapKind::MissingPrompt)
            }
            EventPayload::PromptSubmitted(_)
            | EventPayload::SessionStarted(_)
            | EventPayload::SessionEnded(_) => None,
        }
    }

    /// Compute the store mutation for applying `envelope` now
    ///
    /// Does not change the state; call [`commit`](Self::commit) once the
    /// store has accepted the mutation.
    pub fn plan(&self, envelope: EventEnvelope, gap: Option<GapKind>, from_pending: bool) -> Mutation {
        let seq = envelope.sequence_hint;
        let kind = envelope.kind();

        let mut after = self.timeline.clone();
        after.record(kind, seq, envelope.captured_at);

        // Exchanges whose boundaries this envelope can move: the one it lands
        // in, and for a prompt, the one it splits off from
        let owner = after.owner(seq);
        let mut candidates = BTreeSet::new();
        if let Some(owner) = owner {
            candidates.insert(owner);
        }
        if let Some(previous) = self.timeline.owner(seq) {
            candidates.insert(previous);
        }

        let exchange_status = candidates
            .into_iter()
            .filter_map(|prompt| {
                let new_status = after.status_of(prompt);
                let is_new = !self.timeline.prompts.contains(&prompt);
                let changed = is_new || self.timeline.status_of(prompt) != new_status;
                changed.then_some(ExchangeStatusChange {
                    prompt_sequence: prompt,
                    status: new_status,
                })
            })
            .collect();

        let (title, reassign) = match &envelope.payload {
            EventPayload::PromptSubmitted(p) if !self.timeline.prompts.contains(&seq) => {
                let earliest = self.timeline.prompts.first().map_or(true, |first| seq < *first);
                let title = earliest.then(|| truncate_chars(&p.prompt, TITLE_CHARS).to_string());
                let reassign = Reassign {
                    exchange: seq,
                    after: seq,
                    before: self.timeline.next_prompt_after(seq),
                };
                (title, Some(reassign))
            }
            _ => (None, None),
        };

        let (status, ended_at) = after.conversation();

        Mutation {
            exchange: owner,
            gap,
            from_pending,
            conversation: ConversationChange {
                status,
                ended_at,
                title,
            },
            reassign,
            exchange_status,
            envelope,
        }
    }

    /// Record an applied envelope; returns true if it left the pending buffer
    pub fn commit(&mut self, envelope: &EventEnvelope) -> bool {
        let seq = envelope.sequence_hint;
        self.timeline.record(envelope.kind(), seq, envelope.captured_at);
        if let (EventPayload::ToolInvoked(_), Some(key)) = (&envelope.payload, envelope.payload.tool_key()) {
            self.invocations.entry(key.to_string()).or_default().insert(seq);
        }

        let before = self.pending.len();
        self.pending.retain(|p| p.envelope.event_id != envelope.event_id);
        before != self.pending.len()
    }

    /// Buffer an envelope (sorted by sequence); false if already held
    pub fn hold(&mut self, entry: PendingEnvelope) -> bool {
        if self.is_pending(&entry.envelope.event_id) {
            return false;
        }
        let idx = self
            .pending
            .partition_point(|p| p.envelope.sequence_hint <= entry.envelope.sequence_hint);
        self.pending.insert(idx, entry);
        true
    }

    /// Lowest-sequence held envelope whose predecessor has now been applied
    pub fn next_ready(&self) -> Option<EventEnvelope> {
        self.pending
            .iter()
            .find(|p| self.missing_predecessor(&p.envelope).is_none())
            .map(|p| p.envelope.clone())
    }

    /// Lowest-sequence held envelope, for capacity overflow
    pub fn oldest_pending(&self) -> Option<EventEnvelope> {
        self.pending.first().map(|p| p.envelope.clone())
    }

    /// Held envelopes stashed at or before `deadline`, in sequence order
    pub fn expired(&self, deadline: DateTime<Utc>) -> Vec<EventEnvelope> {
        self.pending
            .iter()
            .filter(|p| p.stashed_at <= deadline)
            .map(|p| p.envelope.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::*;
    use serde_json::json;

    fn env(seq: u64, payload: EventPayload) -> EventEnvelope {
        EventEnvelope {
            event_id: format!("e{seq}"),
            session_id: "s".to_string(),
            sequence_hint: seq,
            captured_at: Utc::now(),
            payload,
        }
    }

    fn prompt(seq: u64) -> EventEnvelope {
        env(
            seq,
            EventPayload::PromptSubmitted(PromptSubmitted {
                prompt: format!("prompt {seq}"),
                context: SessionContext::default(),
            }),
        )
    }

    fn invoked(seq: u64, id: &str) -> EventEnvelope {
        env(
            seq,
            EventPayload::ToolInvoked(ToolInvoked {
                tool_name: "Bash".to_string(),
                tool_use_id: Some(id.to_string()),
                arguments: json!({}),
                context: SessionContext::default(),
            }),
        )
    }

    fn completed(seq: u64, id: &str) -> EventEnvelope {
        env(
            seq,
            EventPayload::ToolCompleted(ToolCompleted {
                tool_name: "Bash".to_string(),
                tool_use_id: Some(id.to_string()),
                result: json!("ok"),
                duration_ms: Some(12),
                success: true,
                context: SessionContext::default(),
            }),
        )
    }

    fn response(seq: u64) -> EventEnvelope {
        env(seq, EventPayload::ResponseEmitted(ResponseEmitted::default()))
    }

    fn ended(seq: u64) -> EventEnvelope {
        env(seq, EventPayload::SessionEnded(SessionEnded::default()))
    }

    fn apply(state: &mut SessionState, e: EventEnvelope) -> Mutation {
        let m = state.plan(e, None, false);
        state.commit(&m.envelope);
        m
    }

    #[test]
    fn test_predecessor_rules() {
        let mut state = SessionState::new();
        assert_eq!(state.missing_predecessor(&invoked(2, "t1")), Some(GapKind::MissingPrompt));
        assert_eq!(state.missing_predecessor(&response(4)), Some(GapKind::MissingPrompt));
        assert_eq!(state.missing_predecessor(&prompt(1)), None);
        assert_eq!(state.missing_predecessor(&ended(9)), None);

        apply(&mut state, prompt(1));
        assert_eq!(state.missing_predecessor(&invoked(2, "t1")), None);
        assert_eq!(
            state.missing_predecessor(&completed(3, "t1")),
            Some(GapKind::MissingToolInvocation)
        );

        apply(&mut state, invoked(2, "t1"));
        assert_eq!(state.missing_predecessor(&completed(3, "t1")), None);
        // Different tool_use_id is still missing its invocation
        assert!(state.missing_predecessor(&completed(3, "t2")).is_some());
    }

    #[test]
    fn test_new_prompt_opens_and_closes_previous() {
        let mut state = SessionState::new();
        let m = apply(&mut state, prompt(1));
        assert_eq!(m.exchange, Some(1));
        assert_eq!(
            m.exchange_status,
            vec![ExchangeStatusChange {
                prompt_sequence: 1,
                status: ExchangeStatus::Open
            }]
        );
        assert_eq!(m.conversation.title.as_deref(), Some("prompt 1"));

        let m = apply(&mut state, prompt(5));
        assert!(m.exchange_status.contains(&ExchangeStatusChange {
            prompt_sequence: 1,
            status: ExchangeStatus::Closed(CloseReason::NextPrompt),
        }));
        assert!(m.exchange_status.contains(&ExchangeStatusChange {
            prompt_sequence: 5,
            status: ExchangeStatus::Open,
        }));
        assert_eq!(m.conversation.title, None);
    }

    #[test]
    fn test_response_closes_exchange() {
        let mut state = SessionState::new();
        apply(&mut state, prompt(1));
        let m = apply(&mut state, response(4));
        assert_eq!(m.exchange, Some(1));
        assert_eq!(
            m.exchange_status,
            vec![ExchangeStatusChange {
                prompt_sequence: 1,
                status: ExchangeStatus::Closed(CloseReason::Response)
            }]
        );
    }

    #[test]
    fn test_late_prompt_splits_exchange() {
        let mut state = SessionState::new();
        apply(&mut state, prompt(1));
        apply(&mut state, response(6));

        // Prompt 4 arrives after response 6 was applied to exchange 1
        let m = apply(&mut state, prompt(4));
        assert_eq!(
            m.reassign,
            Some(Reassign {
                exchange: 4,
                after: 4,
                before: None
            })
        );
        assert!(m.exchange_status.contains(&ExchangeStatusChange {
            prompt_sequence: 1,
            status: ExchangeStatus::Closed(CloseReason::NextPrompt),
        }));
        assert!(m.exchange_status.contains(&ExchangeStatusChange {
            prompt_sequence: 4,
            status: ExchangeStatus::Closed(CloseReason::Response),
        }));
    }

    #[test]
    fn test_earliest_prompt_sets_title() {
        let mut state = SessionState::new();
        apply(&mut state, prompt(10));
        let m = apply(&mut state, prompt(3));
        assert_eq!(m.conversation.title.as_deref(), Some("prompt 3"));
        assert_eq!(m.reassign.unwrap().before, Some(10));
    }

    #[test]
    fn test_session_end_closes_and_prompt_reopens() {
        let mut state = SessionState::new();
        apply(&mut state, prompt(1));
        let m = apply(&mut state, ended(2));
        assert_eq!(m.conversation.status, ConversationStatus::Closed);
        assert!(m.conversation.ended_at.is_some());
        assert_eq!(
            m.exchange_status[0].status,
            ExchangeStatus::Closed(CloseReason::SessionEnded)
        );

        let m = apply(&mut state, prompt(3));
        assert_eq!(m.conversation.status, ConversationStatus::Active);
        assert_eq!(m.conversation.ended_at, None);
    }

    #[test]
    fn test_session_end_without_prompts_closes_conversation() {
        let mut state = SessionState::new();
        let m = apply(&mut state, ended(1));
        assert_eq!(m.exchange, None);
        assert_eq!(m.conversation.status, ConversationStatus::Closed);
        assert!(m.exchange_status.is_empty());
    }

    #[test]
    fn test_pending_kept_in_sequence_order() {
        let mut state = SessionState::new();
        for seq in [7, 3, 5] {
            assert!(state.hold(PendingEnvelope {
                envelope: completed(seq, "x"),
                stashed_at: Utc::now(),
            }));
        }
        assert!(!state.hold(PendingEnvelope {
            envelope: completed(5, "x"),
            stashed_at: Utc::now(),
        }));
        assert_eq!(state.oldest_pending().unwrap().sequence_hint, 3);
        assert!(state.next_ready().is_none());

        apply(&mut state, prompt(1));
        apply(&mut state, invoked(2, "x"));
        assert_eq!(state.next_ready().unwrap().sequence_hint, 3);

        // Committing a held envelope removes it from the buffer
        let ready = state.next_ready().unwrap();
        assert!(state.commit(&ready));
        assert_eq!(state.pending_len(), 2);
    }

    #[test]
    fn test_snapshot_rehydrates_invocations() {
        let snapshot = SessionSnapshot {
            events: vec![
                AppliedEvent {
                    sequence_hint: 1,
                    kind: EventKind::PromptSubmitted,
                    tool_key: None,
                    captured_at: Utc::now(),
                },
                AppliedEvent {
                    sequence_hint: 2,
                    kind: EventKind::ToolInvoked,
                    tool_key: Some("t1".to_string()),
                    captured_at: Utc::now(),
                },
            ],
            pending: vec![],
        };
        let state = SessionState::from_snapshot(snapshot);
        assert_eq!(state.missing_predecessor(&completed(3, "t1")), None);
        assert_eq!(state.timeline.status_of(1), ExchangeStatus::Open);
    }

    #[test]
    fn test_idle_requires_empty_buffer() {
        let mut state = SessionState::new();
        state.last_touched = Instant::now() - Duration::from_secs(120);
        assert!(state.is_idle(Instant::now(), Duration::from_secs(60)));

        state.hold(PendingEnvelope {
            envelope: completed(3, "x"),
            stashed_at: Utc::now(),
        });
        assert!(!state.is_idle(Instant::now(), Duration::from_secs(60)));
    }
}
