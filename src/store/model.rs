// Data exchanged across the persistence boundary
//
// Mutation        correlator -> store (one per applied envelope)
// SessionSnapshot store -> correlator (rehydration)
// *View           store -> CLI / tests (read model)

use crate::envelope::{EventEnvelope, EventKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Status enums
// ─────────────────────────────────────────────────────────────────────────────

/// Why an envelope was applied without its causal predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// tool_completed without a matching tool_invoked
    MissingToolInvocation,
    /// tool_invoked / response_emitted without an owning prompt
    MissingPrompt,
}

impl GapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingToolInvocation => "missing_tool_invocation",
            Self::MissingPrompt => "missing_prompt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing_tool_invocation" => Some(Self::MissingToolInvocation),
            "missing_prompt" => Some(Self::MissingPrompt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Response,
    NextPrompt,
    SessionEnded,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::NextPrompt => "next_prompt",
            Self::SessionEnded => "session_ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Open,
    Closed(CloseReason),
}

impl ExchangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed(_) => "closed",
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Open => None,
            Self::Closed(reason) => Some(*reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutation
// ─────────────────────────────────────────────────────────────────────────────

/// Conversation-level effect of one envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationChange {
    pub status: ConversationStatus,
    /// captured_at of the closing session_ended; None while active
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when this envelope is the earliest prompt seen so far
    pub title: Option<String>,
}

/// Move already-applied events into a late-arriving prompt's exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reassign {
    pub exchange: u64,
    /// Exclusive lower bound (the prompt's own sequence)
    pub after: u64,
    /// Exclusive upper bound (the next prompt's sequence), None = unbounded
    pub before: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeStatusChange {
    pub prompt_sequence: u64,
    pub status: ExchangeStatus,
}

/// Everything the store must write for one envelope, as a single transaction
#[derive(Debug, Clone)]
pub struct Mutation {
    pub envelope: EventEnvelope,
    /// Owning exchange (prompt sequence); a prompt owns itself
    pub exchange: Option<u64>,
    pub gap: Option<GapKind>,
    /// Remove the envelope's row from the pending stash in the same transaction
    pub from_pending: bool,
    pub conversation: ConversationChange,
    pub reassign: Option<Reassign>,
    /// Exchanges whose status changed, including a newly opened one
    pub exchange_status: Vec<ExchangeStatusChange>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rehydration
// ─────────────────────────────────────────────────────────────────────────────

/// An applied event as the correlator needs to remember it
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEvent {
    pub sequence_hint: u64,
    pub kind: EventKind,
    pub tool_key: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEnvelope {
    pub envelope: EventEnvelope,
    pub stashed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Applied events in sequence order
    pub events: Vec<AppliedEvent>,
    /// Stashed envelopes in sequence order
    pub pending: Vec<PendingEnvelope>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Read model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    pub event_id: String,
    pub sequence_hint: u64,
    pub event_kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap: Option<GapKind>,
    pub captured_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeView {
    pub prompt_sequence: u64,
    pub prompt: String,
    pub status: String,
    pub close_reason: Option<String>,
    pub tool_calls: u64,
    pub total_tool_ms: u64,
    pub events: Vec<EventView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub session_id: String,
    pub user_session_id: Option<String>,
    pub title: Option<String>,
    pub status: String,
    pub cwd: Option<String>,
    pub transcript_path: Option<String>,
    pub prompt_count: u64,
    pub total_characters: u64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub exchanges: Vec<ExchangeView>,
    /// Events before the session's first prompt
    pub unassigned: Vec<EventView>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub conversations: u64,
    pub active_conversations: u64,
    pub exchanges: u64,
    pub open_exchanges: u64,
    pub events: u64,
    pub pending: u64,
    pub gaps: u64,
    pub db_size_bytes: u64,
}
