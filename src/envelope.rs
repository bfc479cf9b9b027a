//! Event envelope: one captured hook event
//!
//! The envelope is the unit written to queue files. On the wire it is a flat
//! object with an `event_kind` tag next to an untagged `payload`:
//!
//! ```text
//! { "event_id": "...", "session_id": "...", "sequence_hint": 17,
//!   "event_kind": "tool_invoked", "captured_at": "2026-01-01T00:00:00Z",
//!   "payload": { "tool_name": "Bash", "arguments": {...} } }
//! ```
//!
//! In memory the kind and payload are one closed enum, so a payload can never
//! disagree with its kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of `event_id` / `session_id`
///
/// Both end up in one queue file name, which plus the `.error.json` suffix of
/// a dead letter has to stay under the 255-byte NAME_MAX.
pub const MAX_ID_LEN: usize = 96;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    #[error("payload does not match event kind '{kind}': {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{field} is empty")]
    Empty { field: &'static str },

    #[error("{field} is longer than {max} bytes", max = MAX_ID_LEN)]
    TooLong { field: &'static str },

    #[error("{field} must be [A-Za-z0-9._-] and not start with a dot: {value:?}")]
    UnsafeId { field: &'static str, value: String },

    #[error("sequence_hint must be between 1 and {max}", max = i64::MAX)]
    SequenceOutOfRange,
}

// ─────────────────────────────────────────────────────────────────────────────
// Event kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PromptSubmitted,
    ToolInvoked,
    ToolCompleted,
    ResponseEmitted,
    SessionStarted,
    SessionEnded,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::PromptSubmitted,
        EventKind::ToolInvoked,
        EventKind::ToolCompleted,
        EventKind::ResponseEmitted,
        EventKind::SessionStarted,
        EventKind::SessionEnded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromptSubmitted => "prompt_submitted",
            Self::ToolInvoked => "tool_invoked",
            Self::ToolCompleted => "tool_completed",
            Self::ResponseEmitted => "response_emitted",
            Self::SessionStarted => "session_started",
            Self::SessionEnded => "session_ended",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownKind(s.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Producer-side context carried by any payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSubmitted {
    pub prompt: String,
    #[serde(flatten)]
    pub context: SessionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvoked {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub arguments: Value,
    #[serde(flatten)]
    pub context: SessionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCompleted {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(flatten)]
    pub context: SessionContext,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEmitted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(flatten)]
    pub context: SessionContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStarted {
    /// startup, resume, clear, compact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub context: SessionContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEnded {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub context: SessionContext,
}

/// Kind-specific payload; the variant *is* the event kind
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    PromptSubmitted(PromptSubmitted),
    ToolInvoked(ToolInvoked),
    ToolCompleted(ToolCompleted),
    ResponseEmitted(ResponseEmitted),
    SessionStarted(SessionStarted),
    SessionEnded(SessionEnded),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PromptSubmitted(_) => EventKind::PromptSubmitted,
            Self::ToolInvoked(_) => EventKind::ToolInvoked,
            Self::ToolCompleted(_) => EventKind::ToolCompleted,
            Self::ResponseEmitted(_) => EventKind::ResponseEmitted,
            Self::SessionStarted(_) => EventKind::SessionStarted,
            Self::SessionEnded(_) => EventKind::SessionEnded,
        }
    }

    pub fn context(&self) -> &SessionContext {
        match self {
            Self::PromptSubmitted(p) => &p.context,
            Self::ToolInvoked(p) => &p.context,
            Self::ToolCompleted(p) => &p.context,
            Self::ResponseEmitted(p) => &p.context,
            Self::SessionStarted(p) => &p.context,
            Self::SessionEnded(p) => &p.context,
        }
    }

    /// Key pairing a tool completion with its invocation: the tool_use_id when
    /// the client supplied one, otherwise the tool name.
    pub fn tool_key(&self) -> Option<&str> {
        match self {
            Self::ToolInvoked(p) => Some(p.tool_use_id.as_deref().unwrap_or(&p.tool_name)),
            Self::ToolCompleted(p) => Some(p.tool_use_id.as_deref().unwrap_or(&p.tool_name)),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolInvoked(p) => Some(&p.tool_name),
            Self::ToolCompleted(p) => Some(&p.tool_name),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::PromptSubmitted(p) => serde_json::to_value(p),
            Self::ToolInvoked(p) => serde_json::to_value(p),
            Self::ToolCompleted(p) => serde_json::to_value(p),
            Self::ResponseEmitted(p) => serde_json::to_value(p),
            Self::SessionStarted(p) => serde_json::to_value(p),
            Self::SessionEnded(p) => serde_json::to_value(p),
        }
    }

    pub fn from_value(kind: EventKind, value: Value) -> Result<Self, EnvelopeError> {
        let wrap = |source| EnvelopeError::Payload { kind, source };
        Ok(match kind {
            EventKind::PromptSubmitted => Self::PromptSubmitted(serde_json::from_value(value).map_err(wrap)?),
            EventKind::ToolInvoked => Self::ToolInvoked(serde_json::from_value(value).map_err(wrap)?),
            EventKind::ToolCompleted => Self::ToolCompleted(serde_json::from_value(value).map_err(wrap)?),
            EventKind::ResponseEmitted => Self::ResponseEmitted(serde_json::from_value(value).map_err(wrap)?),
            EventKind::SessionStarted => Self::SessionStarted(serde_json::from_value(value).map_err(wrap)?),
            EventKind::SessionEnded => Self::SessionEnded(serde_json::from_value(value).map_err(wrap)?),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Flat wire shape of a queue file
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    event_id: String,
    session_id: String,
    sequence_hint: u64,
    event_kind: EventKind,
    captured_at: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

/// One captured event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct EventEnvelope {
    pub event_id: String,
    pub session_id: String,
    pub sequence_hint: u64,
    pub captured_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl TryFrom<WireEnvelope> for EventEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let payload = EventPayload::from_value(wire.event_kind, wire.payload)?;
        let envelope = Self {
            event_id: wire.event_id,
            session_id: wire.session_id,
            sequence_hint: wire.sequence_hint,
            captured_at: wire.captured_at,
            payload,
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

impl From<EventEnvelope> for WireEnvelope {
    fn from(envelope: EventEnvelope) -> Self {
        Self {
            event_kind: envelope.payload.kind(),
            // Payload structs contain only serializable fields
            payload: envelope.payload.to_value().unwrap_or(Value::Null),
            event_id: envelope.event_id,
            session_id: envelope.session_id,
            sequence_hint: envelope.sequence_hint,
            captured_at: envelope.captured_at,
        }
    }
}

impl EventEnvelope {
    /// Build a fresh envelope with a new UUIDv7 id and a nanosecond sequence hint
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        let now = Utc::now();
        Self {
            event_id: uuid::Uuid::now_v7().to_string(),
            session_id: session_id.into(),
            sequence_hint: next_sequence_hint(),
            captured_at: now,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Parse and validate a queue file's contents
    pub fn from_json(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        // Decode the wire shape first so validation errors keep their own variant
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        Self::try_from(wire)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        validate_id("event_id", &self.event_id)?;
        validate_id("session_id", &self.session_id)?;
        if self.sequence_hint == 0 || self.sequence_hint > i64::MAX as u64 {
            return Err(EnvelopeError::SequenceOutOfRange);
        }
        Ok(())
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<(), EnvelopeError> {
    if value.is_empty() {
        return Err(EnvelopeError::Empty { field });
    }
    if value.len() > MAX_ID_LEN {
        return Err(EnvelopeError::TooLong { field });
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        || value.starts_with('.')
    {
        return Err(EnvelopeError::UnsafeId {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Nanoseconds since the Unix epoch
///
/// Every hook invocation is a separate process, so there is no shared counter;
/// the wall clock at nanosecond resolution is the producer's monotonic source.
pub fn next_sequence_hint() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
        .max(1)
}
