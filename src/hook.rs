//! Claude Code hook adapter: one hook JSON object on stdin → one queue file
//!
//! | hook_event_name           | event kind          |
//! |---------------------------|---------------------|
//! | `UserPromptSubmit`        | `prompt_submitted`  |
//! | `PreToolUse`              | `tool_invoked`      |
//! | `PostToolUse`             | `tool_completed`    |
//! | `Stop`, `SubagentStop`    | `response_emitted`  |
//! | `SessionStart`            | `session_started`   |
//! | `SessionEnd`              | `session_ended`     |
//!
//! Runs inside the client's hook invocation, so it does exactly one local
//! write and never talks to the daemon.

use crate::config::CaptureConfig;
use crate::envelope::{
    EventEnvelope, EventPayload, PromptSubmitted, ResponseEmitted, SessionContext, SessionEnded,
    SessionStarted, ToolCompleted, ToolInvoked,
};
use crate::queue::{QueueError, QueueWriter};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Read;
use std::path::PathBuf;

/// Durations above this are treated as bogus and clamped
const MAX_DURATION_MS: u64 = 3_600_000;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to read hook input: {0}")]
    Read(#[from] std::io::Error),

    #[error("hook input is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("hook input has no session_id")]
    MissingSessionId,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Fields Claude Code sends to hooks; everything else lands in `extra`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_response: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What `capture` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Written(PathBuf),
    /// Excluded by `[capture]`
    Filtered,
    /// Hook event this adapter does not record
    Skipped(String),
}

impl HookInput {
    fn context(&self) -> SessionContext {
        SessionContext {
            cwd: self.cwd.clone(),
            transcript_path: self.transcript_path.clone(),
        }
    }

    /// Map to a payload; None for hook events that are not recorded
    pub fn payload(&self) -> Option<EventPayload> {
        let context = self.context();
        let tool_name = || self.tool_name.clone().unwrap_or_else(|| "unknown".to_string());

        let payload = match self.hook_event_name.as_str() {
            "UserPromptSubmit" => EventPayload::PromptSubmitted(PromptSubmitted {
                prompt: self.prompt.clone().unwrap_or_default(),
                context,
            }),
            "PreToolUse" => EventPayload::ToolInvoked(ToolInvoked {
                tool_name: tool_name(),
                tool_use_id: self.tool_use_id.clone(),
                arguments: self.tool_input.clone().unwrap_or(Value::Null),
                context,
            }),
            "PostToolUse" => EventPayload::ToolCompleted(ToolCompleted {
                tool_name: tool_name(),
                tool_use_id: self.tool_use_id.clone(),
                result: self.tool_response.clone().unwrap_or(Value::Null),
                duration_ms: self.duration_ms(),
                success: self.succeeded(),
                context,
            }),
            "Stop" | "SubagentStop" => EventPayload::ResponseEmitted(ResponseEmitted {
                text: self.string_field("last_assistant_message"),
                context,
                ..Default::default()
            }),
            "SessionStart" => EventPayload::SessionStarted(SessionStarted {
                source: self.source.clone(),
                context,
            }),
            "SessionEnd" => EventPayload::SessionEnded(SessionEnded {
                reason: self.reason.clone(),
                context,
            }),
            _ => return None,
        };
        Some(payload)
    }

    /// Tool duration in milliseconds
    ///
    /// `duration_ms` wins; otherwise `execution_time` or `duration` in
    /// seconds. Looked up at the top level first, then in `tool_response`.
    /// Negative or non-numeric values are ignored, huge ones clamped to an
    /// hour.
    pub fn duration_ms(&self) -> Option<u64> {
        let response = self.tool_response.as_ref().and_then(Value::as_object);
        let sources = std::iter::once(&self.extra).chain(response);

        for fields in sources {
            if let Some(ms) = fields.get("duration_ms").and_then(Value::as_f64) {
                return clamp_ms(ms);
            }
            for key in ["execution_time", "duration"] {
                if let Some(secs) = fields.get(key).and_then(Value::as_f64) {
                    return clamp_ms(secs * 1000.0);
                }
            }
        }
        None
    }

    /// A tool call failed if its response says so
    fn succeeded(&self) -> bool {
        let Some(response) = self.tool_response.as_ref().and_then(Value::as_object) else {
            return true;
        };
        let flag = |key: &str| response.get(key).and_then(Value::as_bool);
        match (flag("success"), flag("is_error")) {
            (Some(false), _) | (_, Some(true)) => false,
            _ => true,
        }
    }

    fn string_field(&self, key: &str) -> Option<String> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Build the envelope; `Ok(None)` for unrecorded hook events
    pub fn to_envelope(&self) -> Result<Option<EventEnvelope>, HookError> {
        let session_id = self
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(HookError::MissingSessionId)?;
        Ok(self
            .payload()
            .map(|payload| EventEnvelope::new(session_id, payload)))
    }
}

fn clamp_ms(ms: f64) -> Option<u64> {
    if !ms.is_finite() || ms < 0.0 {
        return None;
    }
    Some((ms.round() as u64).min(MAX_DURATION_MS))
}

/// Read one hook object from `input` and enqueue it
pub fn capture(
    input: impl Read,
    writer: &QueueWriter,
    filter: &CaptureConfig,
) -> Result<CaptureOutcome, HookError> {
    let hook: HookInput = serde_json::from_reader(input)?;

    if !filter.enabled || !filter.allows_hook(&hook.hook_event_name) {
        return Ok(CaptureOutcome::Filtered);
    }
    if let Some(tool) = &hook.tool_name {
        if !filter.allows_tool(tool) {
            return Ok(CaptureOutcome::Filtered);
        }
    }

    match hook.to_envelope()? {
        Some(envelope) => {
            let path = writer.write(&envelope)?;
            tracing::debug!(
                session_id = %envelope.session_id,
                kind = %envelope.kind(),
                "Captured {}",
                hook.hook_event_name
            );
            Ok(CaptureOutcome::Written(path))
        }
        None => Ok(CaptureOutcome::Skipped(hook.hook_event_name)),
    }
}
