// Queue directory layout and file naming
//
// File names encode enough to sort and filter without opening the file:
//   {sequence_hint:020}-{session_id}-{event_kind}-{event_id}.json
// The sequence hint is zero-padded so a plain lexicographic listing is also
// numeric order.

use super::{QueueError, QueueState};
use crate::envelope::{EventEnvelope, EventKind};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Suffix of the error-detail file stored next to a dead-lettered file
pub(crate) const ERROR_SUFFIX: &str = ".error.json";

/// Queue file name for an envelope
pub fn file_name_for(envelope: &EventEnvelope) -> String {
    format!(
        "{:020}-{}-{}-{}.json",
        envelope.sequence_hint,
        envelope.session_id,
        envelope.kind(),
        envelope.event_id
    )
}

/// Fields recovered from a queue file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub sequence_hint: u64,
    pub session_id: String,
    pub event_kind: EventKind,
    pub event_id: String,
}

impl ParsedName {
    /// Parse a queue file name
    ///
    /// Session and event ids may themselves contain `-`, so the kind is
    /// located by searching for a known `-{kind}-` marker rather than by
    /// splitting.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let (seq, rest) = stem.split_once('-')?;
        let sequence_hint = seq.parse().ok()?;

        // Earliest marker wins when an event id happens to contain a kind name
        let (idx, kind, marker_len) = EventKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let marker = format!("-{}-", kind.as_str());
                rest.find(&marker).map(|idx| (idx, kind, marker.len()))
            })
            .min_by_key(|(idx, _, _)| *idx)?;

        let session_id = &rest[..idx];
        let event_id = &rest[idx + marker_len..];
        if session_id.is_empty() || event_id.is_empty() {
            return None;
        }
        Some(Self {
            sequence_hint,
            session_id: session_id.to_string(),
            event_kind: kind,
            event_id: event_id.to_string(),
        })
    }
}

/// True for names the pipeline should pick up (ignores error details and
/// editor/tempfile droppings)
pub(crate) fn is_queue_file(name: &str) -> bool {
    name.ends_with(".json") && !name.ends_with(ERROR_SUFFIX) && !name.starts_with('.')
}

/// Count of files per queue directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub incoming: usize,
    pub processing: usize,
    pub failed: usize,
    pub archive: usize,
}

/// Paths of one queue tree
#[derive(Debug, Clone)]
pub struct QueueLayout {
    root: PathBuf,
}

impl QueueLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    /// Producer staging directory
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn path(&self, state: QueueState, name: &str) -> PathBuf {
        self.dir(state).join(name)
    }

    /// Create all queue directories (idempotent)
    pub fn ensure(&self) -> Result<(), QueueError> {
        let dirs = QueueState::ALL
            .into_iter()
            .map(|s| self.dir(s))
            .chain(std::iter::once(self.tmp_dir()));
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| QueueError::Prepare { path: dir, source })?;
        }
        Ok(())
    }

    /// Queue file names in a directory, sorted (= sequence order)
    pub fn list(&self, state: QueueState) -> Result<Vec<String>, QueueError> {
        let dir = self.dir(state);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(QueueError::Read { path: dir, source }),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_queue_file(name))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Queue files with their modification times
    pub(crate) fn list_with_mtime(
        &self,
        state: QueueState,
    ) -> Result<Vec<(String, SystemTime)>, QueueError> {
        let mut out = Vec::new();
        for name in self.list(state)? {
            // A file can move between listing and stat; skip it
            if let Ok(modified) = fs::metadata(self.path(state, &name)).and_then(|m| m.modified()) {
                out.push((name, modified));
            }
        }
        Ok(out)
    }

    pub fn depths(&self) -> Result<QueueDepths, QueueError> {
        Ok(QueueDepths {
            incoming: self.list(QueueState::Incoming)?.len(),
            processing: self.list(QueueState::Processing)?.len(),
            failed: self.list(QueueState::Failed)?.len(),
            archive: self.list(QueueState::Archive)?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventPayload, SessionEnded};

    #[test]
    fn test_file_name_roundtrip_with_dashes() {
        let mut env = EventEnvelope::new(
            "sess-with-dashes",
            EventPayload::SessionEnded(SessionEnded::default()),
        );
        env.sequence_hint = 42;
        let name = file_name_for(&env);

        assert!(name.starts_with("00000000000000000042-sess-with-dashes-session_ended-"));
        let parsed = ParsedName::parse(&name).unwrap();
        assert_eq!(parsed.sequence_hint, 42);
        assert_eq!(parsed.session_id, "sess-with-dashes");
        assert_eq!(parsed.event_kind, EventKind::SessionEnded);
        assert_eq!(parsed.event_id, env.event_id);
    }

    #[test]
    fn test_padding_sorts_numerically() {
        let a = format!("{:020}-s-prompt_submitted-a.json", 9u64);
        let b = format!("{:020}-s-prompt_submitted-b.json", 10u64);
        assert!(a < b);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParsedName::parse("notes.txt").is_none());
        assert!(ParsedName::parse("abc-s-prompt_submitted-e.json").is_none());
        assert!(ParsedName::parse("1-s-unknown_kind-e.json").is_none());
    }

    #[test]
    fn test_list_skips_error_details() {
        let dir = tempfile::tempdir().unwrap();
        let layout = QueueLayout::new(dir.path());
        layout.ensure().unwrap();

        let failed = layout.dir(QueueState::Failed);
        fs::write(failed.join("1-s-session_ended-e.json"), "{}").unwrap();
        fs::write(failed.join("1-s-session_ended-e.json.error.json"), "{}").unwrap();
        fs::write(failed.join(".hidden.json"), "{}").unwrap();

        assert_eq!(
            layout.list(QueueState::Failed).unwrap(),
            vec!["1-s-session_ended-e.json".to_string()]
        );
        assert_eq!(layout.depths().unwrap().failed, 1);
    }
}
