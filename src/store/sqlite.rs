//! SQLite implementation of the persistence adapter
//!
//! ```text
//! worker threads ──→ SqliteStore (r2d2 pool, N connections)
//!                        │
//!                        └──→ SQLite (WAL: concurrent readers, one writer)
//! ```
//!
//! Writers take `BEGIN IMMEDIATE` so lock contention shows up at the start of
//! the transaction, bounded by `busy_timeout`. A busy/locked database or an
//! exhausted pool is reported as transient.

use super::model::*;
use super::{schema, ApplyOutcome, PersistenceAdapter, StoreError};
use crate::envelope::{EventEnvelope, EventKind, EventPayload};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound on waiting for a lock or a pooled connection
    pub busy_timeout: Duration,
    /// Pooled connections (roughly one per worker)
    pub pool_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            pool_size: 4,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Fatal(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Transient(format!("connection pool: {e}"))
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Sequence hints are validated to fit in i64
fn seq(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database and run migrations
    pub fn open(path: &Path, options: StoreOptions) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys=OFF;")
        });

        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .connection_timeout(busy_timeout.max(Duration::from_millis(100)))
            .build(manager)?;

        {
            let conn = pool.get()?;
            schema::init(&conn)?;
        }

        tracing::debug!("Store opened at {}", path.display());
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn event_views(
        conn: &rusqlite::Connection,
        session_id: &str,
        exchange: Option<u64>,
    ) -> Result<Vec<EventView>, StoreError> {
        let sql = match exchange {
            Some(_) => {
                "SELECT event_id, sequence_hint, event_kind, gap, captured_at, payload_json
                 FROM events WHERE session_id = ?1 AND exchange_sequence = ?2
                 ORDER BY sequence_hint, event_id"
            }
            None => {
                "SELECT event_id, sequence_hint, event_kind, gap, captured_at, payload_json
                 FROM events WHERE session_id = ?1 AND exchange_sequence IS NULL AND ?2 IS NULL
                 ORDER BY sequence_hint, event_id"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![session_id, exchange.map(seq)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut views = Vec::new();
        for row in rows {
            let (event_id, sequence_hint, kind, gap, captured_at, payload) = row?;
            let Ok(event_kind) = kind.parse::<EventKind>() else {
                tracing::warn!(event_id = %event_id, "Skipping event with unknown kind '{}'", kind);
                continue;
            };
            views.push(EventView {
                event_id,
                sequence_hint: sequence_hint as u64,
                event_kind,
                gap: gap.as_deref().and_then(GapKind::parse),
                captured_at: parse_ts(&captured_at),
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(views)
    }
}

impl PersistenceAdapter for SqliteStore {
    fn is_applied(&self, event_id: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE event_id = ?1)",
            [event_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn apply(&self, m: &Mutation) -> Result<ApplyOutcome, StoreError> {
        let env = &m.envelope;
        let payload_json = serde_json::to_string(&env.payload.to_value()?)?;
        let now = ts(&Utc::now());
        let captured_at = ts(&env.captured_at);
        let duration_ms = match &env.payload {
            EventPayload::ToolCompleted(p) => p.duration_ms.map(seq),
            _ => None,
        };

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO events
                (event_id, session_id, sequence_hint, event_kind, exchange_sequence,
                 tool_name, tool_key, duration_ms, payload_json, gap, captured_at, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                env.event_id,
                env.session_id,
                seq(env.sequence_hint),
                env.kind().as_str(),
                m.exchange.map(seq),
                env.payload.tool_name(),
                env.payload.tool_key(),
                duration_ms,
                payload_json,
                m.gap.map(|g| g.as_str()),
                captured_at,
                now,
            ],
        )?;

        if inserted == 0 {
            // Already applied: the only thing left to do is drop a stale stash row
            if m.from_pending {
                tx.execute("DELETE FROM pending WHERE event_id = ?1", [&env.event_id])?;
                tx.commit()?;
            }
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let ctx = env.payload.context();
        tx.execute(
            "INSERT OR IGNORE INTO conversations
                (session_id, cwd, transcript_path, status, started_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            params![env.session_id, ctx.cwd, ctx.transcript_path, captured_at, now],
        )?;

        let (prompt_inc, chars_inc) = match &env.payload {
            EventPayload::PromptSubmitted(p) => (1i64, p.prompt.chars().count() as i64),
            _ => (0, 0),
        };
        tx.execute(
            "UPDATE conversations SET
                cwd = COALESCE(cwd, ?2),
                transcript_path = COALESCE(transcript_path, ?3),
                status = ?4,
                ended_at = ?5,
                title = COALESCE(?6, title),
                prompt_count = prompt_count + ?7,
                total_characters = total_characters + ?8,
                started_at = MIN(started_at, ?9),
                updated_at = ?10
             WHERE session_id = ?1",
            params![
                env.session_id,
                ctx.cwd,
                ctx.transcript_path,
                m.conversation.status.as_str(),
                m.conversation.ended_at.as_ref().map(ts),
                m.conversation.title,
                prompt_inc,
                chars_inc,
                captured_at,
                now,
            ],
        )?;

        if let EventPayload::PromptSubmitted(p) = &env.payload {
            tx.execute(
                "INSERT OR IGNORE INTO exchanges
                    (session_id, prompt_sequence, prompt_event_id, prompt_text, opened_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'open')",
                params![
                    env.session_id,
                    seq(env.sequence_hint),
                    env.event_id,
                    p.prompt,
                    captured_at
                ],
            )?;
        }

        if let Some(r) = m.reassign {
            let moved = tx.execute(
                "UPDATE events SET exchange_sequence = ?1
                 WHERE session_id = ?2 AND sequence_hint > ?3 AND sequence_hint < ?4",
                params![
                    seq(r.exchange),
                    env.session_id,
                    seq(r.after),
                    r.before.map(seq).unwrap_or(i64::MAX)
                ],
            )?;
            if moved > 0 {
                tracing::debug!(
                    session_id = %env.session_id,
                    "Late prompt {} took over {} event(s)",
                    r.exchange,
                    moved
                );
            }
        }

        for change in &m.exchange_status {
            tx.execute(
                "UPDATE exchanges SET status = ?1, close_reason = ?2
                 WHERE session_id = ?3 AND prompt_sequence = ?4",
                params![
                    change.status.as_str(),
                    change.status.close_reason().map(|r| r.as_str()),
                    env.session_id,
                    seq(change.prompt_sequence)
                ],
            )?;
        }

        if m.from_pending {
            tx.execute("DELETE FROM pending WHERE event_id = ?1", [&env.event_id])?;
        }

        tx.commit()?;
        Ok(ApplyOutcome::Applied)
    }

    fn stash_pending(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        let json = serde_json::to_string(envelope)?;
        let now = ts(&Utc::now());
        let captured_at = ts(&envelope.captured_at);
        let ctx = envelope.payload.context();

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO pending (event_id, session_id, sequence_hint, envelope_json, stashed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                envelope.event_id,
                envelope.session_id,
                seq(envelope.sequence_hint),
                json,
                now
            ],
        )?;
        // A held envelope still counts as the session's first sighting
        tx.execute(
            "INSERT OR IGNORE INTO conversations
                (session_id, cwd, transcript_path, status, started_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            params![
                envelope.session_id,
                ctx.cwd,
                ctx.transcript_path,
                captured_at,
                now
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET
                cwd = COALESCE(cwd, ?2),
                transcript_path = COALESCE(transcript_path, ?3),
                started_at = MIN(started_at, ?4)
             WHERE session_id = ?1",
            params![envelope.session_id, ctx.cwd, ctx.transcript_path, captured_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT sequence_hint, event_kind, tool_key, captured_at
             FROM events WHERE session_id = ?1 ORDER BY sequence_hint",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (sequence_hint, kind, tool_key, captured_at) = row?;
            if let Ok(kind) = kind.parse() {
                events.push(AppliedEvent {
                    sequence_hint: sequence_hint as u64,
                    kind,
                    tool_key,
                    captured_at: parse_ts(&captured_at),
                });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT event_id, envelope_json, stashed_at
             FROM pending WHERE session_id = ?1 ORDER BY sequence_hint",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut pending = Vec::new();
        for row in rows {
            let (event_id, json, stashed_at) = row?;
            match EventEnvelope::from_json(json.as_bytes()) {
                Ok(envelope) => pending.push(PendingEnvelope {
                    envelope,
                    stashed_at: parse_ts(&stashed_at),
                }),
                Err(e) => tracing::warn!(event_id = %event_id, "Ignoring unreadable pending envelope: {}", e),
            }
        }

        Ok(SessionSnapshot { events, pending })
    }

    fn pending_sessions(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT session_id FROM pending ORDER BY session_id")?;
        let sessions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.pool.get()?;
        let count = |sql: &str| -> Result<u64, StoreError> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };

        Ok(StoreStats {
            conversations: count("SELECT COUNT(*) FROM conversations")?,
            active_conversations: count(
                "SELECT COUNT(*) FROM conversations WHERE status = 'active'",
            )?,
            exchanges: count("SELECT COUNT(*) FROM exchanges")?,
            open_exchanges: count("SELECT COUNT(*) FROM exchanges WHERE status = 'open'")?,
            events: count("SELECT COUNT(*) FROM events")?,
            pending: count("SELECT COUNT(*) FROM pending")?,
            gaps: count("SELECT COUNT(*) FROM events WHERE gap IS NOT NULL")?,
            db_size_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        })
    }

    fn conversation(&self, session_id: &str) -> Result<Option<ConversationView>, StoreError> {
        let conn = self.pool.get()?;

        let header = conn
            .query_row(
                "SELECT user_session_id, title, status, cwd, transcript_path,
                        prompt_count, total_characters, started_at, ended_at
                 FROM conversations WHERE session_id = ?1",
                [session_id],
                |row| {
                    Ok(ConversationView {
                        session_id: session_id.to_string(),
                        user_session_id: row.get(0)?,
                        title: row.get(1)?,
                        status: row.get(2)?,
                        cwd: row.get(3)?,
                        transcript_path: row.get(4)?,
                        prompt_count: row.get::<_, i64>(5)? as u64,
                        total_characters: row.get::<_, i64>(6)? as u64,
                        started_at: row.get(7)?,
                        ended_at: row.get(8)?,
                        exchanges: Vec::new(),
                        unassigned: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut view) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT prompt_sequence, prompt_text, status, close_reason
             FROM exchanges WHERE session_id = ?1 ORDER BY prompt_sequence",
        )?;
        let exchanges = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (prompt_sequence, prompt, status, close_reason) in exchanges {
            let events = Self::event_views(&conn, session_id, Some(prompt_sequence))?;
            let tool_calls = events
                .iter()
                .filter(|e| e.event_kind == EventKind::ToolInvoked)
                .count() as u64;
            let total_tool_ms = events
                .iter()
                .filter(|e| e.event_kind == EventKind::ToolCompleted)
                .filter_map(|e| e.payload.get("duration_ms").and_then(|v| v.as_u64()))
                .sum();
            view.exchanges.push(ExchangeView {
                prompt_sequence,
                prompt,
                status,
                close_reason,
                tool_calls,
                total_tool_ms,
                events,
            });
        }
        view.unassigned = Self::event_views(&conn, session_id, None)?;

        Ok(Some(view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{PromptSubmitted, SessionContext, ToolInvoked};
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db"), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn prompt(session: &str, seq: u64, text: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: format!("{session}-{seq}"),
            session_id: session.to_string(),
            sequence_hint: seq,
            captured_at: Utc::now(),
            payload: EventPayload::PromptSubmitted(PromptSubmitted {
                prompt: text.to_string(),
                context: SessionContext {
                    cwd: Some("/repo".to_string()),
                    transcript_path: Some("/t.jsonl".to_string()),
                },
            }),
        }
    }

    fn open_mutation(envelope: EventEnvelope) -> Mutation {
        let seq = envelope.sequence_hint;
        Mutation {
            exchange: Some(seq),
            gap: None,
            from_pending: false,
            conversation: ConversationChange {
                status: ConversationStatus::Active,
                ended_at: None,
                title: Some("first".to_string()),
            },
            reassign: None,
            exchange_status: vec![ExchangeStatusChange {
                prompt_sequence: seq,
                status: ExchangeStatus::Open,
            }],
            envelope,
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (_dir, store) = open_temp();
        let m = open_mutation(prompt("s1", 1, "hello"));

        assert!(!store.is_applied("s1-1").unwrap());
        assert_eq!(store.apply(&m).unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.apply(&m).unwrap(), ApplyOutcome::AlreadyApplied);
        assert!(store.is_applied("s1-1").unwrap());

        let stats = store.stats().unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.exchanges, 1);
        assert_eq!(stats.conversations, 1);

        let view = store.conversation("s1").unwrap().unwrap();
        assert_eq!(view.prompt_count, 1);
        assert_eq!(view.total_characters, 5);
        assert_eq!(view.cwd.as_deref(), Some("/repo"));
        assert_eq!(view.user_session_id, None);
    }

    #[test]
    fn test_reassign_moves_events_to_late_prompt() {
        let (_dir, store) = open_temp();
        store.apply(&open_mutation(prompt("s1", 10, "first"))).unwrap();

        let tool = EventEnvelope {
            event_id: "tool-30".to_string(),
            session_id: "s1".to_string(),
            sequence_hint: 30,
            captured_at: Utc::now(),
            payload: EventPayload::ToolInvoked(ToolInvoked {
                tool_name: "Bash".to_string(),
                tool_use_id: None,
                arguments: json!({"command": "ls"}),
                context: SessionContext::default(),
            }),
        };
        store
            .apply(&Mutation {
                exchange: Some(10),
                exchange_status: vec![],
                ..open_mutation(tool)
            })
            .unwrap();

        let mut late = open_mutation(prompt("s1", 20, "second"));
        late.reassign = Some(Reassign {
            exchange: 20,
            after: 20,
            before: None,
        });
        late.conversation.title = None;
        store.apply(&late).unwrap();

        let view = store.conversation("s1").unwrap().unwrap();
        assert_eq!(view.exchanges.len(), 2);
        assert_eq!(view.exchanges[0].events.len(), 1);
        let second: Vec<u64> = view.exchanges[1].events.iter().map(|e| e.sequence_hint).collect();
        assert_eq!(second, vec![20, 30]);
        assert_eq!(view.exchanges[1].tool_calls, 1);
        assert_eq!(view.title.as_deref(), Some("first"));
    }

    #[test]
    fn test_pending_stash_roundtrip() {
        let (_dir, store) = open_temp();
        let env = prompt("s2", 5, "held");
        store.stash_pending(&env).unwrap();
        store.stash_pending(&env).unwrap();

        assert_eq!(store.pending_sessions().unwrap(), vec!["s2".to_string()]);
        let snapshot = store.load_session("s2").unwrap();
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].envelope, env);

        let mut m = open_mutation(env);
        m.from_pending = true;
        store.apply(&m).unwrap();
        assert!(store.pending_sessions().unwrap().is_empty());
        assert_eq!(store.load_session("s2").unwrap().events.len(), 1);
    }

    #[test]
    fn test_stash_seeds_conversation() {
        let (_dir, store) = open_temp();
        store.stash_pending(&prompt("s3", 7, "held")).unwrap();

        let view = store.conversation("s3").unwrap().unwrap();
        assert_eq!(view.status, "active");
        assert_eq!(view.cwd.as_deref(), Some("/repo"));
        assert_eq!(view.prompt_count, 0);
        assert!(view.exchanges.is_empty());

        // Applying later keeps a single row and fills in the aggregates
        let mut m = open_mutation(prompt("s3", 7, "held"));
        m.from_pending = true;
        store.apply(&m).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(store.conversation("s3").unwrap().unwrap().prompt_count, 1);
    }

    #[test]
    fn test_missing_conversation_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.conversation("nope").unwrap().is_none());
    }

    #[test]
    fn test_busy_error_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::from(err).is_transient());

        let err = rusqlite::Error::InvalidQuery;
        assert!(!StoreError::from(err).is_transient());
    }
}
