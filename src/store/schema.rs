//! Database schema and migrations
//!
//! Version is tracked in `metadata.schema_version`. Each migration runs in
//! one transaction together with its version bump, so a crash leaves the
//! database at the previous version and the step simply runs again.

use rusqlite::{params, Connection};

/// (version, DDL) in ascending order; append new steps, never edit old ones
const MIGRATIONS: &[(i32, &str)] = &[(1, SCHEMA_V1)];

/// Latest version this build knows how to create
const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r#"
        -- One row per producer session; never deleted here
        CREATE TABLE IF NOT EXISTS conversations (
            session_id TEXT PRIMARY KEY,
            user_session_id TEXT,            -- assigned by the UI layer, never by the correlator
            title TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            cwd TEXT,
            transcript_path TEXT,
            prompt_count INTEGER NOT NULL DEFAULT 0,
            total_characters INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_user_session ON conversations(user_session_id);
        CREATE INDEX IF NOT EXISTS idx_conversations_started ON conversations(started_at);

        -- One row per prompt; keyed by the prompt's sequence within the session
        CREATE TABLE IF NOT EXISTS exchanges (
            session_id TEXT NOT NULL,
            prompt_sequence INTEGER NOT NULL,
            prompt_event_id TEXT NOT NULL,
            prompt_text TEXT NOT NULL,
            opened_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            close_reason TEXT,
            PRIMARY KEY (session_id, prompt_sequence)
        );

        -- Every applied envelope. The primary key is the idempotency guard.
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            sequence_hint INTEGER NOT NULL,
            event_kind TEXT NOT NULL,
            exchange_sequence INTEGER,      -- NULL before the first prompt
            tool_name TEXT,
            tool_key TEXT,
            duration_ms INTEGER,
            payload_json TEXT NOT NULL,
            gap TEXT,                       -- set when applied without its predecessor
            captured_at TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_session_seq ON events(session_id, sequence_hint);
        CREATE INDEX IF NOT EXISTS idx_events_exchange ON events(session_id, exchange_sequence);

        -- Envelopes waiting for a predecessor; deleted in the transaction
        -- that finally applies them
        CREATE TABLE IF NOT EXISTS pending (
            event_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            sequence_hint INTEGER NOT NULL,
            envelope_json TEXT NOT NULL,
            stashed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_session ON pending(session_id, sequence_hint);
"#;

/// Apply connection pragmas and bring the schema up to date
pub(super) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA cache_size=-16000;  -- 16MB cache
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        "#,
    )?;

    let found = current_version(conn)?;
    if found > SCHEMA_VERSION {
        tracing::warn!(
            "Store schema version {} is newer than this build ({}); continuing without migrating",
            found,
            SCHEMA_VERSION
        );
        return Ok(());
    }
    migrate(conn, MIGRATIONS)
}

fn current_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row(
        "SELECT COALESCE(
            (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
            0
        )",
        [],
        |row| row.get(0),
    )
}

fn migrate(conn: &Connection, steps: &[(i32, &str)]) -> rusqlite::Result<()> {
    let current = current_version(conn)?;
    for (version, ddl) in steps.iter().filter(|(v, _)| *v > current) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(ddl)?;
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
            params![version.to_string()],
        )?;
        tx.commit()?;
        tracing::debug!("Store schema at version {}", version);
    }
    Ok(())
}
