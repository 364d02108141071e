use rusqlite::Connection;

use crate::error::Result;

/// Initialise the sessions and messages tables and their indices.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                              TEXT PRIMARY KEY,
            session_key                     TEXT NOT NULL UNIQUE,
            user_id                         TEXT NOT NULL,
            agent_id                        TEXT NOT NULL,
            name                            TEXT NOT NULL,
            title                           TEXT,
            summary                         TEXT,
            last_summarized_count           INTEGER NOT NULL DEFAULT 0,
            memory_flush_compaction_count   INTEGER NOT NULL DEFAULT 0,
            active_task                     TEXT,
            message_count                   INTEGER NOT NULL DEFAULT 0,
            total_tokens                    INTEGER NOT NULL DEFAULT 0,
            last_model                      TEXT,
            created_at                      TEXT NOT NULL,
            updated_at                      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role          TEXT NOT NULL,
            content       TEXT NOT NULL,
            tool_calls    TEXT,
            tool_results  TEXT,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, id);",
    )?;
    Ok(())
}
