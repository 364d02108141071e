use rusqlite::{Connection, Result};

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_memory_entries_table(conn)?;
    create_fts_index(conn)?;
    Ok(())
}

fn create_memory_entries_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_entries (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            layer            TEXT NOT NULL,
            namespace        TEXT NOT NULL,
            key              TEXT NOT NULL,
            value            TEXT NOT NULL,
            tags             TEXT NOT NULL DEFAULT '[]',
            user_id          TEXT NOT NULL,
            confidence       REAL NOT NULL DEFAULT 0.6,
            access_count     INTEGER NOT NULL DEFAULT 1,
            accessed_at      TEXT NOT NULL,
            reinforced_count INTEGER NOT NULL DEFAULT 0,
            metadata         TEXT NOT NULL DEFAULT '{}',
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            UNIQUE(namespace, key, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_user_layer
            ON memory_entries(user_id, layer);",
    )
}

/// FTS5 virtual table for full-text search across memory keys and values.
/// content='' makes it an external-content table — we sync manually on write.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_entries_fts
            USING fts5(key, value, content='memory_entries', content_rowid='id');",
    )
}
