use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::store::{NewMessage, SessionStore};
use crate::types::{Message, Role, Session, SessionKey, ToolCall, ToolResultEntry};

/// Thread-safe manager for persisted user sessions.
///
/// Wraps a single SQLite connection in a `Mutex`. For high-concurrency
/// deployments consider a connection pool (e.g. r2d2), but a Mutex is
/// sufficient for the single-node target. Implements [`SessionStore`]
/// directly — the async methods wrap the same synchronous SQLite calls
/// the sync helper methods below use, mirroring the rest of this
/// workspace's persistence layer rather than introducing `spawn_blocking`
/// indirection.
pub struct SessionManager {
    db: Mutex<Connection>,
}

impl SessionManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Return an existing session or create a new one (upsert pattern).
    ///
    /// Creating a session is cheap — no LLM call is made. The session is
    /// persisted so stats survive restarts.
    #[instrument(skip(self), fields(key = %key))]
    pub fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        if let Some(session) = self.get_by_key(key)? {
            debug!("session cache hit");
            return Ok(session);
        }

        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let key_str = key.format();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO sessions
             (id, session_key, user_id, agent_id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![id, key_str, key.user_id, key.agent_id, key.name, now],
        )?;

        db.query_row(
            "SELECT id, session_key, user_id, agent_id, name, title, summary,
                    last_summarized_count, memory_flush_compaction_count, active_task,
                    message_count, total_tokens, last_model, created_at, updated_at
             FROM sessions WHERE session_key = ?1",
            rusqlite::params![key_str],
            row_to_session,
        )
        .map_err(SessionError::Database)
    }

    /// Retrieve a session by key, returning `None` if it does not exist.
    #[instrument(skip(self), fields(key = %key))]
    pub fn get_by_key(&self, key: &SessionKey) -> Result<Option<Session>> {
        let key_str = key.format();
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, session_key, user_id, agent_id, name, title, summary,
                    last_summarized_count, memory_flush_compaction_count, active_task,
                    message_count, total_tokens, last_model, created_at, updated_at
             FROM sessions WHERE session_key = ?1",
            rusqlite::params![key_str],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    fn get_by_id_sync(&self, session_id: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, session_key, user_id, agent_id, name, title, summary,
                    last_summarized_count, memory_flush_compaction_count, active_task,
                    message_count, total_tokens, last_model, created_at, updated_at
             FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// List the most-recently-updated sessions for a user, newest first.
    #[instrument(skip(self), fields(user_id, limit))]
    pub fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_key, user_id, agent_id, name, title, summary,
                    last_summarized_count, memory_flush_compaction_count, active_task,
                    message_count, total_tokens, last_model, created_at, updated_at
             FROM sessions
             WHERE user_id = ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, limit as i64], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Append one message and bump the owning session's aggregate stats.
    #[instrument(skip(self, message), fields(session_id, tokens, model))]
    pub fn append_message_sync(
        &self,
        session_id: &str,
        message: NewMessage,
        tokens: u64,
        model: &str,
    ) -> Result<Message> {
        let now = chrono::Utc::now().to_rfc3339();
        let tool_calls_json = match &message.tool_calls {
            Some(calls) => Some(
                serde_json::to_string(calls)
                    .map_err(|e| SessionError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let tool_results_json = match &message.tool_results {
            Some(results) => Some(
                serde_json::to_string(results)
                    .map_err(|e| SessionError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (session_id, role, content, tool_calls, tool_results, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                session_id,
                message.role.to_string(),
                message.content,
                tool_calls_json,
                tool_results_json,
                now
            ],
        )?;
        let id = db.last_insert_rowid();

        let rows_changed = db.execute(
            "UPDATE sessions
             SET message_count = message_count + 1,
                 total_tokens  = total_tokens  + ?1,
                 last_model    = ?2,
                 updated_at    = ?3
             WHERE id = ?4",
            rusqlite::params![tokens as i64, model, now, session_id],
        )?;
        if rows_changed == 0 {
            return Err(SessionError::NotFound {
                key: session_id.to_string(),
            });
        }

        Ok(Message {
            id,
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            tool_results: message.tool_results,
            created_at: now,
        })
    }

    /// Return up to `limit` most-recent messages, in chronological order.
    #[instrument(skip(self), fields(session_id, limit))]
    pub fn get_messages_sync(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_id, role, content, tool_calls, tool_results, created_at
             FROM (
                 SELECT * FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit as i64], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Replace the oldest messages with `summary`, keeping only messages
    /// with id `>= run_start_id` or among the last `keep_last_k` (spec
    /// §4.2/§4.4 — compaction never evicts the active run).
    #[instrument(skip(self, summary), fields(session_id, keep_last_k, run_start_id))]
    pub fn compact_sync(
        &self,
        session_id: &str,
        summary: &str,
        keep_last_k: usize,
        run_start_id: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut keep_ids: Vec<i64> = {
            let mut stmt = db.prepare(
                "SELECT id FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![session_id, keep_last_k as i64], |r| {
                r.get::<_, i64>(0)
            })?;
            rows.filter_map(|r| r.ok()).collect()
        };
        {
            let mut stmt = db.prepare(
                "SELECT id FROM messages WHERE session_id = ?1 AND id >= ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![session_id, run_start_id], |r| {
                r.get::<_, i64>(0)
            })?;
            for r in rows.filter_map(|r| r.ok()) {
                if !keep_ids.contains(&r) {
                    keep_ids.push(r);
                }
            }
        }

        if keep_ids.is_empty() {
            db.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                rusqlite::params![session_id],
            )?;
        } else {
            let placeholders = keep_ids
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "DELETE FROM messages WHERE session_id = ? AND id NOT IN ({placeholders})"
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&session_id];
            for id in &keep_ids {
                params.push(id);
            }
            db.execute(&sql, params.as_slice())?;
        }

        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "UPDATE sessions SET summary = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![summary, now, session_id],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(session_id))]
    pub fn get_summary_sync(&self, session_id: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT summary FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )
        .map_err(SessionError::Database)
    }

    #[instrument(skip(self, summary), fields(session_id))]
    pub fn update_summary_sync(&self, session_id: &str, summary: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let changed = db.execute(
            "UPDATE sessions SET summary = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![summary, now, session_id],
        )?;
        if changed == 0 {
            return Err(SessionError::NotFound {
                key: session_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get_active_task_sync(&self, session_id: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT active_task FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )
        .map_err(SessionError::Database)
    }

    pub fn set_active_task_sync(&self, session_id: &str, task: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET active_task = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![task, chrono::Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }

    pub fn clear_active_task_sync(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET active_task = NULL, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![chrono::Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }

    pub fn get_last_summarized_count_sync(&self, session_id: &str) -> Result<u32> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT last_summarized_count FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn set_last_summarized_count_sync(&self, session_id: &str, count: u32) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET last_summarized_count = ?1 WHERE id = ?2",
            rusqlite::params![count, session_id],
        )?;
        Ok(())
    }

    /// Whether the pre-compaction memory flush is still due for
    /// `compaction_count` (spec §4.6 — once per compaction cycle).
    pub fn should_run_memory_flush_sync(
        &self,
        session_id: &str,
        compaction_count: u32,
    ) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let recorded: i64 = db.query_row(
            "SELECT memory_flush_compaction_count FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )?;
        Ok((recorded as u32) < compaction_count)
    }

    pub fn record_memory_flush_sync(&self, session_id: &str, compaction_count: u32) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET memory_flush_compaction_count = ?1 WHERE id = ?2",
            rusqlite::params![compaction_count, session_id],
        )?;
        Ok(())
    }

    /// Permanently delete a session record and its messages (cascade).
    #[instrument(skip(self), fields(session_id))]
    pub fn delete_sync(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "DELETE FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
        )?;
        if rows_changed == 0 {
            return Err(SessionError::NotFound {
                key: session_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SessionManager {
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        SessionManager::get_or_create(self, key)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        self.get_by_id_sync(session_id)
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Session>> {
        SessionManager::list_for_user(self, user_id, limit)
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
        tokens: u64,
        model: &str,
    ) -> Result<Message> {
        self.append_message_sync(session_id, message, tokens, model)
    }

    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.get_messages_sync(session_id, limit)
    }

    async fn compact(
        &self,
        session_id: &str,
        summary: &str,
        keep_last_k: usize,
        run_start_id: i64,
    ) -> Result<()> {
        self.compact_sync(session_id, summary, keep_last_k, run_start_id)
    }

    async fn get_summary(&self, session_id: &str) -> Result<Option<String>> {
        self.get_summary_sync(session_id)
    }

    async fn update_summary(&self, session_id: &str, summary: &str) -> Result<()> {
        self.update_summary_sync(session_id, summary)
    }

    async fn get_active_task(&self, session_id: &str) -> Result<Option<String>> {
        self.get_active_task_sync(session_id)
    }

    async fn set_active_task(&self, session_id: &str, task: &str) -> Result<()> {
        self.set_active_task_sync(session_id, task)
    }

    async fn clear_active_task(&self, session_id: &str) -> Result<()> {
        self.clear_active_task_sync(session_id)
    }

    async fn get_last_summarized_count(&self, session_id: &str) -> Result<u32> {
        self.get_last_summarized_count_sync(session_id)
    }

    async fn set_last_summarized_count(&self, session_id: &str, count: u32) -> Result<()> {
        self.set_last_summarized_count_sync(session_id, count)
    }

    async fn should_run_memory_flush(&self, session_id: &str, compaction_count: u32) -> Result<bool> {
        self.should_run_memory_flush_sync(session_id, compaction_count)
    }

    async fn record_memory_flush(&self, session_id: &str, compaction_count: u32) -> Result<()> {
        self.record_memory_flush_sync(session_id, compaction_count)
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.delete_sync(session_id)
    }
}

/// Map a SQLite row to a `Session`.
fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let key_str: String = row.get(1)?;
    let key = SessionKey::parse(&key_str).unwrap_or_else(|_| SessionKey {
        user_id: row.get::<_, String>(2).unwrap_or_default(),
        agent_id: row.get::<_, String>(3).unwrap_or_default(),
        name: row.get::<_, String>(4).unwrap_or_default(),
    });

    Ok(Session {
        id: row.get(0)?,
        key,
        title: row.get(5)?,
        summary: row.get(6)?,
        last_summarized_count: row.get::<_, i64>(7)? as u32,
        memory_flush_compaction_count: row.get::<_, i64>(8)? as u32,
        active_task: row.get(9)?,
        message_count: row.get::<_, i64>(10)? as u32,
        total_tokens: row.get::<_, i64>(11)? as u64,
        last_model: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

/// Map a SQLite row to a `Message`, deserializing the optional tool-call /
/// tool-result JSON columns.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let role: Role = role_str.parse().unwrap_or(Role::User);

    let tool_calls_json: Option<String> = row.get(4)?;
    let tool_calls: Option<Vec<ToolCall>> = tool_calls_json
        .and_then(|s| serde_json::from_str(&s).ok());

    let tool_results_json: Option<String> = row.get(5)?;
    let tool_results: Option<Vec<ToolResultEntry>> = tool_results_json
        .and_then(|s| serde_json::from_str(&s).ok());

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role,
        content: row.get(3)?,
        tool_calls,
        tool_results,
        created_at: row.get(6)?,
    })
}
