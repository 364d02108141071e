use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Message, Session, SessionKey};

/// Narrow interface the agentic core consumes for session persistence
/// (spec §6.4). The core never touches SQL directly — only this trait —
/// so the concrete store is swappable without touching the prompt
/// assembler, window selector, or compactor.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the session for `key`, creating it if it does not exist yet.
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session>;

    /// Fetch a session by its primary id.
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// List the most-recently-updated sessions for a user, newest first.
    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Session>>;

    /// Append one message, bumping `message_count`/`total_tokens`/
    /// `last_model`/`updated_at` on the owning session.
    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
        tokens: u64,
        model: &str,
    ) -> Result<Message>;

    /// Return up to `limit` most-recent messages, in chronological order.
    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Replace the oldest messages with `summary`, keeping only the last
    /// `keep_last_k` messages plus any message whose id is `>= run_start_id`
    /// (spec §4.2/§4.4 — compaction never evicts the active run).
    async fn compact(
        &self,
        session_id: &str,
        summary: &str,
        keep_last_k: usize,
        run_start_id: i64,
    ) -> Result<()>;

    /// Fetch the raw stored tiered-summary blob, if any.
    async fn get_summary(&self, session_id: &str) -> Result<Option<String>>;

    /// Overwrite the stored tiered-summary blob and its watermark.
    async fn update_summary(&self, session_id: &str, summary: &str) -> Result<()>;

    /// Fetch the current active objective, if any.
    async fn get_active_task(&self, session_id: &str) -> Result<Option<String>>;

    /// Set (or replace) the active objective.
    async fn set_active_task(&self, session_id: &str, task: &str) -> Result<()>;

    /// Clear the active objective.
    async fn clear_active_task(&self, session_id: &str) -> Result<()>;

    /// Fetch the message-count watermark the stored summary was built from.
    async fn get_last_summarized_count(&self, session_id: &str) -> Result<u32>;

    /// Update the message-count watermark after a successful compaction.
    async fn set_last_summarized_count(&self, session_id: &str, count: u32) -> Result<()>;

    /// Whether the pre-compaction memory flush (spec §4.6) is still due
    /// for the session's current compaction cycle.
    async fn should_run_memory_flush(&self, session_id: &str, compaction_count: u32) -> Result<bool>;

    /// Record that the pre-compaction memory flush ran for
    /// `compaction_count`, so it is not repeated within the same cycle.
    async fn record_memory_flush(&self, session_id: &str, compaction_count: u32) -> Result<()>;

    /// Permanently delete a session and its messages.
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// A message to be appended — no `id`/`created_at` yet, those are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: crate::types::Role,
    pub content: String,
    pub tool_calls: Option<Vec<crate::types::ToolCall>>,
    pub tool_results: Option<Vec<crate::types::ToolResultEntry>>,
}
