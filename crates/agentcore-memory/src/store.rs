use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Layer, MemoryDraft, MemoryEntry, MemorySnapshot};

/// Narrow interface the agentic core consumes for durable memory.
///
/// The core never talks SQL directly — it only ever sees this trait, so
/// the concrete store (SQLite here, anything else in a different
/// deployment) is swappable without touching the prompt assembler,
/// compactor, or memory pipeline.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store a fact, or reinforce an existing one with the same
    /// `(layer, namespace, key, user_id)` address (spec §4.6 store policy).
    async fn learn(&self, draft: MemoryDraft) -> Result<MemoryEntry>;

    /// Bump `reinforced_count` and raise `confidence` by the configured
    /// step (capped at 1.0) for an existing entry.
    async fn reinforce(
        &self,
        layer: Layer,
        namespace: &str,
        key: &str,
        user_id: &str,
    ) -> Result<MemoryEntry>;

    /// Delete a specific memory entry.
    async fn forget(&self, layer: Layer, namespace: &str, key: &str, user_id: &str) -> Result<()>;

    /// Full-text search across a user's memories.
    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryEntry>>;

    /// Ranked snapshot for prompt injection: overfetches, ranks by
    /// `confidence × decay`, and applies the two-pass style cap (spec §4.1).
    async fn ranked_snapshot(&self, user_id: &str, total_cap: usize) -> Result<MemorySnapshot>;
}
