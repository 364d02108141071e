use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, instrument};

use agentcore_core::config::MemoryPipelineConfig;

use crate::error::{MemoryError, Result};
use crate::store::MemoryStore;
use crate::types::{Layer, MemoryDraft, MemoryEntry, MemorySnapshot, STYLE_NAMESPACE};

/// Overfetch factor / floor applied before ranking, so truncation at
/// `total_cap` never happens before the highest-ranked rows have even
/// been considered (spec §4.1 — "overfetch ≥ 3× and ≥ 30 rows").
const OVERFETCH_FACTOR: usize = 3;
const OVERFETCH_FLOOR: usize = 30;

/// Style namespace entries are capped independently within the top-K
/// selection (spec §4.1 — "cap style/personality at 10").
const STYLE_CAP: usize = 10;

/// SQLite-backed reference implementation of [`MemoryStore`].
///
/// Thread-safe: wraps the connection in a `Mutex`, matching the rest of
/// this workspace's single-node persistence layer. Swappable behind the
/// trait — the agentic core depends only on `MemoryStore`.
pub struct SqliteMemoryStore {
    db: Mutex<Connection>,
    config: MemoryPipelineConfig,
}

impl SqliteMemoryStore {
    pub fn new(conn: Connection, config: MemoryPipelineConfig) -> Self {
        Self {
            db: Mutex::new(conn),
            config,
        }
    }

    fn get_by_address(
        &self,
        db: &Connection,
        layer: Layer,
        namespace: &str,
        key: &str,
        user_id: &str,
    ) -> rusqlite::Result<Option<MemoryEntry>> {
        db.query_row(
            "SELECT id, layer, namespace, key, value, tags, user_id, confidence,
                    access_count, accessed_at, reinforced_count, metadata,
                    created_at, updated_at
             FROM memory_entries
             WHERE layer = ?1 AND namespace = ?2 AND key = ?3 AND user_id = ?4",
            rusqlite::params![layer.to_string(), namespace, key, user_id],
            row_to_entry,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    }

    fn sync_fts(&self, db: &Connection, id: i64, key: &str, value: &str, delete_old: bool) -> rusqlite::Result<()> {
        if delete_old {
            db.execute(
                "INSERT INTO memory_entries_fts(memory_entries_fts, rowid, key, value)
                 VALUES('delete', ?1, ?2, ?3)",
                rusqlite::params![id, key, value],
            )?;
        }
        db.execute(
            "INSERT INTO memory_entries_fts(rowid, key, value) VALUES(?1, ?2, ?3)",
            rusqlite::params![id, key, value],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    #[instrument(skip(self, draft), fields(layer = %draft.layer, namespace = %draft.namespace))]
    async fn learn(&self, draft: MemoryDraft) -> Result<MemoryEntry> {
        let db = self.db.lock().unwrap();
        let now = Utc::now();
        let key = draft.normalized_key();
        let is_style = draft.namespace == STYLE_NAMESPACE;

        let existing = self.get_by_address(&db, draft.layer, &draft.namespace, &key, &draft.user_id)?;

        if let Some(existing) = existing {
            // Style facts, and any exact-value duplicate, always reinforce
            // rather than overwrite (spec §4.6).
            if is_style || existing.value == draft.value {
                drop(db);
                return self
                    .reinforce(draft.layer, &draft.namespace, &key, &draft.user_id)
                    .await;
            }

            // Different value at the same address: overwrite with the new
            // value but keep accumulated access/reinforcement history.
            let confidence = draft.source.default_confidence(&self.config);
            let tags_json = serde_json::to_string(&draft.tags).map_err(|e| MemoryError::Serialization(e.to_string()))?;
            let meta_json = draft.metadata.to_string();
            db.execute(
                "UPDATE memory_entries
                 SET value = ?1, tags = ?2, confidence = ?3, metadata = ?4, updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![draft.value, tags_json, confidence, meta_json, now.to_rfc3339(), existing.id],
            )?;
            self.sync_fts(&db, existing.id, &key, &draft.value, true)?;
            debug!(namespace = %draft.namespace, key, "memory entry updated");
            return self
                .get_by_address(&db, draft.layer, &draft.namespace, &key, &draft.user_id)?
                .ok_or_else(|| MemoryError::NotFound {
                    layer: draft.layer.to_string(),
                    namespace: draft.namespace.clone(),
                    key,
                });
        }

        let confidence = draft.source.default_confidence(&self.config);
        let tags_json = serde_json::to_string(&draft.tags).map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let meta_json = draft.metadata.to_string();
        db.execute(
            "INSERT INTO memory_entries
             (layer, namespace, key, value, tags, user_id, confidence, access_count,
              accessed_at, reinforced_count, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, 0, ?9, ?8, ?8)",
            rusqlite::params![
                draft.layer.to_string(),
                draft.namespace,
                key,
                draft.value,
                tags_json,
                draft.user_id,
                confidence,
                now.to_rfc3339(),
                meta_json,
            ],
        )?;
        let id = db.last_insert_rowid();
        self.sync_fts(&db, id, &key, &draft.value, false)?;
        debug!(namespace = %draft.namespace, key, "memory entry created");

        self.get_by_address(&db, draft.layer, &draft.namespace, &key, &draft.user_id)?
            .ok_or_else(|| MemoryError::NotFound {
                layer: draft.layer.to_string(),
                namespace: draft.namespace.clone(),
                key,
            })
    }

    #[instrument(skip(self), fields(layer = %layer, namespace, key))]
    async fn reinforce(
        &self,
        layer: Layer,
        namespace: &str,
        key: &str,
        user_id: &str,
    ) -> Result<MemoryEntry> {
        let db = self.db.lock().unwrap();
        let now = Utc::now();
        let existing = self
            .get_by_address(&db, layer, namespace, key, user_id)?
            .ok_or_else(|| MemoryError::NotFound {
                layer: layer.to_string(),
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?;

        let new_confidence = (existing.confidence + self.config.reinforcement_step).min(1.0);
        db.execute(
            "UPDATE memory_entries
             SET access_count = access_count + 1,
                 accessed_at = ?1,
                 reinforced_count = reinforced_count + 1,
                 confidence = ?2,
                 updated_at = ?1
             WHERE id = ?3",
            rusqlite::params![now.to_rfc3339(), new_confidence, existing.id],
        )?;

        self.get_by_address(&db, layer, namespace, key, user_id)?
            .ok_or_else(|| MemoryError::NotFound {
                layer: layer.to_string(),
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    #[instrument(skip(self), fields(layer = %layer, namespace, key))]
    async fn forget(&self, layer: Layer, namespace: &str, key: &str, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let existing = self
            .get_by_address(&db, layer, namespace, key, user_id)?
            .ok_or_else(|| MemoryError::NotFound {
                layer: layer.to_string(),
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?;

        db.execute(
            "INSERT INTO memory_entries_fts(memory_entries_fts, rowid, key, value)
             VALUES('delete', ?1, ?2, ?3)",
            rusqlite::params![existing.id, existing.key, existing.value],
        )?;
        db.execute("DELETE FROM memory_entries WHERE id = ?1", rusqlite::params![existing.id])?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id, limit))]
    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT m.id, m.layer, m.namespace, m.key, m.value, m.tags, m.user_id, m.confidence,
                    m.access_count, m.accessed_at, m.reinforced_count, m.metadata,
                    m.created_at, m.updated_at
             FROM memory_entries m
             JOIN memory_entries_fts f ON m.id = f.rowid
             WHERE m.user_id = ?1 AND memory_entries_fts MATCH ?2
             ORDER BY rank
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, query, limit as i64], row_to_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self), fields(user_id, total_cap))]
    async fn ranked_snapshot(&self, user_id: &str, total_cap: usize) -> Result<MemorySnapshot> {
        let overfetch = (total_cap * OVERFETCH_FACTOR).max(OVERFETCH_FLOOR);
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, layer, namespace, key, value, tags, user_id, confidence,
                    access_count, accessed_at, reinforced_count, metadata,
                    created_at, updated_at
             FROM memory_entries
             WHERE user_id = ?1
             ORDER BY confidence DESC
             LIMIT ?2",
        )?;
        let rows: Vec<MemoryEntry> = stmt
            .query_map(rusqlite::params![user_id, overfetch as i64], row_to_entry)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(db);

        let now = Utc::now();
        let mut ranked = rows;
        ranked.sort_by(|a, b| b.rank(now).partial_cmp(&a.rank(now)).unwrap_or(std::cmp::Ordering::Equal));

        // Two-pass selection: style entries capped at STYLE_CAP, then fill
        // the remainder up to total_cap from everything else (spec §4.1).
        let mut style: Vec<MemoryEntry> = Vec::new();
        let mut other: Vec<MemoryEntry> = Vec::new();
        for entry in ranked {
            if entry.namespace == STYLE_NAMESPACE {
                if style.len() < STYLE_CAP {
                    style.push(entry);
                }
            } else {
                other.push(entry);
            }
        }

        let remaining = total_cap.saturating_sub(style.len());
        other.truncate(remaining);

        let mut entries = style;
        entries.extend(other);
        Ok(MemorySnapshot { entries })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let layer_str: String = row.get(1)?;
    let tags_str: String = row.get(5)?;
    let accessed_at_str: String = row.get(9)?;
    let metadata_str: String = row.get(11)?;
    let created_at_str: String = row.get(12)?;
    let updated_at_str: String = row.get(13)?;

    Ok(MemoryEntry {
        id: row.get(0)?,
        layer: layer_str.parse().unwrap_or(Layer::Tacit),
        namespace: row.get(2)?,
        key: row.get(3)?,
        value: row.get(4)?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        user_id: row.get(6)?,
        confidence: row.get(7)?,
        access_count: row.get(8)?,
        accessed_at: accessed_at_str
            .parse()
            .unwrap_or_else(|_| Utc::now()),
        reinforced_count: row.get(10)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        created_at: created_at_str.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at_str.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemorySource;

    fn store() -> SqliteMemoryStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        SqliteMemoryStore::new(conn, MemoryPipelineConfig::default())
    }

    fn draft(namespace: &str, key: &str, value: &str, source: MemorySource) -> MemoryDraft {
        MemoryDraft {
            layer: Layer::Tacit,
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            tags: vec![],
            user_id: "u1".to_string(),
            source,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn learn_inserts_with_default_confidence() {
        let store = store();
        let entry = store
            .learn(draft("preference", "tea", "green", MemorySource::Inferred))
            .await
            .unwrap();
        assert_eq!(entry.confidence, 0.6);
        assert_eq!(entry.reinforced_count, 0);
    }

    #[tokio::test]
    async fn learning_identical_value_twice_reinforces() {
        let store = store();
        store
            .learn(draft("preference", "tea", "green", MemorySource::Inferred))
            .await
            .unwrap();
        let second = store
            .learn(draft("preference", "tea", "green", MemorySource::Inferred))
            .await
            .unwrap();

        assert!(second.reinforced_count >= 1);
        assert!(second.confidence > 0.6);
        assert!(second.confidence <= 1.0);
    }

    #[tokio::test]
    async fn style_namespace_always_reinforces_even_on_new_value() {
        let store = store();
        store
            .learn(draft(STYLE_NAMESPACE, "tone", "terse", MemorySource::Inferred))
            .await
            .unwrap();
        let second = store
            .learn(draft(STYLE_NAMESPACE, "tone", "verbose", MemorySource::Inferred))
            .await
            .unwrap();

        // Reinforcement never rewrites the value — it only boosts confidence.
        assert_eq!(second.value, "terse");
        assert_eq!(second.reinforced_count, 1);
    }

    #[tokio::test]
    async fn ranked_snapshot_caps_style_entries() {
        let store = store();
        for i in 0..15 {
            store
                .learn(draft(STYLE_NAMESPACE, &format!("style-{i}"), "v", MemorySource::Explicit))
                .await
                .unwrap();
        }
        let snapshot = store.ranked_snapshot("u1", 50).await.unwrap();
        let style_count = snapshot.entries.iter().filter(|e| e.namespace == STYLE_NAMESPACE).count();
        assert_eq!(style_count, STYLE_CAP);
    }

    #[tokio::test]
    async fn forget_removes_entry() {
        let store = store();
        store
            .learn(draft("preference", "tea", "green", MemorySource::Inferred))
            .await
            .unwrap();
        store.forget(Layer::Tacit, "preference", "tea", "u1").await.unwrap();
        let err = store.forget(Layer::Tacit, "preference", "tea", "u1").await;
        assert!(err.is_err());
    }
}
