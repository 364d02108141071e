use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durability layer a memory entry belongs to.
///
/// `Tacit` holds long-term preferences, style, and artifacts; `Daily` holds
/// date-keyed decisions that are expected to auto-expire; `Entity` holds
/// facts about people, places, and projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Tacit,
    Daily,
    Entity,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Tacit => write!(f, "tacit"),
            Layer::Daily => write!(f, "daily"),
            Layer::Entity => write!(f, "entity"),
        }
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tacit" => Ok(Layer::Tacit),
            "daily" => Ok(Layer::Daily),
            "entity" => Ok(Layer::Entity),
            other => Err(format!("unknown memory layer: {other}")),
        }
    }
}

/// How a memory entry was produced — determines the default confidence
/// applied when an explicit value isn't given by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Explicit,
    Inferred,
}

impl MemorySource {
    pub fn default_confidence(&self, cfg: &agentcore_core::config::MemoryPipelineConfig) -> f64 {
        match self {
            MemorySource::Explicit => cfg.confidence_explicit,
            MemorySource::Inferred => cfg.confidence_inferred,
        }
    }
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySource::Explicit => write!(f, "explicit"),
            MemorySource::Inferred => write!(f, "inferred"),
        }
    }
}

impl FromStr for MemorySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(MemorySource::Explicit),
            "inferred" => Ok(MemorySource::Inferred),
            other => Err(format!("unknown memory source: {other}")),
        }
    }
}

/// A durable memory entry. See spec §3 — `(layer, namespace, key, value,
/// tags, user_id, confidence, access_count, accessed_at, reinforced_count,
/// metadata)`. `(namespace, key, user_id)` is unique within a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub layer: Layer,
    pub namespace: String,
    pub key: String,
    pub value: String,
    pub tags: Vec<String>,
    pub user_id: String,
    pub confidence: f64,
    pub access_count: i64,
    pub accessed_at: DateTime<Utc>,
    pub reinforced_count: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// `access_count × 0.7^(days_since_access / 30)` — spec §4.1.
    pub fn decay_score(&self, now: DateTime<Utc>) -> f64 {
        let days = (now - self.accessed_at).num_seconds().max(0) as f64 / 86_400.0;
        self.access_count as f64 * 0.7f64.powf(days / 30.0)
    }

    /// `confidence × decay_score` — the ranking key used by the prompt
    /// assembler's top-K selection (spec §4.1).
    pub fn rank(&self, now: DateTime<Utc>) -> f64 {
        self.confidence * self.decay_score(now)
    }

    /// Only entries at or above this confidence are eligible for
    /// system-prompt injection (spec §3 — 0.80).
    pub fn is_injection_eligible(&self, min_confidence: f64) -> bool {
        self.confidence >= min_confidence
    }
}

/// A not-yet-persisted memory fact, as produced by the extractor (§4.6) or
/// an explicit user "remember that" instruction.
#[derive(Debug, Clone)]
pub struct MemoryDraft {
    pub layer: Layer,
    pub namespace: String,
    pub key: String,
    pub value: String,
    pub tags: Vec<String>,
    pub user_id: String,
    pub source: MemorySource,
    pub metadata: serde_json::Value,
}

impl MemoryDraft {
    /// Keys are normalized to lower-kebab-case (spec §4.6 "normalize keys").
    pub fn normalized_key(&self) -> String {
        normalize_key(&self.key)
    }
}

/// Normalize a raw extractor-provided key to lower-kebab-case.
pub fn normalize_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// `style` namespace entries always reinforce rather than overwrite (spec
/// §4.6): "Style facts always go through the reinforcement path."
pub const STYLE_NAMESPACE: &str = "style";

/// The ranked set of memories selected for prompt injection — the output
/// of the two-pass selection described in spec §4.1: cap `style`
/// namespace entries at `style_cap`, then fill the remainder up to
/// `total_cap` from other tacit namespaces (highest rank first).
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub entries: Vec<MemoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_lower_kebab() {
        assert_eq!(normalize_key("Favorite Color!!"), "favorite-color");
        assert_eq!(normalize_key("  already-kebab  "), "already-kebab");
        assert_eq!(normalize_key("Snake_Case Value"), "snake-case-value");
    }

    #[test]
    fn decay_score_decreases_with_age() {
        let now = Utc::now();
        let fresh = MemoryEntry {
            id: 1,
            layer: Layer::Tacit,
            namespace: "preference".into(),
            key: "tea".into(),
            value: "green".into(),
            tags: vec![],
            user_id: "u1".into(),
            confidence: 0.9,
            access_count: 5,
            accessed_at: now,
            reinforced_count: 0,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let mut stale = fresh.clone();
        stale.accessed_at = now - chrono::Duration::days(60);

        assert!(fresh.decay_score(now) > stale.decay_score(now));
    }
}
