use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Structured, user-centric session key.
///
/// Sessions belong to users, not channels — so the same user across
/// different surfaces shares the same session: `user:{user_id}:agent:{agent_id}:{name}`.
///
/// The `name` component identifies which conversation slot is active,
/// e.g. `"main"` for the default or `"work"` for a named session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// The stable user identifier.
    pub user_id: String,
    /// The agent that owns this session (e.g. `"main"`).
    pub agent_id: String,
    /// The conversation slot name chosen by the user (e.g. `"main"`, `"work"`).
    pub name: String,
}

impl SessionKey {
    /// Construct a new key from its three parts.
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            name: name.into(),
        }
    }

    /// Return the canonical wire-format string.
    ///
    /// Format: `user:{user_id}:agent:{agent_id}:{name}`
    pub fn format(&self) -> String {
        format!("user:{}:agent:{}:{}", self.user_id, self.agent_id, self.name)
    }

    /// Parse a wire-format key string back into a `SessionKey`.
    ///
    /// Expects exactly: `user:<id>:agent:<id>:<name>`
    /// where `<name>` may itself contain colons.
    pub fn parse(s: &str) -> Result<Self> {
        // Strip leading "user:" prefix
        let rest = s.strip_prefix("user:").ok_or_else(|| {
            SessionError::InvalidKey(format!("missing 'user:' prefix: {s}"))
        })?;

        // Find ":agent:" separator — the user_id ends at that point
        let agent_marker = ":agent:";
        let agent_pos = rest.find(agent_marker).ok_or_else(|| {
            SessionError::InvalidKey(format!("missing ':agent:' segment: {s}"))
        })?;

        let user_id = &rest[..agent_pos];
        // Skip past ":agent:"
        let after_agent = &rest[agent_pos + agent_marker.len()..];

        // The first colon separates agent_id from name; name may contain colons
        let colon_pos = after_agent.find(':').ok_or_else(|| {
            SessionError::InvalidKey(format!("missing session name segment: {s}"))
        })?;

        let agent_id = &after_agent[..colon_pos];
        let name = &after_agent[colon_pos + 1..];

        if user_id.is_empty() || agent_id.is_empty() || name.is_empty() {
            return Err(SessionError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }

        Ok(Self {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// A persisted conversation session (spec §3 — "Session").
///
/// Sessions are lazy-created on first message and track aggregate stats
/// so callers can show token usage without scanning the full log, plus
/// the bookkeeping compaction needs: the tiered summary, the watermark of
/// how many messages it covers, the active objective, and a guard counter
/// for the pre-compaction memory flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUIDv7 primary key — time-sortable.
    pub id: String,
    /// The structured key that identifies this session.
    pub key: SessionKey,
    /// Optional user-provided title (e.g. "Weekend trip planning").
    pub title: Option<String>,
    /// The rolling tiered summary blob, rendered form (spec §3 — "Summary").
    /// `None` until the first compaction.
    pub summary: Option<String>,
    /// The message count the current summary was last built from.
    pub last_summarized_count: u32,
    /// How many compaction cycles have triggered a pre-compaction memory
    /// flush — compared against the compaction count to ensure the flush
    /// runs at most once per cycle (spec §4.6).
    pub memory_flush_compaction_count: u32,
    /// The current working objective, if any (spec §3 — "ActiveTask").
    pub active_task: Option<String>,
    /// Total number of messages exchanged in this session.
    pub message_count: u32,
    /// Cumulative token usage across all messages.
    pub total_tokens: u64,
    /// The model used for the most recent message (may change over time).
    pub last_model: Option<String>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    /// RFC3339 timestamp of the last update.
    pub updated_at: String,
}

/// Message role (spec §3 — "Message").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(SessionError::InvalidRole(other.to_string())),
        }
    }
}

/// A tool-call emitted by an assistant message, awaiting a matching
/// tool-result (spec §3 invariant: every tool-call id must be answered by
/// exactly one tool-result on a later tool message within the same run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// The outcome of executing one tool-call, carried on a tool-role message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// An ordered conversation message (spec §3 — "Message").
///
/// `tool_calls` is only ever `Some` on an assistant message; `tool_results`
/// only ever `Some` on a tool message — `None`, not an empty vec, marks
/// "this concept doesn't apply to this message". Tool-call input JSON is
/// validated on ingress and the call dropped if invalid, so a session can
/// never be poisoned with unparseable tool input (spec §3 edge case).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Option<Vec<ToolResultEntry>>,
    pub created_at: String,
}

/// Literal markers delimiting the three tiers of a rolling summary
/// (spec §3 — "Summary (tiered)").
pub const MARKER_EARLIER: &str = "[Earlier context]";
pub const MARKER_RECENT: &str = "[Recent context]";
pub const MARKER_SEPARATOR: &str = "\n\n---\n\n";

/// Hard cap on the rendered tiered summary blob, in characters.
pub const SUMMARY_MAX_CHARS: usize = 6000;

/// The three named regions of a rolling summary, ordered earlier / recent
/// / current. `render`/`parse` round-trip through the literal marker
/// format in spec §3, so a blob written by an older, marker-less build is
/// still readable as a legacy "current"-only summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub earlier: String,
    pub recent: String,
    pub current: String,
}

impl Summary {
    /// Parse a stored summary blob. A blob with no markers at all is
    /// legacy — spec §3: "Legacy summaries with no markers are treated as
    /// `current` and promoted on next compaction."
    pub fn parse(raw: &str) -> Self {
        if !raw.contains(MARKER_EARLIER) && !raw.contains(MARKER_RECENT) {
            return Summary {
                earlier: String::new(),
                recent: String::new(),
                current: raw.trim().to_string(),
            };
        }

        let mut earlier = String::new();
        let mut recent = String::new();
        let mut current = String::new();

        if let Some(after_earlier) = raw.split(MARKER_EARLIER).nth(1) {
            if let Some((e, rest)) = after_earlier.split_once(MARKER_RECENT) {
                earlier = e.trim().to_string();
                if let Some((r, c)) = rest.split_once(MARKER_SEPARATOR) {
                    recent = r.trim().to_string();
                    current = c.trim().to_string();
                } else {
                    recent = rest.trim().to_string();
                }
            }
        } else if let Some(after_recent) = raw.split(MARKER_RECENT).nth(1) {
            if let Some((r, c)) = after_recent.split_once(MARKER_SEPARATOR) {
                recent = r.trim().to_string();
                current = c.trim().to_string();
            } else {
                recent = after_recent.trim().to_string();
            }
        }

        Summary { earlier, recent, current }
    }

    /// Render back to the literal marker format, enforcing the hard cap
    /// by dropping the oldest prefix up to the next newline and prefixing
    /// `"..."` (spec §3).
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.earlier.is_empty() {
            out.push_str(MARKER_EARLIER);
            out.push('\n');
            out.push_str(&self.earlier);
            out.push('\n');
        }
        if !self.recent.is_empty() {
            out.push_str(MARKER_RECENT);
            out.push('\n');
            out.push_str(&self.recent);
        }
        if !self.current.is_empty() {
            if !out.is_empty() {
                out.push_str(MARKER_SEPARATOR);
            }
            out.push_str(&self.current);
        }

        if out.len() > SUMMARY_MAX_CHARS {
            let mut excess = out.len() - SUMMARY_MAX_CHARS;
            while !out.is_char_boundary(excess) {
                excess += 1;
            }
            let cut_at = out[excess..]
                .find('\n')
                .map(|i| excess + i + 1)
                .unwrap_or(excess);
            out = format!("...{}", &out[cut_at..]);
        }

        out
    }
}

/// Compress `text` to at most `max_chars`, used when building the next
/// tier from the previous compaction's tiers (spec §3 compaction rule).
/// Cuts on a word boundary and appends an ellipsis rather than a bare
/// hard cut mid-word.
pub fn compress_tier(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    let cut_at = truncated.rfind(' ').unwrap_or(truncated.len());
    format!("{}…", &truncated[..cut_at])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_key() {
        let key = SessionKey::new("u-123", "main", "main");
        let s = key.format();
        assert_eq!(s, "user:u-123:agent:main:main");
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed, key);
    }

    #[test]
    fn roundtrip_name_with_colons() {
        let key = SessionKey::new("u-999", "main", "trip:paris:2026");
        let s = key.format();
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed.name, "trip:paris:2026");
    }

    #[test]
    fn parse_missing_agent_returns_err() {
        assert!(SessionKey::parse("user:u-1:main:main").is_err());
    }

    #[test]
    fn parse_missing_user_prefix_returns_err() {
        assert!(SessionKey::parse("agent:main:main").is_err());
    }

    #[test]
    fn legacy_summary_without_markers_becomes_current() {
        let summary = Summary::parse("just a plain old summary with no markers");
        assert_eq!(summary.current, "just a plain old summary with no markers");
        assert!(summary.earlier.is_empty());
        assert!(summary.recent.is_empty());
    }

    #[test]
    fn tiered_summary_roundtrips() {
        let summary = Summary {
            earlier: "long ago we discussed X".to_string(),
            recent: "then we discussed Y".to_string(),
            current: "now we are discussing Z".to_string(),
        };
        let rendered = summary.render();
        assert!(rendered.contains(MARKER_EARLIER));
        assert!(rendered.contains(MARKER_RECENT));
        assert!(rendered.contains(MARKER_SEPARATOR));

        let parsed = Summary::parse(&rendered);
        assert_eq!(parsed, summary);
    }

    #[test]
    fn render_enforces_hard_cap() {
        let summary = Summary {
            earlier: "e".repeat(3000),
            recent: "r".repeat(3000),
            current: "c".repeat(3000),
        };
        let rendered = summary.render();
        assert!(rendered.len() <= SUMMARY_MAX_CHARS + 3);
        assert!(rendered.starts_with("..."));
    }

    #[test]
    fn render_hard_cap_does_not_split_a_multibyte_char() {
        let summary = Summary {
            earlier: "é".repeat(3000),
            recent: "日".repeat(3000),
            current: "字".repeat(3000),
        };
        let rendered = summary.render();
        assert!(rendered.starts_with("..."));
    }

    #[test]
    fn compress_tier_truncates_with_ellipsis() {
        let long = "word ".repeat(1000);
        let compressed = compress_tier(&long, 50);
        assert!(compressed.chars().count() <= 51);
        assert!(compressed.ends_with('…'));
    }

    #[test]
    fn role_roundtrips_through_str() {
        for role in [Role::User, Role::Assistant, Role::Tool] {
            let s = role.to_string();
            let parsed: Role = s.parse().expect("role parse failed");
            assert_eq!(parsed, role);
        }
    }
}
