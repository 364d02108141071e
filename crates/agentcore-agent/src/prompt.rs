use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use agentcore_memory::{Layer, MemoryEntry, MemorySnapshot};

use crate::provider::ToolDefinition;

/// Per-file size cap (characters).
const MAX_FILE_CHARS: usize = 20_000;
/// Total cap for all workspace files combined (characters).
const MAX_TOTAL_CHARS: usize = 100_000;

/// Fallback identity files, in load order (spec §4.1 — "file-based memory
/// (AGENTS.md / MEMORY.md / SOUL.md)"), tried only when the database
/// context load fails.
const KNOWN_FILES: &[&str] = &["AGENTS.md", "MEMORY.md", "SOUL.md"];

// ---------------------------------------------------------------------------
// WorkspaceLoader — reads multiple .md files from a workspace directory
// ---------------------------------------------------------------------------

/// Loads and assembles workspace .md files into a single prompt string,
/// used as the second link in the prompt assembler's fail chain: DB
/// context → this loader → [`default_identity`] (spec §4.1).
pub struct WorkspaceLoader;

impl WorkspaceLoader {
    /// Load all workspace files from `dir` and return the assembled prompt
    /// string. Returns `None` if the directory doesn't exist or none of
    /// the known files are present.
    pub fn load(dir: &Path) -> Option<String> {
        if !dir.is_dir() {
            return None;
        }

        let mut sections: Vec<(String, String)> = Vec::new();
        let mut total_chars: usize = 0;

        for &name in KNOWN_FILES {
            let path = dir.join(name);
            if let Some(content) = read_and_truncate(&path) {
                total_chars += content.len();
                sections.push((name.to_string(), content));
            }
        }

        if sections.is_empty() {
            return None;
        }

        while total_chars > MAX_TOTAL_CHARS && sections.len() > 1 {
            let (_, removed) = sections.pop().expect("sections non-empty");
            total_chars -= removed.len();
        }

        let mut out = String::with_capacity(total_chars + sections.len() * 30);
        out.push_str("# Workspace identity\n\n");
        out.push_str("The database context load failed; falling back to workspace files.");

        for (name, content) in &sections {
            out.push_str("\n\n---\n\n## ");
            out.push_str(name);
            out.push_str("\n\n");
            out.push_str(content);
        }

        info!(
            files = sections.len(),
            chars = out.len(),
            "loaded workspace identity files from {}",
            dir.display()
        );

        Some(out)
    }
}

/// Read a file and truncate to `MAX_FILE_CHARS` using a 70/20 head/tail split.
fn read_and_truncate(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to read workspace file");
        })
        .ok()?;

    if content.is_empty() {
        return None;
    }

    Some(truncate_content(&content, MAX_FILE_CHARS))
}

/// Truncate content to `max_chars` using 70% head / 20% tail / 10% marker.
pub(crate) fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }

    let head_chars = max_chars * 70 / 100;
    let tail_chars = max_chars * 20 / 100;
    let marker = "\n\n[... content truncated ...]\n\n";

    let head_end = content[..head_chars]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(head_chars);
    let tail_start = if content.len() > tail_chars {
        content[(content.len() - tail_chars)..]
            .find('\n')
            .map(|i| content.len() - tail_chars + i + 1)
            .unwrap_or(content.len() - tail_chars)
    } else {
        0
    };

    let mut out = String::with_capacity(head_end + marker.len() + (content.len() - tail_start));
    out.push_str(&content[..head_end]);
    out.push_str(marker);
    out.push_str(&content[tail_start..]);
    out
}

/// The crate's built-in minimal default identity, used when both the
/// database and the workspace-file fallback fail (spec §4.1 — last link
/// in the chain).
pub fn default_identity() -> String {
    "You are a helpful personal assistant. Be concise and direct. \
     Ask for clarification rather than guessing when unsure."
        .to_string()
}

// ---------------------------------------------------------------------------
// PromptAssembler
// ---------------------------------------------------------------------------

/// Everything [`PromptAssembler::build_static`] needs, already gathered by
/// the caller — the assembler itself performs no I/O (spec §4.1 — "pure
/// w.r.t. the database snapshot it was given").
pub struct StaticPromptInput<'a> {
    pub identity: &'a str,
    pub memories: &'a MemorySnapshot,
    pub injection_min_confidence: f64,
    pub user_profile: Option<&'a str>,
    pub agent_rules: Option<&'a str>,
    pub tool_notes: Option<&'a str>,
    pub tools: &'a [ToolDefinition],
    pub skill_hints: Option<&'a str>,
    pub active_skill_content: Option<&'a str>,
    pub app_catalog: Option<&'a str>,
    pub model_switch_aliases: Option<&'a [String]>,
}

/// Produces the two prompt strings the runner sends to a provider each
/// iteration (spec §4.1): a static prompt, stable across iterations to
/// maximize provider-side prefix caching, and a small dynamic suffix.
pub struct PromptAssembler;

impl PromptAssembler {
    /// Build the static prompt: identity, memories, tool names, rules,
    /// and optional skill/app/model-switch sections, closing with a
    /// reminder re-listing the exact tool names.
    pub fn build_static(input: &StaticPromptInput<'_>) -> String {
        let mut out = String::new();
        out.push_str(input.identity.trim());

        let eligible: Vec<&MemoryEntry> = input
            .memories
            .entries
            .iter()
            .filter(|e| e.is_injection_eligible(input.injection_min_confidence))
            .collect();
        if !eligible.is_empty() {
            out.push_str("\n\n## What you know about this user\n");
            for entry in &eligible {
                out.push_str(&format!(
                    "- [{}/{}] {}\n",
                    layer_label(entry.layer),
                    entry.namespace,
                    entry.value
                ));
            }
        }

        if let Some(profile) = input.user_profile {
            if !profile.is_empty() {
                out.push_str("\n\n## User profile\n");
                out.push_str(profile);
            }
        }

        if let Some(rules) = input.agent_rules {
            if !rules.is_empty() {
                out.push_str("\n\n## Rules\n");
                out.push_str(rules);
            }
        }

        if let Some(notes) = input.tool_notes {
            if !notes.is_empty() {
                out.push_str("\n\n## Tool notes\n");
                out.push_str(notes);
            }
        }

        let tool_names: Vec<&str> = input.tools.iter().map(|t| t.name.as_str()).collect();
        if !tool_names.is_empty() {
            out.push_str("\n\n## Available tools\n");
            out.push_str(&tool_names.join(", "));
        }

        if let Some(hints) = input.skill_hints {
            if !hints.is_empty() {
                out.push_str("\n\n## Skills\n");
                out.push_str(hints);
            }
        }

        if let Some(skill) = input.active_skill_content {
            if !skill.is_empty() {
                out.push_str("\n\n## Active skill\n");
                out.push_str(skill);
            }
        }

        if let Some(catalog) = input.app_catalog {
            if !catalog.is_empty() {
                out.push_str("\n\n## Connected apps\n");
                out.push_str(catalog);
            }
        }

        if let Some(aliases) = input.model_switch_aliases {
            if !aliases.is_empty() {
                out.push_str("\n\n## Model switching\n");
                out.push_str("You can be switched to a different model via: ");
                out.push_str(&aliases.join(", "));
            }
        }

        if !tool_names.is_empty() {
            out.push_str("\n\n## Reminder\n");
            out.push_str("Your available tools are exactly: ");
            out.push_str(&tool_names.join(", "));
            out.push('.');
        }

        out
    }

    /// Build the per-iteration dynamic suffix: date/time with timezone,
    /// `provider_id/model_name`, active task if any, tiered summary if any.
    pub fn build_dynamic(
        now: DateTime<Utc>,
        tz_label: &str,
        provider_id: &str,
        model_name: &str,
        active_task: Option<&str>,
        summary: Option<&str>,
    ) -> String {
        let mut out = format!(
            "Current date/time: {} ({})\nModel: {}/{}",
            now.to_rfc3339(),
            tz_label,
            provider_id,
            model_name
        );

        if let Some(task) = active_task {
            if !task.is_empty() {
                out.push_str("\n\nActive task: ");
                out.push_str(task);
            }
        }

        if let Some(summary) = summary {
            if !summary.is_empty() {
                out.push_str("\n\nConversation summary so far:\n");
                out.push_str(summary);
            }
        }

        out
    }
}

fn layer_label(layer: Layer) -> &'static str {
    match layer {
        Layer::Tacit => "tacit",
        Layer::Daily => "daily",
        Layer::Entity => "entity",
    }
}

/// Volatile session metadata made available to adapters for display —
/// kept distinct from the dynamic suffix text itself.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_key: String,
    pub turn_count: u32,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_workspace(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, content) in files {
            fs::write(dir.path().join(name), content).expect("write");
        }
        dir
    }

    #[test]
    fn workspace_loads_known_files_in_order() {
        let dir = make_workspace(&[
            ("AGENTS.md", "agents content"),
            ("MEMORY.md", "memory content"),
            ("SOUL.md", "soul content"),
        ]);

        let result = WorkspaceLoader::load(dir.path()).expect("should load");
        let agents_pos = result.find("## AGENTS.md").unwrap();
        let memory_pos = result.find("## MEMORY.md").unwrap();
        let soul_pos = result.find("## SOUL.md").unwrap();
        assert!(agents_pos < memory_pos);
        assert!(memory_pos < soul_pos);
    }

    #[test]
    fn workspace_returns_none_when_no_known_files() {
        let dir = make_workspace(&[("RANDOM.md", "irrelevant")]);
        assert!(WorkspaceLoader::load(dir.path()).is_none());
    }

    #[test]
    fn truncate_preserves_small_files() {
        let content = "Hello, world!\nSecond line.";
        let result = truncate_content(content, MAX_FILE_CHARS);
        assert_eq!(result, content);
    }

    #[test]
    fn truncate_applies_marker_on_large_files() {
        let content = (0..2000).map(|i| format!("Line {i}\n")).collect::<String>();
        let result = truncate_content(&content, 200);
        assert!(result.contains("[... content truncated ...]"));
        assert!(result.len() < content.len());
    }

    fn sample_memory(namespace: &str, value: &str, confidence: f64) -> MemoryEntry {
        let now = Utc::now();
        MemoryEntry {
            id: 1,
            layer: Layer::Tacit,
            namespace: namespace.to_string(),
            key: "k".to_string(),
            value: value.to_string(),
            tags: vec![],
            user_id: "u1".to_string(),
            confidence,
            access_count: 1,
            accessed_at: now,
            reinforced_count: 0,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn static_prompt_includes_eligible_memories_and_excludes_low_confidence() {
        let memories = MemorySnapshot {
            entries: vec![
                sample_memory("preference", "likes dark mode", 0.9),
                sample_memory("preference", "might like tea", 0.5),
            ],
        };
        let tools = vec![ToolDefinition {
            name: "file".into(),
            description: "read/write files".into(),
            input_schema: serde_json::json!({}),
        }];
        let input = StaticPromptInput {
            identity: "You are an assistant.",
            memories: &memories,
            injection_min_confidence: 0.80,
            user_profile: None,
            agent_rules: None,
            tool_notes: None,
            tools: &tools,
            skill_hints: None,
            active_skill_content: None,
            app_catalog: None,
            model_switch_aliases: None,
        };

        let prompt = PromptAssembler::build_static(&input);
        assert!(prompt.contains("likes dark mode"));
        assert!(!prompt.contains("might like tea"));
        assert!(prompt.contains("file"));
        assert!(prompt.contains("Your available tools are exactly: file."));
    }

    #[test]
    fn dynamic_suffix_includes_task_and_summary() {
        let now = Utc::now();
        let dynamic = PromptAssembler::build_dynamic(
            now,
            "UTC",
            "anthropic",
            "claude-opus",
            Some("Build a todo app"),
            Some("Earlier we discussed X"),
        );
        assert!(dynamic.contains("anthropic/claude-opus"));
        assert!(dynamic.contains("Build a todo app"));
        assert!(dynamic.contains("Earlier we discussed X"));
    }
}
