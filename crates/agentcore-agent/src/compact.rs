use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use agentcore_sessions::types::{Message, Summary};

use crate::provider::{ChatRequest, Provider};
use crate::stream::StreamEvent;
use crate::window::estimate_session_tokens;

/// Bound on the structured-summary LLM call (spec §4.4 — 30s).
pub const SUMMARY_TIMEOUT_SECS: u64 = 30;

/// Progressive compaction keep sizes tried in order until one produces a
/// window at or below the threshold (spec §4.4).
pub const PROGRESSIVE_KEEP: [usize; 3] = [10, 3, 1];

const SECTION_NAMES: [&str; 7] = [
    "Current Task",
    "Progress",
    "Key Decisions",
    "Errors & Blockers",
    "Next Steps",
    "Important Context",
    "Agent-Generated Content",
];

fn summary_prompt(transcript: &str) -> String {
    format!(
        "Summarize this conversation so it can continue with full context. \
         Respond with exactly these sections, each as a markdown heading \
         followed by its content (omit a section's body if there's nothing \
         to report, but keep the heading):\n\n{}\n\n---\n\n{}",
        SECTION_NAMES
            .iter()
            .map(|s| format!("## {s}"))
            .collect::<Vec<_>>()
            .join("\n"),
        transcript
    )
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the "Current Task" section out of a structured summary, if
/// present and non-empty (spec §4.4 step 3).
pub fn parse_current_task(summary_text: &str) -> Option<String> {
    let marker = "## Current Task";
    let start = summary_text.find(marker)? + marker.len();
    let rest = &summary_text[start..];
    let end = rest.find("\n## ").unwrap_or(rest.len());
    let body = rest[..end].trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Naive fallback summary used when the structured-summary call fails or
/// times out (spec §4.4 step 2 — "truncated user messages + tool
/// failures").
pub fn naive_fallback_summary(messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for message in messages {
        match message.role {
            agentcore_sessions::types::Role::User => {
                let truncated: String = message.content.chars().take(200).collect();
                lines.push(format!("User said: {truncated}"));
            }
            agentcore_sessions::types::Role::Tool => {
                if let Some(results) = &message.tool_results {
                    for result in results {
                        if result.is_error {
                            let truncated: String = result.content.chars().take(200).collect();
                            lines.push(format!("Tool failure: {truncated}"));
                        }
                    }
                }
            }
            agentcore_sessions::types::Role::Assistant => {}
        }
    }
    if lines.is_empty() {
        "No summarizable content.".to_string()
    } else {
        lines.join("\n")
    }
}

async fn collect_text(
    provider: &dyn Provider,
    ctx: CancellationToken,
    req: ChatRequest,
) -> Option<String> {
    let mut rx = provider.stream(ctx, req).await.ok()?;
    let mut out = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Text { text } => out.push_str(&text),
            StreamEvent::Error { .. } => return None,
            StreamEvent::Done => break,
            _ => {}
        }
    }
    Some(out)
}

/// Generate the structured summary, falling back to a naive extract on
/// timeout or provider failure (spec §4.4 step 2).
#[instrument(skip(provider, messages), fields(message_count = messages.len()))]
pub async fn generate_summary(provider: &dyn Provider, messages: &[Message]) -> String {
    let transcript = render_transcript(messages);
    let req = ChatRequest {
        model: provider.cheapest_model().to_string(),
        static_system: String::new(),
        system: "Respond using exactly the requested markdown sections.".to_string(),
        messages: vec![agentcore_sessions::types::Message {
            id: 0,
            session_id: String::new(),
            role: agentcore_sessions::types::Role::User,
            content: summary_prompt(&transcript),
            tool_calls: None,
            tool_results: None,
            created_at: String::new(),
        }],
        tools: Vec::new(),
        enable_thinking: false,
        max_tokens: 2048,
    };

    let ctx = CancellationToken::new();
    let result = tokio::time::timeout(
        Duration::from_secs(SUMMARY_TIMEOUT_SECS),
        collect_text(provider, ctx, req),
    )
    .await;

    match result {
        Ok(Some(text)) if !text.trim().is_empty() => text,
        _ => naive_fallback_summary(messages),
    }
}

/// Apply the tiered cumulative compression rule (spec §3): the previous
/// `earlier ⧺ recent` compress to the new `earlier` (600 chars), the
/// previous `current` compresses to the new `recent` (1500 chars), and
/// the freshly generated summary becomes the new `current`.
pub fn apply_tiered_compression(previous: &Summary, new_summary: &str) -> Summary {
    let combined_old = format!("{} {}", previous.earlier, previous.recent);
    let earlier = agentcore_sessions::types::compress_tier(combined_old.trim(), 600);
    let recent = agentcore_sessions::types::compress_tier(previous.current.trim(), 1500);

    Summary {
        earlier,
        recent,
        current: new_summary.trim().to_string(),
    }
}

/// Outcome of one compaction attempt at a given progressive keep size.
pub struct CompactionPlan {
    pub keep_last_k: usize,
    pub summary: Summary,
    pub pinned_active_task: Option<String>,
}

/// Run the compactor for one trigger (spec §4.4).
///
/// `previous_summary` is the session's current tiered summary (empty if
/// none yet). `messages` is the full, uncompacted message history.
/// `retry_after_overflow` skips `K=10` when this is a retry within the
/// same run after a provider-reported context overflow (spec §4.4 —
/// "on provider-reported overflow after one compaction this run, skip
/// K=10").
#[instrument(skip(provider, previous_summary, messages), fields(message_count = messages.len(), auto_compact_tokens, retry_after_overflow))]
pub async fn compact(
    provider: &dyn Provider,
    previous_summary: &Summary,
    messages: &[Message],
    auto_compact_tokens: u64,
    retry_after_overflow: bool,
) -> CompactionPlan {
    let summary_text = generate_summary(provider, messages).await;
    let pinned_active_task = parse_current_task(&summary_text);
    let new_summary = apply_tiered_compression(previous_summary, &summary_text);

    let keep_sizes: Vec<usize> = PROGRESSIVE_KEEP
        .iter()
        .copied()
        .filter(|&k| !(retry_after_overflow && k == 10))
        .collect();

    let mut chosen = *keep_sizes.last().unwrap_or(&1);
    for &k in &keep_sizes {
        let tail: Vec<Message> = messages.iter().rev().take(k).rev().cloned().collect();
        let estimate = estimate_session_tokens(&tail) + estimate_summary_tokens(&new_summary);
        if estimate <= auto_compact_tokens {
            chosen = k;
            break;
        }
    }

    CompactionPlan {
        keep_last_k: chosen,
        summary: new_summary,
        pinned_active_task,
    }
}

fn estimate_summary_tokens(summary: &Summary) -> u64 {
    let chars = summary.earlier.len() + summary.recent.len() + summary.current.len();
    (chars as u64) / agentcore_core::config::CHARS_PER_TOKEN
}
