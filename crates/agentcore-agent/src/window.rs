use agentcore_core::config::WindowConfig;
use agentcore_sessions::types::{Message, Role};

/// Result of selecting the sliding window for one iteration (spec §4.2).
pub struct WindowSelection {
    /// The messages to send to the model, in chronological order,
    /// including a synthetic rolling-summary message prepended if any
    /// messages were evicted.
    pub messages: Vec<Message>,
    /// Whether any messages older than the window were evicted.
    pub evicted: bool,
    /// The ids of messages that were evicted (oldest-first), for callers
    /// that need to build a rolling summary over exactly this range.
    pub evicted_ids: Vec<i64>,
}

/// Estimate a message's token cost using the chars/4 heuristic (spec §9 —
/// no real tokenizer).
fn estimate_tokens(message: &Message) -> u64 {
    let mut chars = message.content.len();
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            chars += call.name.len() + call.input.to_string().len();
        }
    }
    if let Some(results) = &message.tool_results {
        for result in results {
            chars += result.content.len();
        }
    }
    (chars as u64) / agentcore_core::config::CHARS_PER_TOKEN
}

/// Sum the chars/4 token estimate across a set of messages (used by the
/// threshold calculator and compactor to decide when to trigger/stop).
pub fn estimate_session_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_tokens).sum()
}

/// Select the message window to send to the model (spec §4.2).
///
/// Walks `messages` newest-to-oldest, including messages until the
/// message-count or token cap is hit — but never stopping before every
/// message with id `>= run_start_id` is included. Fixes a window that
/// would start mid tool-call/tool-result pair by extending one step
/// earlier. Any message strictly older than the resulting window is
/// "evicted" and reported via `evicted`/`evicted_ids` so the caller can
/// build and prepend a rolling summary.
pub fn select_window(messages: &[Message], run_start_id: i64, config: &WindowConfig) -> WindowSelection {
    if messages.is_empty() {
        return WindowSelection {
            messages: Vec::new(),
            evicted: false,
            evicted_ids: Vec::new(),
        };
    }

    let mut included_from = messages.len(); // exclusive lower bound index, walked down
    let mut token_total: u64 = 0;
    let mut count = 0usize;

    for (idx, message) in messages.iter().enumerate().rev() {
        let must_include = message.id >= run_start_id;
        let tokens = estimate_tokens(message);

        if !must_include {
            let would_exceed_count = count + 1 > config.max_messages;
            let would_exceed_tokens = token_total + tokens > config.max_tokens;
            if would_exceed_count || would_exceed_tokens {
                break;
            }
        }

        included_from = idx;
        token_total += tokens;
        count += 1;
    }

    // Tool-pair boundary fix: never start the window with a tool-role
    // message that answers a call from an assistant message just before it.
    while included_from > 0 && messages[included_from].role == Role::Tool {
        included_from -= 1;
    }

    let evicted_ids: Vec<i64> = messages[..included_from].iter().map(|m| m.id).collect();
    let evicted = !evicted_ids.is_empty();
    let windowed = messages[included_from..].to_vec();

    WindowSelection {
        messages: windowed,
        evicted,
        evicted_ids,
    }
}

/// Label for the synthetic message prepended when messages were evicted
/// (spec §4.2 — exact literal).
pub const ROLLING_CONTEXT_LABEL: &str = "[Conversation context from earlier in this session]";

/// Verify the window invariant: every assistant tool-call has a matching
/// tool-result later in the sequence (spec §4.2). Used by tests and, if
/// the caller wants a cheap runtime assertion, by the runner before a send.
pub fn is_well_formed(messages: &[Message]) -> bool {
    use std::collections::HashSet;
    let mut pending: HashSet<&str> = HashSet::new();
    for message in messages {
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                pending.insert(call.id.as_str());
            }
        }
        if let Some(results) = &message.tool_results {
            for result in results {
                pending.remove(result.tool_call_id.as_str());
            }
        }
    }
    pending.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore_sessions::types::{ToolCall, ToolResultEntry};

    fn msg(id: i64, role: Role, content: &str) -> Message {
        Message {
            id,
            session_id: "s1".to_string(),
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_results: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn small_config() -> WindowConfig {
        WindowConfig {
            max_messages: 3,
            max_tokens: 1_000_000,
        }
    }

    #[test]
    fn property_never_evicts_current_run_messages() {
        let messages: Vec<Message> = (1..=10)
            .map(|i| msg(i, Role::User, &format!("m{i}")))
            .collect();
        // Triggering user message is id 10; cap is 3 messages, far fewer
        // than the 10-message history, but run_start_id protects id 10.
        let selection = select_window(&messages, 10, &small_config());
        assert!(selection.messages.iter().any(|m| m.id == 10));
    }

    #[test]
    fn property_never_evicts_any_message_at_or_above_run_start() {
        let messages: Vec<Message> = (1..=20)
            .map(|i| msg(i, Role::User, &format!("m{i}")))
            .collect();
        let run_start = 15;
        let selection = select_window(&messages, run_start, &small_config());
        for id in run_start..=20 {
            assert!(
                selection.messages.iter().any(|m| m.id == id),
                "message {id} was evicted"
            );
        }
    }

    #[test]
    fn respects_message_count_cap_for_older_messages() {
        let messages: Vec<Message> = (1..=10)
            .map(|i| msg(i, Role::User, &format!("m{i}")))
            .collect();
        // run_start_id beyond the range means nothing is "current run",
        // so the 3-message cap applies freely.
        let selection = select_window(&messages, 1000, &small_config());
        assert_eq!(selection.messages.len(), 3);
        assert!(selection.evicted);
        assert_eq!(selection.evicted_ids.len(), 7);
    }

    #[test]
    fn tool_pair_boundary_extends_one_step_earlier() {
        let mut messages = vec![
            msg(1, Role::User, "hi"),
            Message {
                id: 2,
                session_id: "s1".into(),
                role: Role::Assistant,
                content: String::new(),
                tool_calls: Some(vec![ToolCall {
                    id: "call-1".into(),
                    name: "file".into(),
                    input: serde_json::json!({}),
                }]),
                tool_results: None,
                created_at: "2026-01-01T00:00:00Z".into(),
            },
            Message {
                id: 3,
                session_id: "s1".into(),
                role: Role::Tool,
                content: String::new(),
                tool_calls: None,
                tool_results: Some(vec![ToolResultEntry {
                    tool_call_id: "call-1".into(),
                    content: "result".into(),
                    is_error: false,
                }]),
                created_at: "2026-01-01T00:00:00Z".into(),
            },
        ];
        messages.push(msg(4, Role::Assistant, "done"));

        let config = WindowConfig {
            max_messages: 2, // would otherwise start at the tool message (id 3)
            max_tokens: 1_000_000,
        };
        let selection = select_window(&messages, 1000, &config);
        // Boundary fix must pull in the assistant tool-call message too.
        assert!(selection.messages.iter().any(|m| m.id == 2));
        assert!(is_well_formed(&selection.messages));
    }

    #[test]
    fn is_well_formed_detects_unmatched_tool_call() {
        let messages = vec![Message {
            id: 1,
            session_id: "s1".into(),
            role: Role::Assistant,
            content: String::new(),
            tool_calls: Some(vec![ToolCall {
                id: "orphan".into(),
                name: "file".into(),
                input: serde_json::json!({}),
            }]),
            tool_results: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        }];
        assert!(!is_well_formed(&messages));
    }
}
