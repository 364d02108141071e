use serde::Serialize;

use agentcore_sessions::types::Message;

/// Events routed from a provider's stream to the runner's caller (spec
/// §6.1 — `text | tool_call | tool_result | message | usage | error | done`).
///
/// This is the sum type the whole runner loop is a state machine over: a
/// provider implementation only ever needs to produce this enum, and the
/// runner only ever needs to match on it — no provider-specific branching
/// leaks past the `Provider` trait boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental assistant text.
    Text { text: String },

    /// The model wants to call a tool.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// The result of executing a tool call (echoed back to the caller for
    /// observability; the runner also appends it to session state).
    ToolResult {
        tool_call_id: String,
        content: String,
        image_url: Option<String>,
    },

    /// A full, persisted message (used when the runner wants to hand the
    /// caller a complete `Message` rather than incremental deltas).
    Message { message: Box<Message> },

    /// Ground-truth token usage reported by the provider, when available
    /// (spec §9 — prefer this over the chars/4 heuristic).
    Usage { input_tokens: u64 },

    /// A surfaced error. Always followed by `Done` (spec §7 — background
    /// pipeline errors never reach here; only user-visible ones do).
    Error { message: String },

    /// Terminal event for this run. Exactly one `Done` per `Run` call.
    Done,
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::Text { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }
}
