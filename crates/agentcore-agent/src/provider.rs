use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentcore_sessions::types::Message;

use crate::stream::StreamEvent;

/// Tool definition handed to the provider verbatim from the tool registry
/// (spec §6.3 — `ToolDefinition{name, description, input_schema_json}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Request sent to a provider for one iteration (spec §6.2 —
/// `ChatRequest = { messages, tools, static_system, system, model,
/// enable_thinking, max_tokens }`).
///
/// `static_system` carries the prompt assembler's static prompt (stable
/// across iterations, for providers that support prefix caching);
/// `system` carries the dynamic suffix appended per iteration. Providers
/// that don't distinguish the two simply concatenate them.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub static_system: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub enable_thinking: bool,
    pub max_tokens: u32,
}

/// Provider-reported rate limit state, surfaced optionally for adapters
/// to render a status line (spec §6.2 — `GetRateLimit() -> RateLimitInfo`).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitInfo {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at_unix: i64,
}

/// Common interface for all LLM providers (spec §6.2). The runner never
/// speaks a provider's wire protocol directly — only this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, e.g. `"anthropic"`.
    fn id(&self) -> &str;

    /// The auth-profile identifier usage/cooldown bookkeeping is recorded
    /// against (spec §4.8) — distinct from `id()` because one provider id
    /// can have multiple credential profiles.
    fn profile_id(&self) -> &str;

    /// Whether this provider executes tool calls internally (e.g. an
    /// embedded CLI) rather than handing `ToolCall` events back to the
    /// runner for dispatch (spec §4.9).
    fn handles_tools(&self) -> bool;

    /// Stream a chat request, cooperatively cancellable via `ctx`.
    async fn stream(
        &self,
        ctx: CancellationToken,
        req: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError>;

    /// Current rate-limit state, if the provider tracks and exposes one.
    fn rate_limit(&self) -> Option<RateLimitInfo> {
        None
    }

    /// The provider's default model, used when no override/selector picks
    /// one explicitly (spec §4.8 step 3).
    fn default_model(&self) -> &str;

    /// Whether `model` supports extended thinking (spec §4.8 — thinking
    /// flag only enabled when the model supports it).
    fn supports_thinking(&self, _model: &str) -> bool {
        false
    }

    /// The cheapest model this provider can serve a classification/
    /// extraction call with (spec §4.4/§4.6/§4.7 — "cheapest available
    /// model"). Defaults to the default model.
    fn cheapest_model(&self) -> &str {
        self.default_model()
    }

    /// The context window of `model`, in tokens, if known (spec §4.3 —
    /// "active provider's reported model list"). `None` triggers the
    /// fallback threshold triple.
    fn context_window(&self, _model: &str) -> Option<u64> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("context window exceeded")]
    ContextOverflow,

    #[error("message role ordering rejected: {0}")]
    RoleOrdering(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("quota exhausted")]
    QuotaExhausted,
}

impl ProviderError {
    /// Classification used by the selector's error-recording path (spec
    /// §4.8 — `rate_limit | auth | overflow | role_order | transient |
    /// generic`).
    pub fn classify(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limit",
            ProviderError::AuthFailure(_) => "auth",
            ProviderError::ContextOverflow => "overflow",
            ProviderError::RoleOrdering(_) => "role_order",
            ProviderError::Transient(_)
            | ProviderError::Http(_)
            | ProviderError::Unavailable(_) => "transient",
            ProviderError::Cancelled => "cancelled",
            ProviderError::QuotaExhausted => "quota",
            ProviderError::Api { .. } | ProviderError::Parse(_) => "generic",
        }
    }
}
