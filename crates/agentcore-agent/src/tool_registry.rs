use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::fence::ToolOrigin;
use crate::provider::ToolDefinition;

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// The outcome of executing a tool call.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    pub origin: ToolOrigin,
    pub image_url: Option<String>,
}

/// Governs which tool results get AFV-fenced (spec §4.5/§9). Swappable so
/// deployments can tune the web-like-tool set without touching the
/// registry implementation.
pub trait FencePolicy: Send + Sync {
    fn origin_of(&self, tool_name: &str) -> ToolOrigin;
    fn is_web_like(&self, tool_name: &str) -> bool;
}

/// Notification that the set of available tools changed (e.g. an MCP
/// server connected or disconnected), so the prompt assembler's static
/// prompt can be rebuilt (spec §4.9 — tool list is part of the cached
/// static prompt).
#[derive(Debug, Clone)]
pub struct ToolRegistryChange;

/// Narrow interface the runner consumes for tool discovery and dispatch
/// (spec §6.3). Concrete tool implementations are out of scope — this
/// crate only defines the seam.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// The exact, verbatim list of currently available tools — fed into
    /// both the static system prompt and the provider's tool schema
    /// (spec §4.1 — "the *exact* current tool name list from the
    /// registry (verbatim)").
    fn list(&self) -> Vec<ToolDefinition>;

    /// Execute one tool call, cooperatively cancellable, bounded by a
    /// 5-minute per-call timeout enforced by the caller (spec §4.9).
    async fn execute(&self, ctx: CancellationToken, call: ToolCallRequest) -> ToolCallResult;

    /// Install the active fencing policy.
    fn set_policy(&self, policy: Box<dyn FencePolicy>);

    /// Subscribe to tool-set change notifications.
    fn on_change(&self) -> broadcast::Receiver<ToolRegistryChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPolicy;
    impl FencePolicy for StaticPolicy {
        fn origin_of(&self, tool_name: &str) -> ToolOrigin {
            match tool_name {
                "send_message" => ToolOrigin::Comm,
                "fetch_url" => ToolOrigin::App,
                _ => ToolOrigin::Skill,
            }
        }
        fn is_web_like(&self, tool_name: &str) -> bool {
            tool_name == "fetch_url"
        }
    }

    #[test]
    fn policy_classifies_known_tools() {
        let policy = StaticPolicy;
        assert_eq!(policy.origin_of("send_message"), ToolOrigin::Comm);
        assert_eq!(policy.origin_of("fetch_url"), ToolOrigin::App);
        assert!(policy.is_web_like("fetch_url"));
        assert!(!policy.is_web_like("send_message"));
    }
}
