pub mod bridge;
pub mod compact;
pub mod fence;
pub mod memory_pipeline;
pub mod objective;
pub mod prompt;
pub mod provider;
pub mod quarantine;
pub mod runner;
pub mod selector;
pub mod stream;
pub mod threshold;
pub mod tool_registry;
pub mod window;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use bridge::{BridgeContext, ContextBridge};
pub use compact::CompactionPlan;
pub use fence::ToolOrigin;
pub use objective::{NoWorkTaskList, ObjectiveUpdate, WorkTaskList};
pub use provider::{ChatRequest, Provider, ProviderError, RateLimitInfo, ToolDefinition};
pub use quarantine::{QuarantineStore, QuarantinedTurn};
pub use runner::{RunChannel, RunRequest, Runner, RunnerIdentity};
pub use selector::{FuzzyMatcher, ModelOverride, ModelSelector, ProviderHealth, SubstringFuzzyMatcher};
pub use stream::StreamEvent;
pub use threshold::Thresholds;
pub use tool_registry::{FencePolicy, ToolCallRequest, ToolCallResult, ToolRegistry, ToolRegistryChange};
