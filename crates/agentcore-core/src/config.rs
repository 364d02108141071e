use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Hard fallback thresholds used when the active provider reports no
/// context window (spec §4.3).
pub const FALLBACK_WARNING_TOKENS: u64 = 60_000;
pub const FALLBACK_ERROR_TOKENS: u64 = 70_000;
pub const FALLBACK_AUTO_COMPACT_TOKENS: u64 = 80_000;

/// Sliding-window caps (spec §4.2).
pub const WINDOW_MAX_MESSAGES: usize = 20;
pub const WINDOW_MAX_TOKENS: u64 = 40_000;

/// Characters per token used by the estimation heuristic (spec §9 — no
/// real tokenizer; prefer provider-reported `usage.input_tokens` when set).
pub const CHARS_PER_TOKEN: u64 = 4;

/// Top-level configuration for the agentic execution core.
///
/// Loaded from an `agentcore.toml` file with `AGENTCORE_`-prefixed
/// environment variable overrides (`AGENTCORE_RUNNER_MAX_ITERATIONS=50`),
/// mirroring the layered figment configuration pattern used throughout
/// this codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCoreConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub memory: MemoryPipelineConfig,
    #[serde(default)]
    pub fence: FenceConfig,
}

impl Default for AgentCoreConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            window: WindowConfig::default(),
            compaction: CompactionConfig::default(),
            memory: MemoryPipelineConfig::default(),
            fence: FenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum iterations per run (default 100, min 1 — spec §4.9).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Per-tool-call timeout in seconds (spec §4.9 — 5 minutes).
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Seconds to wait before retrying a transient error (spec §7 — 2s).
    #[serde(default = "default_transient_backoff_secs")]
    pub transient_backoff_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
            transient_backoff_secs: default_transient_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_window_max_tokens")]
    pub max_tokens: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_messages: default_window_max_messages(),
            max_tokens: default_window_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Timeout for the structured-summary LLM call (spec §4.4 — 30s).
    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,
    /// Progressive-keep K values tried in order (spec §4.4 — {10, 3, 1}).
    #[serde(default = "default_progressive_keep")]
    pub progressive_keep: Vec<usize>,
    /// Hard cap on the tiered summary blob, in characters (spec §3 — 6000).
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            summary_timeout_secs: default_summary_timeout_secs(),
            progressive_keep: default_progressive_keep(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPipelineConfig {
    /// Idle debounce timer in seconds (spec §4.6 — 5s).
    #[serde(default = "default_idle_debounce_secs")]
    pub idle_debounce_secs: u64,
    /// Number of trailing messages read for idle extraction (spec §4.6 — 6).
    #[serde(default = "default_idle_extract_messages")]
    pub idle_extract_messages: usize,
    /// Fraction of AutoCompact that triggers a pre-compaction flush (spec §4.6 — 0.75).
    #[serde(default = "default_pre_compaction_flush_fraction")]
    pub pre_compaction_flush_fraction: f64,
    /// Timeout for the extraction LLM call in seconds (spec §5 — 90s background bound).
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,
    /// Confidence defaults (spec §3).
    #[serde(default = "default_confidence_explicit")]
    pub confidence_explicit: f64,
    #[serde(default = "default_confidence_inferred")]
    pub confidence_inferred: f64,
    /// Reinforcement step applied to confidence on duplicate store (spec §3).
    #[serde(default = "default_reinforcement_step")]
    pub reinforcement_step: f64,
    /// Minimum confidence for system-prompt injection eligibility (spec §3 — 0.80).
    #[serde(default = "default_injection_min_confidence")]
    pub injection_min_confidence: f64,
}

impl Default for MemoryPipelineConfig {
    fn default() -> Self {
        Self {
            idle_debounce_secs: default_idle_debounce_secs(),
            idle_extract_messages: default_idle_extract_messages(),
            pre_compaction_flush_fraction: default_pre_compaction_flush_fraction(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
            confidence_explicit: default_confidence_explicit(),
            confidence_inferred: default_confidence_inferred(),
            reinforcement_step: default_reinforcement_step(),
            injection_min_confidence: default_injection_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceConfig {
    /// Ring-buffer quarantine capacity (spec §4.5).
    #[serde(default = "default_quarantine_capacity")]
    pub quarantine_capacity: usize,
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            quarantine_capacity: default_quarantine_capacity(),
        }
    }
}

fn default_max_iterations() -> u32 {
    100
}
fn default_tool_timeout_secs() -> u64 {
    300
}
fn default_transient_backoff_secs() -> u64 {
    2
}
fn default_window_max_messages() -> usize {
    WINDOW_MAX_MESSAGES
}
fn default_window_max_tokens() -> u64 {
    WINDOW_MAX_TOKENS
}
fn default_summary_timeout_secs() -> u64 {
    30
}
fn default_progressive_keep() -> Vec<usize> {
    vec![10, 3, 1]
}
fn default_summary_max_chars() -> usize {
    6000
}
fn default_idle_debounce_secs() -> u64 {
    5
}
fn default_idle_extract_messages() -> usize {
    6
}
fn default_pre_compaction_flush_fraction() -> f64 {
    0.75
}
fn default_extraction_timeout_secs() -> u64 {
    90
}
fn default_confidence_explicit() -> f64 {
    0.9
}
fn default_confidence_inferred() -> f64 {
    0.6
}
fn default_reinforcement_step() -> f64 {
    0.05
}
fn default_injection_min_confidence() -> f64 {
    0.80
}
fn default_quarantine_capacity() -> usize {
    50
}

impl AgentCoreConfig {
    /// Load config from an optional TOML file path with `AGENTCORE_*` env
    /// overrides layered on top, e.g. `AGENTCORE_RUNNER_MAX_ITERATIONS=50`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AgentCoreConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("AGENTCORE_").split("_"));
        figment
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_fallbacks() {
        let cfg = AgentCoreConfig::default();
        assert_eq!(cfg.runner.max_iterations, 100);
        assert_eq!(cfg.window.max_messages, 20);
        assert_eq!(cfg.window.max_tokens, 40_000);
        assert_eq!(cfg.compaction.progressive_keep, vec![10, 3, 1]);
        assert_eq!(cfg.memory.confidence_explicit, 0.9);
        assert_eq!(cfg.memory.confidence_inferred, 0.6);
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let cfg = AgentCoreConfig::load(None).expect("defaults should always parse");
        assert_eq!(cfg.fence.quarantine_capacity, 50);
    }
}
