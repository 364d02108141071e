use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::instrument;

use crate::provider::Provider;
use agentcore_sessions::types::Message;

/// A `"<provider_id>/<model_name>"` override, parsed from config or a
/// request field (spec §4.8 step 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOverride {
    pub provider_id: String,
    pub model_name: String,
}

/// Parse a `"provider/model"` override string. Returns `None` if the
/// string has no `/` separator (spec §4.8 — falls through to the next
/// selection step rather than erroring).
pub fn parse_model_override(raw: &str) -> Option<ModelOverride> {
    let (provider_id, model_name) = raw.split_once('/')?;
    if provider_id.is_empty() || model_name.is_empty() {
        return None;
    }
    Some(ModelOverride {
        provider_id: provider_id.to_string(),
        model_name: model_name.to_string(),
    })
}

/// Optional pluggable selection strategy consulted when no explicit
/// override is present (spec §4.8 step 2 — `ModelSelector::Select`).
#[async_trait]
pub trait ModelSelector: Send + Sync {
    async fn select(&self, messages: &[Message]) -> Option<ModelOverride>;
}

/// Fuzzy-matches phrases like "use claude" / "switch to opus" in the last
/// user message against known provider/model aliases (spec §4.8 — "last
/// user message model-switch phrase ... resolved via fuzzy matcher").
#[async_trait]
pub trait FuzzyMatcher: Send + Sync {
    fn match_phrase(&self, text: &str, aliases: &[String]) -> Option<String>;
}

/// Simple substring-based fuzzy matcher: case-insensitive containment of
/// a known alias token inside the message text.
pub struct SubstringFuzzyMatcher;

impl FuzzyMatcher for SubstringFuzzyMatcher {
    fn match_phrase(&self, text: &str, aliases: &[String]) -> Option<String> {
        let lowered = text.to_lowercase();
        aliases
            .iter()
            .find(|alias| lowered.contains(&alias.to_lowercase()))
            .cloned()
    }
}

/// Classification of a provider call failure, used to decide cooldown
/// behavior (spec §4.8 — "error classified
/// rate_limit|auth|overflow|role_order|transient|generic").
pub type ErrorClass = &'static str;

#[derive(Debug, Clone, Default)]
struct ProfileState {
    cooldown_until: Option<Instant>,
    last_failure_fingerprint: Option<String>,
}

/// Tracks per-profile health (cooldowns, failure dedup) across a process
/// lifetime (spec §4.8 — `MarkFailed` informs subsequent `Select` calls).
/// Not persisted; reset on restart.
pub struct ProviderHealth {
    profiles: Mutex<HashMap<String, ProfileState>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderHealth {
    pub fn new() -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful call, resetting the profile's cooldown.
    pub fn mark_success(&self, profile_id: &str) {
        let mut profiles = self.profiles.lock().unwrap();
        profiles
            .entry(profile_id.to_string())
            .or_default()
            .cooldown_until = None;
    }

    /// Record a failure, classified per spec §4.8. Rate-limit and quota
    /// failures impose a cooldown; repeated identical failures (same
    /// payload fingerprint) are deduplicated and don't extend it further.
    pub fn mark_failed(&self, profile_id: &str, class: ErrorClass, fingerprint: &str) {
        let mut profiles = self.profiles.lock().unwrap();
        let state = profiles.entry(profile_id.to_string()).or_default();

        if state.last_failure_fingerprint.as_deref() == Some(fingerprint) {
            return;
        }
        state.last_failure_fingerprint = Some(fingerprint.to_string());

        let cooldown = match class {
            "rate_limit" => Some(Duration::from_secs(60)),
            "quota" => Some(Duration::from_secs(300)),
            "auth" => Some(Duration::from_secs(120)),
            _ => None,
        };
        if let Some(cooldown) = cooldown {
            state.cooldown_until = Some(Instant::now() + cooldown);
        }
    }

    /// Whether the profile is currently in cooldown and should be skipped
    /// by selection.
    pub fn is_cooling_down(&self, profile_id: &str) -> bool {
        self.profiles
            .lock()
            .unwrap()
            .get(profile_id)
            .and_then(|s| s.cooldown_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

/// The chosen provider + model + thinking flag for one iteration.
pub struct Selection<'a> {
    pub provider: &'a dyn Provider,
    pub model: String,
    pub enable_thinking: bool,
}

/// Select a provider and model for the next iteration (spec §4.8).
///
/// Precedence: explicit `model_override` → `ModelSelector::select` → a
/// persistent switch established by a prior "switch to X" phrase →
/// first loaded, non-cooling-down provider. If the override or selector
/// names a provider id that isn't loaded, falls back to the first loaded
/// provider.
#[instrument(skip(providers, health, model_override, selector, messages, sticky_switch), fields(provider_count = providers.len(), wants_reasoning))]
pub async fn select<'a>(
    providers: &'a [Box<dyn Provider>],
    health: &ProviderHealth,
    model_override: Option<&ModelOverride>,
    selector: Option<&dyn ModelSelector>,
    messages: &[Message],
    sticky_switch: Option<&ModelOverride>,
    wants_reasoning: bool,
) -> Option<Selection<'a>> {
    let candidate = if let Some(ov) = model_override {
        Some(ov.clone())
    } else if let Some(selector) = selector {
        selector.select(messages).await
    } else {
        sticky_switch.cloned()
    };

    let chosen = candidate.and_then(|ov| {
        providers
            .iter()
            .find(|p| p.id() == ov.provider_id && !health.is_cooling_down(p.profile_id()))
            .map(|p| (p.as_ref(), ov.model_name))
    });

    let (provider, model) = match chosen {
        Some(found) => found,
        None => {
            let provider = providers
                .iter()
                .find(|p| !health.is_cooling_down(p.profile_id()))
                .map(|p| p.as_ref())?;
            let model = provider.default_model().to_string();
            (provider, model)
        }
    };

    let enable_thinking =
        (wants_reasoning && provider.supports_thinking(&model)) || provider.handles_tools();

    Some(Selection {
        provider,
        model,
        enable_thinking,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_slash_model() {
        let ov = parse_model_override("anthropic/claude-opus").unwrap();
        assert_eq!(ov.provider_id, "anthropic");
        assert_eq!(ov.model_name, "claude-opus");
    }

    #[test]
    fn rejects_strings_without_separator() {
        assert!(parse_model_override("anthropic").is_none());
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(parse_model_override("/claude-opus").is_none());
        assert!(parse_model_override("anthropic/").is_none());
    }

    #[test]
    fn fuzzy_matcher_finds_known_alias() {
        let matcher = SubstringFuzzyMatcher;
        let aliases = vec!["opus".to_string(), "haiku".to_string()];
        assert_eq!(
            matcher.match_phrase("let's switch to opus for this", &aliases),
            Some("opus".to_string())
        );
        assert_eq!(matcher.match_phrase("no alias here", &aliases), None);
    }

    #[test]
    fn health_dedups_identical_failure_fingerprints() {
        let health = ProviderHealth::new();
        health.mark_failed("p1", "rate_limit", "fp-1");
        assert!(health.is_cooling_down("p1"));
        health.mark_success("p1");
        assert!(!health.is_cooling_down("p1"));
    }

    #[test]
    fn non_cooldown_classes_do_not_set_cooldown() {
        let health = ProviderHealth::new();
        health.mark_failed("p1", "generic", "fp-1");
        assert!(!health.is_cooling_down("p1"));
    }
}
