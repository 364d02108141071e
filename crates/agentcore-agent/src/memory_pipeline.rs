use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use agentcore_memory::types::{Layer, MemoryDraft, MemorySource, STYLE_NAMESPACE};
use agentcore_memory::MemoryStore;
use agentcore_sessions::types::Message;

use crate::provider::{ChatRequest, Provider};
use crate::stream::StreamEvent;

/// One fact surfaced by the extractor, before it's mapped to a
/// `(layer, namespace, key)` address (spec §4.6).
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedFact {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionPayload {
    #[serde(default)]
    pub preferences: Vec<ExtractedFact>,
    #[serde(default)]
    pub entities: Vec<ExtractedFact>,
    #[serde(default)]
    pub decisions: Vec<ExtractedFact>,
    #[serde(default)]
    pub styles: Vec<ExtractedFact>,
    #[serde(default)]
    pub artifacts: Vec<ExtractedFact>,
}

/// Strip ```-fenced code blocks, keeping their inner content.
fn strip_markdown_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        // Skip an optional language tag up to the next newline.
        let after = match after.find('\n') {
            Some(nl) => &after[nl + 1..],
            None => after,
        };
        match after.find("```") {
            Some(end) => {
                out.push_str(&after[..end]);
                rest = &after[end + 3..];
            }
            None => {
                out.push_str(after);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Extract the first balanced top-level `{...}` object from `text` (spec
/// §4.6 — "extract the first balanced top-level object").
fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    for (idx, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + idx + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a raw extractor response into a payload. Returns an empty
/// payload on any parse failure (spec §4.6 — "on any parse failure
/// return empty"), never an error.
pub fn parse_extraction(raw: &str) -> ExtractionPayload {
    let stripped = strip_markdown_fences(raw);
    let Some(obj) = extract_balanced_object(&stripped) else {
        return ExtractionPayload::default();
    };
    serde_json::from_str(obj).unwrap_or_default()
}

fn category_namespace(fact: &ExtractedFact, fallback: &str) -> String {
    fact.category
        .clone()
        .unwrap_or_else(|| fallback.to_string())
}

/// Map each extracted fact to a `(layer, namespace)` address per its
/// originating category (spec §4.6).
fn drafts_from_payload(payload: &ExtractionPayload, user_id: &str) -> Vec<MemoryDraft> {
    let mut drafts = Vec::new();

    for fact in &payload.preferences {
        drafts.push(draft(fact, Layer::Tacit, category_namespace(fact, "preference"), user_id));
    }
    for fact in &payload.entities {
        drafts.push(draft(fact, Layer::Entity, category_namespace(fact, "entity"), user_id));
    }
    for fact in &payload.decisions {
        drafts.push(draft(fact, Layer::Daily, category_namespace(fact, "decision"), user_id));
    }
    for fact in &payload.styles {
        drafts.push(draft(fact, Layer::Tacit, STYLE_NAMESPACE.to_string(), user_id));
    }
    for fact in &payload.artifacts {
        drafts.push(draft(fact, Layer::Tacit, category_namespace(fact, "artifact"), user_id));
    }

    drafts
}

fn draft(fact: &ExtractedFact, layer: Layer, namespace: String, user_id: &str) -> MemoryDraft {
    MemoryDraft {
        layer,
        namespace,
        key: fact.key.clone(),
        value: fact.value.clone(),
        tags: fact.tags.clone(),
        user_id: user_id.to_string(),
        source: MemorySource::Inferred,
        metadata: serde_json::json!({}),
    }
}

/// Store policy (spec §4.6): normalize keys; reinforce on an identical
/// `(layer, namespace, key, value)` match, else insert fresh. Style facts
/// always reinforce.
#[instrument(skip(store, drafts), fields(draft_count = drafts.len()))]
pub async fn store_drafts(store: &dyn MemoryStore, drafts: Vec<MemoryDraft>) {
    for mut draft in drafts {
        draft.key = draft.normalized_key();
        let is_style = draft.namespace == STYLE_NAMESPACE;

        if is_style {
            let reinforce_result = store
                .reinforce(draft.layer, &draft.namespace, &draft.key, &draft.user_id)
                .await;
            if reinforce_result.is_err() {
                let _ = store.learn(draft).await;
            }
            continue;
        }

        match store
            .search(&draft.user_id, &draft.value, 1)
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|e| {
                e.layer == draft.layer && e.namespace == draft.namespace && e.key == draft.key && e.value == draft.value
            }) {
            Some(_) => {
                let _ = store
                    .reinforce(draft.layer, &draft.namespace, &draft.key, &draft.user_id)
                    .await;
            }
            None => {
                let _ = store.learn(draft).await;
            }
        }
    }
}

/// Ask the cheapest reachable provider (falling back provider-by-provider
/// on failure) to extract facts from the trailing messages (spec §4.6).
#[instrument(skip(providers, messages), fields(provider_count = providers.len(), message_count = messages.len()))]
pub async fn extract_via_providers(
    providers: &[Box<dyn Provider>],
    timeout: Duration,
    messages: &[Message],
) -> ExtractionPayload {
    let transcript = render_transcript(messages);
    let prompt = extraction_prompt(&transcript);

    for provider in providers {
        let req = ChatRequest {
            model: provider.cheapest_model().to_string(),
            static_system: String::new(),
            system: "Respond with JSON only, no prose.".to_string(),
            messages: vec![agentcore_sessions::types::Message {
                id: 0,
                session_id: String::new(),
                role: agentcore_sessions::types::Role::User,
                content: prompt.clone(),
                tool_calls: None,
                tool_results: None,
                created_at: String::new(),
            }],
            tools: Vec::new(),
            enable_thinking: false,
            max_tokens: 1024,
        };

        let ctx = CancellationToken::new();
        let attempt = tokio::time::timeout(timeout, collect_text(provider.as_ref(), ctx, req)).await;
        if let Ok(Some(text)) = attempt {
            let payload = parse_extraction(&text);
            if !is_empty_payload(&payload) {
                return payload;
            }
        }
    }

    ExtractionPayload::default()
}

fn is_empty_payload(payload: &ExtractionPayload) -> bool {
    payload.preferences.is_empty()
        && payload.entities.is_empty()
        && payload.decisions.is_empty()
        && payload.styles.is_empty()
        && payload.artifacts.is_empty()
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

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn extraction_prompt(transcript: &str) -> String {
    format!(
        "Extract durable facts from this conversation excerpt as a single JSON \
         object with arrays \"preferences\", \"entities\", \"decisions\", \"styles\", \
         \"artifacts\". Each fact is {{\"key\": \"...\", \"value\": \"...\", \
         \"category\": \"...\", \"tags\": [\"...\"]}}. Omit arrays with nothing to \
         report. Respond with JSON only.\n\n{transcript}"
    )
}

/// Full extraction pipeline: run the extractor, map facts to addresses,
/// and apply the store policy (spec §4.6 end to end).
#[instrument(skip(providers, messages, store), fields(user_id, message_count = messages.len()))]
pub async fn run_extraction(
    providers: &[Box<dyn Provider>],
    timeout: Duration,
    messages: &[Message],
    user_id: &str,
    store: &dyn MemoryStore,
) {
    let payload = extract_via_providers(providers, timeout, messages).await;
    let drafts = drafts_from_payload(&payload, user_id);
    store_drafts(store, drafts).await;
}

/// Session-keyed idle debounce timer manager (spec §4.6/§5 — "debounced
/// idle extraction timer replaced on every schedule call", overlap-guarded
/// per session).
#[derive(Default)]
pub struct IdleDebouncer {
    timers: DashMap<String, CancellationToken>,
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl IdleDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending timer for `session_id` and start a new one. The
    /// returned token is cancelled if `schedule` is called again for the
    /// same session before the debounce elapses.
    pub fn schedule(&self, session_id: &str) -> CancellationToken {
        if let Some(existing) = self.timers.get(session_id) {
            existing.cancel();
        }
        let token = CancellationToken::new();
        self.timers.insert(session_id.to_string(), token.clone());
        token
    }

    /// Acquire the per-session overlap guard for extraction, returning
    /// `None` if an extraction is already running for this session.
    pub fn try_acquire(&self, session_id: &str) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self
            .in_flight
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }
}

/// Whether the pre-compaction flush should run: the estimate has crossed
/// the configured fraction of AutoCompact, and no flush has yet run for
/// this compaction cycle (spec §4.6 — watermark-guarded via
/// `should_run_memory_flush`/`record_memory_flush`).
pub fn should_pre_compaction_flush(estimated_tokens: u64, auto_compact: u64, fraction: f64) -> bool {
    (estimated_tokens as f64) >= (auto_compact as f64) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_markdown_fences_keeps_inner_content() {
        let text = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(text).trim(), "{\"a\": 1}");
    }

    #[test]
    fn extract_balanced_object_handles_nesting() {
        let text = "noise {\"a\": {\"b\": 1}} trailing junk";
        let obj = extract_balanced_object(text).unwrap();
        assert_eq!(obj, "{\"a\": {\"b\": 1}}");
    }

    #[test]
    fn parse_extraction_returns_empty_on_garbage() {
        let payload = parse_extraction("not json at all");
        assert!(is_empty_payload(&payload));
    }

    #[test]
    fn parse_extraction_maps_all_categories() {
        let raw = r#"```json
        {
            "preferences": [{"key": "tea", "value": "green"}],
            "entities": [{"key": "acme-corp", "value": "client", "category": "company"}],
            "decisions": [{"key": "deploy-friday", "value": "no"}],
            "styles": [{"key": "tone", "value": "terse"}],
            "artifacts": [{"key": "readme", "value": "./README.md"}]
        }
        ```"#;
        let payload = parse_extraction(raw);
        assert_eq!(payload.preferences.len(), 1);
        assert_eq!(payload.entities.len(), 1);
        assert_eq!(payload.decisions.len(), 1);
        assert_eq!(payload.styles.len(), 1);
        assert_eq!(payload.artifacts.len(), 1);

        let drafts = drafts_from_payload(&payload, "u1");
        assert_eq!(drafts.len(), 5);
        assert!(drafts.iter().any(|d| d.layer == Layer::Tacit && d.namespace == "preference"));
        assert!(drafts.iter().any(|d| d.layer == Layer::Entity && d.namespace == "company"));
        assert!(drafts.iter().any(|d| d.layer == Layer::Daily && d.namespace == "decision"));
        assert!(drafts.iter().any(|d| d.layer == Layer::Tacit && d.namespace == STYLE_NAMESPACE));
        assert!(drafts.iter().any(|d| d.layer == Layer::Tacit && d.namespace == "artifact"));
    }

    #[test]
    fn pre_compaction_flush_threshold_matches_fraction() {
        assert!(should_pre_compaction_flush(75_000, 100_000, 0.75));
        assert!(!should_pre_compaction_flush(74_999, 100_000, 0.75));
    }

    #[test]
    fn debouncer_cancels_previous_timer_on_reschedule() {
        let debouncer = IdleDebouncer::new();
        let first = debouncer.schedule("s1");
        assert!(!first.is_cancelled());
        let _second = debouncer.schedule("s1");
        assert!(first.is_cancelled());
    }

    #[tokio::test]
    async fn debouncer_overlap_guard_blocks_concurrent_extraction() {
        let debouncer = IdleDebouncer::new();
        let guard1 = debouncer.try_acquire("s1");
        assert!(guard1.is_some());
        assert!(debouncer.try_acquire("s1").is_none());
        drop(guard1);
        assert!(debouncer.try_acquire("s1").is_some());
    }
}
