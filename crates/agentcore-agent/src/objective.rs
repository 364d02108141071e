use async_trait::async_trait;
use serde::Deserialize;

use crate::provider::{ChatRequest, Provider};
use agentcore_sessions::types::Role;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Minimum prompt length (chars) that triggers objective detection (spec §4.7).
pub const MIN_PROMPT_CHARS: usize = 20;

/// Bound on the background classification call (spec §4.7/§5).
pub const CLASSIFY_TIMEOUT_SECS: u64 = 15;

/// The action the classifier decided on (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveAction {
    Set,
    Update,
    Keep,
    Clear,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifierResponse {
    action: ObjectiveAction,
    #[serde(default)]
    objective: Option<String>,
}

/// Collaborator that owns the session's work-task list, cleared whenever a
/// new objective is set (spec §4.7 — "set also clears work-task list").
/// Defined as a trait here because work-task-list storage lives outside
/// this crate's scope; any future owner of that list implements this.
#[async_trait]
pub trait WorkTaskList: Send + Sync {
    async fn clear(&self, session_id: &str) -> Result<(), String>;
}

/// No-op implementation for deployments that don't track a work-task list
/// separately from the active objective.
pub struct NoWorkTaskList;

#[async_trait]
impl WorkTaskList for NoWorkTaskList {
    async fn clear(&self, _session_id: &str) -> Result<(), String> {
        Ok(())
    }
}

fn classification_prompt(current_objective: Option<&str>, new_message: &str) -> String {
    format!(
        "You are tracking the active objective of a conversation. \
         The current objective is: {}\n\n\
         The user just sent this message:\n{}\n\n\
         Decide whether the objective should change. Respond with a single \
         JSON object: {{\"action\": \"set\"|\"update\"|\"keep\"|\"clear\", \"objective\": \"...\"}}. \
         Use \"set\" when there was no prior objective and one is now clear. \
         Use \"update\" when the objective changed but work continues on the same topic. \
         Use \"keep\" when the message doesn't change the objective. \
         Use \"clear\" when the user indicates the task is done or abandoned. \
         Omit \"objective\" for \"keep\" and \"clear\".",
        current_objective.unwrap_or("(none)"),
        new_message
    )
}

fn extract_json_object(text: &str) -> Option<&str> {
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

/// The decided update to apply to a session's active task (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectiveUpdate {
    Set(String),
    Update(String),
    Keep,
    Clear,
}

/// Run the classification call and parse its result into an
/// [`ObjectiveUpdate`]. Returns `None` on timeout, provider error, or
/// unparseable output — callers log and swallow per spec §4.7.
#[instrument(skip(provider, current_objective, new_message))]
pub async fn classify(
    provider: &dyn Provider,
    current_objective: Option<&str>,
    new_message: &str,
) -> Option<ObjectiveUpdate> {
    let prompt = classification_prompt(current_objective, new_message);
    let req = ChatRequest {
        model: provider.cheapest_model().to_string(),
        static_system: String::new(),
        system: "Respond with JSON only, no prose.".to_string(),
        messages: vec![agentcore_sessions::types::Message {
            id: 0,
            session_id: String::new(),
            role: Role::User,
            content: prompt,
            tool_calls: None,
            tool_results: None,
            created_at: String::new(),
        }],
        tools: Vec::new(),
        enable_thinking: false,
        max_tokens: 256,
    };

    let ctx = CancellationToken::new();
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(CLASSIFY_TIMEOUT_SECS),
        collect_text(provider, ctx, req),
    )
    .await
    .ok()??;

    let json_slice = extract_json_object(&result)?;
    let parsed: ClassifierResponse = serde_json::from_str(json_slice).ok()?;

    match parsed.action {
        ObjectiveAction::Set => parsed.objective.map(ObjectiveUpdate::Set),
        ObjectiveAction::Update => parsed.objective.map(ObjectiveUpdate::Update),
        ObjectiveAction::Keep => Some(ObjectiveUpdate::Keep),
        ObjectiveAction::Clear => Some(ObjectiveUpdate::Clear),
    }
}

async fn collect_text(
    provider: &dyn Provider,
    ctx: CancellationToken,
    req: ChatRequest,
) -> Option<String> {
    use crate::stream::StreamEvent;

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

/// Apply a decided [`ObjectiveUpdate`] to session state, clearing the
/// work-task list when a new objective is set (spec §4.7).
#[instrument(skip(update, work_tasks), fields(session_id = %session_id))]
pub async fn apply(
    update: &ObjectiveUpdate,
    session_id: &str,
    work_tasks: &dyn WorkTaskList,
) -> Option<String> {
    match update {
        ObjectiveUpdate::Set(objective) => {
            let _ = work_tasks.clear(session_id).await;
            Some(objective.clone())
        }
        ObjectiveUpdate::Update(objective) => Some(objective.clone()),
        ObjectiveUpdate::Keep => None,
        ObjectiveUpdate::Clear => {
            let _ = work_tasks.clear(session_id).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_prompt_embeds_current_objective_and_message() {
        let prompt = classification_prompt(Some("ship the release"), "let's also fix the docs");
        assert!(prompt.contains("ship the release"));
        assert!(prompt.contains("let's also fix the docs"));
    }

    #[test]
    fn extract_json_object_finds_first_balanced_object() {
        let text = "```json\n{\"action\": \"set\", \"objective\": \"fix bug\"}\n```";
        let obj = extract_json_object(text).unwrap();
        let parsed: ClassifierResponse = serde_json::from_str(obj).unwrap();
        assert_eq!(parsed.action, ObjectiveAction::Set);
        assert_eq!(parsed.objective.as_deref(), Some("fix bug"));
    }

    #[test]
    fn extract_json_object_handles_nested_braces() {
        let text = "noise {\"action\": \"update\", \"objective\": \"{nested} stuff\"} trailing";
        let obj = extract_json_object(text).unwrap();
        assert!(obj.ends_with('}'));
    }

    #[tokio::test]
    async fn apply_set_clears_work_tasks() {
        struct Tracker(std::sync::atomic::AtomicBool);
        #[async_trait]
        impl WorkTaskList for Tracker {
            async fn clear(&self, _session_id: &str) -> Result<(), String> {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }
        let tracker = Tracker(std::sync::atomic::AtomicBool::new(false));
        let result = apply(&ObjectiveUpdate::Set("new goal".into()), "s1", &tracker).await;
        assert_eq!(result, Some("new goal".to_string()));
        assert!(tracker.0.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn apply_keep_is_noop() {
        let result = apply(&ObjectiveUpdate::Keep, "s1", &NoWorkTaskList).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn apply_clear_clears_work_tasks_and_returns_none() {
        let result = apply(&ObjectiveUpdate::Clear, "s1", &NoWorkTaskList).await;
        assert_eq!(result, None);
    }
}
