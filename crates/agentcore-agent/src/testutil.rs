//! Fake collaborators for the runner's end-to-end test suite (spec §8.1).
//! Mirrors the pattern of a handful of always-succeed/always-fail stand-ins
//! per trait rather than a single do-everything mock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use agentcore_memory::error::Result as MemResult;
use agentcore_memory::types::{Layer, MemoryDraft, MemoryEntry, MemorySnapshot};
use agentcore_memory::MemoryStore;
use agentcore_sessions::error::Result as SessionResult;
use agentcore_sessions::types::{Message, Session, SessionKey};
use agentcore_sessions::{NewMessage, SessionStore};

use crate::provider::{ChatRequest, Provider, ProviderError};
use crate::stream::StreamEvent;
use crate::tool_registry::{FencePolicy, ToolCallRequest, ToolCallResult, ToolRegistry, ToolRegistryChange};
use crate::fence::ToolOrigin;

/// A scripted provider that replays a fixed sequence of stream events per
/// call, one script entry consumed per `stream()` invocation. The last
/// script entry repeats once exhausted.
pub struct ScriptedProvider {
    id: String,
    model: String,
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    calls: Mutex<usize>,
    handles_tools: bool,
    context_window: Option<u64>,
}

impl ScriptedProvider {
    pub fn new(id: &str, model: &str, scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            scripts: Mutex::new(scripts),
            calls: Mutex::new(0),
            handles_tools: false,
            context_window: None,
        }
    }

    pub fn with_context_window(mut self, window: u64) -> Self {
        self.context_window = Some(window);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn profile_id(&self) -> &str {
        &self.id
    }

    fn handles_tools(&self) -> bool {
        self.handles_tools
    }

    async fn stream(
        &self,
        _ctx: CancellationToken,
        _req: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let mut calls = self.calls.lock().unwrap();
        let scripts = self.scripts.lock().unwrap();
        let idx = (*calls).min(scripts.len() - 1);
        let events = scripts[idx].clone();
        *calls += 1;
        drop(scripts);
        drop(calls);

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn context_window(&self, _model: &str) -> Option<u64> {
        self.context_window
    }
}

/// A provider whose every `stream()` call fails with the given error —
/// useful for exercising the transient/rate-limit/auth retry paths.
pub struct AlwaysFailProvider {
    id: String,
    model: String,
    error: fn() -> ProviderError,
}

impl AlwaysFailProvider {
    pub fn new(id: &str, model: &str, error: fn() -> ProviderError) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            error,
        }
    }
}

#[async_trait]
impl Provider for AlwaysFailProvider {
    fn id(&self) -> &str {
        &self.id
    }
    fn profile_id(&self) -> &str {
        &self.id
    }
    fn handles_tools(&self) -> bool {
        false
    }
    async fn stream(
        &self,
        _ctx: CancellationToken,
        _req: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        Err((self.error)())
    }
    fn default_model(&self) -> &str {
        &self.model
    }
}

/// In-memory `SessionStore` fake backed by a single mutex-guarded map.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<InMemorySessionStoreInner>,
}

#[derive(Default)]
struct InMemorySessionStoreInner {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
    next_message_id: i64,
    flush_watermarks: HashMap<String, u32>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_rfc3339() -> String {
    "2026-01-01T00:00:00Z".to_string()
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, key: &SessionKey) -> SessionResult<Session> {
        let mut inner = self.inner.lock().unwrap();
        let session_id = key.format();
        if let Some(session) = inner.sessions.get(&session_id) {
            return Ok(session.clone());
        }
        let session = Session {
            id: session_id.clone(),
            key: key.clone(),
            title: None,
            summary: None,
            last_summarized_count: 0,
            memory_flush_compaction_count: 0,
            active_task: None,
            message_count: 0,
            total_tokens: 0,
            last_model: None,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        };
        inner.sessions.insert(session_id.clone(), session.clone());
        inner.messages.insert(session_id, Vec::new());
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> SessionResult<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(session_id).cloned())
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> SessionResult<Vec<Session>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.key.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
        tokens: u64,
        model: &str,
    ) -> SessionResult<Message> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        let msg = Message {
            id,
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            tool_results: message.tool_results,
            created_at: now_rfc3339(),
        };
        inner
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(msg.clone());
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.message_count += 1;
            session.total_tokens += tokens;
            session.last_model = Some(model.to_string());
            session.updated_at = now_rfc3339();
        }
        Ok(msg)
    }

    async fn get_messages(&self, session_id: &str, limit: usize) -> SessionResult<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let all = inner.messages.get(session_id).cloned().unwrap_or_default();
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn compact(
        &self,
        session_id: &str,
        summary: &str,
        keep_last_k: usize,
        run_start_id: i64,
    ) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(messages) = inner.messages.get_mut(session_id) {
            let keep_from_id = messages
                .iter()
                .rev()
                .take(keep_last_k)
                .map(|m| m.id)
                .min()
                .unwrap_or(i64::MAX);
            messages.retain(|m| m.id >= keep_from_id.min(run_start_id));
        }
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.summary = Some(summary.to_string());
            session.updated_at = now_rfc3339();
        }
        Ok(())
    }

    async fn get_summary(&self, session_id: &str) -> SessionResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .and_then(|s| s.summary.clone()))
    }

    async fn update_summary(&self, session_id: &str, summary: &str) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.summary = Some(summary.to_string());
        }
        Ok(())
    }

    async fn get_active_task(&self, session_id: &str) -> SessionResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .and_then(|s| s.active_task.clone()))
    }

    async fn set_active_task(&self, session_id: &str, task: &str) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.active_task = Some(task.to_string());
        }
        Ok(())
    }

    async fn clear_active_task(&self, session_id: &str) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.active_task = None;
        }
        Ok(())
    }

    async fn get_last_summarized_count(&self, session_id: &str) -> SessionResult<u32> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|s| s.last_summarized_count)
            .unwrap_or(0))
    }

    async fn set_last_summarized_count(&self, session_id: &str, count: u32) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.last_summarized_count = count;
        }
        Ok(())
    }

    async fn should_run_memory_flush(&self, session_id: &str, compaction_count: u32) -> SessionResult<bool> {
        let inner = self.inner.lock().unwrap();
        let recorded = inner.flush_watermarks.get(session_id).copied().unwrap_or(0);
        Ok(recorded < compaction_count)
    }

    async fn record_memory_flush(&self, session_id: &str, compaction_count: u32) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush_watermarks.insert(session_id.to_string(), compaction_count);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(session_id);
        inner.messages.remove(session_id);
        Ok(())
    }
}

/// In-memory `MemoryStore` fake.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    entries: Mutex<Vec<MemoryEntry>>,
    next_id: Mutex<i64>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn learn(&self, draft: MemoryDraft) -> MemResult<MemoryEntry> {
        let now = chrono::Utc::now();
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let entry = MemoryEntry {
            id: *next_id,
            layer: draft.layer,
            namespace: draft.namespace,
            key: draft.key,
            value: draft.value,
            tags: draft.tags,
            user_id: draft.user_id,
            confidence: draft.source.default_confidence(&agentcore_core::config::MemoryPipelineConfig::default()),
            access_count: 1,
            accessed_at: now,
            reinforced_count: 0,
            metadata: draft.metadata,
            created_at: now,
            updated_at: now,
        };
        self.entries.lock().unwrap().push(entry.clone());
        Ok(entry)
    }

    async fn reinforce(
        &self,
        layer: Layer,
        namespace: &str,
        key: &str,
        user_id: &str,
    ) -> MemResult<MemoryEntry> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.layer == layer && e.namespace == namespace && e.key == key && e.user_id == user_id)
            .ok_or_else(|| agentcore_memory::error::MemoryError::NotFound {
                layer: layer.to_string(),
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?;
        entry.reinforced_count += 1;
        entry.confidence = (entry.confidence + 0.05).min(1.0);
        entry.access_count += 1;
        Ok(entry.clone())
    }

    async fn forget(&self, layer: Layer, namespace: &str, key: &str, user_id: &str) -> MemResult<()> {
        self.entries
            .lock()
            .unwrap()
            .retain(|e| !(e.layer == layer && e.namespace == namespace && e.key == key && e.user_id == user_id));
        Ok(())
    }

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> MemResult<Vec<MemoryEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.user_id == user_id && (e.value.contains(query) || e.key.contains(query)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ranked_snapshot(&self, user_id: &str, total_cap: usize) -> MemResult<MemorySnapshot> {
        let mut entries: Vec<MemoryEntry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        let now = chrono::Utc::now();
        entries.sort_by(|a, b| b.rank(now).partial_cmp(&a.rank(now)).unwrap());
        entries.truncate(total_cap);
        Ok(MemorySnapshot { entries })
    }
}

/// A `ToolRegistry` fake that dispatches to a registered closure table.
pub struct FakeToolRegistry {
    tools: Vec<crate::provider::ToolDefinition>,
    handlers: HashMap<String, fn(&serde_json::Value) -> ToolCallResult>,
    change_tx: broadcast::Sender<ToolRegistryChange>,
}

impl FakeToolRegistry {
    pub fn new(
        tools: Vec<crate::provider::ToolDefinition>,
        handlers: HashMap<String, fn(&serde_json::Value) -> ToolCallResult>,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(8);
        Self {
            tools,
            handlers,
            change_tx: tx,
        }
    }
}

#[async_trait]
impl ToolRegistry for FakeToolRegistry {
    fn list(&self) -> Vec<crate::provider::ToolDefinition> {
        self.tools.clone()
    }

    async fn execute(&self, _ctx: CancellationToken, call: ToolCallRequest) -> ToolCallResult {
        if let Some(handler) = self.handlers.get(&call.name) {
            let mut result = handler(&call.input);
            result.tool_call_id = call.id;
            result
        } else {
            ToolCallResult {
                tool_call_id: call.id,
                content: format!("unknown tool: {}", call.name),
                is_error: true,
                origin: ToolOrigin::System,
                image_url: None,
            }
        }
    }

    fn set_policy(&self, _policy: Box<dyn FencePolicy>) {}

    fn on_change(&self) -> broadcast::Receiver<ToolRegistryChange> {
        self.change_tx.subscribe()
    }
}

/// A permissive `FencePolicy` that treats everything as `App` origin,
/// web-like — suitable for forcing fence wrapping in an injection test.
pub struct AlwaysWebLikePolicy;

impl FencePolicy for AlwaysWebLikePolicy {
    fn origin_of(&self, _tool_name: &str) -> ToolOrigin {
        ToolOrigin::App
    }
    fn is_web_like(&self, _tool_name: &str) -> bool {
        true
    }
}

/// A policy that never triggers fencing — useful for scenarios where
/// fencing would otherwise add noise to the assertions.
pub struct NeverFencePolicy;

impl FencePolicy for NeverFencePolicy {
    fn origin_of(&self, _tool_name: &str) -> ToolOrigin {
        ToolOrigin::Skill
    }
    fn is_web_like(&self, _tool_name: &str) -> bool {
        false
    }
}
