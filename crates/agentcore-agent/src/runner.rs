use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use agentcore_core::config::{AgentCoreConfig, CHARS_PER_TOKEN};
use agentcore_core::error::CoreError;
use agentcore_memory::MemoryStore;
use agentcore_sessions::types::{
    Message, Role, Session, SessionKey, Summary, ToolCall as StoredToolCall, ToolResultEntry,
};
use agentcore_sessions::{NewMessage, SessionStore};

use crate::bridge::{BridgeContext, ContextBridge};
use crate::compact::{self, CompactionPlan};
use crate::fence::{self, FingerprintGenerator, FingerprintPair, ToolOrigin};
use crate::memory_pipeline::{self, IdleDebouncer};
use crate::objective::{self, NoWorkTaskList, ObjectiveUpdate, WorkTaskList};
use crate::prompt::{default_identity, PromptAssembler, StaticPromptInput, WorkspaceLoader};
use crate::provider::{ChatRequest, Provider, ProviderError};
use crate::quarantine::{QuarantineStore, QuarantinedTurn};
use crate::selector::{
    self, FuzzyMatcher, ModelOverride, ModelSelector, ProviderHealth, SubstringFuzzyMatcher,
};
use crate::stream::StreamEvent;
use crate::threshold::{self, Thresholds};
use crate::tool_registry::{FencePolicy, ToolCallRequest, ToolRegistry};
use crate::window;

/// How many trailing messages are pulled from the store each iteration
/// before the sliding window narrows them down further.
const HISTORY_FETCH_LIMIT: usize = 5_000;
/// Cap on the ranked memory snapshot fed into the static prompt (spec §4.1).
const MEMORY_SNAPSHOT_CAP: usize = 50;
/// Default max_tokens handed to providers; adapters that care about output
/// budget beyond this can override per-request once that seam exists.
const DEFAULT_MAX_TOKENS: u32 = 4_096;
const PROMPT_OVERHEAD_BASE: u64 = 4_000;

/// The surface a run originated from — threaded through so tool dispatch
/// and fencing can make origin-aware decisions (spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunChannel {
    Web,
    Cli,
    Telegram,
    Discord,
    Slack,
}

/// One user turn to drive to completion (spec §6.1 — `Run(context, req)`).
pub struct RunRequest {
    pub session_key: SessionKey,
    pub prompt: String,
    pub user_id: String,
    pub origin: ToolOrigin,
    pub channel: RunChannel,
    /// Explicit `"provider/model"` override for this run, if any.
    pub model_override: Option<String>,
    /// Replaces the assembled static prompt outright, if set — used by
    /// adapters that build their own system prompt (spec §6.1).
    pub system_override: Option<String>,
    /// Skip objective detection and idle memory extraction for this turn
    /// (e.g. synthetic/system-generated turns).
    pub skip_memory_extract: bool,
}

/// Static, rarely-changing inputs to the prompt assembler (spec §4.1), set
/// once at construction and reused across every run.
#[derive(Clone, Default)]
pub struct RunnerIdentity {
    pub identity: Option<String>,
    pub user_profile: Option<String>,
    pub agent_rules: Option<String>,
    pub tool_notes: Option<String>,
    pub workspace_dir: Option<PathBuf>,
    pub skill_hints: Option<String>,
    pub active_skill_content: Option<String>,
    pub app_catalog: Option<String>,
}

/// Outcome of processing one provider stream, deciding what the iteration
/// loop does next (spec §4.9).
enum NextStep {
    /// Loop again, counted against the iteration budget.
    ContinueCounted,
    /// Loop again without consuming an iteration (transient backoff/retry).
    ContinueUncounted,
    /// The run is over; `Done` has already been sent.
    Exit,
}

/// Per-run scratch state, reset at the start of every `Run` call (spec §4.9).
struct RunState {
    run_start_id: i64,
    thresholds: Option<Thresholds>,
    prompt_overhead: Option<u64>,
    last_input_tokens: Option<u64>,
    empty_reply_retried: bool,
    nudge_used: bool,
    compacted_this_run: bool,
    flush_done: bool,
    flush_cycle: u32,
    fences: FingerprintGenerator,
    active_fences: Vec<(String, FingerprintPair)>,
    static_prompt: Option<String>,
    read_paths: Vec<String>,
}

/// Session-keyed guard against overlapping background detections, distinct
/// from the idle-extraction debouncer's own in-flight map (spec §5 —
/// "memory extraction and objective detection are each guarded by their own
/// session-keyed in-flight map").
#[derive(Default)]
struct OverlapGuard(DashMap<String, Arc<AsyncMutex<()>>>);

impl OverlapGuard {
    fn try_acquire(&self, key: &str) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }
}

/// Drives every user turn to completion (spec §4.9, §6.1). Owns the
/// provider pool, the narrow session/memory/tool-registry seams, and the
/// bookkeeping shared across iterations and runs: provider health, the
/// quarantine ring, the MCP context bridge, and the idle extraction timer.
pub struct Runner {
    providers: Vec<Box<dyn Provider>>,
    session_store: Arc<dyn SessionStore>,
    memory_store: Arc<dyn MemoryStore>,
    tool_registry: Arc<dyn ToolRegistry>,
    fence_policy: Box<dyn FencePolicy>,
    config: AgentCoreConfig,
    identity: RunnerIdentity,
    model_aliases: HashMap<String, ModelOverride>,
    health: ProviderHealth,
    quarantine: QuarantineStore,
    bridge: ContextBridge,
    idle: IdleDebouncer,
    objective_guard: OverlapGuard,
    compaction_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    model_selector: AsyncMutex<Option<Box<dyn ModelSelector>>>,
    fuzzy_matcher: AsyncMutex<Box<dyn FuzzyMatcher>>,
    sticky_switch: StdMutex<HashMap<String, ModelOverride>>,
    work_tasks: Box<dyn WorkTaskList>,
}

impl Runner {
    pub fn new(
        providers: Vec<Box<dyn Provider>>,
        session_store: Arc<dyn SessionStore>,
        memory_store: Arc<dyn MemoryStore>,
        tool_registry: Arc<dyn ToolRegistry>,
        fence_policy: Box<dyn FencePolicy>,
        config: AgentCoreConfig,
        identity: RunnerIdentity,
    ) -> Self {
        let quarantine_capacity = config.fence.quarantine_capacity;
        Self {
            providers,
            session_store,
            memory_store,
            tool_registry,
            fence_policy,
            config,
            identity,
            model_aliases: HashMap::new(),
            health: ProviderHealth::new(),
            quarantine: QuarantineStore::new(quarantine_capacity),
            bridge: ContextBridge::new(),
            idle: IdleDebouncer::new(),
            objective_guard: OverlapGuard::default(),
            compaction_locks: DashMap::new(),
            model_selector: AsyncMutex::new(None),
            fuzzy_matcher: AsyncMutex::new(Box::new(SubstringFuzzyMatcher)),
            sticky_switch: StdMutex::new(HashMap::new()),
            work_tasks: Box::new(NoWorkTaskList),
        }
    }

    /// Register `"alias" -> provider/model"` phrases recognized in the
    /// user's last message (spec §4.8 — "fuzzy matcher ... known aliases").
    pub fn with_model_aliases(mut self, aliases: HashMap<String, ModelOverride>) -> Self {
        self.model_aliases = aliases;
        self
    }

    /// Install a work-task-list collaborator, cleared on every `Set`/`Clear`
    /// objective transition (spec §4.7).
    pub fn with_work_tasks(mut self, work_tasks: Box<dyn WorkTaskList>) -> Self {
        self.work_tasks = work_tasks;
        self
    }

    /// Administrative setter: install a pluggable model-selection strategy
    /// (spec §6.1 — `SetModelSelector`).
    pub async fn set_model_selector(&self, selector: Box<dyn ModelSelector>) {
        *self.model_selector.lock().await = Some(selector);
    }

    /// Administrative setter: swap the fuzzy matcher used for model-switch
    /// phrases (spec §6.1 — `SetFuzzyMatcher`).
    pub async fn set_fuzzy_matcher(&self, matcher: Box<dyn FuzzyMatcher>) {
        *self.fuzzy_matcher.lock().await = matcher;
    }

    pub fn quarantine(&self) -> &QuarantineStore {
        &self.quarantine
    }

    /// Start one run. Synchronous per spec §6.1: `no_providers_configured`
    /// is surfaced immediately rather than via the event stream, since no
    /// stream can usefully exist without at least one provider.
    pub fn run(
        self: &Arc<Self>,
        request: RunRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, CoreError> {
        if self.providers.is_empty() {
            return Err(CoreError::NoProvidersConfigured);
        }
        let (tx, rx) = mpsc::channel(100);
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.drive(request, tx).await;
        });
        Ok(rx)
    }

    #[instrument(skip(self, request, tx), fields(session_key = %request.session_key))]
    async fn drive(self: Arc<Self>, request: RunRequest, tx: mpsc::Sender<StreamEvent>) {
        let session = match self.session_store.get_or_create(&request.session_key).await {
            Ok(s) => s,
            Err(err) => {
                let _ = tx.send(StreamEvent::error(err.to_string())).await;
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        };
        let session_id = session.id.clone();

        let user_tokens = (request.prompt.len() as u64) / CHARS_PER_TOKEN;
        let user_message = match self
            .session_store
            .append_message(
                &session_id,
                NewMessage {
                    role: Role::User,
                    content: request.prompt.clone(),
                    tool_calls: None,
                    tool_results: None,
                },
                user_tokens,
                "",
            )
            .await
        {
            Ok(m) => m,
            Err(err) => {
                let _ = tx.send(StreamEvent::error(err.to_string())).await;
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        };

        if !request.skip_memory_extract && request.prompt.chars().count() >= objective::MIN_PROMPT_CHARS {
            self.spawn_objective_detection(
                session_id.clone(),
                session.active_task.clone(),
                request.prompt.clone(),
            );
        }

        let mut state = RunState {
            run_start_id: user_message.id,
            thresholds: None,
            prompt_overhead: None,
            last_input_tokens: None,
            empty_reply_retried: false,
            nudge_used: false,
            compacted_this_run: false,
            flush_done: false,
            flush_cycle: session.memory_flush_compaction_count + 1,
            fences: FingerprintGenerator::new(),
            active_fences: Vec::new(),
            static_prompt: None,
            read_paths: Vec::new(),
        };

        let max_iterations = self.config.runner.max_iterations.max(1);
        let mut iteration: u32 = 0;

        loop {
            if iteration >= max_iterations {
                let _ = tx
                    .send(StreamEvent::error(format!(
                        "reached the iteration budget of {max_iterations} without a final answer"
                    )))
                    .await;
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }

            let session = match self.session_store.get(&session_id).await {
                Ok(Some(s)) => s,
                _ => {
                    let _ = tx.send(StreamEvent::error("session disappeared mid-run")).await;
                    let _ = tx.send(StreamEvent::Done).await;
                    return;
                }
            };
            let messages = self
                .session_store
                .get_messages(&session_id, HISTORY_FETCH_LIMIT)
                .await
                .unwrap_or_default();
            let window_selection = window::select_window(&messages, state.run_start_id, &self.config.window);
            let estimate = window::estimate_session_tokens(&window_selection.messages);

            if state.static_prompt.is_none() {
                state.static_prompt = Some(self.build_static_prompt(&request).await);
            }
            let static_prompt = state.static_prompt.clone().unwrap_or_default();

            if state.prompt_overhead.is_none() {
                let tool_defs = self.tool_registry.list();
                let tool_chars: usize = tool_defs
                    .iter()
                    .map(|t| t.name.len() + t.description.len() + t.input_schema.to_string().len())
                    .sum();
                state.prompt_overhead = Some(
                    (static_prompt.len() as u64 + tool_chars as u64) / CHARS_PER_TOKEN + PROMPT_OVERHEAD_BASE,
                );
            }

            if request.model_override.is_none() {
                if let Some(alias_override) = self.match_switch_phrase(&request.prompt).await {
                    self.sticky_switch
                        .lock()
                        .unwrap()
                        .insert(session_id.clone(), alias_override);
                }
            }
            let explicit_override = request
                .model_override
                .as_deref()
                .and_then(selector::parse_model_override);
            let sticky_override = self.sticky_switch.lock().unwrap().get(&session_id).cloned();

            let selection = {
                let guard = self.model_selector.lock().await;
                selector::select(
                    &self.providers,
                    &self.health,
                    explicit_override.as_ref(),
                    guard.as_deref(),
                    &window_selection.messages,
                    sticky_override.as_ref(),
                    false,
                )
                .await
            };
            let Some(selection) = selection else {
                let _ = tx.send(StreamEvent::error("no providers currently available")).await;
                let _ = tx.send(StreamEvent::Done).await;
                return;
            };

            if state.thresholds.is_none() {
                let ctx_window = selection.provider.context_window(&selection.model);
                state.thresholds = Some(threshold::compute(ctx_window, state.prompt_overhead));
            }
            let thresholds = state.thresholds.expect("computed above");

            if !state.flush_done
                && memory_pipeline::should_pre_compaction_flush(
                    estimate,
                    thresholds.auto_compact,
                    self.config.memory.pre_compaction_flush_fraction,
                )
            {
                if self
                    .session_store
                    .should_run_memory_flush(&session_id, state.flush_cycle)
                    .await
                    .unwrap_or(true)
                {
                    let flush_timeout = Duration::from_secs(self.config.memory.extraction_timeout_secs);
                    memory_pipeline::run_extraction(
                        &self.providers,
                        flush_timeout,
                        &window_selection.messages,
                        &request.user_id,
                        self.memory_store.as_ref(),
                    )
                    .await;
                    let _ = self
                        .session_store
                        .record_memory_flush(&session_id, state.flush_cycle)
                        .await;
                }
                state.flush_done = true;
            }

            if estimate > thresholds.auto_compact {
                self.run_compaction(
                    &session_id,
                    &session,
                    &messages,
                    thresholds.auto_compact,
                    state.compacted_this_run,
                    state.run_start_id,
                )
                .await;
                state.compacted_this_run = true;
                if !state.read_paths.is_empty() {
                    let listing = format!("Files read earlier this run: {}", state.read_paths.join(", "));
                    let _ = self
                        .session_store
                        .append_message(
                            &session_id,
                            NewMessage {
                                role: Role::User,
                                content: listing,
                                tool_calls: None,
                                tool_results: None,
                            },
                            0,
                            "",
                        )
                        .await;
                }
                continue;
            }

            let mut outbound_messages = Vec::new();
            if window_selection.evicted {
                if let Some(summary) = session.summary.clone().filter(|s| !s.is_empty()) {
                    outbound_messages.push(synthetic_rolling_message(&session_id, &summary));
                }
            }
            outbound_messages.extend(window_selection.messages.clone());

            let dynamic = PromptAssembler::build_dynamic(
                chrono::Utc::now(),
                "UTC",
                selection.provider.id(),
                &selection.model,
                session.active_task.as_deref(),
                session.summary.as_deref(),
            );

            let record = format!(
                "{static_prompt}\n{dynamic}\n{}",
                outbound_messages
                    .iter()
                    .map(message_verification_text)
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            let active_pairs: Vec<FingerprintPair> = state
                .active_fences
                .iter()
                .filter(|(id, _)| {
                    outbound_messages.iter().any(|m| {
                        m.tool_results
                            .as_ref()
                            .map(|rs| rs.iter().any(|r| &r.tool_call_id == id))
                            .unwrap_or(false)
                    })
                })
                .map(|(_, pair)| *pair)
                .collect();

            let verify_result = fence::verify(&record, &active_pairs);
            if !verify_result.ok() {
                let reason = verify_result
                    .violations
                    .first()
                    .map(|v| format!("{:?}", v.reason))
                    .unwrap_or_else(|| "unknown".to_string());
                self.quarantine.insert(QuarantinedTurn {
                    session_id: session_id.clone(),
                    record: record.clone(),
                    reason,
                });
                let placeholder = "[Response quarantined: integrity check failed]";
                let _ = self
                    .session_store
                    .append_message(
                        &session_id,
                        NewMessage {
                            role: Role::Assistant,
                            content: placeholder.to_string(),
                            tool_calls: None,
                            tool_results: None,
                        },
                        0,
                        &selection.model,
                    )
                    .await;
                let _ = tx
                    .send(StreamEvent::error(
                        "Your request was blocked by an integrity check and could not be sent.",
                    ))
                    .await;
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }

            let stripped_messages: Vec<Message> = outbound_messages
                .iter()
                .map(|m| {
                    let mut m2 = m.clone();
                    m2.content = fence::strip_fence_markers(&m2.content);
                    if let Some(tool_results) = &mut m2.tool_results {
                        for r in tool_results.iter_mut() {
                            r.content = fence::strip_fence_markers(&r.content);
                        }
                    }
                    m2
                })
                .collect();

            let req = ChatRequest {
                model: selection.model.clone(),
                static_system: static_prompt.clone(),
                system: dynamic,
                messages: stripped_messages,
                tools: self.tool_registry.list(),
                enable_thinking: selection.enable_thinking,
                max_tokens: DEFAULT_MAX_TOKENS,
            };

            let cancel = CancellationToken::new();
            match selection.provider.stream(cancel, req).await {
                Ok(rx_stream) => {
                    match self
                        .handle_stream(rx_stream, &selection, &session_id, &session, &request, &tx, &mut state)
                        .await
                    {
                        NextStep::ContinueCounted => iteration += 1,
                        NextStep::ContinueUncounted => {}
                        NextStep::Exit => return,
                    }
                }
                Err(err) => match err {
                    ProviderError::ContextOverflow => {
                        self.run_compaction(
                            &session_id,
                            &session,
                            &messages,
                            thresholds.auto_compact,
                            state.compacted_this_run,
                            state.run_start_id,
                        )
                        .await;
                        state.compacted_this_run = true;
                    }
                    ProviderError::RateLimited { .. } | ProviderError::AuthFailure(_) => {
                        self.health
                            .mark_failed(selection.provider.profile_id(), err.classify(), &err.to_string());
                        iteration += 1;
                    }
                    ProviderError::RoleOrdering(_) => {
                        iteration += 1;
                    }
                    ProviderError::Transient(_) | ProviderError::Http(_) | ProviderError::Unavailable(_) => {
                        tokio::time::sleep(Duration::from_secs(self.config.runner.transient_backoff_secs)).await;
                    }
                    ProviderError::Cancelled => {
                        let _ = tx.send(StreamEvent::Done).await;
                        return;
                    }
                    ProviderError::QuotaExhausted => {
                        let _ = tx
                            .send(StreamEvent::error(
                                "You've reached your usage limit for this plan. Please upgrade to continue.",
                            ))
                            .await;
                        let _ = tx.send(StreamEvent::Done).await;
                        return;
                    }
                    ProviderError::Api { .. } | ProviderError::Parse(_) => {
                        let _ = tx.send(StreamEvent::error(err.to_string())).await;
                        let _ = tx.send(StreamEvent::Done).await;
                        return;
                    }
                },
            }
        }
    }

    /// Consume one provider stream to completion: forward events, persist
    /// the resulting message(s), and decide the iteration's outcome (spec
    /// §4.9). The channel closing (`recv` returning `None`) marks the end
    /// of this provider call — a mid-script `StreamEvent::Done` is treated
    /// the same way, never forwarded as the run's own terminal event.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, rx, selection, session, request, tx, state), fields(session_id = %session_id))]
    async fn handle_stream(
        &self,
        mut rx: mpsc::Receiver<StreamEvent>,
        selection: &selector::Selection<'_>,
        session_id: &str,
        session: &Session,
        request: &RunRequest,
        tx: &mpsc::Sender<StreamEvent>,
        state: &mut RunState,
    ) -> NextStep {
        let mut text_buf = String::new();
        let mut pending_calls: Vec<(String, String, serde_json::Value)> = Vec::new();
        let mut saw_message: Option<Message> = None;
        let mut mid_stream_error = false;

        loop {
            let Some(event) = rx.recv().await else { break };
            match event {
                StreamEvent::Text { text } => {
                    text_buf.push_str(&text);
                    let _ = tx.send(StreamEvent::Text { text }).await;
                }
                StreamEvent::ToolCall { id, name, input } => {
                    let _ = tx
                        .send(StreamEvent::ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        })
                        .await;
                    pending_calls.push((id, name, input));
                }
                StreamEvent::ToolResult {
                    tool_call_id,
                    content,
                    image_url,
                } => {
                    let _ = tx
                        .send(StreamEvent::ToolResult {
                            tool_call_id,
                            content,
                            image_url,
                        })
                        .await;
                }
                StreamEvent::Message { message } => {
                    let _ = tx.send(StreamEvent::Message { message: message.clone() }).await;
                    saw_message = Some(*message);
                }
                StreamEvent::Usage { input_tokens } => {
                    state.last_input_tokens = Some(input_tokens);
                    let _ = tx.send(StreamEvent::Usage { input_tokens }).await;
                }
                StreamEvent::Error { .. } => {
                    mid_stream_error = true;
                    break;
                }
                StreamEvent::Done => break,
            }
        }

        if mid_stream_error {
            tokio::time::sleep(Duration::from_secs(self.config.runner.transient_backoff_secs)).await;
            return NextStep::ContinueUncounted;
        }

        if !pending_calls.is_empty() && !selection.provider.handles_tools() {
            return self
                .dispatch_tool_calls(pending_calls, text_buf, selection, session_id, session, request, tx, state)
                .await;
        }

        let final_text = if !text_buf.is_empty() {
            text_buf
        } else if let Some(m) = saw_message {
            m.content
        } else {
            String::new()
        };

        if final_text.trim().is_empty() {
            if !state.empty_reply_retried {
                state.empty_reply_retried = true;
                return NextStep::ContinueCounted;
            }
            let friendly = "I didn't catch a usable response there — could you try rephrasing?";
            let _ = self
                .session_store
                .append_message(
                    session_id,
                    NewMessage {
                        role: Role::Assistant,
                        content: friendly.to_string(),
                        tool_calls: None,
                        tool_results: None,
                    },
                    0,
                    &selection.model,
                )
                .await;
            let _ = tx.send(StreamEvent::text(friendly)).await;
            self.health.mark_success(selection.provider.profile_id());
            self.schedule_idle_extraction(session_id.to_string(), request.user_id.clone());
            let _ = tx.send(StreamEvent::Done).await;
            return NextStep::Exit;
        }

        let stripped = fence::strip_fence_markers(&final_text);
        let tokens = state
            .last_input_tokens
            .unwrap_or_else(|| (stripped.len() as u64) / CHARS_PER_TOKEN);
        let _ = self
            .session_store
            .append_message(
                session_id,
                NewMessage {
                    role: Role::Assistant,
                    content: stripped,
                    tool_calls: None,
                    tool_results: None,
                },
                tokens,
                &selection.model,
            )
            .await;
        self.health.mark_success(selection.provider.profile_id());

        if session.active_task.is_some() && !state.nudge_used {
            state.nudge_used = true;
            return NextStep::ContinueCounted;
        }

        self.schedule_idle_extraction(session_id.to_string(), request.user_id.clone());
        let _ = tx.send(StreamEvent::Done).await;
        NextStep::Exit
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, pending_calls, text_buf, selection, session, request, tx, state), fields(session_id = %session_id))]
    async fn dispatch_tool_calls(
        &self,
        pending_calls: Vec<(String, String, serde_json::Value)>,
        text_buf: String,
        selection: &selector::Selection<'_>,
        session_id: &str,
        session: &Session,
        request: &RunRequest,
        tx: &mpsc::Sender<StreamEvent>,
        state: &mut RunState,
    ) -> NextStep {
        let mut stored_calls = Vec::new();
        let mut valid_calls = Vec::new();
        for (id, name, input) in pending_calls {
            if input.is_object() {
                stored_calls.push(StoredToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                valid_calls.push((id, name, input));
            } else {
                warn!(tool_call_id = %id, "dropping tool call with invalid input JSON");
            }
        }

        let assistant_tokens = (text_buf.len() as u64) / CHARS_PER_TOKEN;
        let _ = self
            .session_store
            .append_message(
                session_id,
                NewMessage {
                    role: Role::Assistant,
                    content: fence::strip_fence_markers(&text_buf),
                    tool_calls: if stored_calls.is_empty() { None } else { Some(stored_calls) },
                    tool_results: None,
                },
                assistant_tokens,
                &selection.model,
            )
            .await;

        let mut result_entries = Vec::new();
        for (id, name, input) in valid_calls {
            self.bridge
                .set(BridgeContext {
                    session_key: session.key.clone(),
                    origin: request.origin,
                })
                .await;
            let call_timeout = Duration::from_secs(self.config.runner.tool_timeout_secs);
            let outcome = tokio::time::timeout(
                call_timeout,
                self.tool_registry.execute(
                    CancellationToken::new(),
                    ToolCallRequest {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                ),
            )
            .await;
            self.bridge.clear().await;

            let (content, is_error, origin, image_url) = match outcome {
                Ok(result) => (result.content, result.is_error, result.origin, result.image_url),
                Err(_) => (format!("tool '{name}' timed out"), true, ToolOrigin::System, None),
            };

            let is_web_like = self.fence_policy.is_web_like(&name);
            let wrapped = if fence::should_wrap(origin, is_web_like) {
                let pair = state.fences.generate();
                state.active_fences.push((id.clone(), pair));
                fence::wrap(pair, fence::default_guide_header(), &content)
            } else {
                content
            };

            let _ = tx
                .send(StreamEvent::ToolResult {
                    tool_call_id: id.clone(),
                    content: fence::strip_fence_markers(&wrapped),
                    image_url: image_url.clone(),
                })
                .await;

            if name.contains("read") || name == "file" {
                if let Some(path) = input.get("path").and_then(|p| p.as_str()) {
                    state.read_paths.push(path.to_string());
                }
            }

            result_entries.push(ToolResultEntry {
                tool_call_id: id,
                content: wrapped,
                is_error,
            });
        }

        if !result_entries.is_empty() {
            let _ = self
                .session_store
                .append_message(
                    session_id,
                    NewMessage {
                        role: Role::Tool,
                        content: String::new(),
                        tool_calls: None,
                        tool_results: Some(result_entries),
                    },
                    0,
                    &selection.model,
                )
                .await;
        }

        NextStep::ContinueCounted
    }

    /// Run one compaction cycle under a per-session lock (spec §4.4),
    /// persisting the new tiered summary, the last-summarized watermark,
    /// any pinned active task, and trimming the stored history.
    #[instrument(skip(self, session, messages), fields(session_id = %session_id, auto_compact_tokens, run_start_id))]
    async fn run_compaction(
        &self,
        session_id: &str,
        session: &Session,
        messages: &[Message],
        auto_compact_tokens: u64,
        retry_after_overflow: bool,
        run_start_id: i64,
    ) {
        let lock = self
            .compaction_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let previous_summary = Summary::parse(session.summary.as_deref().unwrap_or(""));
        let Some(selection) = selector::select(&self.providers, &self.health, None, None, messages, None, false).await
        else {
            return;
        };

        let plan: CompactionPlan =
            compact::compact(selection.provider, &previous_summary, messages, auto_compact_tokens, retry_after_overflow)
                .await;

        let rendered = plan.summary.render();
        let _ = self.session_store.update_summary(session_id, &rendered).await;
        let _ = self
            .session_store
            .set_last_summarized_count(session_id, messages.len() as u32)
            .await;
        if let Some(task) = plan.pinned_active_task {
            let _ = self.session_store.set_active_task(session_id, &task).await;
        }
        let _ = self
            .session_store
            .compact(session_id, &rendered, plan.keep_last_k, run_start_id)
            .await;
    }

    async fn build_static_prompt(&self, request: &RunRequest) -> String {
        if let Some(override_prompt) = &request.system_override {
            return override_prompt.clone();
        }

        let identity = self
            .identity
            .identity
            .clone()
            .or_else(|| self.identity.workspace_dir.as_deref().and_then(WorkspaceLoader::load))
            .unwrap_or_else(default_identity);

        let memories = self
            .memory_store
            .ranked_snapshot(&request.user_id, MEMORY_SNAPSHOT_CAP)
            .await
            .unwrap_or_default();
        let tools = self.tool_registry.list();
        let mut aliases: Vec<String> = self.model_aliases.keys().cloned().collect();
        aliases.sort();

        let input = StaticPromptInput {
            identity: &identity,
            memories: &memories,
            injection_min_confidence: self.config.memory.injection_min_confidence,
            user_profile: self.identity.user_profile.as_deref(),
            agent_rules: self.identity.agent_rules.as_deref(),
            tool_notes: self.identity.tool_notes.as_deref(),
            tools: &tools,
            skill_hints: self.identity.skill_hints.as_deref(),
            active_skill_content: self.identity.active_skill_content.as_deref(),
            app_catalog: self.identity.app_catalog.as_deref(),
            model_switch_aliases: if aliases.is_empty() { None } else { Some(aliases.as_slice()) },
        };

        PromptAssembler::build_static(&input)
    }

    async fn match_switch_phrase(&self, text: &str) -> Option<ModelOverride> {
        if self.model_aliases.is_empty() {
            return None;
        }
        let aliases: Vec<String> = self.model_aliases.keys().cloned().collect();
        let matcher = self.fuzzy_matcher.lock().await;
        let matched = matcher.match_phrase(text, &aliases)?;
        self.model_aliases.get(&matched).cloned()
    }

    fn spawn_objective_detection(self: &Arc<Self>, session_id: String, current_objective: Option<String>, message: String) {
        if self.providers.is_empty() {
            return;
        }
        let Some(guard) = self.objective_guard.try_acquire(&session_id) else {
            return;
        };
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let Some(selection) =
                selector::select(&runner.providers, &runner.health, None, None, &[], None, false).await
            else {
                return;
            };
            let Some(update) = objective::classify(selection.provider, current_objective.as_deref(), &message).await
            else {
                return;
            };
            match objective::apply(&update, &session_id, runner.work_tasks.as_ref()).await {
                Some(new_task) => {
                    let _ = runner.session_store.set_active_task(&session_id, &new_task).await;
                }
                None => {
                    if matches!(update, ObjectiveUpdate::Clear) {
                        let _ = runner.session_store.clear_active_task(&session_id).await;
                    }
                }
            }
        });
    }

    fn schedule_idle_extraction(self: &Arc<Self>, session_id: String, user_id: String) {
        if self.providers.is_empty() {
            return;
        }
        let token = self.idle.schedule(&session_id);
        let runner = Arc::clone(self);
        let debounce = Duration::from_secs(runner.config.memory.idle_debounce_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(debounce) => {
                    let Some(_guard) = runner.idle.try_acquire(&session_id) else { return; };
                    let messages = runner
                        .session_store
                        .get_messages(&session_id, runner.config.memory.idle_extract_messages)
                        .await
                        .unwrap_or_default();
                    if messages.is_empty() {
                        return;
                    }
                    let extract_timeout = Duration::from_secs(runner.config.memory.extraction_timeout_secs);
                    memory_pipeline::run_extraction(
                        &runner.providers,
                        extract_timeout,
                        &messages,
                        &user_id,
                        runner.memory_store.as_ref(),
                    )
                    .await;
                }
            }
        });
    }
}

/// Text considered for fence verification: a tool message's own fence
/// markers live in `tool_results[].content`, not `.content` (which is left
/// empty for those messages), so the record has to look there too.
fn message_verification_text(m: &Message) -> String {
    let mut parts = vec![m.content.clone()];
    if let Some(tool_calls) = &m.tool_calls {
        parts.extend(tool_calls.iter().map(|tc| tc.input.to_string()));
    }
    if let Some(tool_results) = &m.tool_results {
        parts.extend(tool_results.iter().map(|r| r.content.clone()));
    }
    parts.join("\n")
}

fn synthetic_rolling_message(session_id: &str, summary: &str) -> Message {
    Message {
        id: -1,
        session_id: session_id.to_string(),
        role: Role::User,
        content: format!("{}\n\n{summary}", window::ROLLING_CONTEXT_LABEL),
        tool_calls: None,
        tool_results: None,
        created_at: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        AlwaysFailProvider, AlwaysWebLikePolicy, FakeToolRegistry, InMemoryMemoryStore, InMemorySessionStore,
        NeverFencePolicy, ScriptedProvider,
    };
    use crate::tool_registry::ToolCallResult;

    fn base_request(session_key: SessionKey, prompt: &str) -> RunRequest {
        RunRequest {
            session_key,
            prompt: prompt.to_string(),
            user_id: "u1".to_string(),
            origin: ToolOrigin::User,
            channel: RunChannel::Cli,
            model_override: None,
            system_override: None,
            skip_memory_extract: true,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, StreamEvent::Done);
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn make_runner(
        provider: Box<dyn Provider>,
        tools: FakeToolRegistry,
        policy: Box<dyn FencePolicy>,
    ) -> Arc<Runner> {
        Arc::new(Runner::new(
            vec![provider],
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryMemoryStore::new()),
            Arc::new(tools),
            policy,
            AgentCoreConfig::default(),
            RunnerIdentity::default(),
        ))
    }

    fn empty_tools() -> FakeToolRegistry {
        FakeToolRegistry::new(vec![], HashMap::new())
    }

    /// A session store that tampers with any stored fence marker, standing
    /// in for an attacker (or storage-layer bug) altering a tool result
    /// after it was wrapped but before the next turn rereads it.
    struct CorruptingSessionStore {
        inner: InMemorySessionStore,
    }

    fn corrupt_fence_marker(content: &str) -> String {
        if let Some(start) = content.find("$$FENCE_A_") {
            let digit_start = start + "$$FENCE_A_".len();
            if let Some(end_rel) = content[digit_start..].find("$$") {
                let end = digit_start + end_rel;
                let mut corrupted = content.to_string();
                corrupted.replace_range(digit_start..end, "99999");
                return corrupted;
            }
        }
        content.to_string()
    }

    #[async_trait::async_trait]
    impl SessionStore for CorruptingSessionStore {
        async fn get_or_create(&self, key: &SessionKey) -> agentcore_sessions::error::Result<Session> {
            self.inner.get_or_create(key).await
        }
        async fn get(&self, session_id: &str) -> agentcore_sessions::error::Result<Option<Session>> {
            self.inner.get(session_id).await
        }
        async fn list_for_user(&self, user_id: &str, limit: usize) -> agentcore_sessions::error::Result<Vec<Session>> {
            self.inner.list_for_user(user_id, limit).await
        }
        async fn append_message(
            &self,
            session_id: &str,
            mut message: NewMessage,
            tokens: u64,
            model: &str,
        ) -> agentcore_sessions::error::Result<Message> {
            if let Some(results) = &mut message.tool_results {
                for r in results.iter_mut() {
                    r.content = corrupt_fence_marker(&r.content);
                }
            }
            self.inner.append_message(session_id, message, tokens, model).await
        }
        async fn get_messages(&self, session_id: &str, limit: usize) -> agentcore_sessions::error::Result<Vec<Message>> {
            self.inner.get_messages(session_id, limit).await
        }
        async fn compact(
            &self,
            session_id: &str,
            summary: &str,
            keep_last_k: usize,
            run_start_id: i64,
        ) -> agentcore_sessions::error::Result<()> {
            self.inner.compact(session_id, summary, keep_last_k, run_start_id).await
        }
        async fn get_summary(&self, session_id: &str) -> agentcore_sessions::error::Result<Option<String>> {
            self.inner.get_summary(session_id).await
        }
        async fn update_summary(&self, session_id: &str, summary: &str) -> agentcore_sessions::error::Result<()> {
            self.inner.update_summary(session_id, summary).await
        }
        async fn get_active_task(&self, session_id: &str) -> agentcore_sessions::error::Result<Option<String>> {
            self.inner.get_active_task(session_id).await
        }
        async fn set_active_task(&self, session_id: &str, task: &str) -> agentcore_sessions::error::Result<()> {
            self.inner.set_active_task(session_id, task).await
        }
        async fn clear_active_task(&self, session_id: &str) -> agentcore_sessions::error::Result<()> {
            self.inner.clear_active_task(session_id).await
        }
        async fn get_last_summarized_count(&self, session_id: &str) -> agentcore_sessions::error::Result<u32> {
            self.inner.get_last_summarized_count(session_id).await
        }
        async fn set_last_summarized_count(&self, session_id: &str, count: u32) -> agentcore_sessions::error::Result<()> {
            self.inner.set_last_summarized_count(session_id, count).await
        }
        async fn should_run_memory_flush(&self, session_id: &str, compaction_count: u32) -> agentcore_sessions::error::Result<bool> {
            self.inner.should_run_memory_flush(session_id, compaction_count).await
        }
        async fn record_memory_flush(&self, session_id: &str, compaction_count: u32) -> agentcore_sessions::error::Result<()> {
            self.inner.record_memory_flush(session_id, compaction_count).await
        }
        async fn delete(&self, session_id: &str) -> agentcore_sessions::error::Result<()> {
            self.inner.delete(session_id).await
        }
    }

    fn make_runner_with_corrupting_store(
        provider: Box<dyn Provider>,
        tools: FakeToolRegistry,
        policy: Box<dyn FencePolicy>,
    ) -> Arc<Runner> {
        Arc::new(Runner::new(
            vec![provider],
            Arc::new(CorruptingSessionStore {
                inner: InMemorySessionStore::new(),
            }),
            Arc::new(InMemoryMemoryStore::new()),
            Arc::new(tools),
            policy,
            AgentCoreConfig::default(),
            RunnerIdentity::default(),
        ))
    }

    // S1 — happy path: one user row, one assistant row, exactly one Done.
    #[tokio::test]
    async fn s1_happy_path_round_trip() {
        let provider = ScriptedProvider::new(
            "p1",
            "model-a",
            vec![vec![StreamEvent::text("hello")]],
        );
        let runner = make_runner(Box::new(provider), empty_tools(), Box::new(NeverFencePolicy));

        let key = SessionKey::new("u1", "main", "main");
        let rx = runner.run(base_request(key.clone(), "hi")).unwrap();
        let events = drain(rx).await;

        assert!(matches!(events.last(), Some(StreamEvent::Done)));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { text } if text == "hello")));

        let session = runner.session_store.get_or_create(&key).await.unwrap();
        let messages = runner.session_store.get_messages(&session.id, 100).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "hello");
    }

    // S2 — tool round-trip: tool_call -> tool_result -> final text, message
    // order user / assistant(+tool_call) / tool(result) / assistant.
    #[tokio::test]
    async fn s2_tool_round_trip() {
        let provider = ScriptedProvider::new(
            "p1",
            "model-a",
            vec![
                vec![StreamEvent::ToolCall {
                    id: "call-1".to_string(),
                    name: "file".to_string(),
                    input: serde_json::json!({"action": "read", "path": "/tmp/a.txt"}),
                }],
                vec![StreamEvent::text("got X")],
            ],
        );
        let mut handlers: HashMap<String, fn(&serde_json::Value) -> ToolCallResult> = HashMap::new();
        handlers.insert("file".to_string(), |_input| ToolCallResult {
            tool_call_id: String::new(),
            content: "X".to_string(),
            is_error: false,
            origin: ToolOrigin::Skill,
            image_url: None,
        });
        let tools = FakeToolRegistry::new(
            vec![crate::provider::ToolDefinition {
                name: "file".to_string(),
                description: "read/write files".to_string(),
                input_schema: serde_json::json!({}),
            }],
            handlers,
        );

        let runner = make_runner(Box::new(provider), tools, Box::new(NeverFencePolicy));
        let key = SessionKey::new("u1", "main", "main");
        let rx = runner.run(base_request(key.clone(), "read /tmp/a.txt")).unwrap();
        let events = drain(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolResult { content, .. } if content.contains('X'))));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { text } if text == "got X")));

        let session = runner.session_store.get_or_create(&key).await.unwrap();
        let messages = runner.session_store.get_messages(&session.id, 100).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].tool_calls.is_some());
        assert_eq!(messages[2].role, Role::Tool);
        assert_eq!(messages[3].role, Role::Assistant);
        assert_eq!(messages[3].content, "got X");
    }

    // S3 — injection attempt: an altered fence marker must quarantine the
    // turn, never reach the model for iteration 2, and leave exactly one
    // quarantined entry.
    #[tokio::test]
    async fn s3_altered_fence_marker_is_quarantined() {
        let provider = ScriptedProvider::new(
            "p1",
            "model-a",
            vec![
                vec![StreamEvent::ToolCall {
                    id: "call-1".to_string(),
                    name: "fetch_url".to_string(),
                    input: serde_json::json!({"url": "http://example.com"}),
                }],
                vec![StreamEvent::text("should never be reached")],
            ],
        );
        let mut handlers: HashMap<String, fn(&serde_json::Value) -> ToolCallResult> = HashMap::new();
        handlers.insert("fetch_url".to_string(), |_input| ToolCallResult {
            tool_call_id: String::new(),
            content: "page content".to_string(),
            is_error: false,
            origin: ToolOrigin::App,
            image_url: None,
        });
        let tools = FakeToolRegistry::new(
            vec![crate::provider::ToolDefinition {
                name: "fetch_url".to_string(),
                description: "fetch a URL".to_string(),
                input_schema: serde_json::json!({}),
            }],
            handlers,
        );

        let runner = make_runner_with_corrupting_store(Box::new(provider), tools, Box::new(AlwaysWebLikePolicy));
        let key = SessionKey::new("u1", "main", "main");

        // The store tampers with the fence marker's digits the moment the
        // tool result is persisted, so the next iteration's window rebuild
        // reads back an altered marker and `fence::verify` reports it.
        let rx = runner.run(base_request(key.clone(), "fetch a page")).unwrap();
        let events = drain(rx).await;

        assert_eq!(runner.quarantine().count(), 1);
        let quarantined = runner.quarantine().recent(1).unwrap();
        assert_eq!(quarantined.reason, "Altered");
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Text { text } if text == "should never be reached")));

        let session = runner.session_store.get_or_create(&key).await.unwrap();
        let messages = runner.session_store.get_messages(&session.id, 100).await.unwrap();
        assert!(messages
            .iter()
            .any(|m| m.content.contains("Response quarantined")));
    }

    // S5 — transient failure then success: the run must retry without
    // consuming the friendly empty-reply path and eventually succeed.
    #[tokio::test]
    async fn s5_transient_then_success() {
        struct FlakyProvider {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait::async_trait]
        impl Provider for FlakyProvider {
            fn id(&self) -> &str {
                "p1"
            }
            fn profile_id(&self) -> &str {
                "p1"
            }
            fn handles_tools(&self) -> bool {
                false
            }
            async fn stream(
                &self,
                _ctx: CancellationToken,
                _req: ChatRequest,
            ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    return Err(ProviderError::Transient("connection reset".to_string()));
                }
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    let _ = tx.send(StreamEvent::text("recovered")).await;
                });
                Ok(rx)
            }
            fn default_model(&self) -> &str {
                "model-a"
            }
        }

        let runner = make_runner(
            Box::new(FlakyProvider {
                calls: std::sync::atomic::AtomicUsize::new(0),
            }),
            empty_tools(),
            Box::new(NeverFencePolicy),
        );
        let key = SessionKey::new("u1", "main", "main");
        let rx = runner.run(base_request(key, "hi")).unwrap();
        let events = drain(rx).await;

        assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { text } if text == "recovered")));
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[test]
    fn no_providers_configured_is_synchronous() {
        let runner = Arc::new(Runner::new(
            Vec::new(),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryMemoryStore::new()),
            Arc::new(empty_tools()),
            Box::new(NeverFencePolicy),
            AgentCoreConfig::default(),
            RunnerIdentity::default(),
        ));
        let key = SessionKey::new("u1", "main", "main");
        let err = runner.run(base_request(key, "hi")).unwrap_err();
        assert_eq!(err.code(), "NO_PROVIDERS_CONFIGURED");
    }

    #[tokio::test]
    async fn always_fail_auth_provider_surfaces_as_cooldown_without_user_text() {
        let provider = AlwaysFailProvider::new("p1", "model-a", || ProviderError::AuthFailure("bad key".to_string()));
        let runner = make_runner(Box::new(provider), empty_tools(), Box::new(NeverFencePolicy));
        let key = SessionKey::new("u1", "main", "main");
        let rx = runner.run(base_request(key, "hi")).unwrap();
        let events = drain(rx).await;
        // Exhausts the iteration budget silently retrying a now-cooling-down
        // provider until no provider is available, then a clean error+Done.
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    // S4 — forced compaction: a reported context overflow must trigger a
    // compaction cycle (summary call, then a normal reply) rather than
    // surfacing the overflow to the user.
    #[tokio::test]
    async fn s4_context_overflow_triggers_compaction_then_succeeds() {
        struct OverflowThenOkProvider {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait::async_trait]
        impl Provider for OverflowThenOkProvider {
            fn id(&self) -> &str {
                "p1"
            }
            fn profile_id(&self) -> &str {
                "p1"
            }
            fn handles_tools(&self) -> bool {
                false
            }
            async fn stream(
                &self,
                _ctx: CancellationToken,
                _req: ChatRequest,
            ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    return Err(ProviderError::ContextOverflow);
                }
                let text = if n == 1 {
                    "## Current Task\nShip the release\n\n## Progress\nStarted".to_string()
                } else {
                    "done after compaction".to_string()
                };
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    let _ = tx.send(StreamEvent::text(text)).await;
                });
                Ok(rx)
            }
            fn default_model(&self) -> &str {
                "model-a"
            }
        }

        let runner = make_runner(
            Box::new(OverflowThenOkProvider {
                calls: std::sync::atomic::AtomicUsize::new(0),
            }),
            empty_tools(),
            Box::new(NeverFencePolicy),
        );
        let key = SessionKey::new("u1", "main", "main");
        let rx = runner.run(base_request(key.clone(), "let's ship it")).unwrap();
        let events = drain(rx).await;

        assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { text } if text == "done after compaction")));
        assert!(matches!(events.last(), Some(StreamEvent::Done)));

        let session = runner.session_store.get_or_create(&key).await.unwrap();
        assert!(session.summary.as_deref().is_some_and(|s| !s.is_empty()));
    }

    // S6 — objective detection: a long enough prompt spawns a background
    // classification call whose result is written back as the session's
    // active task, without delaying the main reply.
    #[tokio::test]
    async fn s6_objective_detection_sets_active_task() {
        struct ObjectiveAwareProvider;
        #[async_trait::async_trait]
        impl Provider for ObjectiveAwareProvider {
            fn id(&self) -> &str {
                "p1"
            }
            fn profile_id(&self) -> &str {
                "p1"
            }
            fn handles_tools(&self) -> bool {
                false
            }
            async fn stream(
                &self,
                _ctx: CancellationToken,
                req: ChatRequest,
            ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
                let is_classification = req.messages.iter().any(|m| m.content.contains("tracking the active objective"));
                let text = if is_classification {
                    "{\"action\": \"set\", \"objective\": \"plan a trip to Paris\"}".to_string()
                } else {
                    "Sure, let's plan it!".to_string()
                };
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    let _ = tx.send(StreamEvent::text(text)).await;
                });
                Ok(rx)
            }
            fn default_model(&self) -> &str {
                "model-a"
            }
        }

        let runner = make_runner(Box::new(ObjectiveAwareProvider), empty_tools(), Box::new(NeverFencePolicy));
        let key = SessionKey::new("u1", "main", "main");
        let mut request = base_request(key.clone(), "let's plan a trip to Paris next month");
        request.skip_memory_extract = false;
        let rx = runner.run(request).unwrap();
        let events = drain(rx).await;
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { text } if text == "Sure, let's plan it!")));

        let mut active_task = None;
        for _ in 0..50 {
            let session = runner.session_store.get_or_create(&key).await.unwrap();
            if session.active_task.is_some() {
                active_task = session.active_task;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(active_task.as_deref(), Some("plan a trip to Paris"));
    }
}
