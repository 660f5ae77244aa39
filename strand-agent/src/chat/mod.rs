//! Interactive chat: an open-ended turn loop streaming [`StreamEvent`]s.
//!
//! Unlike an agent run there is no completion tool; a model turn without
//! function calls is the final answer. Dangerous tools wait on the
//! [`ApprovalBroker`], and a quota failure switches to a fallback model picked
//! by the router.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;

use strand_core::config::{Settings, StrandConfig};
use strand_core::content::{Content, FunctionCall, FunctionResponse, Part, estimate_history_tokens};
use strand_core::error::StrandError;
use strand_core::event::StreamEvent;
use strand_core::routing::RoutingContext;
use strand_core::tool_call::{ToolCall, ToolCallRequest, ToolCallState};

use crate::approval::{ApprovalBroker, ChatApprovalGate};
use crate::backends::BackendTable;
use crate::executor::parse_thought;
use crate::llm::{GenerationConfig, ModelBackend, ModelRequest, StreamChunk};
use crate::model_router::ModelRouter;
use crate::registry::ToolRegistry;
use crate::scheduler::ToolScheduler;
use crate::session::{CompressionOutcome, InMemorySessionStore, compress_history};

pub const WRITE_TODOS_TOOL_NAME: &str = "write_todos";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Services shared by every chat session of a process.
#[derive(Clone)]
pub struct ChatRuntime {
    pub backends: Arc<BackendTable>,
    pub router: Arc<ModelRouter>,
    pub registry: Arc<ToolRegistry>,
    pub store: InMemorySessionStore,
    pub broker: Arc<ApprovalBroker>,
    /// Current reloadable settings; read at the start of every turn.
    pub settings: watch::Receiver<ChatSettings>,
}

/// The part of the config chat picks up without a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSettings {
    pub dangerous_tools: Vec<String>,
    pub system_prompt: Option<String>,
    /// Explicit model choice handed to the router on a session's first message.
    pub requested_model: Option<String>,
}

impl ChatSettings {
    pub fn from_config(config: &StrandConfig) -> Self {
        Self {
            dangerous_tools: config.dangerous_tools(),
            system_prompt: config.chat.system_prompt.clone(),
            requested_model: Settings::model(config),
        }
    }

    /// A receiver pinned to these settings, for runtimes that never reload.
    pub fn fixed(self) -> watch::Receiver<ChatSettings> {
        watch::channel(self).1
    }
}

#[derive(Default)]
struct ChatState {
    model: Option<String>,
    history: Vec<Content>,
    tool_calls: u64,
    tool_errors: u64,
}

struct ChatInner {
    session_id: String,
    runtime: ChatRuntime,
    state: Mutex<ChatState>,
    always_allowed: Arc<Mutex<HashSet<String>>>,
    // One message at a time per session.
    turn: tokio::sync::Mutex<()>,
}

/// One chat session. Cheap to clone.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatInner>,
}

/// What one streamed model turn produced.
struct ModelOutput {
    parts: Vec<Part>,
    calls: Vec<FunctionCall>,
    text: String,
}

enum TurnStep {
    Continue,
    Done,
}

impl ChatService {
    /// Open `session_id`, restoring any history the store already has.
    pub async fn open(runtime: ChatRuntime, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let existing = runtime.store.load_or_create(&session_id).await;
        tracing::debug!(session_id = %session_id, turns = existing.history.len(), "chat session opened");
        Self {
            inner: Arc::new(ChatInner {
                session_id,
                runtime,
                state: Mutex::new(ChatState {
                    history: existing.history,
                    ..ChatState::default()
                }),
                always_allowed: Arc::new(Mutex::new(HashSet::new())),
                turn: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Model currently serving this session, once one has been chosen.
    pub fn model(&self) -> Option<String> {
        lock(&self.inner.state).model.clone()
    }

    pub fn history(&self) -> Vec<Content> {
        lock(&self.inner.state).history.clone()
    }

    pub async fn clear(&self) {
        let _turn = self.inner.turn.lock().await;
        lock(&self.inner.state).history.clear();
        self.save().await;
    }

    pub fn tool_call_count(&self) -> u64 {
        lock(&self.inner.state).tool_calls
    }

    pub fn tool_error_count(&self) -> u64 {
        lock(&self.inner.state).tool_errors
    }

    /// Send a user message. Events arrive on the returned channel until it closes.
    pub fn send_message(
        &self,
        prompt: impl Into<String>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let chat = self.clone();
        let prompt = prompt.into();
        tokio::spawn(async move {
            let _turn = chat.inner.turn.lock().await;
            chat.converse(prompt, cancel, tx).await;
        });
        rx
    }

    /// Summarize the history into a single model turn.
    pub async fn compress(&self) -> Result<CompressionOutcome, StrandError> {
        let _turn = self.inner.turn.lock().await;
        let model = self.ensure_model("").await?;
        let backend = self.inner.runtime.backends.resolve(&model)?;
        let mut history = self.history();
        let outcome = compress_history(backend.as_ref(), &model, &mut history).await?;
        lock(&self.inner.state).history = history;
        self.save().await;
        Ok(outcome)
    }

    async fn save(&self) {
        let history = self.history();
        self.inner
            .runtime
            .store
            .save_history(&self.inner.session_id, history)
            .await;
    }

    fn settings(&self) -> ChatSettings {
        self.inner.runtime.settings.borrow().clone()
    }

    /// Pick a model for the session on first use.
    async fn ensure_model(&self, request: &str) -> Result<String, StrandError> {
        if let Some(model) = self.model() {
            return Ok(model);
        }
        let ctx = RoutingContext {
            request: request.to_string(),
            requested_model: self.settings().requested_model,
            ..RoutingContext::default()
        };
        let decision = self.inner.runtime.router.route(&ctx).await?;
        tracing::info!(
            session_id = %self.inner.session_id,
            model = %decision.model,
            source = %decision.metadata.source,
            "chat model selected"
        );
        lock(&self.inner.state).model = Some(decision.model.clone());
        Ok(decision.model)
    }

    async fn converse(
        &self,
        prompt: String,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) {
        lock(&self.inner.state).history.push(Content::user(prompt.clone()));
        self.save().await;
        let _ = tx.send(StreamEvent::StreamingStarted {});

        let mut model = match self.ensure_model(&prompt).await {
            Ok(model) => model,
            Err(err) => {
                let _ = tx.send(StreamEvent::error(format!("No model available: {err}")));
                return;
            }
        };

        let mut turn: u32 = 0;
        let mut announce_thinking = true;
        loop {
            if cancel.is_cancelled() {
                let _ = tx.send(StreamEvent::error("request cancelled"));
                return;
            }
            if announce_thinking {
                let _ = tx.send(StreamEvent::Thinking { subject: None });
            }
            announce_thinking = true;

            let backend = match self.inner.runtime.backends.resolve(&model) {
                Ok(backend) => backend,
                Err(err) => {
                    let _ = tx.send(StreamEvent::error(err));
                    return;
                }
            };
            let prompt_id = format!("{}#{turn}", self.inner.session_id);
            turn += 1;

            let output = match self
                .stream_model(backend.as_ref(), &model, &prompt_id, &cancel, &tx)
                .await
            {
                Ok(Some(output)) => output,
                Ok(None) => {
                    let _ = tx.send(StreamEvent::error("request cancelled"));
                    return;
                }
                Err(err) if err.is_rate_limited() => {
                    match self.fall_back(backend.kind(), &model, &prompt, &tx).await {
                        Some(next) => {
                            model = next;
                            announce_thinking = false;
                            continue;
                        }
                        None => return,
                    }
                }
                Err(err) => {
                    tracing::error!(session_id = %self.inner.session_id, error = %err, "model call failed");
                    let _ = tx.send(StreamEvent::error(format!(
                        "Error from executor '{}': {err}",
                        backend.kind()
                    )));
                    return;
                }
            };

            match self.finish_turn(backend.as_ref(), output, &prompt_id, &cancel, &tx).await {
                TurnStep::Continue => {}
                TurnStep::Done => return,
            }
        }
    }

    /// Stream one model turn, forwarding text as it arrives. `None` on cancellation.
    async fn stream_model(
        &self,
        backend: &dyn ModelBackend,
        model: &str,
        prompt_id: &str,
        cancel: &CancellationToken,
        tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<Option<ModelOutput>, StrandError> {
        let request = ModelRequest {
            model: model.to_string(),
            system_instruction: self.settings().system_prompt,
            history: self.history(),
            tools: self.inner.runtime.registry.declarations(),
            generation: GenerationConfig::default(),
            prompt_id: prompt_id.to_string(),
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            stream = backend.send_message_stream(request) => stream?,
        };

        let mut output = ModelOutput {
            parts: Vec::new(),
            calls: Vec::new(),
            text: String::new(),
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            match chunk? {
                StreamChunk::Text(text) => {
                    let _ = tx.send(StreamEvent::Chunk { text: text.clone() });
                    output.text.push_str(&text);
                    output.parts.push(Part::text(text));
                }
                StreamChunk::Thought(text) => {
                    let thought = parse_thought(&text);
                    if !thought.subject.is_empty() {
                        let _ = tx.send(StreamEvent::Thinking {
                            subject: Some(thought.subject),
                        });
                    }
                    output.parts.push(Part::Thought { text });
                }
                StreamChunk::FunctionCall(mut call) => {
                    if call.id.is_empty() {
                        call.id = format!("{prompt_id}-{}", output.calls.len());
                    }
                    output.parts.push(Part::FunctionCall(call.clone()));
                    output.calls.push(call);
                }
            }
        }
        Ok(Some(output))
    }

    /// Ask the router for a fallback after a quota failure.
    async fn fall_back(
        &self,
        executor_type: &str,
        model: &str,
        prompt: &str,
        tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Option<String> {
        tracing::warn!(session_id = %self.inner.session_id, model, "quota exceeded, looking for a fallback");
        let ctx = RoutingContext {
            history: Vec::new(),
            request: prompt.to_string(),
            is_fallback: true,
            executor_type: executor_type.to_string(),
            current_model: Some(model.to_string()),
            requested_model: None,
        };
        let decision = match self.inner.runtime.router.route(&ctx).await {
            Ok(decision) if decision.model != model => decision,
            _ => {
                let _ = tx.send(StreamEvent::error(format!(
                    "Quota Exceeded for {model}. No fallback model found. Please try again later or switch models manually."
                )));
                return None;
            }
        };

        tracing::info!(
            session_id = %self.inner.session_id,
            old_model = model,
            new_model = %decision.model,
            "switching to fallback model"
        );
        let _ = tx.send(StreamEvent::ModelSwitch {
            old_model: model.to_string(),
            new_model: decision.model.clone(),
            reason: format!("Quota Exceeded. {}", decision.metadata.reasoning),
        });
        let _ = tx.send(StreamEvent::FinalResponse {
            content: format!("Automatically switched to model **{}**.", decision.model),
        });
        let _ = tx.send(StreamEvent::Thinking { subject: None });
        lock(&self.inner.state).model = Some(decision.model.clone());
        Some(decision.model)
    }

    async fn finish_turn(
        &self,
        backend: &dyn ModelBackend,
        output: ModelOutput,
        prompt_id: &str,
        cancel: &CancellationToken,
        tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> TurnStep {
        let ModelOutput { parts, calls, text } = output;
        lock(&self.inner.state)
            .history
            .push(Content::model_parts(parts));
        self.save().await;

        let history = self.history();
        let tokens = backend
            .count_tokens(&history)
            .await
            .unwrap_or_else(|_| estimate_history_tokens(&history));
        let _ = tx.send(StreamEvent::TokenCount { tokens });

        if calls.is_empty() {
            let _ = tx.send(StreamEvent::FinalResponse { content: text });
            return TurnStep::Done;
        }

        tracing::debug!(session_id = %self.inner.session_id, num_calls = calls.len(), "executing tool calls");
        let requests: Vec<ToolCallRequest> = calls
            .into_iter()
            .map(|call| {
                let _ = tx.send(StreamEvent::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                });
                ToolCallRequest {
                    call_id: call.id,
                    name: call.name,
                    args: call.args,
                    prompt_id: prompt_id.to_string(),
                }
            })
            .collect();

        let gate = ChatApprovalGate::new(
            self.inner.runtime.broker.clone(),
            self.settings().dangerous_tools,
            self.inner.always_allowed.clone(),
            tx.clone(),
        );
        let scheduler =
            ToolScheduler::new(self.inner.runtime.registry.clone()).with_approval_gate(Arc::new(gate));
        let resolved = scheduler.schedule(requests, cancel).await;

        let mut response_parts = Vec::with_capacity(resolved.len());
        for call in &resolved {
            self.record(call, tx);
            let todos_written = matches!(call.state, ToolCallState::Success { .. })
                && call.request.name == WRITE_TODOS_TOOL_NAME;
            if let Some(summary) = todos_written.then(|| todos_summary(&call.request)).flatten() {
                let _ = tx.send(StreamEvent::TodosSummaryUpdate { summary });
            }
            if let Some(response) = call.state.response() {
                response_parts.push(Part::FunctionResponse(FunctionResponse {
                    id: call.request.call_id.clone(),
                    name: call.request.name.clone(),
                    response: response.response.clone(),
                }));
            }
        }

        lock(&self.inner.state)
            .history
            .push(Content::user_parts(response_parts));
        self.save().await;
        TurnStep::Continue
    }

    fn record(&self, call: &ToolCall, tx: &mpsc::UnboundedSender<StreamEvent>) {
        let succeeded = matches!(call.state, ToolCallState::Success { .. });
        {
            let mut state = lock(&self.inner.state);
            state.tool_calls += 1;
            if !succeeded {
                state.tool_errors += 1;
            }
        }
        let (result, err) = match call.state.response() {
            Some(response) => (response.display.clone(), response.error.clone()),
            None => (String::new(), None),
        };
        let _ = tx.send(StreamEvent::ToolCallEnd {
            id: call.request.call_id.clone(),
            name: call.request.name.clone(),
            result,
            err,
        });
    }
}

/// `"Todos {completed}/{total}"` from a `write_todos` argument list.
fn todos_summary(request: &ToolCallRequest) -> Option<String> {
    let todos = request.args.get("todos")?.as_array()?;
    let completed = todos
        .iter()
        .filter(|t| t.get("status").and_then(|s| s.as_str()) == Some("completed"))
        .count();
    Some(format!("Todos {completed}/{}", todos.len()))
}

/// Chat sessions by id, opened on first use.
#[derive(Clone)]
pub struct ChatHub {
    runtime: ChatRuntime,
    sessions: Arc<RwLock<HashMap<String, ChatService>>>,
}

impl ChatHub {
    pub fn new(runtime: ChatRuntime) -> Self {
        Self {
            runtime,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.runtime.broker
    }

    pub async fn session(&self, session_id: &str) -> ChatService {
        if let Some(chat) = self.sessions.read().await.get(session_id) {
            return chat.clone();
        }
        let mut sessions = self.sessions.write().await;
        if let Some(chat) = sessions.get(session_id) {
            return chat.clone();
        }
        let chat = ChatService::open(self.runtime.clone(), session_id).await;
        sessions.insert(session_id.to_string(), chat.clone());
        chat
    }

    pub async fn existing(&self, session_id: &str) -> Option<ChatService> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests;
