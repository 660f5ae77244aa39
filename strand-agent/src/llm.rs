use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use strand_core::content::{Content, FunctionCall, Part, Role, estimate_history_tokens};
use strand_core::error::{LlmError, StrandError};
use strand_core::tool::ToolDefinition;

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub thinking_budget: i32,
    pub include_thoughts: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.95,
            thinking_budget: -1,
            include_thoughts: true,
        }
    }
}

/// One model turn's worth of input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub history: Vec<Content>,
    pub tools: Vec<ToolDefinition>,
    pub generation: GenerationConfig,
    pub prompt_id: String,
}

/// A piece of streamed model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamChunk {
    Text(String),
    Thought(String),
    FunctionCall(FunctionCall),
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, StrandError>>;

/// A model provider the runtime can talk to.
///
/// Backends are stateless with respect to the conversation: the full history
/// travels with every request.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Executor type label (`gemini`, `qwen`, `mock`, ...).
    fn kind(&self) -> &str;

    async fn send_message_stream(&self, request: ModelRequest) -> Result<ChunkStream, StrandError>;

    /// Single-shot text generation without tools or history.
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, StrandError>;

    async fn count_tokens(&self, history: &[Content]) -> Result<u32, StrandError> {
        Ok(estimate_history_tokens(history))
    }
}

/// A [`ModelBackend`] over any rig completion model.
pub struct RigBackend<M: rig::completion::CompletionModel> {
    kind: String,
    model: M,
}

impl<M: rig::completion::CompletionModel> RigBackend<M> {
    pub fn new(kind: impl Into<String>, model: M) -> Self {
        Self {
            kind: kind.into(),
            model,
        }
    }
}

#[async_trait]
impl<M> ModelBackend for RigBackend<M>
where
    M: rig::completion::CompletionModel + Send + Sync + 'static,
    M::Response: Send + Sync,
    M::StreamingResponse: 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn send_message_stream(&self, request: ModelRequest) -> Result<ChunkStream, StrandError> {
        let (current_prompt, chat_history) = split_prompt_and_history(to_rig_messages(&request.history));
        let tool_definitions = request
            .tools
            .iter()
            .map(|def| rig::completion::ToolDefinition {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.to_value(),
            })
            .collect::<Vec<_>>();

        let mut builder = self
            .model
            .completion_request(current_prompt.clone())
            .messages(chat_history)
            .tools(tool_definitions)
            .temperature(f64::from(request.generation.temperature))
            .additional_params(generation_params(&self.kind, &request.generation));
        if let Some(system) = &request.system_instruction {
            builder = builder.preamble(system.clone());
        }
        let rig_request = builder.build();

        tracing::debug!(
            model = %request.model,
            prompt_id = %request.prompt_id,
            history_len = request.history.len(),
            prompt_preview = %truncate_debug(&current_prompt, 200),
            "sending streaming completion request"
        );

        let response = self
            .model
            .stream(rig_request)
            .await
            .map_err(|e| classify_error(&self.kind, &e.to_string()))?;

        let kind = self.kind.clone();
        let prompt_id = request.prompt_id.clone();
        let include_thoughts = request.generation.include_thoughts;
        let chunks = response
            .enumerate()
            .filter_map(move |(idx, item)| {
                let chunk = match item {
                    Err(e) => Some(Err(classify_error(&kind, &e.to_string()))),
                    Ok(content) => streamed_chunk(content, &prompt_id, idx, include_thoughts).map(Ok),
                };
                futures::future::ready(chunk)
            });

        Ok(chunks.boxed())
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, StrandError> {
        let request = self.model.completion_request(prompt.to_string()).build();
        let response = self
            .model
            .completion(request)
            .await
            .map_err(|e| classify_error(&self.kind, &e.to_string()))?;

        let text: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                rig::message::AssistantContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse {
                reason: format!("{model} returned no text"),
            }
            .into());
        }
        Ok(text)
    }
}

/// Extra request parameters. Thinking settings are only understood by Gemini's
/// OpenAI-compatible endpoint.
fn generation_params(kind: &str, generation: &GenerationConfig) -> serde_json::Value {
    let mut params = serde_json::json!({ "top_p": generation.top_p });
    if kind == "gemini" {
        params["extra_body"] = serde_json::json!({
            "google": {
                "thinking_config": {
                    "thinking_budget": generation.thinking_budget,
                    "include_thoughts": generation.include_thoughts,
                }
            }
        });
    }
    params
}

/// Map one streamed rig item onto a chunk. Empty deltas, suppressed thoughts and
/// the provider's final usage record yield nothing.
fn streamed_chunk<R>(
    content: rig::streaming::StreamedAssistantContent<R>,
    prompt_id: &str,
    idx: usize,
    include_thoughts: bool,
) -> Option<StreamChunk> {
    use rig::streaming::StreamedAssistantContent;

    match content {
        StreamedAssistantContent::Text(t) => (!t.text.is_empty()).then_some(StreamChunk::Text(t.text)),
        StreamedAssistantContent::Reasoning(r) => {
            let thought = r.reasoning.concat();
            (include_thoughts && !thought.is_empty()).then_some(StreamChunk::Thought(thought))
        }
        StreamedAssistantContent::ToolCall(tc) => {
            let id = if tc.id.is_empty() {
                format!("{prompt_id}-{idx}")
            } else {
                tc.id
            };
            Some(StreamChunk::FunctionCall(FunctionCall {
                id,
                name: tc.function.name,
                args: arguments_to_map(tc.function.arguments),
            }))
        }
        StreamedAssistantContent::Final(_) => None,
    }
}

fn arguments_to_map(arguments: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match arguments {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

/// Quota-like failures become `RateLimited` so the router can pick a fallback.
pub(crate) fn classify_error(provider: &str, message: &str) -> StrandError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("429") || lowered.contains("quota") || lowered.contains("rate limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
        .into()
    } else {
        LlmError::Transport {
            provider: provider.to_string(),
            reason: truncate_debug(message, 2_000),
        }
        .into()
    }
}

/// Convert history into rig's message format.
///
/// Thoughts are dropped; calls and responses keep their ids so the provider
/// can pair them.
fn to_rig_messages(history: &[Content]) -> Vec<rig::completion::Message> {
    let mut out = Vec::new();
    for content in history {
        match content.role {
            Role::User => {
                let mut items = Vec::new();
                for part in &content.parts {
                    match part {
                        Part::Text { text } => items.push(rig::message::UserContent::text(text.clone())),
                        Part::FunctionResponse(resp) => {
                            items.push(rig::message::UserContent::tool_result(
                                &resp.id,
                                rig::OneOrMany::one(rig::message::ToolResultContent::text(
                                    resp.response.to_string(),
                                )),
                            ));
                        }
                        Part::Thought { .. } | Part::FunctionCall(_) => {}
                    }
                }
                if let Ok(content) = rig::OneOrMany::many(items) {
                    out.push(rig::completion::Message::User { content });
                }
            }
            Role::Model => {
                let mut items = Vec::new();
                for part in &content.parts {
                    match part {
                        Part::Text { text } => {
                            items.push(rig::message::AssistantContent::text(text.clone()));
                        }
                        Part::FunctionCall(call) => {
                            items.push(rig::message::AssistantContent::tool_call(
                                &call.id,
                                &call.name,
                                serde_json::Value::Object(call.args.clone()),
                            ));
                        }
                        Part::Thought { .. } | Part::FunctionResponse(_) => {}
                    }
                }
                if let Ok(content) = rig::OneOrMany::many(items) {
                    out.push(rig::completion::Message::Assistant { id: None, content });
                }
            }
        }
    }
    out
}

fn split_prompt_and_history(
    messages: Vec<rig::completion::Message>,
) -> (String, Vec<rig::completion::Message>) {
    let Some(last) = messages.last() else {
        return (String::new(), vec![]);
    };

    if let Some(text) = extract_user_text(last) {
        let history = messages[..messages.len() - 1].to_vec();
        return (text, history);
    }

    (String::new(), messages)
}

fn extract_user_text(message: &rig::completion::Message) -> Option<String> {
    match message {
        rig::completion::Message::User { content } => {
            let mut text = None;
            for item in content.iter() {
                match item {
                    rig::message::UserContent::Text(t) => {
                        text.get_or_insert_with(String::new).push_str(&t.text);
                    }
                    _ => return None,
                }
            }
            text
        }
        _ => None,
    }
}

pub(crate) fn truncate_debug(value: &str, max_chars: usize) -> String {
    let char_count = value.chars().count();
    if char_count <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{}...(+{} chars)", truncated, char_count - max_chars)
}

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Chunks(Vec<StreamChunk>),
    RateLimited { provider: String },
    Transport { provider: String, reason: String },
    /// A stream that never yields; only cancellation or a deadline ends it.
    Stall,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Chunks(vec![StreamChunk::Text(text.into())])
    }

    pub fn calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        Self::Chunks(
            calls
                .into_iter()
                .map(|(name, args)| {
                    StreamChunk::FunctionCall(FunctionCall {
                        id: String::new(),
                        name: name.to_string(),
                        args: args.as_object().cloned().unwrap_or_default(),
                    })
                })
                .collect(),
        )
    }
}

/// Replays a fixed queue of turns. Records every request it receives.
pub struct ScriptedBackend {
    kind: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
    generated: Mutex<VecDeque<String>>,
}

impl ScriptedBackend {
    pub fn new(kind: impl Into<String>, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            kind: kind.into(),
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            generated: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue replies for [`ModelBackend::generate`].
    pub fn with_generated(self, replies: Vec<String>) -> Self {
        if let Ok(mut generated) = self.generated.lock() {
            generated.extend(replies);
        }
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn send_message_stream(&self, request: ModelRequest) -> Result<ChunkStream, StrandError> {
        let prompt_id = request.prompt_id.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .turns
            .lock()
            .ok()
            .and_then(|mut turns| turns.pop_front());

        match next {
            None => Ok(stream::iter(vec![Ok(StreamChunk::Text(
                "No more scripted responses".into(),
            ))])
            .boxed()),
            Some(ScriptedTurn::Chunks(chunks)) => {
                let chunks = chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| match chunk {
                        StreamChunk::FunctionCall(mut call) if call.id.is_empty() => {
                            call.id = format!("{prompt_id}-{i}");
                            Ok(StreamChunk::FunctionCall(call))
                        }
                        other => Ok(other),
                    })
                    .collect::<Vec<_>>();
                Ok(stream::iter(chunks).boxed())
            }
            Some(ScriptedTurn::RateLimited { provider }) => Err(LlmError::RateLimited {
                provider,
                retry_after: None,
            }
            .into()),
            Some(ScriptedTurn::Transport { provider, reason }) => {
                Err(LlmError::Transport { provider, reason }.into())
            }
            Some(ScriptedTurn::Stall) => Ok(stream::pending().boxed()),
        }
    }

    async fn generate(&self, _model: &str, prompt: &str) -> Result<String, StrandError> {
        let reply = self
            .generated
            .lock()
            .ok()
            .and_then(|mut generated| generated.pop_front());
        Ok(reply.unwrap_or_else(|| format!("summary of {} chars", prompt.len())))
    }
}
