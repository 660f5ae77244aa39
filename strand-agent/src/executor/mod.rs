//! `AgentExecutor`: one bounded, non-interactive agent run.
//!
//! Each turn calls the model, dispatches the requested tool calls through the
//! scheduler and folds the responses back into the next message, until the
//! agent calls `task_complete` or a limit is hit.

mod helpers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use strand_core::agent::{AgentDefinition, AgentInputs, OutputObject, TerminateMode};
use strand_core::content::{Content, FunctionCall, FunctionResponse, Part};
use strand_core::error::{ConfigurationError, StrandError};
use strand_core::event::{Activity, ActivityCallback, ActivityEvent, ErrorContext};
use strand_core::tool::{TASK_COMPLETE_TOOL_NAME, ToolDefinition};
use strand_core::tool_call::{ToolCallRequest, ToolCallState};

use crate::backends::BackendTable;
use crate::llm::{GenerationConfig, ModelBackend, ModelRequest, StreamChunk};
use crate::registry::ToolRegistry;
use crate::scheduler::ToolScheduler;

pub use helpers::{
    NON_INTERACTIVE_ALLOW_LIST, ThoughtSummary, completion_declaration, parse_thought,
    template_string,
};
use helpers::{
    DEFAULT_QUERY, agent_id, build_system_prompt, template_initial_messages, validate_tools,
};

const NOT_COMPLETED: &str = "Agent execution was terminated before completion.";
const DEFAULT_GOAL_RESULT: &str = "Task completed successfully.";
const DUPLICATE_COMPLETION: &str = "Task already marked complete in this turn. Ignoring duplicate call.";
const OUTPUT_SUBMITTED: &str = "Output submitted and task completed.";
const ALL_CALLS_FAILED: &str =
    "All tool calls failed or were unauthorized. Please analyze the errors and try an alternative approach.";

/// Shared services handed to every executor.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub backends: Arc<BackendTable>,
    /// Appended to the system prompt under "# Environment Context".
    pub environment_context: Option<String>,
}

impl RuntimeContext {
    pub fn new(backends: Arc<BackendTable>) -> Self {
        Self {
            backends,
            environment_context: None,
        }
    }

    pub fn with_environment_context(mut self, context: impl Into<String>) -> Self {
        self.environment_context = Some(context.into());
        self
    }
}

pub struct AgentExecutor {
    definition: AgentDefinition,
    agent_id: String,
    registry: Arc<ToolRegistry>,
    scheduler: ToolScheduler,
    runtime: RuntimeContext,
    on_activity: Option<ActivityCallback>,
}

/// What the model produced in one turn.
struct ModelTurn {
    parts: Vec<Part>,
    calls: Vec<FunctionCall>,
    cancelled: bool,
}

impl ModelTurn {
    fn cancelled() -> Self {
        Self {
            parts: Vec::new(),
            calls: Vec::new(),
            cancelled: true,
        }
    }
}

/// Result of processing one turn's function calls.
struct CallsOutcome {
    next_message: Content,
    submitted_output: Option<String>,
    task_completed: bool,
}

impl AgentExecutor {
    /// Validate the definition and build the agent's isolated registry.
    ///
    /// Fails if a configured tool is missing from `parent` or is not safe to run
    /// without confirmation. Nothing is registered on failure.
    pub fn create(
        definition: AgentDefinition,
        runtime: RuntimeContext,
        parent: &ToolRegistry,
        parent_prompt_id: Option<&str>,
        on_activity: Option<ActivityCallback>,
    ) -> Result<Self, StrandError> {
        definition.validate()?;

        let mut registry = ToolRegistry::new();
        if definition.tool_config.is_some() {
            for name in definition.tool_names() {
                let tool = parent
                    .get_tool(name)
                    .map_err(|_| ConfigurationError::ToolNotInParent { tool: name.clone() })?;
                registry.register(tool)?;
            }
            validate_tools(&registry, &definition.name)?;
        }

        let agent_id = agent_id(parent_prompt_id, &definition.name);
        let registry = Arc::new(registry);
        tracing::debug!(
            agent_id = %agent_id,
            agent_name = %definition.name,
            tools = ?registry.tool_names(),
            "agent executor created"
        );

        Ok(Self {
            definition,
            agent_id,
            scheduler: ToolScheduler::new(registry.clone()),
            registry,
            runtime,
            on_activity,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Drive the run to a terminal mode.
    ///
    /// Limits, cancellation and protocol violations end in an `OutputObject`;
    /// only setup and transport failures return `Err`.
    pub async fn run(
        &self,
        inputs: &AgentInputs,
        cancel: &CancellationToken,
    ) -> Result<OutputObject, StrandError> {
        let started = Instant::now();
        tracing::info!(
            agent_id = %self.agent_id,
            agent_name = %self.definition.name,
            "agent_start"
        );

        let (backend, system_instruction, mut history) = match self.start_session(inputs) {
            Ok(session) => session,
            Err(err) => {
                self.emit_error(None, None, None, err.to_string());
                return Err(err);
            }
        };
        let tools = self.prepare_tools();

        let query = self
            .definition
            .prompt_config
            .query
            .as_deref()
            .filter(|q| !q.is_empty())
            .map(|q| template_string(q, inputs))
            .unwrap_or_else(|| DEFAULT_QUERY.to_string());
        let mut current_message = Content::user(query);
        let mut turns: u32 = 0;

        let (terminate_reason, final_result) = loop {
            if let Some(mode) = self.check_termination(started, turns) {
                break (mode, None);
            }
            if cancel.is_cancelled() {
                break (TerminateMode::Aborted, None);
            }

            let prompt_id = format!("{}#{}", self.agent_id, turns);
            turns += 1;
            history.push(current_message);

            // Thinking: call the model
            tracing::debug!(agent_id = %self.agent_id, turn = turns, "calling model");
            let turn = match self
                .call_model(backend.as_ref(), &system_instruction, &history, &tools, &prompt_id, cancel)
                .await
            {
                Ok(turn) => turn,
                Err(err) => {
                    self.emit_error(None, None, None, err.to_string());
                    self.log_finish(started, turns, TerminateMode::Error);
                    return Err(err);
                }
            };

            if turn.cancelled || cancel.is_cancelled() {
                break (TerminateMode::Aborted, None);
            }
            history.push(Content::model_parts(turn.parts));

            if turn.calls.is_empty() {
                let message = format!(
                    "Agent stopped calling tools but did not call '{TASK_COMPLETE_TOOL_NAME}' to finalize the session."
                );
                self.emit_error(Some(ErrorContext::ProtocolViolation), None, None, message.clone());
                break (TerminateMode::Error, Some(message));
            }

            // Acting: dispatch the requested calls
            tracing::debug!(
                agent_id = %self.agent_id,
                num_calls = turn.calls.len(),
                "acting: processing function calls"
            );
            let outcome = self.process_function_calls(turn.calls, &prompt_id, cancel).await;
            if outcome.task_completed {
                let result = outcome
                    .submitted_output
                    .unwrap_or_else(|| DEFAULT_GOAL_RESULT.to_string());
                break (TerminateMode::Goal, Some(result));
            }
            current_message = outcome.next_message;
        };

        self.log_finish(started, turns, terminate_reason);

        let result = match terminate_reason {
            TerminateMode::Goal => final_result.unwrap_or_else(|| DEFAULT_GOAL_RESULT.to_string()),
            _ => final_result.unwrap_or_else(|| NOT_COMPLETED.to_string()),
        };
        Ok(OutputObject {
            result,
            terminate_reason,
        })
    }

    fn start_session(
        &self,
        inputs: &AgentInputs,
    ) -> Result<(Arc<dyn ModelBackend>, Option<String>, Vec<Content>), StrandError> {
        let prompt_config = &self.definition.prompt_config;
        let system_prompt = prompt_config.system_prompt.as_deref().filter(|p| !p.is_empty());
        if system_prompt.is_none() && prompt_config.initial_messages.is_empty() {
            return Err(ConfigurationError::EmptyPrompt.into());
        }

        let system_instruction = system_prompt.map(|template| {
            build_system_prompt(
                template,
                inputs,
                self.runtime.environment_context.as_deref(),
            )
        });
        let history = template_initial_messages(&prompt_config.initial_messages, inputs);
        let backend = self
            .runtime
            .backends
            .resolve(&self.definition.model_config.model)?;
        Ok((backend, system_instruction, history))
    }

    fn prepare_tools(&self) -> Vec<ToolDefinition> {
        let mut tools = self
            .registry
            .declarations_filtered(self.definition.tool_names());
        tools.push(completion_declaration(self.definition.output_config.as_ref()));
        tools
    }

    fn check_termination(&self, started: Instant, turns: u32) -> Option<TerminateMode> {
        let run = &self.definition.run_config;
        if run.max_turns > 0 && turns >= run.max_turns {
            return Some(TerminateMode::MaxTurns);
        }
        let limit = Duration::from_secs(u64::from(run.max_time_minutes) * 60);
        if run.max_time_minutes > 0 && started.elapsed() >= limit {
            return Some(TerminateMode::Timeout);
        }
        None
    }

    async fn call_model(
        &self,
        backend: &dyn ModelBackend,
        system_instruction: &Option<String>,
        history: &[Content],
        tools: &[ToolDefinition],
        prompt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, StrandError> {
        let model_config = &self.definition.model_config;
        let request = ModelRequest {
            model: model_config.model.clone(),
            system_instruction: system_instruction.clone(),
            history: history.to_vec(),
            tools: tools.to_vec(),
            generation: GenerationConfig {
                temperature: model_config.temperature,
                top_p: model_config.top_p,
                thinking_budget: model_config.thinking_budget,
                include_thoughts: true,
            },
            prompt_id: prompt_id.to_string(),
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ModelTurn::cancelled()),
            stream = backend.send_message_stream(request) => stream?,
        };

        let mut turn = ModelTurn {
            parts: Vec::new(),
            calls: Vec::new(),
            cancelled: false,
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ModelTurn::cancelled()),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            match chunk? {
                StreamChunk::Thought(text) => {
                    let thought = parse_thought(&text);
                    if !thought.subject.is_empty() {
                        self.emit(Activity::ThoughtChunk {
                            text: thought.subject,
                        });
                    }
                    turn.parts.push(Part::Thought { text });
                }
                StreamChunk::FunctionCall(mut call) => {
                    if call.id.is_empty() {
                        call.id = format!("{prompt_id}-{}", turn.calls.len());
                    }
                    turn.parts.push(Part::FunctionCall(call.clone()));
                    turn.calls.push(call);
                }
                StreamChunk::Text(text) => turn.parts.push(Part::text(text)),
            }
        }
        Ok(turn)
    }

    async fn process_function_calls(
        &self,
        calls: Vec<FunctionCall>,
        prompt_id: &str,
        cancel: &CancellationToken,
    ) -> CallsOutcome {
        let mut task_completed = false;
        let mut submitted_output = None;
        let mut sync_parts = Vec::new();
        let mut requests = Vec::new();
        let mut response_ids = HashMap::new();

        for (i, call) in calls.into_iter().enumerate() {
            let call_id = format!("{prompt_id}-{i}");
            self.emit(Activity::ToolCallStart {
                call_id: call_id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
            });

            if call.name == TASK_COMPLETE_TOOL_NAME {
                if task_completed {
                    sync_parts.push(function_response(
                        &call,
                        serde_json::json!({ "error": DUPLICATE_COMPLETION }),
                    ));
                    self.emit_error(
                        Some(ErrorContext::ProtocolViolation),
                        Some(&call.name),
                        Some(&call_id),
                        DUPLICATE_COMPLETION.to_string(),
                    );
                    continue;
                }

                task_completed = true;
                match &self.definition.output_config {
                    Some(output) => match call.args.get(&output.output_name) {
                        Some(value) => {
                            submitted_output = Some(output.format.render(value));
                            sync_parts.push(function_response(
                                &call,
                                serde_json::json!({ "result": OUTPUT_SUBMITTED }),
                            ));
                            self.emit(Activity::ToolCallEnd {
                                call_id,
                                name: call.name.clone(),
                                output: OUTPUT_SUBMITTED.into(),
                            });
                        }
                        None => {
                            task_completed = false;
                            let message = format!(
                                "Missing required argument '{}' for completion.",
                                output.output_name
                            );
                            sync_parts.push(function_response(
                                &call,
                                serde_json::json!({ "error": message }),
                            ));
                            self.emit_error(
                                Some(ErrorContext::ProtocolViolation),
                                Some(&call.name),
                                Some(&call_id),
                                message,
                            );
                        }
                    },
                    None => {
                        submitted_output = Some(DEFAULT_GOAL_RESULT.to_string());
                        sync_parts.push(function_response(
                            &call,
                            serde_json::json!({ "status": "Task marked complete." }),
                        ));
                        self.emit(Activity::ToolCallEnd {
                            call_id,
                            name: call.name.clone(),
                            output: "Task marked complete.".into(),
                        });
                    }
                }
                continue;
            }

            if !self.registry.contains(&call.name) {
                let message = format!(
                    "Unauthorized tool call: '{}' is not available to this agent.",
                    call.name
                );
                tracing::warn!(agent_id = %self.agent_id, tool = %call.name, call_id = %call_id, "unauthorized tool call");
                sync_parts.push(function_response(
                    &call,
                    serde_json::json!({ "error": message }),
                ));
                self.emit_error(
                    Some(ErrorContext::ToolCallUnauthorized),
                    Some(&call.name),
                    Some(&call_id),
                    message,
                );
                continue;
            }

            response_ids.insert(call_id.clone(), call.id.clone());
            requests.push(ToolCallRequest {
                call_id,
                name: call.name,
                args: call.args,
                prompt_id: prompt_id.to_string(),
            });
        }

        let resolved = if requests.is_empty() {
            Vec::new()
        } else {
            self.scheduler.schedule(requests, cancel).await
        };

        let mut any_succeeded = false;
        let mut async_parts = Vec::with_capacity(resolved.len());
        for call in resolved {
            let Some(response) = call.state.response() else {
                continue;
            };
            match &call.state {
                ToolCallState::Success { .. } => {
                    any_succeeded = true;
                    self.emit(Activity::ToolCallEnd {
                        call_id: call.request.call_id.clone(),
                        name: call.request.name.clone(),
                        output: response.display.clone(),
                    });
                }
                _ => {
                    self.emit_error(
                        Some(ErrorContext::ToolCall),
                        Some(&call.request.name),
                        Some(&call.request.call_id),
                        response.error.clone().unwrap_or_else(|| response.display.clone()),
                    );
                }
            }
            let id = response_ids
                .get(&call.request.call_id)
                .cloned()
                .unwrap_or_else(|| call.request.call_id.clone());
            async_parts.push(Part::FunctionResponse(FunctionResponse {
                id,
                name: call.request.name.clone(),
                response: response.response.clone(),
            }));
        }

        let mut parts = sync_parts;
        parts.extend(async_parts);
        if !task_completed && !any_succeeded {
            parts.push(Part::text(ALL_CALLS_FAILED));
        }

        CallsOutcome {
            next_message: Content::user_parts(parts),
            submitted_output,
            task_completed,
        }
    }

    fn log_finish(&self, started: Instant, turns: u32, reason: TerminateMode) {
        tracing::info!(
            agent_id = %self.agent_id,
            agent_name = %self.definition.name,
            duration_ms = started.elapsed().as_millis() as u64,
            turns,
            terminate_reason = %reason,
            "agent_finish"
        );
    }

    fn emit(&self, activity: Activity) {
        if let Some(callback) = &self.on_activity {
            callback(ActivityEvent {
                agent_name: self.definition.name.clone(),
                activity,
            });
        }
    }

    fn emit_error(
        &self,
        context: Option<ErrorContext>,
        name: Option<&str>,
        call_id: Option<&str>,
        error: String,
    ) {
        self.emit(Activity::Error {
            context,
            name: name.map(str::to_string),
            call_id: call_id.map(str::to_string),
            error,
        });
    }
}

fn function_response(call: &FunctionCall, response: serde_json::Value) -> Part {
    Part::FunctionResponse(FunctionResponse {
        id: call.id.clone(),
        name: call.name.clone(),
        response,
    })
}
