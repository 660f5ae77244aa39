//! Concurrent execution of the tool calls requested in one turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use strand_core::tool::{Tool, ToolContext, ToolUpdate};
use strand_core::tool_call::{
    ConfirmationDetails, ConfirmationKind, ConfirmationOutcome, ToolCall, ToolCallRequest,
    ToolCallResponse, ToolCallState,
};

use crate::registry::ToolRegistry;

pub const CANCELLED_BY_USER: &str = "Tool execution cancelled by user.";
pub const CANCELLED_BY_SIGNAL: &str = "Tool call cancelled before completion.";

/// Receives `(call_id, chunk)` for tools that stream output.
pub type OutputHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Observes every state change of every call.
pub type StateObserver = Arc<dyn Fn(&ToolCall) + Send + Sync>;

/// Human confirmation hook for interactive flows.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    fn requires_approval(&self, request: &ToolCallRequest) -> bool;

    fn confirmation_details(&self, request: &ToolCallRequest) -> ConfirmationDetails {
        ConfirmationDetails {
            kind: ConfirmationKind::Exec,
            tool_name: request.name.clone(),
            message: format!("Confirm execution of tool '{}'?", request.name),
            args: request.args.clone(),
        }
    }

    async fn request_approval(
        &self,
        request: &ToolCallRequest,
        details: ConfirmationDetails,
    ) -> ConfirmationOutcome;
}

#[derive(Clone)]
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    output_handler: Option<OutputHandler>,
    observer: Option<StateObserver>,
    approval: Option<Arc<dyn ApprovalGate>>,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            output_handler: None,
            observer: None,
            approval: None,
        }
    }

    pub fn with_output_handler(mut self, handler: OutputHandler) -> Self {
        self.output_handler = Some(handler);
        self
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run every request concurrently and wait until all of them are terminal.
    ///
    /// Results come back in completion order. A missing tool resolves to `Error`
    /// without affecting its siblings; cancelling `cancel` resolves anything
    /// still in flight to `Cancelled`.
    pub async fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Vec<ToolCall> {
        let mut completed = Vec::with_capacity(requests.len());
        let mut in_flight: HashMap<tokio::task::Id, ToolCallRequest> = HashMap::new();
        let mut set = JoinSet::new();

        for request in requests {
            let mut call = ToolCall::new(request);
            self.notify(&call);

            let tool = match self.registry.get_tool(&call.request.name) {
                Ok(tool) => tool,
                Err(_) => {
                    let message = format!("Tool \"{}\" not found in registry.", call.request.name);
                    tracing::warn!(call_id = %call.call_id(), tool = %call.request.name, "tool not found");
                    let state = error_state(&call.request, message, 0);
                    finish(&mut call, state);
                    self.notify(&call);
                    completed.push(call);
                    continue;
                }
            };

            if cancel.is_cancelled() {
                let state = cancelled_state(&call.request, CANCELLED_BY_SIGNAL, 0);
                finish(&mut call, state);
                self.notify(&call);
                completed.push(call);
                continue;
            }

            finish(&mut call, ToolCallState::Scheduled);
            self.notify(&call);

            let request = call.request.clone();
            let job = CallJob {
                call,
                tool,
                cancel: cancel.clone(),
                output_handler: self.output_handler.clone(),
                observer: self.observer.clone(),
                approval: self.approval.clone(),
            };
            let handle = set.spawn(job.run());
            in_flight.insert(handle.id(), request);
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, call)) => {
                    in_flight.remove(&id);
                    completed.push(call);
                }
                Err(join_err) => {
                    let Some(request) = in_flight.remove(&join_err.id()) else {
                        continue;
                    };
                    tracing::error!(call_id = %request.call_id, error = %join_err, "tool task failed");
                    let mut call = ToolCall::new(request);
                    let state = if join_err.is_cancelled() {
                        cancelled_state(&call.request, CANCELLED_BY_SIGNAL, 0)
                    } else {
                        error_state(&call.request, format!("tool task failed: {join_err}"), 0)
                    };
                    finish(&mut call, state);
                    self.notify(&call);
                    completed.push(call);
                }
            }
        }

        completed
    }

    fn notify(&self, call: &ToolCall) {
        if let Some(observer) = &self.observer {
            observer(call);
        }
    }
}

struct CallJob {
    call: ToolCall,
    tool: Arc<dyn Tool>,
    cancel: CancellationToken,
    output_handler: Option<OutputHandler>,
    observer: Option<StateObserver>,
    approval: Option<Arc<dyn ApprovalGate>>,
}

impl CallJob {
    async fn run(mut self) -> ToolCall {
        let started = Instant::now();

        if let Some(gate) = self.approval.clone()
            && gate.requires_approval(&self.call.request)
        {
            let details = gate.confirmation_details(&self.call.request);
            self.advance(ToolCallState::AwaitingApproval {
                confirmation: details.clone(),
            });
            let outcome = tokio::select! {
                outcome = gate.request_approval(&self.call.request, details) => Some(outcome),
                _ = self.cancel.cancelled() => None,
            };
            match outcome {
                Some(ConfirmationOutcome::ProceedOnce | ConfirmationOutcome::ProceedAlways) => {}
                Some(ConfirmationOutcome::Cancel) => {
                    let state = cancelled_state(&self.call.request, CANCELLED_BY_USER, elapsed_ms(started));
                    self.advance(state);
                    return self.call;
                }
                None => {
                    let state = cancelled_state(&self.call.request, CANCELLED_BY_SIGNAL, elapsed_ms(started));
                    self.advance(state);
                    return self.call;
                }
            }
        }

        self.advance(ToolCallState::Executing {
            live_output: None,
            pid: None,
        });
        tracing::debug!(call_id = %self.call.call_id(), tool = %self.call.request.name, "executing tool call");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ToolContext::new(self.call.request.call_id.clone(), self.cancel.clone())
            .with_updates(tx);
        let args = self.call.request.args.clone();
        let tool = self.tool.clone();
        let execution = tool.execute(&ctx, args);
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                result = &mut execution => break Some(result),
                Some(update) = rx.recv() => self.apply_update(update),
            }
        };
        while let Ok(update) = rx.try_recv() {
            self.apply_update(update);
        }

        let duration_ms = elapsed_ms(started);
        let state = match outcome {
            None => cancelled_state(&self.call.request, CANCELLED_BY_SIGNAL, duration_ms),
            Some(Ok(result)) => {
                let response = ToolCallResponse::from_result(&self.call.request, &result);
                if result.is_error() {
                    ToolCallState::Error {
                        response,
                        duration_ms,
                    }
                } else {
                    ToolCallState::Success {
                        response,
                        duration_ms,
                    }
                }
            }
            Some(Err(err)) => error_state(&self.call.request, err.to_string(), duration_ms),
        };
        tracing::debug!(
            call_id = %self.call.call_id(),
            status = state.status(),
            duration_ms,
            "tool call resolved"
        );
        self.advance(state);
        self.call
    }

    fn apply_update(&mut self, update: ToolUpdate) {
        match update {
            ToolUpdate::Output { call_id, chunk } => {
                self.call.push_output(&chunk);
                if let Some(handler) = &self.output_handler {
                    handler(&call_id, &chunk);
                }
            }
            ToolUpdate::Pid { pid, .. } => self.call.set_pid(pid),
        }
        self.notify();
    }

    fn advance(&mut self, next: ToolCallState) {
        finish(&mut self.call, next);
        self.notify();
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer(&self.call);
        }
    }
}

fn finish(call: &mut ToolCall, next: ToolCallState) {
    if let Err(err) = call.transition(next) {
        tracing::warn!(error = %err, "ignored invalid tool call transition");
    }
}

fn error_state(request: &ToolCallRequest, message: impl Into<String>, duration_ms: u64) -> ToolCallState {
    ToolCallState::Error {
        response: ToolCallResponse::error(request, message),
        duration_ms,
    }
}

fn cancelled_state(request: &ToolCallRequest, message: &str, duration_ms: u64) -> ToolCallState {
    ToolCallState::Cancelled {
        response: ToolCallResponse::error(request, message),
        duration_ms,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
