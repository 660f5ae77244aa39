//! Lifecycle of a single requested tool call.
//!
//! `Validating -> Scheduled -> Executing -> {Success | Error | Cancelled}`, with an
//! optional `AwaitingApproval` detour for interactive flows. Terminal states are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::tool::{ToolArgs, ToolResult};

/// A function call emitted by the model, tagged with a turn-unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub args: ToolArgs,
    pub prompt_id: String,
}

/// What gets folded back into the conversation once a call is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub call_id: String,
    pub name: String,
    pub response: serde_json::Value,
    #[serde(default)]
    pub display: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResponse {
    pub fn from_result(request: &ToolCallRequest, result: &ToolResult) -> Self {
        let response = match &result.llm_content {
            serde_json::Value::String(text) => serde_json::json!({ "content": text }),
            other => serde_json::json!({ "content": other }),
        };
        Self {
            call_id: request.call_id.clone(),
            name: request.name.clone(),
            response,
            display: result.return_display.clone(),
            error: result.error.as_ref().map(|e| e.message.clone()),
        }
    }

    pub fn error(request: &ToolCallRequest, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            call_id: request.call_id.clone(),
            name: request.name.clone(),
            response: serde_json::json!({ "error": message }),
            display: message.clone(),
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationKind {
    Exec,
    Edit,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationDetails {
    pub kind: ConfirmationKind,
    pub tool_name: String,
    pub message: String,
    #[serde(default)]
    pub args: ToolArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    ProceedOnce,
    ProceedAlways,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallState {
    Validating,
    Scheduled,
    Executing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        live_output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    AwaitingApproval {
        confirmation: ConfirmationDetails,
    },
    Success {
        response: ToolCallResponse,
        duration_ms: u64,
    },
    Error {
        response: ToolCallResponse,
        duration_ms: u64,
    },
    Cancelled {
        response: ToolCallResponse,
        duration_ms: u64,
    },
}

impl ToolCallState {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Scheduled => "scheduled",
            Self::Executing { .. } => "executing",
            Self::AwaitingApproval { .. } => "awaiting_approval",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }

    pub fn response(&self) -> Option<&ToolCallResponse> {
        match self {
            Self::Success { response, .. }
            | Self::Error { response, .. }
            | Self::Cancelled { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            Self::Success { duration_ms, .. }
            | Self::Error { duration_ms, .. }
            | Self::Cancelled { duration_ms, .. } => Some(*duration_ms),
            _ => None,
        }
    }

    fn allows(&self, next: &ToolCallState) -> bool {
        use ToolCallState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Error { .. } | Cancelled { .. }) => true,
            (Validating, Scheduled) => true,
            (Scheduled, Executing { .. } | AwaitingApproval { .. }) => true,
            (Executing { .. }, Executing { .. } | AwaitingApproval { .. } | Success { .. }) => true,
            (AwaitingApproval { .. }, Executing { .. } | Scheduled) => true,
            _ => false,
        }
    }
}

/// A tracked call: the original request plus its current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub request: ToolCallRequest,
    pub state: ToolCallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    pub fn new(request: ToolCallRequest) -> Self {
        Self {
            request,
            state: ToolCallState::Validating,
            started_at: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.request.call_id
    }

    pub fn transition(&mut self, next: ToolCallState) -> Result<(), ToolError> {
        if !self.state.allows(&next) {
            return Err(ToolError::InvalidTransition {
                call_id: self.request.call_id.clone(),
                from: self.state.status().to_string(),
                to: next.status().to_string(),
            });
        }
        if matches!(next, ToolCallState::Executing { .. }) && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Append streamed output while executing.
    pub fn push_output(&mut self, chunk: &str) {
        if let ToolCallState::Executing { live_output, .. } = &mut self.state {
            live_output.get_or_insert_with(String::new).push_str(chunk);
        }
    }

    pub fn set_pid(&mut self, value: u32) {
        if let ToolCallState::Executing { pid, .. } = &mut self.state {
            *pid = Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ToolCallRequest {
        ToolCallRequest {
            call_id: "agent#0-0".into(),
            name: "read_file".into(),
            args: ToolArgs::new(),
            prompt_id: "agent#0".into(),
        }
    }

    fn executing() -> ToolCallState {
        ToolCallState::Executing {
            live_output: None,
            pid: None,
        }
    }

    #[test]
    fn happy_path_reaches_success() {
        let mut call = ToolCall::new(request());
        call.transition(ToolCallState::Scheduled).expect("scheduled");
        call.transition(executing()).expect("executing");
        assert!(call.started_at.is_some());
        let response = ToolCallResponse::from_result(&call.request, &ToolResult::text("ok"));
        call.transition(ToolCallState::Success {
            response,
            duration_ms: 3,
        })
        .expect("success");
        assert_eq!(call.state.status(), "success");
        assert_eq!(call.state.duration_ms(), Some(3));
    }

    #[test]
    fn terminal_state_is_immutable() {
        let mut call = ToolCall::new(request());
        let response = ToolCallResponse::error(&call.request, "gone");
        call.transition(ToolCallState::Cancelled {
            response: response.clone(),
            duration_ms: 0,
        })
        .expect("cancel from validating");

        let err = call
            .transition(ToolCallState::Success {
                response,
                duration_ms: 1,
            })
            .expect_err("terminal state must not change");
        assert!(matches!(err, ToolError::InvalidTransition { .. }));
        assert_eq!(call.state.status(), "cancelled");
    }

    #[test]
    fn cannot_skip_straight_to_success() {
        let mut call = ToolCall::new(request());
        let response = ToolCallResponse::error(&call.request, "x");
        assert!(
            call.transition(ToolCallState::Success {
                response,
                duration_ms: 0
            })
            .is_err()
        );
        assert_eq!(call.state, ToolCallState::Validating);
    }

    #[test]
    fn approval_detour_returns_to_executing() {
        let mut call = ToolCall::new(request());
        call.transition(ToolCallState::Scheduled).expect("scheduled");
        call.transition(ToolCallState::AwaitingApproval {
            confirmation: ConfirmationDetails {
                kind: ConfirmationKind::Exec,
                tool_name: "write_file".into(),
                message: "Confirm?".into(),
                args: ToolArgs::new(),
            },
        })
        .expect("awaiting approval");
        call.transition(executing()).expect("approved");
        call.push_output("hello ");
        call.push_output("world");
        call.set_pid(7);
        assert_eq!(
            call.state,
            ToolCallState::Executing {
                live_output: Some("hello world".into()),
                pid: Some(7)
            }
        );
    }

    #[test]
    fn state_serializes_with_status_tag() {
        let value = serde_json::to_value(ToolCallState::Scheduled).expect("serialize");
        assert_eq!(value, serde_json::json!({"status": "scheduled"}));
    }

    #[test]
    fn response_from_text_result_wraps_content() {
        let response = ToolCallResponse::from_result(&request(), &ToolResult::text("file body"));
        assert_eq!(response.response, serde_json::json!({"content": "file body"}));
        assert!(response.error.is_none());
    }
}
