//! Activity emitted by agent runs and the event stream fanned out to subscribers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tool::ToolArgs;
use crate::tool_call::ConfirmationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    ProtocolViolation,
    ToolCall,
    ToolCallUnauthorized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activity {
    ToolCallStart {
        call_id: String,
        name: String,
        args: ToolArgs,
    },
    ToolCallEnd {
        call_id: String,
        name: String,
        output: String,
    },
    ThoughtChunk {
        text: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ErrorContext>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        error: String,
    },
}

/// Activity attributed to a named agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub agent_name: String,
    #[serde(flatten)]
    pub activity: Activity,
}

impl ActivityEvent {
    pub fn is_error_with(&self, ctx: ErrorContext) -> bool {
        matches!(
            &self.activity,
            Activity::Error { context: Some(c), .. } if *c == ctx
        )
    }
}

pub type ActivityCallback = Arc<dyn Fn(ActivityEvent) + Send + Sync>;

/// Tagged events streamed to local renderers and remote subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        text: String,
    },
    StreamingStarted {},
    Thinking {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    ToolCallStart {
        id: String,
        name: String,
        args: ToolArgs,
    },
    ToolCallEnd {
        id: String,
        name: String,
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
    FinalResponse {
        content: String,
    },
    Error {
        err: String,
    },
    TokenCount {
        tokens: u32,
    },
    ModelSwitch {
        old_model: String,
        new_model: String,
        reason: String,
    },
    ToolConfirmationRequest {
        id: String,
        name: String,
        args: ToolArgs,
        kind: ConfirmationKind,
        message: String,
    },
    TodosSummaryUpdate {
        summary: String,
    },
    AgentActivity(ActivityEvent),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::StreamingStarted {} => "streaming_started",
            Self::Thinking { .. } => "thinking",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::FinalResponse { .. } => "final_response",
            Self::Error { .. } => "error",
            Self::TokenCount { .. } => "token_count",
            Self::ModelSwitch { .. } => "model_switch",
            Self::ToolConfirmationRequest { .. } => "tool_confirmation_request",
            Self::TodosSummaryUpdate { .. } => "todos_summary_update",
            Self::AgentActivity(_) => "agent_activity",
        }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            err: err.to_string(),
        }
    }
}

/// Wire envelope: `{"type", "payload", "sessionId"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: StreamEvent,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl EventEnvelope {
    pub fn new(session_id: impl Into<String>, event: StreamEvent) -> Self {
        Self {
            event,
            session_id: session_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let envelope = EventEnvelope::new(
            "s-1",
            StreamEvent::FinalResponse {
                content: "done".into(),
            },
        );
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "type": "final_response",
                "payload": {"content": "done"},
                "sessionId": "s-1"
            })
        );
    }

    #[test]
    fn streaming_started_has_empty_payload() {
        let value = serde_json::to_value(EventEnvelope::new("s", StreamEvent::StreamingStarted {}))
            .expect("serialize");
        assert_eq!(value["type"], "streaming_started");
        assert_eq!(value["payload"], serde_json::json!({}));
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let events = vec![
            StreamEvent::Chunk { text: "a".into() },
            StreamEvent::Thinking { subject: None },
            StreamEvent::TokenCount { tokens: 3 },
            StreamEvent::TodosSummaryUpdate {
                summary: "Todos 1/2".into(),
            },
            StreamEvent::ModelSwitch {
                old_model: "a".into(),
                new_model: "b".into(),
                reason: "quota".into(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).expect("serialize");
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn activity_flattens_agent_name() {
        let event = ActivityEvent {
            agent_name: "investigator".into(),
            activity: Activity::Error {
                context: Some(ErrorContext::ToolCallUnauthorized),
                name: Some("execute_command".into()),
                call_id: Some("x#0-0".into()),
                error: "nope".into(),
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["agent_name"], "investigator");
        assert_eq!(value["type"], "error");
        assert_eq!(value["context"], "tool_call_unauthorized");
        assert!(event.is_error_with(ErrorContext::ToolCallUnauthorized));
        assert!(!event.is_error_with(ErrorContext::ProtocolViolation));
    }
}
