use serde::{Deserialize, Serialize};

use strand_core::tool_call::ConfirmationOutcome;

/// Body of `POST /api/v1/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub prompt: String,
    /// Continue an existing session instead of starting a new one.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub status: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl TaskAccepted {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            status: "task accepted".into(),
            session_id: session_id.into(),
        }
    }
}

/// Body of `POST /api/v1/tool-calls/{id}/confirm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub outcome: ConfirmationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub id: String,
    pub outcome: ConfirmationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub subscribers: usize,
    pub running_sessions: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
