use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StrandError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("infra error: {0}")]
    Infra(#[from] InfraError),
}

impl StrandError {
    /// True when the backend rejected the call for quota reasons.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Llm(LlmError::RateLimited { .. }))
    }
}

/// Construction-time failures. Never silently ignored.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("agent definition is missing a {field}")]
    MissingField { field: &'static str },

    #[error("tool '{tool}' not found in parent registry")]
    ToolNotInParent { tool: String },

    #[error(
        "tool \"{tool}\" is not on the allow-list for non-interactive execution in agent \"{agent}\". Only tools that do not require user confirmation can be used in subagents."
    )]
    ToolNotAllowListed { tool: String, agent: String },

    #[error("prompt config must define either a system prompt or initial messages")]
    EmptyPrompt,

    #[error("agent with name '{name}' already registered")]
    DuplicateAgent { name: String },

    #[error("no agent found with name '{name}'")]
    UnknownAgent { name: String },

    #[error("missing required input '{name}'")]
    MissingInput { name: String },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ToolError {
    #[error("no tool found with name '{name}'")]
    NotFound { name: String },

    #[error("tool with name '{name}' already registered")]
    AlreadyRegistered { name: String },

    #[error("tool {name} execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("tool {name} was cancelled")]
    Cancelled { name: String },

    #[error("invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("tool call {call_id} cannot move from {from} to {to}")]
    InvalidTransition {
        call_id: String,
        from: String,
        to: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("quota exceeded for {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("transport failure from {provider}: {reason}")]
    Transport { provider: String, reason: String },

    #[error("invalid LLM response: {reason}")]
    InvalidResponse { reason: String },

    #[error("no backend registered for model '{model}'")]
    NoBackend { model: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no routing strategy made a decision")]
    NoDecision,

    #[error("{strategy} strategy: {reason}")]
    Strategy {
        strategy: &'static str,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no conversation found to compress")]
    NothingToCompress,

    #[error("session {0} not found")]
    NotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
