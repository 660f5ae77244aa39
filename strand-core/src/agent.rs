use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::content::Content;
use crate::error::ConfigurationError;

pub type AgentId = String;

/// Caller-supplied values substituted into `{{name}}` placeholders.
pub type AgentInputs = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// Declarative description of an agent. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub input_config: InputConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_config: Option<OutputConfig>,
    #[serde(default)]
    pub model_config: ModelConfig,
    #[serde(default)]
    pub run_config: RunConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(default)]
    pub prompt_config: PromptConfig,
}

impl AgentDefinition {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::MissingField { field: "name" });
        }
        if self.description.trim().is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "description",
            });
        }
        Ok(())
    }

    /// Tool names the agent is granted, empty when no tool config is present.
    pub fn tool_names(&self) -> &[String] {
        self.tool_config
            .as_ref()
            .map(|cfg| cfg.tools.as_slice())
            .unwrap_or(&[])
    }

    pub fn apply_overrides(&mut self, overrides: &AgentOverrides) {
        if let Some(model) = overrides.model.as_ref().filter(|m| !m.is_empty()) {
            self.model_config.model = model.clone();
        }
        if let Some(budget) = overrides.thinking_budget {
            self.model_config.thinking_budget = budget;
        }
        if let Some(minutes) = overrides.max_time_minutes {
            self.run_config.max_time_minutes = minutes;
        }
        if let Some(turns) = overrides.max_turns {
            self.run_config.max_turns = turns;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default)]
    pub inputs: BTreeMap<String, InputParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    pub description: String,
    #[serde(rename = "type", default = "default_input_type")]
    pub input_type: String,
    #[serde(default)]
    pub required: bool,
}

fn default_input_type() -> String {
    "string".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub output_name: String,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Post-processing applied to the submitted output value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Raw,
    PrettyJson,
}

impl OutputFormat {
    pub fn render(&self, value: &serde_json::Value) -> String {
        match self {
            Self::Raw => match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::PrettyJson => {
                let parsed = match value {
                    serde_json::Value::String(s) => {
                        serde_json::from_str(s).unwrap_or_else(|_| value.clone())
                    }
                    other => other.clone(),
                };
                serde_json::to_string_pretty(&parsed)
                    .unwrap_or_else(|e| format!("Error marshaling output: {e}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// `-1` lets the backend decide.
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            thinking_budget: default_thinking_budget(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_top_p() -> f32 {
    0.95
}

fn default_thinking_budget() -> i32 {
    -1
}

/// Run limits. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub max_turns: u32,
    #[serde(default)]
    pub max_time_minutes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_messages: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Per-agent settings overrides read from config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentOverrides {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_budget: Option<i32>,
    #[serde(default)]
    pub max_time_minutes: Option<u32>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

/// Why a run ended. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateMode {
    Goal,
    MaxTurns,
    Timeout,
    Aborted,
    Error,
}

impl std::fmt::Display for TerminateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Goal => write!(f, "goal"),
            Self::MaxTurns => write!(f, "max_turns"),
            Self::Timeout => write!(f, "timeout"),
            Self::Aborted => write!(f, "aborted"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Final result of an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputObject {
    pub result: String,
    pub terminate_reason: TerminateMode,
}
