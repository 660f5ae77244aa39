use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentDefinition, AgentOverrides, DEFAULT_MODEL};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrandConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Overrides for built-in agents, keyed by agent name.
    #[serde(default)]
    pub agents: HashMap<String, AgentOverrides>,
    #[serde(default)]
    pub custom_agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default)]
    pub debug: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            debug: false,
        }
    }
}

fn default_instance_id() -> String {
    "strand".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Explicit user choice; `"auto"` lets the routing chain decide.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            model: None,
            classifier_model: default_classifier_model(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_classifier_model() -> String {
    "gemini-1.5-pro".into()
}

/// One row of the backend table: models starting with `prefix` go to `provider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub prefix: String,
    /// Executor type label used by fallback suggesters.
    pub kind: String,
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Used when no prefix matches.
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Tools that need explicit confirmation before they run in chat.
    #[serde(default = "default_dangerous_tools")]
    pub dangerous_tools: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            dangerous_tools: default_dangerous_tools(),
            system_prompt: None,
        }
    }
}

fn default_dangerous_tools() -> Vec<String> {
    vec![
        "write_file".into(),
        "smart_edit".into(),
        "run_shell_command".into(),
    ]
}

/// Read-only settings lookup. The runtime never writes settings back.
pub trait Settings: Send + Sync {
    /// Explicitly requested model, if any.
    fn model(&self) -> Option<String>;

    fn default_model(&self) -> Option<String>;

    fn classifier_model(&self) -> String;

    fn debug(&self) -> bool;

    fn agent_overrides(&self, name: &str) -> Option<AgentOverrides>;

    fn dangerous_tools(&self) -> Vec<String>;

    /// Agent definitions supplied by the user, loaded after the built-ins.
    fn custom_agents(&self) -> Vec<AgentDefinition> {
        Vec::new()
    }
}

impl Settings for StrandConfig {
    fn model(&self) -> Option<String> {
        self.models.model.clone().filter(|m| !m.is_empty())
    }

    fn default_model(&self) -> Option<String> {
        Some(self.models.default_model.clone()).filter(|m| !m.is_empty())
    }

    fn classifier_model(&self) -> String {
        self.models.classifier_model.clone()
    }

    fn debug(&self) -> bool {
        self.global.debug
    }

    fn agent_overrides(&self, name: &str) -> Option<AgentOverrides> {
        self.agents.get(name).cloned()
    }

    fn dangerous_tools(&self) -> Vec<String> {
        self.chat.dangerous_tools.clone()
    }

    fn custom_agents(&self) -> Vec<AgentDefinition> {
        self.custom_agents.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: StrandConfig = toml::from_str("").expect("empty config should parse");
        assert_eq!(cfg.global.instance_id, "strand");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(cfg.models.default_model, DEFAULT_MODEL);
        assert!(cfg.backends.is_empty());
        assert!(cfg.dangerous_tools().contains(&"write_file".to_string()));
        assert_eq!(Settings::model(&cfg), None);
    }

    #[test]
    fn unknown_top_level_section_is_rejected() {
        let toml = r#"
[nonsense]
x = 1
"#;
        assert!(toml::from_str::<StrandConfig>(toml).is_err());
    }

    #[test]
    fn backends_and_agent_overrides_parse() {
        let toml = r#"
[global]
instance_id = "t"
debug = true

[models]
default_model = "qwen-max"
model = "auto"

[[backends]]
prefix = "qwen"
kind = "qwen"
provider = "openai"
base_url = "https://dashscope.example.com/v1"
api_key_env = "DASHSCOPE_API_KEY"

[[backends]]
prefix = "gemini"
kind = "gemini"
provider = "gemini"
default = true

[agents.codebase_investigator]
enabled = true
max_turns = 4
"#;
        let cfg: StrandConfig = toml::from_str(toml).expect("config should parse");
        assert!(cfg.debug());
        assert_eq!(cfg.backends.len(), 2);
        assert!(cfg.backends[1].default);
        assert_eq!(Settings::model(&cfg).as_deref(), Some("auto"));
        let overrides = cfg
            .agent_overrides("codebase_investigator")
            .expect("overrides present");
        assert!(overrides.enabled);
        assert_eq!(overrides.max_turns, Some(4));
        assert!(cfg.agent_overrides("test_writer").is_none());
    }

    #[test]
    fn custom_agent_definition_parses() {
        let toml = r#"
[[custom_agents]]
name = "summarizer"
description = "Summarizes a topic"

[custom_agents.output_config]
output_name = "report"

[custom_agents.run_config]
max_turns = 3

[custom_agents.prompt_config]
system_prompt = "Summarize {{topic}}"

[custom_agents.input_config.inputs.topic]
description = "What to summarize"
required = true
"#;
        let cfg: StrandConfig = toml::from_str(toml).expect("config should parse");
        let agent = &cfg.custom_agents[0];
        assert_eq!(agent.name, "summarizer");
        assert_eq!(
            agent.output_config.as_ref().map(|o| o.output_name.as_str()),
            Some("report")
        );
        assert_eq!(agent.run_config.max_turns, 3);
        assert_eq!(agent.input_config.inputs["topic"].input_type, "string");
        assert!(agent.input_config.inputs["topic"].required);
        assert_eq!(agent.model_config.model, DEFAULT_MODEL);
    }
}
