use strand_core::agent::{AgentInputs, OutputConfig};
use strand_core::content::{Content, Part};
use strand_core::error::ConfigurationError;
use strand_core::tool::{ParameterSchema, PropertySchema, TASK_COMPLETE_TOOL_NAME, ToolDefinition};

use crate::registry::ToolRegistry;

/// Tools that never need human confirmation and may run inside an agent.
pub const NON_INTERACTIVE_ALLOW_LIST: &[&str] = &[
    "list_directory",
    "read_file",
    "search_file_content",
    "glob",
    "read_many_files",
    "save_memory",
    "google_web_search",
    "web_fetch",
    "run_tests",
    "find_references",
    "rename_symbol",
    "git_commit",
    "write_file",
    "smart_edit",
    "extract_function",
];

pub(super) const DEFAULT_QUERY: &str = "Get Started!";

/// Replace every `{{key}}` with the matching input. Unknown placeholders stay as-is.
pub fn template_string(template: &str, inputs: &AgentInputs) -> String {
    let mut result = template.to_string();
    for (key, value) in inputs {
        let placeholder = format!("{{{{{key}}}}}");
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        result = result.replace(&placeholder, &rendered);
    }
    result
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThoughtSummary {
    pub subject: String,
    pub description: String,
}

/// Split `"**Subject** rest"` into subject and description.
pub fn parse_thought(raw: &str) -> ThoughtSummary {
    const DELIM: &str = "**";
    let whole = || ThoughtSummary {
        subject: String::new(),
        description: raw.trim().to_string(),
    };

    let Some(start) = raw.find(DELIM) else {
        return whole();
    };
    let after_start = start + DELIM.len();
    let Some(rel_end) = raw[after_start..].find(DELIM) else {
        return whole();
    };
    let end = after_start + rel_end;

    ThoughtSummary {
        subject: raw[after_start..end].trim().to_string(),
        description: format!("{}{}", &raw[..start], &raw[end + DELIM.len()..])
            .trim()
            .to_string(),
    }
}

pub(super) fn build_system_prompt(
    template: &str,
    inputs: &AgentInputs,
    environment_context: Option<&str>,
) -> String {
    let mut prompt = template_string(template, inputs);

    if let Some(env) = environment_context.filter(|e| !e.trim().is_empty()) {
        prompt.push_str("\n\n# Environment Context\n");
        prompt.push_str(env);
    }

    prompt.push_str(
        "\nImportant Rules:\n\
         * You are running in a non-interactive mode. You CANNOT ask the user for input or clarification.\n\
         * Work systematically using available tools to complete your task.\n\
         * Always use absolute paths for file operations. Construct them using the provided \"Environment Context\".",
    );
    prompt.push_str(&format!(
        "\n* When you have completed your task, you MUST call the `{TASK_COMPLETE_TOOL_NAME}` tool.\
         \n* Do not call any other tools in the same turn as `{TASK_COMPLETE_TOOL_NAME}`.\
         \n* This is the ONLY way to complete your mission. If you stop calling tools without calling this, you have failed."
    ));
    prompt
}

/// Initial messages with `{{key}}` substituted in their text parts.
pub(super) fn template_initial_messages(messages: &[Content], inputs: &AgentInputs) -> Vec<Content> {
    messages
        .iter()
        .map(|content| Content {
            role: content.role,
            parts: content
                .parts
                .iter()
                .map(|part| match part {
                    Part::Text { text } => Part::text(template_string(text, inputs)),
                    other => other.clone(),
                })
                .collect(),
        })
        .collect()
}

/// Declaration of the reserved completion tool.
pub fn completion_declaration(output: Option<&OutputConfig>) -> ToolDefinition {
    match output {
        None => ToolDefinition {
            name: TASK_COMPLETE_TOOL_NAME.into(),
            description: "Call this tool to signal that you have completed your task. This is the ONLY way to finish.".into(),
            parameters: ParameterSchema::object(),
        },
        Some(cfg) => ToolDefinition {
            name: TASK_COMPLETE_TOOL_NAME.into(),
            description: "Call this tool to submit your final answer and complete the task. This is the ONLY way to finish.".into(),
            parameters: ParameterSchema::object().property(
                cfg.output_name.clone(),
                PropertySchema::string(),
                true,
            ),
        },
    }
}

/// Every registered tool must be on the non-interactive allow-list.
pub(super) fn validate_tools(registry: &ToolRegistry, agent: &str) -> Result<(), ConfigurationError> {
    for name in registry.tool_names() {
        if !NON_INTERACTIVE_ALLOW_LIST.contains(&name.as_str()) {
            return Err(ConfigurationError::ToolNotAllowListed {
                tool: name,
                agent: agent.to_string(),
            });
        }
    }
    Ok(())
}

/// `"{parent}-{name}-{hex nanos}"`, parent prefix only when present.
pub(super) fn agent_id(parent_prompt_id: Option<&str>, name: &str) -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    match parent_prompt_id.filter(|p| !p.is_empty()) {
        Some(parent) => format!("{parent}-{name}-{nanos:x}"),
        None => format!("{name}-{nanos:x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, serde_json::Value)]) -> AgentInputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn template_substitutes_strings_unquoted_and_leaves_unknowns() {
        let vars = inputs(&[
            ("objective", serde_json::json!("find the bug")),
            ("depth", serde_json::json!(3)),
        ]);
        assert_eq!(
            template_string("Goal: {{objective}} depth={{depth}} {{missing}}", &vars),
            "Goal: find the bug depth=3 {{missing}}"
        );
    }

    #[test]
    fn parse_thought_extracts_subject() {
        let thought = parse_thought("  **Scanning files** looking for main.rs ");
        assert_eq!(thought.subject, "Scanning files");
        assert_eq!(thought.description, "looking for main.rs");

        let plain = parse_thought("no subject here");
        assert_eq!(plain.subject, "");
        assert_eq!(plain.description, "no subject here");

        let unterminated = parse_thought("**half open");
        assert_eq!(unterminated.subject, "");
        assert_eq!(unterminated.description, "**half open");
    }

    #[test]
    fn system_prompt_appends_rules_and_environment() {
        let vars = inputs(&[("objective", serde_json::json!("map the repo"))]);
        let prompt = build_system_prompt("Your job: {{objective}}", &vars, Some("cwd: /work"));
        assert!(prompt.starts_with("Your job: map the repo"));
        assert!(prompt.contains("# Environment Context\ncwd: /work"));
        assert!(prompt.contains("Important Rules:"));
        assert!(prompt.contains("you MUST call the `task_complete` tool."));

        let bare = build_system_prompt("x", &vars, None);
        assert!(!bare.contains("Environment Context\n"));
    }

    #[test]
    fn completion_declaration_requires_output_name() {
        let plain = completion_declaration(None);
        assert!(plain.parameters.required.is_empty());

        let cfg = OutputConfig {
            output_name: "report".into(),
            format: Default::default(),
        };
        let with_output = completion_declaration(Some(&cfg));
        assert_eq!(with_output.parameters.required, vec!["report".to_string()]);
        assert_eq!(with_output.parameters.properties["report"].property_type, "string");
        assert!(with_output.description.starts_with("Call this tool to submit your final answer"));
    }

    #[test]
    fn agent_id_carries_parent_prefix() {
        let id = agent_id(Some("main#2-1"), "investigator");
        assert!(id.starts_with("main#2-1-investigator-"));
        let root = agent_id(None, "investigator");
        assert!(root.starts_with("investigator-"));
        assert!(!agent_id(Some(""), "x").starts_with('-'));
    }
}
