//! Agents shipped with the runtime. Prompts live in `prompts/*.md`, one `## Header`
//! section per field.

use std::collections::{BTreeMap, HashMap};

use strand_core::agent::{
    AgentDefinition, InputConfig, InputParameter, ModelConfig, OutputConfig, OutputFormat,
    PromptConfig, RunConfig, ToolConfig,
};

pub const CODEBASE_INVESTIGATOR: &str = "codebase_investigator";
pub const TEST_WRITER: &str = "test_writer";
pub const REFACTOR: &str = "refactor";

const INVESTIGATOR_PROMPTS: &str = include_str!("prompts/codebase_investigator.md");
const TEST_WRITER_PROMPTS: &str = include_str!("prompts/test_writer.md");
const REFACTOR_PROMPTS: &str = include_str!("prompts/refactor.md");

/// Split a prompt file into `header -> body`.
pub(crate) fn parse_sections(source: &str) -> HashMap<String, String> {
    source
        .split("## ")
        .filter(|section| !section.trim().is_empty())
        .filter_map(|section| {
            let (header, body) = section.split_once('\n')?;
            Some((header.trim().to_string(), body.trim().to_string()))
        })
        .collect()
}

fn section(sections: &HashMap<String, String>, key: &str) -> String {
    sections.get(key).cloned().unwrap_or_default()
}

fn required_input(description: impl Into<String>) -> InputParameter {
    InputParameter {
        description: description.into(),
        input_type: "string".into(),
        required: true,
    }
}

fn report_output() -> Option<OutputConfig> {
    Some(OutputConfig {
        output_name: "report".into(),
        format: OutputFormat::PrettyJson,
    })
}

fn tools(names: &[&str]) -> Option<ToolConfig> {
    Some(ToolConfig {
        tools: names.iter().map(|n| n.to_string()).collect(),
    })
}

pub fn codebase_investigator() -> AgentDefinition {
    let prompts = parse_sections(INVESTIGATOR_PROMPTS);
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "objective".to_string(),
        required_input(section(&prompts, "Objective Description")),
    );

    AgentDefinition {
        name: CODEBASE_INVESTIGATOR.into(),
        display_name: "Codebase Investigator Agent".into(),
        description: section(&prompts, "Description"),
        input_config: InputConfig { inputs },
        output_config: report_output(),
        model_config: ModelConfig::default(),
        run_config: RunConfig {
            max_turns: 15,
            max_time_minutes: 5,
        },
        // Read-only tools.
        tool_config: tools(&["list_directory", "read_file", "glob", "search_file_content"]),
        prompt_config: PromptConfig {
            system_prompt: Some(section(&prompts, "System Prompt")),
            initial_messages: Vec::new(),
            query: Some(section(&prompts, "Query")),
        },
    }
}

pub fn test_writer() -> AgentDefinition {
    let prompts = parse_sections(TEST_WRITER_PROMPTS);
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "source_file_path".to_string(),
        required_input("The path to the source file containing the symbol to test."),
    );
    inputs.insert(
        "symbol_name".to_string(),
        required_input("The name of the function or method to write tests for."),
    );

    AgentDefinition {
        name: TEST_WRITER.into(),
        display_name: "Test Writer Agent".into(),
        description: section(&prompts, "Description"),
        input_config: InputConfig { inputs },
        output_config: report_output(),
        model_config: ModelConfig::default(),
        run_config: RunConfig {
            max_turns: 15,
            max_time_minutes: 5,
        },
        tool_config: tools(&["read_file", "write_file", "run_tests", "find_references"]),
        prompt_config: PromptConfig {
            system_prompt: Some(section(&prompts, "System Prompt")),
            initial_messages: Vec::new(),
            query: Some(section(&prompts, "Query")),
        },
    }
}

pub fn refactor() -> AgentDefinition {
    let prompts = parse_sections(REFACTOR_PROMPTS);
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "target_path".to_string(),
        required_input("The file path or directory containing the code to be refactored."),
    );
    inputs.insert(
        "refactoring_goal".to_string(),
        required_input(
            "A clear description of the refactoring goal (e.g., 'Simplify the processOrder function by extracting helper methods').",
        ),
    );

    AgentDefinition {
        name: REFACTOR.into(),
        display_name: "Refactor Agent".into(),
        description: section(&prompts, "Description"),
        input_config: InputConfig { inputs },
        output_config: report_output(),
        model_config: ModelConfig::default(),
        run_config: RunConfig {
            max_turns: 30,
            max_time_minutes: 15,
        },
        tool_config: tools(&[
            "read_file",
            "write_file",
            "run_tests",
            "extract_function",
            "rename_symbol",
            "smart_edit",
            "git_commit",
        ]),
        prompt_config: PromptConfig {
            system_prompt: Some(section(&prompts, "System Prompt")),
            initial_messages: Vec::new(),
            query: Some(section(&prompts, "Query")),
        },
    }
}

pub fn all() -> Vec<AgentDefinition> {
    vec![codebase_investigator(), test_writer(), refactor()]
}
