//! Exposes an agent definition as an ordinary tool.

use std::sync::Arc;

use async_trait::async_trait;

use strand_core::agent::{AgentDefinition, InputConfig, TerminateMode};
use strand_core::error::{ConfigurationError, ToolError};
use strand_core::event::ActivityCallback;
use strand_core::tool::{
    ParameterSchema, PropertySchema, Tool, ToolArgs, ToolContext, ToolDefinition, ToolResult,
    ToolResultError,
};

use crate::executor::{AgentExecutor, RuntimeContext};
use crate::registry::ToolRegistry;

/// Translate an input config into a JSON-schema object.
pub fn input_schema(config: &InputConfig) -> Result<ParameterSchema, ConfigurationError> {
    let mut schema = ParameterSchema::object();
    for (name, input) in &config.inputs {
        let property = match input.input_type.as_str() {
            "string" | "number" | "integer" | "boolean" => PropertySchema::new(input.input_type.clone()),
            "string[]" => PropertySchema::array_of(PropertySchema::string()),
            "number[]" => PropertySchema::array_of(PropertySchema::new("number")),
            other => {
                return Err(ConfigurationError::Invalid(format!(
                    "unsupported input type '{other}' for parameter '{name}'. Supported types: string, number, integer, boolean, string[], number[]"
                )));
            }
        };
        schema = schema.property(name.clone(), property.describe(input.description.clone()), input.required);
    }
    Ok(schema)
}

pub struct SubagentTool {
    definition: AgentDefinition,
    parameters: ParameterSchema,
    runtime: RuntimeContext,
    parent: Arc<ToolRegistry>,
    on_activity: Option<ActivityCallback>,
}

impl SubagentTool {
    /// `parent` is the registry the subagent draws its tools from.
    pub fn new(
        definition: AgentDefinition,
        runtime: RuntimeContext,
        parent: Arc<ToolRegistry>,
    ) -> Result<Self, ConfigurationError> {
        definition.validate()?;
        let parameters = input_schema(&definition.input_config)?;
        Ok(Self {
            definition,
            parameters,
            runtime,
            parent,
            on_activity: None,
        })
    }

    pub fn with_activity_sink(mut self, sink: ActivityCallback) -> Self {
        self.on_activity = Some(sink);
        self
    }

    fn failure(&self, message: String) -> ToolError {
        ToolError::ExecutionFailed {
            name: self.definition.name.clone(),
            message,
        }
    }
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError> {
        for (name, input) in &self.definition.input_config.inputs {
            if input.required && !args.contains_key(name) {
                return Err(ToolError::InvalidArguments {
                    name: self.definition.name.clone(),
                    reason: ConfigurationError::MissingInput { name: name.clone() }.to_string(),
                });
            }
        }

        let executor = AgentExecutor::create(
            self.definition.clone(),
            self.runtime.clone(),
            &self.parent,
            Some(&ctx.call_id),
            self.on_activity.clone(),
        )
        .map_err(|e| self.failure(e.to_string()))?;

        tracing::info!(
            call_id = %ctx.call_id,
            agent_id = %executor.agent_id(),
            "delegating to subagent"
        );
        let output = executor
            .run(&args, &ctx.cancel)
            .await
            .map_err(|e| self.failure(e.to_string()))?;

        let content = serde_json::to_value(&output).map_err(|e| self.failure(e.to_string()))?;
        if output.terminate_reason == TerminateMode::Goal {
            return Ok(ToolResult::structured(content, output.result));
        }

        let message = format!(
            "Subagent '{}' stopped ({}): {}",
            self.definition.name, output.terminate_reason, output.result
        );
        Ok(ToolResult {
            llm_content: content,
            return_display: message.clone(),
            error: Some(ToolResultError {
                message,
                kind: Some(output.terminate_reason.to_string()),
            }),
        })
    }
}
