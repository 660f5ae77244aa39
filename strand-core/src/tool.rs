use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// Arguments supplied by the model for a single call.
pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

/// Name of the reserved tool an agent calls to finish its run.
pub const TASK_COMPLETE_TOOL_NAME: &str = "task_complete";

/// Declaration of a tool as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::object()
    }
}

impl ParameterSchema {
    pub fn object() -> Self {
        Self {
            schema_type: "object".into(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema, required: bool) -> Self {
        let name = name.into();
        if required && !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn new(property_type: impl Into<String>) -> Self {
        Self {
            property_type: property_type.into(),
            description: None,
            items: None,
        }
    }

    pub fn string() -> Self {
        Self::new("string")
    }

    pub fn array_of(items: PropertySchema) -> Self {
        Self {
            property_type: "array".into(),
            description: None,
            items: Some(Box::new(items)),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Outcome of a tool execution: one view for the model, one for humans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub llm_content: serde_json::Value,
    #[serde(default)]
    pub return_display: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolResultError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            llm_content: serde_json::Value::String(content.clone()),
            return_display: content,
            error: None,
        }
    }

    pub fn structured(content: serde_json::Value, display: impl Into<String>) -> Self {
        Self {
            llm_content: content,
            return_display: display.into(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            llm_content: serde_json::Value::String(message.clone()),
            return_display: message.clone(),
            error: Some(ToolResultError {
                message,
                kind: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Progress reported by a long-running tool while it executes.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolUpdate {
    Output { call_id: String, chunk: String },
    Pid { call_id: String, pid: u32 },
}

/// Per-call execution context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub cancel: CancellationToken,
    updates: Option<mpsc::UnboundedSender<ToolUpdate>>,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            call_id: call_id.into(),
            cancel,
            updates: None,
        }
    }

    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<ToolUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report_output(&self, chunk: impl Into<String>) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(ToolUpdate::Output {
                call_id: self.call_id.clone(),
                chunk: chunk.into(),
            });
        }
    }

    pub fn report_pid(&self, pid: u32) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(ToolUpdate::Pid {
                call_id: self.call_id.clone(),
                pid,
            });
        }
    }
}

/// A named capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError>;
}
