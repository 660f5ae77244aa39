use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::json;

use strand_agent::llm::{ChunkStream, ModelBackend, ModelRequest, StreamChunk};
use strand_core::content::{Content, FunctionCall, Role};
use strand_core::error::StrandError;
use strand_core::tool::{PropertySchema, TASK_COMPLETE_TOOL_NAME, ToolArgs};

/// Offline backend for smoke runs: agents finish on their first turn, chat echoes.
pub struct MockBackend;

#[async_trait]
impl ModelBackend for MockBackend {
    fn kind(&self) -> &str {
        "mock"
    }

    async fn send_message_stream(&self, request: ModelRequest) -> Result<ChunkStream, StrandError> {
        let completion = request
            .tools
            .iter()
            .find(|tool| tool.name == TASK_COMPLETE_TOOL_NAME);

        let chunk = match completion {
            Some(tool) => {
                let mut args = ToolArgs::new();
                for name in &tool.parameters.required {
                    let value = tool
                        .parameters
                        .properties
                        .get(name)
                        .map(|schema| placeholder(name, schema))
                        .unwrap_or_else(|| json!(format!("mock {name}")));
                    args.insert(name.clone(), value);
                }
                StreamChunk::FunctionCall(FunctionCall {
                    id: format!("{}-0", request.prompt_id),
                    name: TASK_COMPLETE_TOOL_NAME.to_string(),
                    args,
                })
            }
            None => StreamChunk::Text(format!("Echo: {}", last_user_text(&request.history))),
        };

        Ok(stream::iter(vec![Ok(chunk)]).boxed())
    }

    async fn generate(&self, _model: &str, prompt: &str) -> Result<String, StrandError> {
        let preview: String = prompt.chars().take(80).collect();
        Ok(format!("Summary: {preview}"))
    }
}

fn placeholder(name: &str, schema: &PropertySchema) -> serde_json::Value {
    match schema.property_type.as_str() {
        "number" | "integer" => json!(0),
        "boolean" => json!(false),
        "array" => json!([]),
        "object" => json!({}),
        _ => json!(format!("mock {name}")),
    }
}

fn last_user_text(history: &[Content]) -> String {
    history
        .iter()
        .rev()
        .filter(|content| content.role == Role::User)
        .map(Content::text)
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| "No message provided.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_agent::llm::GenerationConfig;
    use strand_core::tool::{ParameterSchema, ToolDefinition};

    fn request(tools: Vec<ToolDefinition>, history: Vec<Content>) -> ModelRequest {
        ModelRequest {
            model: "mock-model".into(),
            system_instruction: None,
            history,
            tools,
            generation: GenerationConfig::default(),
            prompt_id: "agent-1#0".into(),
        }
    }

    async fn first_chunk(request: ModelRequest) -> StreamChunk {
        let mut stream = MockBackend
            .send_message_stream(request)
            .await
            .expect("stream");
        stream.next().await.expect("one chunk").expect("ok chunk")
    }

    #[tokio::test]
    async fn completes_with_required_outputs_filled() {
        let completion = ToolDefinition {
            name: TASK_COMPLETE_TOOL_NAME.into(),
            description: "done".into(),
            parameters: ParameterSchema::object()
                .property("report", PropertySchema::string(), true)
                .property("score", PropertySchema::new("integer"), true)
                .property("notes", PropertySchema::string(), false),
        };
        match first_chunk(request(vec![completion], vec![Content::user("go")])).await {
            StreamChunk::FunctionCall(call) => {
                assert_eq!(call.name, TASK_COMPLETE_TOOL_NAME);
                assert_eq!(call.id, "agent-1#0-0");
                assert_eq!(call.args.get("report"), Some(&json!("mock report")));
                assert_eq!(call.args.get("score"), Some(&json!(0)));
                assert!(!call.args.contains_key("notes"));
            }
            other => panic!("expected completion call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_echoes_last_user_text() {
        let history = vec![
            Content::user("first"),
            Content::model("reply"),
            Content::user("second"),
        ];
        match first_chunk(request(vec![], history)).await {
            StreamChunk::Text(text) => assert_eq!(text, "Echo: second"),
            other => panic!("expected text, got {other:?}"),
        }
    }
}
