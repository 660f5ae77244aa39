//! Conversation content exchanged with a model backend.

use serde::{Deserialize, Serialize};

use crate::tool::ToolArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: ToolArgs,
}

/// The answer to a [`FunctionCall`], sent back on the next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Thought { text: String },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn token_estimate(&self) -> u32 {
        match self {
            Self::Text { text } | Self::Thought { text } => estimate_tokens(text),
            Self::FunctionCall(call) => {
                estimate_tokens(&call.name).saturating_add(estimate_tokens(
                    &serde_json::Value::Object(call.args.clone()).to_string(),
                ))
            }
            Self::FunctionResponse(resp) => {
                estimate_tokens(&resp.name).saturating_add(estimate_tokens(&resp.response.to_string()))
            }
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
        }
    }

    pub fn user_parts(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model_parts(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    /// Concatenated plain text, thoughts excluded.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(|p| match p {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn token_estimate(&self) -> u32 {
        self.parts
            .iter()
            .map(Part::token_estimate)
            .fold(0, u32::saturating_add)
    }
}

/// Simple token estimate: ~4 chars per token, never zero.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count() / 4)
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Estimated token count of a whole history.
pub fn estimate_history_tokens(history: &[Content]) -> u32 {
    history
        .iter()
        .map(Content::token_estimate)
        .fold(0, u32::saturating_add)
}
