use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StrandError;

/// Input to model selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingContext {
    #[serde(default)]
    pub history: Vec<String>,
    pub request: String,
    /// Set when the previous attempt failed and a fallback is wanted.
    #[serde(default)]
    pub is_fallback: bool,
    /// Backend kind currently in use (`gemini`, `qwen`, ...).
    #[serde(default)]
    pub executor_type: String,
    /// Model currently in use.
    #[serde(default)]
    pub current_model: Option<String>,
    /// Model explicitly requested by the user; `"auto"` defers to the chain.
    #[serde(default)]
    pub requested_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub source: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub model: String,
    pub metadata: RoutingMetadata,
}

impl RoutingDecision {
    pub fn new(model: impl Into<String>, source: &str, reasoning: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            metadata: RoutingMetadata {
                source: source.to_string(),
                reasoning: reasoning.into(),
            },
        }
    }
}

/// One link in the routing chain. `Ok(None)` declines.
#[async_trait]
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn route(&self, ctx: &RoutingContext) -> Result<Option<RoutingDecision>, StrandError>;
}
