//! Model selection via an ordered chain of routing strategies.

use std::sync::Arc;

use async_trait::async_trait;

use strand_core::config::Settings;
use strand_core::error::{RoutingError, StrandError};
use strand_core::routing::{RoutingContext, RoutingDecision, RoutingStrategy};

/// Suggests a cheaper model after a quota failure.
pub struct FallbackStrategy;

impl FallbackStrategy {
    /// Per-kind fallback ladder. Only the last path segment of the model id is inspected.
    pub fn suggest(executor_type: &str, model: &str) -> Option<&'static str> {
        let leaf = model.rsplit('/').next().unwrap_or(model);
        match executor_type {
            "gemini" => {
                if leaf.contains("pro") {
                    Some("gemini-flash")
                } else if leaf.contains("flash") && !leaf.contains("lite") {
                    Some("gemini-flash-lite")
                } else {
                    None
                }
            }
            "qwen" => {
                if leaf.contains("max") {
                    Some("qwen-plus")
                } else if leaf.contains("plus") {
                    Some("qwen-turbo")
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
impl RoutingStrategy for FallbackStrategy {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn route(&self, ctx: &RoutingContext) -> Result<Option<RoutingDecision>, StrandError> {
        if !ctx.is_fallback {
            return Ok(None);
        }
        let current = ctx.current_model.as_deref().ok_or(RoutingError::Strategy {
            strategy: "fallback",
            reason: "no current model to fall back from".into(),
        })?;
        Ok(Self::suggest(&ctx.executor_type, current).map(|model| {
            RoutingDecision::new(
                model,
                self.name(),
                "Suggesting a fallback model due to an error.",
            )
        }))
    }
}

/// Honors an explicit model choice unless it is unset or `"auto"`.
pub struct OverrideStrategy;

#[async_trait]
impl RoutingStrategy for OverrideStrategy {
    fn name(&self) -> &'static str {
        "override"
    }

    async fn route(&self, ctx: &RoutingContext) -> Result<Option<RoutingDecision>, StrandError> {
        Ok(ctx
            .requested_model
            .as_deref()
            .filter(|m| !m.is_empty() && *m != "auto")
            .map(|m| RoutingDecision::new(m, self.name(), "Model overridden by user")))
    }
}

/// Sends code-related requests to a stronger model.
pub struct ClassifierStrategy {
    model: String,
}

impl ClassifierStrategy {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

#[async_trait]
impl RoutingStrategy for ClassifierStrategy {
    fn name(&self) -> &'static str {
        "classifier"
    }

    async fn route(&self, ctx: &RoutingContext) -> Result<Option<RoutingDecision>, StrandError> {
        if ctx.request.to_lowercase().contains("code") {
            return Ok(Some(RoutingDecision::new(
                self.model.clone(),
                self.name(),
                "Request contains 'code', suggesting a more powerful model.",
            )));
        }
        Ok(None)
    }
}

pub struct DefaultStrategy {
    model: Option<String>,
}

impl DefaultStrategy {
    pub fn new(model: Option<String>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl RoutingStrategy for DefaultStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn route(&self, _ctx: &RoutingContext) -> Result<Option<RoutingDecision>, StrandError> {
        let model = self
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or(RoutingError::Strategy {
                strategy: "default",
                reason: "no default model configured".into(),
            })?;
        Ok(Some(RoutingDecision::new(
            model,
            self.name(),
            "Default model selected",
        )))
    }
}

/// First decision wins. Failing strategies count as declines.
#[derive(Clone)]
pub struct ModelRouter {
    strategies: Vec<Arc<dyn RoutingStrategy>>,
}

impl ModelRouter {
    pub fn new(strategies: Vec<Arc<dyn RoutingStrategy>>) -> Self {
        Self { strategies }
    }

    /// Fallback, Override, Classifier, Default.
    pub fn standard(settings: &dyn Settings) -> Self {
        Self::new(vec![
            Arc::new(FallbackStrategy),
            Arc::new(OverrideStrategy),
            Arc::new(ClassifierStrategy::new(settings.classifier_model())),
            Arc::new(DefaultStrategy::new(settings.default_model())),
        ])
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn route(&self, ctx: &RoutingContext) -> Result<RoutingDecision, StrandError> {
        for strategy in &self.strategies {
            match strategy.route(ctx).await {
                Ok(Some(decision)) => {
                    tracing::debug!(
                        strategy = strategy.name(),
                        model = %decision.model,
                        reasoning = %decision.metadata.reasoning,
                        "routing decision"
                    );
                    return Ok(decision);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(strategy = strategy.name(), error = %err, "routing strategy failed");
                }
            }
        }
        Err(RoutingError::NoDecision.into())
    }
}
