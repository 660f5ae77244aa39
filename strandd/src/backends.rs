use std::sync::Arc;

use rig::client::CompletionClient;

use strand_agent::backends::{BackendFactory, BackendTable};
use strand_agent::llm::{ModelBackend, RigBackend};
use strand_core::config::BackendConfig;
use strand_core::error::{InfraError, StrandError};

use crate::mock_backend::MockBackend;

/// Build the backend table from `[[backends]]`, once, at startup.
pub fn build_backend_table(rows: &[BackendConfig]) -> Result<BackendTable, StrandError> {
    if rows.is_empty() {
        return Err(InfraError::Config("no [[backends]] configured".into()).into());
    }

    let mut table = BackendTable::new();
    for row in rows {
        let factory = backend_factory(row)?;
        if row.default {
            table.register_default(row.prefix.clone(), row.kind.clone(), factory);
        } else {
            table.register(row.prefix.clone(), row.kind.clone(), factory);
        }
        tracing::info!(
            prefix = %row.prefix,
            kind = %row.kind,
            provider = %row.provider,
            default = row.default,
            "backend registered"
        );
    }
    Ok(table)
}

fn backend_factory(row: &BackendConfig) -> Result<BackendFactory, StrandError> {
    if row.provider == "mock" {
        let backend: Arc<dyn ModelBackend> = Arc::new(MockBackend);
        return Ok(Arc::new(move |_model: &str| Ok(backend.clone())));
    }

    let env_var = row
        .api_key_env
        .clone()
        .unwrap_or_else(|| api_key_env_var(&row.provider));
    let key = std::env::var(&env_var).map_err(|_| {
        InfraError::Config(format!(
            "{env_var} is required when using provider='{}'",
            row.provider
        ))
    })?;

    let base_url = row
        .base_url
        .as_deref()
        .or_else(|| default_base_url(&row.provider));

    let client = match base_url {
        Some(url) => rig::providers::openai::CompletionsClient::builder()
            .api_key(&key)
            .base_url(url)
            .build(),
        None if row.provider == "openai" => rig::providers::openai::CompletionsClient::new(&key),
        None => {
            return Err(InfraError::Config(format!(
                "provider '{}' requires a base_url in config",
                row.provider
            ))
            .into());
        }
    }
    .map_err(|e| InfraError::Config(format!("failed to create LLM client: {e}")))?;

    let kind = row.kind.clone();
    Ok(Arc::new(move |model: &str| {
        let backend: Arc<dyn ModelBackend> =
            Arc::new(RigBackend::new(kind.clone(), client.completion_model(model)));
        Ok(backend)
    }))
}

/// OpenAI-compatible endpoints for providers that need no explicit `base_url`.
fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "gemini" | "google" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "qwen" | "dashscope" => Some("https://dashscope-intl.aliyuncs.com/compatible-mode/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "mistral" => Some("https://api.mistral.ai/v1"),
        _ => None,
    }
}

fn api_key_env_var(provider: &str) -> String {
    match provider {
        "openai" => "OPENAI_API_KEY".into(),
        "gemini" | "google" => "GEMINI_API_KEY".into(),
        "qwen" | "dashscope" => "DASHSCOPE_API_KEY".into(),
        "groq" => "GROQ_API_KEY".into(),
        "mistral" => "MISTRAL_API_KEY".into(),
        other => format!("{}_API_KEY", other.to_ascii_uppercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(prefix: &str, provider: &str, default: bool) -> BackendConfig {
        BackendConfig {
            prefix: prefix.into(),
            kind: "mock".into(),
            provider: provider.into(),
            base_url: None,
            api_key_env: None,
            default,
        }
    }

    #[test]
    fn mock_rows_resolve_by_prefix_and_default() {
        let table = build_backend_table(&[row("mock-", "mock", true)]).expect("table");
        assert_eq!(table.kind_for("mock-large"), Some("mock"));
        let backend = table.resolve("anything-else").expect("default entry");
        assert_eq!(backend.kind(), "mock");
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let mut gemini = row("gemini-", "gemini", false);
        gemini.api_key_env = Some("STRAND_TEST_KEY_THAT_IS_NEVER_SET".into());
        let err = build_backend_table(&[gemini]).expect_err("no key");
        assert!(err.to_string().contains("STRAND_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(build_backend_table(&[]).is_err());
    }

    #[test]
    fn provider_defaults() {
        assert_eq!(api_key_env_var("gemini"), "GEMINI_API_KEY");
        assert_eq!(api_key_env_var("acme"), "ACME_API_KEY");
        assert!(default_base_url("openai").is_none());
        assert!(default_base_url("qwen").is_some());
    }
}
