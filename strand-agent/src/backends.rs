use std::sync::Arc;

use strand_core::error::{LlmError, StrandError};

use crate::llm::ModelBackend;

/// Builds a backend for a concrete model name.
pub type BackendFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn ModelBackend>, StrandError> + Send + Sync>;

struct BackendEntry {
    prefix: String,
    kind: String,
    factory: BackendFactory,
}

/// Model-name prefix → backend constructor. Built once at startup.
#[derive(Default)]
pub struct BackendTable {
    entries: Vec<BackendEntry>,
    default: Option<usize>,
}

impl std::fmt::Debug for BackendTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows: Vec<(&str, &str)> = self
            .entries
            .iter()
            .map(|e| (e.prefix.as_str(), e.kind.as_str()))
            .collect();
        f.debug_struct("BackendTable")
            .field("entries", &rows)
            .field("default", &self.default)
            .finish()
    }
}

impl BackendTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        prefix: impl Into<String>,
        kind: impl Into<String>,
        factory: BackendFactory,
    ) -> &mut Self {
        self.entries.push(BackendEntry {
            prefix: prefix.into(),
            kind: kind.into(),
            factory,
        });
        self
    }

    /// Same as [`register`](Self::register), and marks the entry as the fallback
    /// for models no prefix matches.
    pub fn register_default(
        &mut self,
        prefix: impl Into<String>,
        kind: impl Into<String>,
        factory: BackendFactory,
    ) -> &mut Self {
        self.register(prefix, kind, factory);
        self.default = Some(self.entries.len() - 1);
        self
    }

    /// Single-backend table: every model resolves to `backend`.
    pub fn single(kind: impl Into<String>, backend: Arc<dyn ModelBackend>) -> Self {
        let mut table = Self::new();
        table.register_default("", kind, Arc::new(move |_| Ok(backend.clone())));
        table
    }

    fn entry_for(&self, model: &str) -> Option<&BackendEntry> {
        self.entries
            .iter()
            .filter(|e| model.starts_with(&e.prefix))
            .max_by_key(|e| e.prefix.len())
            .or_else(|| self.default.and_then(|i| self.entries.get(i)))
    }

    /// Executor kind the model would run on.
    pub fn kind_for(&self, model: &str) -> Option<&str> {
        self.entry_for(model).map(|e| e.kind.as_str())
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<dyn ModelBackend>, StrandError> {
        let entry = self.entry_for(model).ok_or_else(|| LlmError::NoBackend {
            model: model.to_string(),
        })?;
        tracing::debug!(model, prefix = %entry.prefix, kind = %entry.kind, "resolved backend");
        (entry.factory)(model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
