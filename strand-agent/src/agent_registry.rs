use std::collections::HashMap;

use strand_core::agent::AgentDefinition;
use strand_core::config::Settings;
use strand_core::error::ConfigurationError;

use crate::builtin;

/// Agent definitions available to this process, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentDefinition>,
    debug: bool,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-ins enabled in `settings` (with their overrides), then custom agents.
    pub fn initialize(settings: &dyn Settings) -> Self {
        let mut registry = Self {
            agents: HashMap::new(),
            debug: settings.debug(),
        };

        for mut definition in builtin::all() {
            let Some(overrides) = settings.agent_overrides(&definition.name) else {
                continue;
            };
            if !overrides.enabled {
                continue;
            }
            definition.apply_overrides(&overrides);
            registry.load(definition);
        }

        for definition in settings.custom_agents() {
            registry.load(definition);
        }

        tracing::info!(agents = ?registry.names(), "agent registry initialized");
        registry
    }

    /// Strict registration: rejects invalid definitions and duplicates.
    pub fn register(&mut self, definition: AgentDefinition) -> Result<(), ConfigurationError> {
        definition.validate()?;
        if self.agents.contains_key(&definition.name) {
            return Err(ConfigurationError::DuplicateAgent {
                name: definition.name,
            });
        }
        self.agents.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Loader path: invalid definitions are logged and skipped, later loads win.
    fn load(&mut self, definition: AgentDefinition) {
        if let Err(err) = definition.validate() {
            tracing::error!(agent = %definition.name, error = %err, "skipping invalid agent definition");
            return;
        }
        if self.agents.contains_key(&definition.name) && self.debug {
            tracing::debug!(agent = %definition.name, "overriding existing agent");
        }
        self.agents.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Result<&AgentDefinition, ConfigurationError> {
        self.agents
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownAgent {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<&AgentDefinition> {
        let mut defs: Vec<&AgentDefinition> = self.agents.values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
