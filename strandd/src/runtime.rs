use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use strand_agent::agent_registry::AgentRegistry;
use strand_agent::approval::ApprovalBroker;
use strand_agent::chat::{ChatHub, ChatRuntime, ChatSettings};
use strand_agent::executor::{AgentExecutor, RuntimeContext};
use strand_agent::model_router::ModelRouter;
use strand_agent::registry::ToolRegistry;
use strand_agent::session::InMemorySessionStore;
use strand_agent::subagent::SubagentTool;
use strand_core::agent::{AgentInputs, OutputObject};
use strand_core::config::StrandConfig;
use strand_core::event::ActivityCallback;

use crate::backends::build_backend_table;
use crate::tools::workspace_registry;

/// Everything the daemon wires together at startup.
pub struct Services {
    pub runtime: RuntimeContext,
    /// Workspace tools only; what agents draw from.
    pub tools: Arc<ToolRegistry>,
    pub agents: AgentRegistry,
    pub chat: ChatHub,
    chat_settings: watch::Sender<ChatSettings>,
}

impl Services {
    pub fn build(config: &StrandConfig, workspace: &Path) -> Result<Self> {
        let backends = Arc::new(
            build_backend_table(&config.backends).context("building backend table")?,
        );
        let runtime = RuntimeContext::new(backends.clone()).with_environment_context(format!(
            "Workspace root: {}",
            workspace.display()
        ));
        let tools = Arc::new(workspace_registry(workspace).context("registering workspace tools")?);
        let agents = AgentRegistry::initialize(config);

        // Chat sees the workspace tools plus every agent exposed as a tool.
        let mut chat_tools = ToolRegistry::new();
        for tool in tools.all_tools() {
            chat_tools.register(tool)?;
        }
        for definition in agents.definitions() {
            let subagent = SubagentTool::new(definition.clone(), runtime.clone(), tools.clone())
                .with_context(|| format!("wrapping agent '{}' as a tool", definition.name))?
                .with_activity_sink(log_activity());
            chat_tools
                .register(Arc::new(subagent))
                .with_context(|| format!("exposing agent '{}' as a tool", definition.name))?;
        }

        let (chat_settings, settings_rx) = watch::channel(ChatSettings::from_config(config));
        let chat = ChatHub::new(ChatRuntime {
            backends,
            router: Arc::new(ModelRouter::standard(config)),
            registry: Arc::new(chat_tools),
            store: InMemorySessionStore::new(),
            broker: Arc::new(ApprovalBroker::new()),
            settings: settings_rx,
        });

        Ok(Self {
            runtime,
            tools,
            agents,
            chat,
            chat_settings,
        })
    }

    /// Push the reloadable parts of a new config to live chat sessions.
    /// Returns true when anything changed.
    pub fn apply_config(&self, config: &StrandConfig) -> bool {
        let next = ChatSettings::from_config(config);
        self.chat_settings.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Run one agent to completion outside of any chat.
    pub async fn run_agent(
        &self,
        name: &str,
        inputs: AgentInputs,
        cancel: &CancellationToken,
    ) -> Result<OutputObject> {
        let definition = self.agents.get(name)?.clone();
        let executor = AgentExecutor::create(
            definition,
            self.runtime.clone(),
            &self.tools,
            None,
            Some(log_activity()),
        )?;
        let output = executor.run(&inputs, cancel).await?;
        Ok(output)
    }
}

fn log_activity() -> ActivityCallback {
    Arc::new(|event| {
        tracing::debug!(
            agent = %event.agent_name,
            activity = ?event.activity,
            "agent activity"
        );
    })
}

/// Parse repeated `key=value` flags into agent inputs. Values that parse as
/// JSON (numbers, booleans, arrays) keep their type; everything else is a string.
pub fn parse_inputs(pairs: &[String]) -> Result<AgentInputs> {
    let mut inputs = AgentInputs::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("input '{pair}' must look like key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("input '{pair}' has an empty key");
        }
        let value = match serde_json::from_str::<serde_json::Value>(value) {
            Ok(parsed) if !parsed.is_string() && !parsed.is_object() => parsed,
            _ => serde_json::Value::String(value.to_string()),
        };
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}
