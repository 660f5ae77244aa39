use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{error, info, warn};

use strand_agent::builtin;
use strand_agent::executor::NON_INTERACTIVE_ALLOW_LIST;
use strand_core::config::StrandConfig;

/// Load and deserialize config from a TOML file.
pub fn load_config(path: &Path) -> Result<StrandConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config: StrandConfig =
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
    Ok(config)
}

/// Validate config for internal consistency:
/// - the bind address parses
/// - backend prefixes are unique and at most one row is the default
/// - agent overrides name a built-in agent
/// - custom agents are complete, uniquely named and only use unattended-safe tools
pub fn validate_config(config: &StrandConfig) -> Result<()> {
    config
        .server
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("server.bind_addr '{}' is not a socket address", config.server.bind_addr))?;

    let mut prefixes = HashSet::new();
    for backend in &config.backends {
        if !prefixes.insert(backend.prefix.as_str()) {
            anyhow::bail!("backend prefix '{}' is configured more than once", backend.prefix);
        }
    }
    let defaults = config.backends.iter().filter(|b| b.default).count();
    if defaults > 1 {
        anyhow::bail!("{defaults} backends are marked default; at most one is allowed");
    }

    let builtins: Vec<String> = builtin::all().into_iter().map(|d| d.name).collect();
    for name in config.agents.keys() {
        if !builtins.contains(name) {
            anyhow::bail!(
                "[agents.{name}] does not match a built-in agent (known: {})",
                builtins.join(", ")
            );
        }
    }

    let mut custom_names = HashSet::new();
    for agent in &config.custom_agents {
        agent
            .validate()
            .with_context(|| format!("custom agent '{}'", agent.name))?;
        if !custom_names.insert(agent.name.as_str()) {
            anyhow::bail!("custom agent '{}' is defined more than once", agent.name);
        }
        for tool in agent.tool_names() {
            if !NON_INTERACTIVE_ALLOW_LIST.contains(&tool.as_str()) {
                anyhow::bail!(
                    "custom agent '{}' uses tool '{}' which cannot run without confirmation",
                    agent.name,
                    tool
                );
            }
        }
    }

    info!("config validation passed");
    Ok(())
}

/// Re-read the file and publish it if valid. Invalid files keep the old config.
pub fn reload_into(path: &Path, tx: &watch::Sender<Arc<StrandConfig>>) -> bool {
    match load_config(path).and_then(|cfg| validate_config(&cfg).map(|()| cfg)) {
        Ok(new_config) => {
            if tx.send(Arc::new(new_config)).is_err() {
                warn!("config watch channel closed");
                return false;
            }
            info!("config reloaded successfully");
            true
        }
        Err(e) => {
            error!("new config rejected, keeping old config: {e:#}");
            false
        }
    }
}

/// Spawn a file watcher that sends updated configs on a watch channel when the file changes.
/// Returns the watcher (must be kept alive) plus the sender, so other triggers
/// (SIGHUP) can publish through the same channel.
pub fn spawn_config_watcher(
    path: &Path,
    initial: StrandConfig,
) -> Result<(
    RecommendedWatcher,
    Arc<watch::Sender<Arc<StrandConfig>>>,
    watch::Receiver<Arc<StrandConfig>>,
)> {
    let (tx, rx) = watch::channel(Arc::new(initial));
    let tx = Arc::new(tx);

    let watched_path: PathBuf = path.to_path_buf();
    let watcher_tx = tx.clone();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    info!("config file changed, reloading");
                    reload_into(&watched_path, &watcher_tx);
                }
            }
            Err(e) => {
                error!("config file watcher error: {e}");
            }
        })?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;

    Ok((watcher, tx, rx))
}
