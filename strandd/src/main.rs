mod backends;
mod config;
mod mock_backend;
mod runtime;
mod shutdown;
mod telemetry;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use strand_stream::{StreamState, stream_router};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Strand daemon: agent runs, interactive chat sessions and their event stream.
#[derive(Parser, Debug)]
#[command(name = "strandd", version, about)]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    /// Increase log verbosity (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and exit.
    #[arg(long)]
    validate: bool,

    /// Run this agent once, print its output as JSON and exit.
    #[arg(long)]
    agent: Option<String>,

    /// Agent input as key=value; repeatable.
    #[arg(long = "input", value_name = "KEY=VALUE", requires = "agent")]
    inputs: Vec<String>,

    /// Root directory the file tools operate in.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Load and validate config
    // -----------------------------------------------------------------------
    let initial_config = config::load_config(&cli.config)?;
    config::validate_config(&initial_config)?;

    if cli.validate {
        println!("config is valid");
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 2. Initialize tracing
    // -----------------------------------------------------------------------
    let telemetry_guard = telemetry::init_telemetry(cli.verbose, cli.agent.is_some())?;
    info!(
        instance_id = %initial_config.global.instance_id,
        "strandd starting"
    );

    let workspace = std::fs::canonicalize(&cli.workspace)
        .with_context(|| format!("resolving workspace {}", cli.workspace.display()))?;
    let services = runtime::Services::build(&initial_config, &workspace)?;

    // -----------------------------------------------------------------------
    // 3. One-shot agent run
    // -----------------------------------------------------------------------
    if let Some(agent) = cli.agent.as_deref() {
        let inputs = runtime::parse_inputs(&cli.inputs)?;
        let cancel = CancellationToken::new();
        let ctrl_c_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, aborting agent run");
                ctrl_c_cancel.cancel();
            }
        });

        let output = services.run_agent(agent, inputs, &cancel).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("encoding agent output")?
        );
        telemetry_guard.flush();
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 4. Config watch and signals
    // -----------------------------------------------------------------------
    let (_watcher, config_tx, mut config_rx) =
        config::spawn_config_watcher(&cli.config, initial_config.clone())?;
    let mut signals = shutdown::Signals::register()?;

    // -----------------------------------------------------------------------
    // 5. Start the streaming server
    // -----------------------------------------------------------------------
    let stream_state = StreamState::new(Arc::new(services.chat.clone()));
    let router = stream_router(stream_state.clone());
    let bind_addr = initial_config.server.bind_addr.clone();

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(bind = %bind_addr, agents = ?services.agents.names(), "stream server listening");

    let server_stop = CancellationToken::new();
    let server_handle = tokio::spawn({
        let stop = server_stop.clone();
        async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                error!("stream server error: {e}");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 6. Main loop
    // -----------------------------------------------------------------------
    info!("entering main loop");
    loop {
        tokio::select! {
            lifecycle = signals.next() => match lifecycle {
                shutdown::Lifecycle::Stop(signal) => {
                    info!(signal, "beginning graceful shutdown");
                    break;
                }
                shutdown::Lifecycle::Reload => {
                    info!("received SIGHUP, reloading config");
                    config::reload_into(&cli.config, &config_tx);
                }
            },
            Ok(()) = config_rx.changed() => {
                let new_config = config_rx.borrow_and_update().clone();
                let chat_changed = services.apply_config(&new_config);
                info!(
                    instance_id = %new_config.global.instance_id,
                    chat_changed,
                    "config applied; backend, agent and logging changes take effect on restart"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // 7. Graceful shutdown
    // -----------------------------------------------------------------------
    shutdown::drain(&stream_state, &server_stop, server_handle, SHUTDOWN_GRACE).await;

    telemetry_guard.flush();
    info!("strandd stopped");
    Ok(())
}
