use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use strand_stream::StreamState;

/// What a process signal asks the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stop(&'static str),
    Reload,
}

/// SIGTERM and SIGINT stop the daemon, SIGHUP re-reads the config.
pub struct Signals {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl Signals {
    /// Handlers are installed here, before the server starts accepting.
    pub fn register() -> Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate()).context("registering SIGTERM handler")?,
            int: signal(SignalKind::interrupt()).context("registering SIGINT handler")?,
            hup: signal(SignalKind::hangup()).context("registering SIGHUP handler")?,
        })
    }

    pub async fn next(&mut self) -> Lifecycle {
        tokio::select! {
            _ = self.term.recv() => Lifecycle::Stop("SIGTERM"),
            _ = self.int.recv() => Lifecycle::Stop("SIGINT"),
            _ = self.hup.recv() => Lifecycle::Reload,
        }
    }
}

/// Cancel every in-flight session turn, stop the server and wait up to `grace`
/// for it to finish. False when the server outlived the grace period.
pub async fn drain(
    stream: &StreamState,
    server_stop: &CancellationToken,
    server: JoinHandle<()>,
    grace: Duration,
) -> bool {
    let running = stream.running_sessions().await;
    info!(sessions = running.len(), "cancelling running sessions");
    stream.cancel_all();
    server_stop.cancel();

    match tokio::time::timeout(grace, server).await {
        Ok(_) => true,
        Err(_) => {
            error!(grace_secs = grace.as_secs(), "stream server did not stop in time");
            false
        }
    }
}
