use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps logging alive for the life of the process; flushes stdout on drop.
pub struct TelemetryGuard {
    _private: (),
}

impl TelemetryGuard {
    pub fn flush(&self) {
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Initialize the tracing subscriber.
///
/// - Installs a JSON-formatted layer with flattened events.
/// - `RUST_LOG` wins; otherwise `debug` under `verbose`, `info` by default.
/// - One-shot runs log to stderr so stdout carries only the result.
pub fn init_telemetry(verbose: bool, to_stderr: bool) -> Result<TelemetryGuard> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if to_stderr {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(TelemetryGuard { _private: () })
}
