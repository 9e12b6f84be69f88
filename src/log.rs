//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: Plan failures and persistence errors that exhausted retries
//! - WARN: Stale checkpoint responses, agent retries, recoverable store errors
//! - INFO: Plan lifecycle (submitted, checkpoint opened, completed)
//! - DEBUG: Per-transition detail (persist versions, event sequence numbers)
//! - TRACE: Streaming chunks and event forwarding
//!
//! Debug mode can be enabled with `--debug` flag or `AGENTFLOW_DEBUG=1` env var.
//! `RUST_LOG` takes precedence over both when set.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Initialize logging to ~/.agentflow/agentflow.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when the log file cannot be opened. Calling this
/// more than once is harmless; later calls are ignored.
pub fn init_with_debug(debug: bool) {
    let level = level_for(debug || env_debug());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("agentflow={}", level.as_str().to_lowercase())));

    let log_file = Config::agentflow_dir().ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("agentflow.log"))
            .ok()
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let _ = match log_file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

fn env_debug() -> bool {
    std::env::var("AGENTFLOW_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn level_for(debug: bool) -> Level {
    if debug {
        Level::DEBUG
    } else {
        Level::INFO
    }
}
