//! Logging and tracing configuration
//!
//! The controller logs to stderr. The agent runs unattended and across
//! reboots, so it also appends to a log file.

use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

const AGENT_LOG: &str = "agent.log";

/// Initialize tracing for controller commands
///
/// Controlled by `RUST_LOG`; default is INFO for this crate, WARN otherwise.
pub fn init_cli() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("certrig=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for the agent (file + stderr)
///
/// Returns the file appender guard, which must live as long as the agent,
/// together with the log file path.
pub fn init_agent() -> Option<(tracing_appender::non_blocking::WorkerGuard, PathBuf)> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("certrig=debug,info"));

    if let Some(log_dir) = paths::log_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let appender = tracing_appender::rolling::never(&log_dir, AGENT_LOG);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(agent_stderr_layer())
                .init();

            return Some((guard, log_dir.join(AGENT_LOG)));
        }
        eprintln!("Warning: could not create log directory {}", log_dir.display());
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(agent_stderr_layer())
        .init();
    None
}

/// Stderr layer for the agent, generic over the subscriber stack it joins
fn agent_stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
}

/// Path to the agent log file
pub fn agent_log_path() -> Option<PathBuf> {
    paths::log_dir().map(|d| d.join(AGENT_LOG))
}

/// Truncate the agent log file
pub fn truncate_agent_log() -> std::io::Result<()> {
    if let Some(path) = agent_log_path() {
        if path.exists() {
            std::fs::write(&path, "")?;
        }
    }
    Ok(())
}
