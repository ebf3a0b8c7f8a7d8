//! Agent mode - resident process running test sessions
//!
//! The agent owns the session and survives controller disconnects. After a
//! reboot it is started again (by the init system or a controller) and picks
//! the session up from its last checkpoint.

mod handler;
mod server;

pub use server::{Agent, AgentContext};

use std::sync::Arc;

use crate::common::{config::Config, Result};
use crate::exec::ProcessRunner;

/// Run in agent mode
///
/// This is the entry point for `certrig agent`. The agent:
/// 1. Resumes the session named by the last checkpoint, if any
/// 2. Listens for controllers on the local socket (and TCP if configured)
/// 3. Runs jobs while controllers come and go
pub async fn run() -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Starting certification agent"
    );

    let config = Config::load()?;
    let runner = Arc::new(ProcessRunner::from_config(&config.execution));
    let agent = Agent::start(config, runner).await?;
    agent.run().await
}
