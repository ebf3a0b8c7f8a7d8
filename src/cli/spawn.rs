//! Agent spawning logic
//!
//! A local controller spawns the agent on demand, using the same binary with
//! the `agent` subcommand. Installations that start the agent at boot never
//! hit this path.

use std::time::Duration;

use crate::common::{paths, Error, Result};
use crate::ipc::{transport, AgentClient, Endpoint};

/// Timeout for the agent to start up
const SPAWN_TIMEOUT_SECS: u64 = 5;

/// Ensure a local agent is running, spawning it if necessary
pub async fn ensure_agent_running(endpoint: &Endpoint) -> Result<()> {
    if !endpoint.is_local() {
        return Ok(());
    }

    match AgentClient::connect(endpoint).await {
        Ok(_) => Ok(()),
        Err(Error::AgentNotRunning) => spawn_agent().await,
        Err(e) => Err(e),
    }
}

async fn spawn_agent() -> Result<()> {
    tracing::debug!("Spawning agent process");

    let exe_path = std::env::current_exe().map_err(|e| {
        Error::Internal(format!("Failed to get current executable path: {}", e))
    })?;

    paths::ensure_socket_dir()?;
    paths::remove_socket()?;

    // The agent logs to its own file; keep it off the terminal
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        std::process::Command::new(&exe_path)
            .arg("agent")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn agent: {}", e)))?;
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x00000008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        std::process::Command::new(&exe_path)
            .arg("agent")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn agent: {}", e)))?;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SPAWN_TIMEOUT_SECS);

    loop {
        if std::time::Instant::now() >= deadline {
            return Err(Error::AgentSpawnTimeout(SPAWN_TIMEOUT_SECS));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        if !transport::socket_exists() {
            continue;
        }

        if transport::connect(&Endpoint::Local).await.is_ok() {
            tracing::debug!("Agent started successfully");
            return Ok(());
        }
    }
}
