//! Running job commands as external processes
//!
//! Each job command runs through the configured shell in its own process
//! group, so a timeout or abort can kill everything the job started.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::config::ExecutionConfig;
use crate::common::{Error, Result};

/// How long to keep draining pipes after the job itself is gone
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of live job output
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

/// Everything needed to start one job command
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job_id: String,
    pub command: String,
    /// Complete environment; the agent's own environment is not inherited
    pub env: BTreeMap<String, String>,
    /// Run as this user through sudo
    pub user: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// How the job process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub exit: ExitKind,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

/// Executes job commands
///
/// `Err` means the command could not be started at all.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        output: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> Result<RunReport>;
}

/// Runs commands as local child processes
pub struct ProcessRunner {
    shell: String,
}

impl ProcessRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.shell.clone())
    }

    fn build_command(&self, request: &RunRequest) -> Result<tokio::process::Command> {
        let mut cmd = match request.user.as_deref().filter(|u| !is_current_user(u)) {
            Some(user) => {
                let sudo = which::which("sudo").map_err(|e| {
                    Error::execution(&request.job_id, format!("sudo not found: {}", e))
                })?;
                let env = which::which("env").unwrap_or_else(|_| PathBuf::from("/usr/bin/env"));
                let mut cmd = tokio::process::Command::new(sudo);
                cmd.env_clear();
                // sudo itself needs a PATH; the job gets its variables through env(1)
                if let Some(path) = request.env.get("PATH") {
                    cmd.env("PATH", path);
                }
                cmd.arg("-n").arg("-u").arg(user).arg("--").arg(env);
                for (key, value) in &request.env {
                    cmd.arg(format!("{}={}", key, value));
                }
                cmd.arg(&self.shell);
                cmd
            }
            None => {
                let mut cmd = tokio::process::Command::new(&self.shell);
                cmd.env_clear();
                cmd.envs(&request.env);
                cmd
            }
        };

        cmd.arg("-c").arg(&request.command);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd)
    }
}

fn is_current_user(user: &str) -> bool {
    if std::env::var("USER").is_ok_and(|u| u == user) {
        return true;
    }
    #[cfg(unix)]
    if user == "root" && unsafe { libc::geteuid() } == 0 {
        return true;
    }
    false
}

/// Kill the whole process group started for a job
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if result != 0 {
            tracing::debug!(pid, "killpg failed: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    sink: Option<OutputSink>,
) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                captured.extend_from_slice(&buf[..n]);
                if let Some(sink) = &sink {
                    let _ = sink.send(OutputChunk {
                        stream,
                        data: buf[..n].to_vec(),
                    });
                }
            }
            Err(e) => {
                tracing::debug!(?stream, "error reading job output: {}", e);
                break;
            }
        }
    }
    captured
}

async fn drain(handle: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            tracing::warn!("output reader task failed: {}", e);
            Vec::new()
        }
        Err(_) => {
            tracing::warn!("job output pipe still open after exit, giving up on it");
            Vec::new()
        }
    }
}

#[cfg(unix)]
fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitKind::Code(code),
        (None, Some(signal)) => ExitKind::Signal(signal),
        (None, None) => ExitKind::Code(-1),
    }
}

#[cfg(not(unix))]
fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    ExitKind::Code(status.code().unwrap_or(-1))
}

#[async_trait]
impl JobRunner for ProcessRunner {
    async fn run(
        &self,
        request: RunRequest,
        output: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut cmd = self.build_command(&request)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::execution(&request.job_id, e.to_string()))?;
        let pid = child.id();
        tracing::debug!(job_id = %request.job_id, pid, "job process started");

        let stdout = child
            .stdout
            .take()
            .map(|r| tokio::spawn(pump(r, OutputStream::Stdout, output.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|r| tokio::spawn(pump(r, OutputStream::Stderr, output.clone())));

        let deadline = async {
            match request.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::execution(&request.job_id, e.to_string()))?;
                exit_kind(status)
            }
            _ = deadline => {
                tracing::warn!(job_id = %request.job_id, "job timed out, killing process group");
                kill_group(pid);
                let _ = child.start_kill();
                let _ = child.wait().await;
                ExitKind::TimedOut
            }
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %request.job_id, "job aborted, killing process group");
                kill_group(pid);
                let _ = child.start_kill();
                let _ = child.wait().await;
                ExitKind::Aborted
            }
        };

        // Children left in the group would keep the pipes open
        if exit != ExitKind::TimedOut && exit != ExitKind::Aborted {
            kill_group(pid);
        }

        Ok(RunReport {
            exit,
            stdout: drain(stdout).await,
            stderr: drain(stderr).await,
            duration: started.elapsed(),
        })
    }
}
