//! Agent server - IPC listeners and main event loop

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::error::IpcError;
use crate::common::{config::Config, paths, Result};
use crate::exec::JobRunner;
use crate::ipc::{
    protocol::{Command, Request, Response},
    transport::{self, Connection, LocalListener},
};
use crate::session::{CheckpointStore, Engine, EngineHandle, SharedState};

use super::handler;

/// State shared by every connection task
pub struct AgentContext {
    pub config: Config,
    pub engine: EngineHandle,
    /// Cancelled to stop the agent
    pub shutdown: CancellationToken,
    last_activity: Mutex<Instant>,
}

impl AgentContext {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Resident agent
pub struct Agent {
    ctx: Arc<AgentContext>,
    engine: JoinHandle<()>,
}

impl Agent {
    /// Resume the last session, if any, and start the engine
    pub async fn start(config: Config, runner: Arc<dyn JobRunner>) -> Result<Self> {
        let store = CheckpointStore::new(config.storage.sessions_dir()?);
        let boot_id = uuid::Uuid::new_v4().simple().to_string();
        let shared = Arc::new(SharedState::new(boot_id.clone(), config.events.max_events));
        let shutdown = CancellationToken::new();

        let mut engine = Engine::new(config.clone(), store, runner, shared, shutdown.clone());
        let resumption = engine.boot()?;
        tracing::info!(boot_id = %boot_id, resumption = ?resumption, "agent booted");
        let (handle, task) = engine.spawn();

        Ok(Self {
            ctx: Arc::new(AgentContext {
                config,
                engine: handle,
                shutdown,
                last_activity: Mutex::new(Instant::now()),
            }),
            engine: task,
        })
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Serve the local socket, plus TCP when configured
    pub async fn run(self) -> Result<()> {
        let local = transport::create_listener().await?;
        tracing::info!("Agent listening on {}", paths::socket_name());

        let tcp = match &self.ctx.config.agent.tcp_listen {
            Some(addr) => {
                let listener = transport::create_tcp_listener(addr).await?;
                tracing::info!("Agent listening on tcp://{}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        let result = self.serve(Some(local), tcp).await;
        paths::remove_socket()?;
        result
    }

    /// Accept controllers until shutdown
    pub async fn serve(self, local: Option<LocalListener>, tcp: Option<TcpListener>) -> Result<()> {
        let idle_minutes = self.ctx.config.agent.idle_timeout_minutes;
        let idle_timeout = Duration::from_secs(idle_minutes * 60);

        loop {
            if idle_minutes > 0 && !self.session_active() && self.ctx.idle_for() > idle_timeout {
                tracing::info!("Idle timeout reached, shutting down agent");
                break;
            }

            tokio::select! {
                signal = terminate_signal() => {
                    signal?;
                    break;
                }
                _ = self.ctx.shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, exiting");
                    break;
                }
                stream = accept_local(local.as_ref()) => match stream {
                    Ok(stream) => self.spawn_client(stream),
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                stream = accept_tcp(tcp.as_ref()) => match stream {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "remote controller connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "could not set TCP_NODELAY");
                        }
                        self.spawn_client(stream);
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                // Periodic wakeup to check the idle timeout
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }

        tracing::info!("Stopping session engine");
        self.ctx.shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(10), self.engine)
            .await
            .is_err()
        {
            tracing::warn!("session engine did not stop in time");
        }
        tracing::info!("Agent shutdown complete");
        Ok(())
    }

    fn session_active(&self) -> bool {
        self.ctx
            .engine
            .shared()
            .snapshot()
            .session
            .is_some_and(|s| !s.status.is_finished())
    }

    fn spawn_client<S: Connection + 'static>(&self, stream: S) {
        self.ctx.touch();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(ctx, stream).await {
                tracing::error!("Error handling client: {}", e);
            }
        });
    }
}

async fn accept_local(listener: Option<&LocalListener>) -> io::Result<transport::LocalStream> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_tcp(
    listener: Option<&TcpListener>,
) -> io::Result<(tokio::net::TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
async fn terminate_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down gracefully");
    Ok(())
}

/// Serve one controller connection until it goes away
async fn handle_client<S: Connection>(ctx: Arc<AgentContext>, stream: S) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let idle = Duration::from_secs(ctx.config.agent.client_idle_timeout_secs);

    loop {
        let request_data = tokio::select! {
            result = transport::recv_message(&mut reader) => {
                match result {
                    Ok(data) => data,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        tracing::debug!("Client disconnected");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading request: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(idle) => {
                tracing::debug!("Client timeout");
                break;
            }
            _ = ctx.shutdown.cancelled() => break,
        };

        let request: Request = match serde_json::from_slice(&request_data) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("Invalid request: {}", e);
                let response = Response::error(
                    0,
                    IpcError {
                        code: "INVALID_REQUEST".to_string(),
                        message: e.to_string(),
                    },
                );
                let json = serde_json::to_vec(&response)?;
                transport::send_message(&mut writer, &json).await?;
                continue;
            }
        };

        tracing::debug!("Received command: {:?}", request.command);
        ctx.touch();

        if matches!(request.command, Command::Shutdown) {
            let response = Response::success(request.id, serde_json::json!({}));
            let json = serde_json::to_vec(&response)?;
            transport::send_message(&mut writer, &json).await?;
            ctx.shutdown.cancel();
            break;
        }

        let response = handler::handle_command(&ctx, request.id, request.command).await;

        let json = serde_json::to_vec(&response)?;
        transport::send_message(&mut writer, &json).await?;
        ctx.touch();
    }

    Ok(())
}
