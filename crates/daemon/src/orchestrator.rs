//! Daemon orchestrator for wiring together all components.
//!
//! [`Daemon`] builds the multiplexer backend and session hub from the
//! configuration, adopts sessions that survived a previous run, and runs the
//! WebSocket listener and the control socket until shutdown. Stopping the
//! daemon never kills hosted sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackendKind, Config};
use crate::hub::SessionHub;
use crate::ipc::{pidfile, IpcHandler, IpcRequest, IpcResponse, IpcServer, IpcSessionInfo};
use crate::mux::{Backend, MemoryMultiplexer, Multiplexer, TmuxMultiplexer};
use crate::router::MessageRouter;
use crate::server::WsServer;

/// Daemon lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Events emitted by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    StateChanged(DaemonState),
    /// Multiplexer sessions from a previous run were registered.
    SessionsAdopted { count: usize },
    /// The multiplexer could not be reached at startup.
    MultiplexerUnavailable,
    Error { message: String },
}

/// Builds the backend named in the configuration.
pub fn build_backend(config: &Config) -> Backend {
    let mux = &config.multiplexer;
    match mux.backend {
        BackendKind::Tmux => Backend::Tmux(TmuxMultiplexer::new(
            mux.tmux_command.clone(),
            mux.session_prefix.clone(),
            Some(mux.default_shell.clone()),
        )),
        BackendKind::Memory => Backend::Memory(MemoryMultiplexer::new(mux.session_prefix.clone())),
    }
}

/// Answers control-socket requests from the CLI.
struct ControlHandler {
    hub: Arc<SessionHub<Backend>>,
    started_at: Instant,
    listen_addr: String,
    shutdown: CancellationToken,
}

impl IpcHandler for ControlHandler {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => {
                let status = self.hub.status().await;
                IpcResponse::Status {
                    running: true,
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    backend: self.hub.mux().name().to_string(),
                    listen_addr: self.listen_addr.clone(),
                    session_count: status.sessions,
                    detached_count: status.detached,
                    connection_count: status.connections,
                }
            }
            IpcRequest::ListSessions => {
                let list = self.hub.list().await;
                IpcResponse::Sessions {
                    sessions: list.sessions.iter().map(IpcSessionInfo::from).collect(),
                }
            }
            IpcRequest::CloseSession { session_id } => {
                let resolved = match self.hub.store().resolve(&session_id).await {
                    Ok(record) => record.id,
                    Err(_) => {
                        return IpcResponse::Error {
                            message: format!("session no longer exists: {session_id}"),
                        }
                    }
                };
                match self.hub.kill_session(&resolved).await {
                    Ok(()) => IpcResponse::SessionClosed {
                        session_id: resolved,
                    },
                    Err(e) => IpcResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.shutdown.cancel();
                IpcResponse::Stopping
            }
        }
    }
}

/// The running daemon.
pub struct Daemon {
    config: Config,
    hub: Arc<SessionHub<Backend>>,
    state: Arc<RwLock<DaemonState>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<DaemonEvent>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let backend = build_backend(&config);
        info!(backend = backend.name(), "Using multiplexer backend");
        let hub = SessionHub::new(Arc::new(backend), config.hub_settings());
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            hub,
            state: Arc::new(RwLock::new(DaemonState::Stopped)),
            shutdown_token: CancellationToken::new(),
            event_tx,
            local_addr: None,
            tasks: Vec::new(),
        })
    }

    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    pub fn hub(&self) -> &Arc<SessionHub<Backend>> {
        &self.hub
    }

    /// Address the WebSocket listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Token cancelled when the daemon should shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    async fn set_state(&self, state: DaemonState) {
        *self.state.write().await = state;
        self.emit_event(DaemonEvent::StateChanged(state));
    }

    fn emit_event(&self, event: DaemonEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Starts the listeners.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != DaemonState::Stopped {
                anyhow::bail!("Daemon is already running");
            }
            *state = DaemonState::Starting;
        }
        self.emit_event(DaemonEvent::StateChanged(DaemonState::Starting));
        info!("Starting panehub daemon...");

        if self.hub.mux().is_available().await {
            match self.hub.reconcile().await {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "Adopted sessions from a previous run");
                    }
                    self.emit_event(DaemonEvent::SessionsAdopted { count });
                }
                Err(e) => warn!(error = %e, "Failed to reconcile multiplexer sessions"),
            }
        } else {
            warn!(
                backend = self.hub.mux().name(),
                "Multiplexer not available; spawns will fail until it is"
            );
            self.emit_event(DaemonEvent::MultiplexerUnavailable);
        }

        let router = MessageRouter::new(Arc::clone(&self.hub));
        let ws = match WsServer::bind(
            &self.config.server.listen_addr,
            router,
            self.shutdown_token.child_token(),
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                self.emit_event(DaemonEvent::Error {
                    message: e.to_string(),
                });
                self.set_state(DaemonState::Stopped).await;
                return Err(e).context("Failed to start WebSocket server");
            }
        };
        let local_addr = ws.local_addr()?;
        self.local_addr = Some(local_addr);
        self.tasks.push(tokio::spawn(ws.run()));

        let socket_path = self.config.socket_path();
        let ipc = IpcServer::bind(&socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", socket_path.display()))?;
        let handler = Arc::new(ControlHandler {
            hub: Arc::clone(&self.hub),
            started_at: Instant::now(),
            listen_addr: local_addr.to_string(),
            shutdown: self.shutdown_token.clone(),
        });
        self.tasks
            .push(tokio::spawn(ipc.serve(handler, self.shutdown_token.child_token())));

        let pid_path = self.config.pid_path();
        pidfile::write_pid_file(&pid_path)
            .with_context(|| format!("Failed to write PID file: {}", pid_path.display()))?;

        self.set_state(DaemonState::Running).await;
        info!(listen_addr = %local_addr, "Daemon started");
        Ok(())
    }

    /// Resolves once shutdown was requested.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// Stops the listeners and disconnects clients. Sessions keep running in
    /// the multiplexer and are adopted again on the next start.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == DaemonState::Stopped {
                return Ok(());
            }
            *state = DaemonState::ShuttingDown;
        }
        self.emit_event(DaemonEvent::StateChanged(DaemonState::ShuttingDown));
        info!("Stopping daemon...");

        self.shutdown_token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "Task ended abnormally");
            }
        }
        pidfile::remove_pid_file(&self.config.pid_path());

        let status = self.hub.status().await;
        info!(
            sessions = status.sessions,
            "Daemon stopped; sessions left running in the multiplexer"
        );
        self.set_state(DaemonState::Stopped).await;
        Ok(())
    }
}
