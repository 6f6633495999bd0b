//! tmux backend.
//!
//! Session lifecycle (create, probe, kill, list) goes through the tmux CLI.
//! Byte streams and resizes go through one [`AttachClient`] per attachment.

use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::Dimensions;
use tokio::process::Command;

use super::attach::{exact_target, AttachClient};
use super::{Attachment, MuxError, MuxHandle, Multiplexer};
use crate::session::SpawnParams;

/// Multiplexer backed by a tmux server.
pub struct TmuxMultiplexer {
    tmux_command: String,
    prefix: String,
    default_shell: Option<String>,
    clients: DashMap<u64, Arc<AttachClient>>,
    next_attach_id: AtomicU64,
}

impl TmuxMultiplexer {
    pub fn new(
        tmux_command: impl Into<String>,
        prefix: impl Into<String>,
        default_shell: Option<String>,
    ) -> Self {
        Self {
            tmux_command: tmux_command.into(),
            prefix: prefix.into(),
            default_shell,
            clients: DashMap::new(),
            next_attach_id: AtomicU64::new(1),
        }
    }

    /// Runs a tmux subcommand and captures its output.
    async fn run(&self, args: &[&str]) -> Result<Output, MuxError> {
        tracing::trace!(command = %self.tmux_command, ?args, "Running tmux");
        Command::new(&self.tmux_command)
            .args(args)
            .env_remove("TMUX")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    MuxError::Unavailable(format!("{} not found", self.tmux_command))
                }
                _ => MuxError::Io(e),
            })
    }

    async fn has_session(&self, name: &str) -> Result<bool, MuxError> {
        let output = self.run(&["has-session", "-t", &exact_target(name)]).await?;
        Ok(output.status.success())
    }

    fn client(&self, handle: &MuxHandle) -> Result<Arc<AttachClient>, MuxError> {
        self.clients
            .get(&handle.attach_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| MuxError::HandleClosed(handle.name.clone()))
    }

    fn open_client(&self, name: &str, dims: Dimensions) -> Result<Attachment, MuxError> {
        let (client, output) = AttachClient::open(&self.tmux_command, name, dims)?;
        let attach_id = self.next_attach_id.fetch_add(1, Ordering::SeqCst);
        self.clients.insert(attach_id, Arc::new(client));
        Ok(Attachment {
            handle: MuxHandle::new(name, attach_id),
            output,
        })
    }

    /// Closes every attach client for a session name.
    async fn close_clients_for(&self, name: &str) {
        let ids: Vec<u64> = self
            .clients
            .iter()
            .filter(|c| c.value().name() == name)
            .map(|c| *c.key())
            .collect();
        for id in ids {
            if let Some((_, client)) = self.clients.remove(&id) {
                let _ = client.close().await;
            }
        }
    }
}

/// Maps tmux's stderr to an adapter error.
fn classify_failure(name: &str, stderr: &str) -> Option<MuxError> {
    if stderr.contains("duplicate session") {
        Some(MuxError::AlreadyExists(name.to_string()))
    } else if stderr.contains("can't find session")
        || stderr.contains("session not found")
        || stderr.contains("no server running")
    {
        Some(MuxError::NotFound(name.to_string()))
    } else if stderr.contains("error connecting to") || stderr.contains("failed to connect") {
        Some(MuxError::Unavailable(stderr.trim().to_string()))
    } else {
        None
    }
}

/// Builds the `new-session` argument list.
fn new_session_args(
    name: &str,
    params: &SpawnParams,
    default_shell: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "new-session".to_string(),
        "-d".to_string(),
        "-s".to_string(),
        name.to_string(),
        "-x".to_string(),
        params.dimensions.cols.to_string(),
        "-y".to_string(),
        params.dimensions.rows.to_string(),
    ];
    if let Some(cwd) = params.cwd.as_deref().filter(|c| !c.is_empty()) {
        args.push("-c".to_string());
        args.push(cwd.to_string());
    }
    if let Some(command) = params.command.as_deref().or(default_shell) {
        args.push(command.to_string());
    }
    args
}

impl Multiplexer for TmuxMultiplexer {
    async fn is_available(&self) -> bool {
        if which::which(&self.tmux_command).is_err() {
            return false;
        }
        matches!(self.run(&["-V"]).await, Ok(output) if output.status.success())
    }

    async fn spawn(&self, mux_name: &str, params: &SpawnParams) -> Result<Attachment, MuxError> {
        let args = new_session_args(mux_name, params, self.default_shell.as_deref());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(mux_name, &stderr)
                .unwrap_or_else(|| MuxError::SpawnFailed(stderr.trim().to_string())));
        }

        tracing::info!(mux_name = %mux_name, dims = %params.dimensions, "Created tmux session");
        self.open_client(mux_name, params.dimensions)
    }

    async fn attach(&self, mux_name: &str, dims: Dimensions) -> Result<Attachment, MuxError> {
        if !self.has_session(mux_name).await? {
            return Err(MuxError::NotFound(mux_name.to_string()));
        }
        self.open_client(mux_name, dims)
    }

    async fn write(&self, handle: &MuxHandle, data: &[u8]) -> Result<(), MuxError> {
        self.client(handle)?.write(data).await
    }

    async fn resize(&self, handle: &MuxHandle, dims: Dimensions) -> Result<bool, MuxError> {
        self.client(handle)?.resize(dims).await
    }

    async fn detach(&self, handle: &MuxHandle) -> Result<(), MuxError> {
        if let Some((_, client)) = self.clients.remove(&handle.attach_id) {
            client.close().await?;
            tracing::debug!(mux_name = %handle.name, attach_id = handle.attach_id, "Detached from tmux session");
        }
        Ok(())
    }

    async fn kill(&self, handle: &MuxHandle) -> Result<(), MuxError> {
        self.close_clients_for(&handle.name).await;

        let output = self
            .run(&["kill-session", "-t", &exact_target(&handle.name)])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&handle.name, &stderr)
                .unwrap_or_else(|| MuxError::KillFailed(stderr.trim().to_string())));
        }
        tracing::info!(mux_name = %handle.name, "Killed tmux session");
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(MuxError::Unavailable(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(&self.prefix))
            .map(str::to_string)
            .collect())
    }
}
