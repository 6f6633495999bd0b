//! IPC message types for CLI-daemon communication.

use protocol::messages::SessionView;
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List every known session, attached or not.
    ListSessions,
    /// Kill a session and forget it.
    CloseSession {
        /// Session id or multiplexer session name.
        session_id: String,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    Pong,
    Status {
        running: bool,
        uptime_secs: u64,
        /// Multiplexer backend in use (`tmux` or `memory`).
        backend: String,
        listen_addr: String,
        session_count: usize,
        detached_count: usize,
        connection_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    Sessions { sessions: Vec<IpcSessionInfo> },
    SessionClosed { session_id: String },
    Error { message: String },
}

/// One session as shown by `panehub sessions list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    pub id: String,
    pub mux_name: String,
    pub display_name: String,
    pub status: String,
    pub cols: u16,
    pub rows: u16,
    pub owners: usize,
    /// Milliseconds since the epoch.
    pub created_at: u64,
}

impl From<&SessionView> for IpcSessionInfo {
    fn from(view: &SessionView) -> Self {
        Self {
            id: view.id.clone(),
            mux_name: view.mux_name.clone(),
            display_name: view.display_name.clone(),
            status: format!("{:?}", view.status).to_lowercase(),
            cols: view.cols,
            rows: view.rows,
            owners: view.owners,
            created_at: view.created_at,
        }
    }
}
