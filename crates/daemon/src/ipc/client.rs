//! IPC client used by the CLI subcommands.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/response client for the daemon's control socket.
pub struct IpcClient {
    lines: Lines<BufReader<ReadHalf<UnixStream>>>,
    writer: WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connects to the daemon. Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| IpcError::Timeout)??;
        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
            timeout,
        })
    }

    /// Sends one request and waits for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| IpcError::Timeout)?
    }

    async fn round_trip(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let line = self.lines.next_line().await?.ok_or(IpcError::Closed)?;
        Ok(serde_json::from_str(line.trim())?)
    }

    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(IpcRequest::Ping).await?, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    pub async fn close_session(&mut self, session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::CloseSession { session_id }).await
    }
}
