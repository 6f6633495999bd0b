//! IPC server accepting CLI connections on a Unix Domain Socket.

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon closed the connection")]
    Closed,

    #[error("IPC request timed out")]
    Timeout,
}

/// Answers control-plane requests.
pub trait IpcHandler: Send + Sync + 'static {
    fn handle(&self, request: IpcRequest) -> impl Future<Output = IpcResponse> + Send;
}

/// Listens for CLI connections.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds the socket, replacing a stale socket file left by a previous
    /// run. The socket is only accessible to the current user.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Accepts connections until `cancel` fires, answering each request with
    /// `handler`. The socket file is removed on return.
    pub async fn serve<H: IpcHandler>(self, handler: Arc<H>, cancel: CancellationToken) {
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept IPC connection");
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.serve(handler.as_ref(), cancel).await {
                    tracing::debug!(error = %e, "IPC connection ended with error");
                }
            });
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Could not remove IPC socket");
        }
    }
}

/// One CLI connection.
pub struct IpcConnection {
    lines: Lines<BufReader<ReadHalf<UnixStream>>>,
    writer: WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    /// Reads the next request. `None` means the client hung up.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(line.trim())?)),
            }
        }
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn serve<H: IpcHandler>(
        mut self,
        handler: &H,
        cancel: CancellationToken,
    ) -> Result<(), IpcError> {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                request = self.read_request() => request,
            };
            let response = match request {
                Ok(Some(request)) => {
                    tracing::debug!(?request, "IPC request");
                    handler.handle(request).await
                }
                Ok(None) => return Ok(()),
                Err(IpcError::Json(e)) => IpcResponse::Error {
                    message: format!("malformed request: {e}"),
                },
                Err(e) => return Err(e),
            };
            self.send_response(&response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Echo;

    impl IpcHandler for Echo {
        async fn handle(&self, request: IpcRequest) -> IpcResponse {
            match request {
                IpcRequest::Ping => IpcResponse::Pong,
                IpcRequest::CloseSession { session_id } => IpcResponse::SessionClosed { session_id },
                _ => IpcResponse::Error {
                    message: "unsupported".to_string(),
                },
            }
        }
    }

    #[tokio::test]
    async fn test_bind_creates_parent_dirs_and_restricts_mode() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("panehub.sock");

        let _server = IpcServer::bind(&socket_path).await.unwrap();
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("panehub.sock");

        drop(IpcServer::bind(&socket_path).await.unwrap());
        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_serve_answers_and_reports_malformed_lines() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("panehub.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.serve(Arc::new(Echo), cancel.clone()));

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"\"Ping\"\nnot json\n").await.unwrap();
        let first: IpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first, IpcResponse::Pong);
        let second: IpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(second, IpcResponse::Error { .. }));

        cancel.cancel();
        task.await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("panehub.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&path).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(conn.read_request().await.unwrap().is_none());
    }
}
