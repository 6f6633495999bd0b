//! PTY-backed multiplexer clients.
//!
//! Each attachment to a tmux session is a `tmux attach-session` client
//! running inside its own pseudo-terminal. The PTY carries the session's
//! byte stream in both directions, and resizing the PTY is how the
//! multiplexer learns about new dimensions.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::Dimensions;
use tokio::sync::{mpsc, Mutex};

use super::MuxError;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// A running `attach-session` client.
pub struct AttachClient {
    name: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<std::sync::Mutex<Box<dyn Write + Send>>>,
    child: Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>,
    dims: std::sync::Mutex<Dimensions>,
    running: Arc<AtomicBool>,
}

impl AttachClient {
    /// Starts a client attached to `name` and begins streaming its output.
    pub fn open(
        tmux_command: &str,
        name: &str,
        dims: Dimensions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Bytes>), MuxError> {
        let pair = native_pty_system()
            .openpty(pty_size(dims))
            .map_err(|e| MuxError::AttachFailed(e.to_string()))?;

        let target = exact_target(name);
        let mut cmd = CommandBuilder::new(tmux_command);
        cmd.args(["attach-session", "-t", target.as_str()]);
        cmd.env("TERM", "xterm-256color");
        // Nested-session guard would refuse to attach otherwise.
        cmd.env_remove("TMUX");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MuxError::AttachFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MuxError::AttachFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MuxError::AttachFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        spawn_read_loop(name.to_string(), reader, tx, Arc::clone(&running));

        tracing::debug!(mux_name = %name, pid = ?child.process_id(), %dims, "Attach client started");

        let client = Self {
            name: name.to_string(),
            master: Mutex::new(pair.master),
            writer: Arc::new(std::sync::Mutex::new(writer)),
            child: Arc::new(std::sync::Mutex::new(child)),
            dims: std::sync::Mutex::new(dims),
            running,
        };
        Ok((client, rx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn dimensions(&self) -> Dimensions {
        *self.dims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends input to the attached session.
    pub async fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        if !self.is_running() {
            return Err(MuxError::HandleClosed(self.name.clone()));
        }
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| MuxError::WriteFailed(e.to_string()))?
        .map_err(|e| MuxError::WriteFailed(e.to_string()))
    }

    /// Resizes the client's PTY.
    ///
    /// Returns `false` without touching the PTY when the size is unchanged,
    /// matching the multiplexer's own behavior for such calls.
    pub async fn resize(&self, dims: Dimensions) -> Result<bool, MuxError> {
        if !self.is_running() {
            return Err(MuxError::HandleClosed(self.name.clone()));
        }
        if self.dimensions() == dims {
            return Ok(false);
        }

        let master = self.master.lock().await;
        master
            .resize(pty_size(dims))
            .map_err(|e| MuxError::ResizeFailed(e.to_string()))?;
        *self.dims.lock().unwrap_or_else(|e| e.into_inner()) = dims;

        tracing::debug!(mux_name = %self.name, cols = dims.cols, rows = dims.rows, "Resized attach client");
        Ok(true)
    }

    /// Terminates the client process. The tmux session is unaffected.
    pub async fn close(&self) -> Result<(), MuxError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let child = Arc::clone(&self.child);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = child.kill() {
                // Already exited on its own.
                tracing::trace!(mux_name = %name, error = %e, "Attach client kill failed");
            }
            match child.wait() {
                Ok(status) => {
                    tracing::debug!(mux_name = %name, code = status.exit_code(), "Attach client closed")
                }
                Err(e) => tracing::warn!(mux_name = %name, error = %e, "Failed to reap attach client"),
            }
        })
        .await
        .map_err(|e| MuxError::AttachFailed(e.to_string()))
    }
}

/// tmux target syntax for an exact session-name match.
pub(crate) fn exact_target(name: &str) -> String {
    format!("={name}")
}

fn pty_size(dims: Dimensions) -> PtySize {
    PtySize {
        rows: dims.rows,
        cols: dims.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Reads the PTY on a blocking thread until EOF, error, or close.
fn spawn_read_loop(
    name: String,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<Bytes>,
    running: Arc<AtomicBool>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::debug!(mux_name = %name, "Attach client EOF");
                    break;
                }
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                        tracing::trace!(mux_name = %name, "Output receiver dropped");
                        break;
                    }
                }
                Err(e) => {
                    if running.load(Ordering::SeqCst) {
                        tracing::warn!(mux_name = %name, error = %e, "Error reading attach client PTY");
                    }
                    break;
                }
            }
        }
        running.store(false, Ordering::SeqCst);
    });
}
