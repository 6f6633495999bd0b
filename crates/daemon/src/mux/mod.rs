//! Multiplexer adapter.
//!
//! A multiplexer keeps shell processes alive independent of any client
//! connection. The engine talks to it through the [`Multiplexer`] trait:
//! sessions are created or located by name, and each *attachment* yields an
//! ordered stream of output chunks plus a handle used for input and resize.
//!
//! Detaching an attachment never kills the hosted session. Only
//! [`Multiplexer::kill`] does that.

use std::future::Future;

use bytes::Bytes;
use protocol::Dimensions;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::SpawnParams;

pub mod attach;
pub mod memory;
pub mod tmux;

pub use memory::{MemoryMultiplexer, ResizeCall};
pub use tmux::TmuxMultiplexer;

/// Errors returned by a multiplexer backend.
#[derive(Debug, Error)]
pub enum MuxError {
    /// No live multiplexer session has this name.
    #[error("multiplexer session not found: {0}")]
    NotFound(String),

    /// A session with this name already exists.
    #[error("multiplexer session already exists: {0}")]
    AlreadyExists(String),

    /// The multiplexer service itself cannot be reached.
    #[error("multiplexer unavailable: {0}")]
    Unavailable(String),

    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    #[error("failed to attach to session: {0}")]
    AttachFailed(String),

    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    #[error("failed to resize session: {0}")]
    ResizeFailed(String),

    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// The attachment behind a handle is gone.
    #[error("attachment closed: {0}")]
    HandleClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reference to one attachment of a multiplexer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MuxHandle {
    /// Multiplexer session name.
    pub name: String,
    /// Backend-assigned attachment id. Zero for a handle with no attachment.
    pub attach_id: u64,
}

impl MuxHandle {
    pub fn new(name: impl Into<String>, attach_id: u64) -> Self {
        Self {
            name: name.into(),
            attach_id,
        }
    }

    /// A handle naming a session without any live attachment, used to kill
    /// sessions that nothing is attached to.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::new(name, 0)
    }

    pub fn is_attached(&self) -> bool {
        self.attach_id != 0
    }
}

/// A live attachment: the handle plus its output stream.
///
/// The receiver yields chunks in emission order and ends when the
/// attachment is detached or the hosted process exits.
#[derive(Debug)]
pub struct Attachment {
    pub handle: MuxHandle,
    pub output: mpsc::UnboundedReceiver<Bytes>,
}

/// Operations the engine needs from a terminal multiplexer.
pub trait Multiplexer: Send + Sync + 'static {
    /// Returns whether the multiplexer service can be reached.
    fn is_available(&self) -> impl Future<Output = bool> + Send;

    /// Creates a new session named `mux_name` and attaches to it.
    fn spawn(
        &self,
        mux_name: &str,
        params: &SpawnParams,
    ) -> impl Future<Output = Result<Attachment, MuxError>> + Send;

    /// Attaches to an existing session.
    ///
    /// Returns [`MuxError::NotFound`] when no live session has this name; a
    /// replacement is never created implicitly.
    fn attach(
        &self,
        mux_name: &str,
        dims: Dimensions,
    ) -> impl Future<Output = Result<Attachment, MuxError>> + Send;

    /// Writes input bytes to the session.
    fn write(
        &self,
        handle: &MuxHandle,
        data: &[u8],
    ) -> impl Future<Output = Result<(), MuxError>> + Send;

    /// Changes the session's dimensions.
    ///
    /// Returns `Ok(false)` when the dimensions equal the multiplexer's current
    /// view; the multiplexer ignores such calls and does not redraw.
    fn resize(
        &self,
        handle: &MuxHandle,
        dims: Dimensions,
    ) -> impl Future<Output = Result<bool, MuxError>> + Send;

    /// Drops the attachment. The hosted session keeps running.
    fn detach(&self, handle: &MuxHandle) -> impl Future<Output = Result<(), MuxError>> + Send;

    /// Terminates the hosted session and every attachment to it.
    fn kill(&self, handle: &MuxHandle) -> impl Future<Output = Result<(), MuxError>> + Send;

    /// Names of live sessions in this application's namespace.
    fn list_sessions(&self) -> impl Future<Output = Result<Vec<String>, MuxError>> + Send;
}

/// Backend selected at runtime from configuration.
pub enum Backend {
    Tmux(TmuxMultiplexer),
    Memory(MemoryMultiplexer),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Tmux(_) => "tmux",
            Backend::Memory(_) => "memory",
        }
    }
}

impl Multiplexer for Backend {
    async fn is_available(&self) -> bool {
        match self {
            Backend::Tmux(m) => m.is_available().await,
            Backend::Memory(m) => m.is_available().await,
        }
    }

    async fn spawn(&self, mux_name: &str, params: &SpawnParams) -> Result<Attachment, MuxError> {
        match self {
            Backend::Tmux(m) => m.spawn(mux_name, params).await,
            Backend::Memory(m) => m.spawn(mux_name, params).await,
        }
    }

    async fn attach(&self, mux_name: &str, dims: Dimensions) -> Result<Attachment, MuxError> {
        match self {
            Backend::Tmux(m) => m.attach(mux_name, dims).await,
            Backend::Memory(m) => m.attach(mux_name, dims).await,
        }
    }

    async fn write(&self, handle: &MuxHandle, data: &[u8]) -> Result<(), MuxError> {
        match self {
            Backend::Tmux(m) => m.write(handle, data).await,
            Backend::Memory(m) => m.write(handle, data).await,
        }
    }

    async fn resize(&self, handle: &MuxHandle, dims: Dimensions) -> Result<bool, MuxError> {
        match self {
            Backend::Tmux(m) => m.resize(handle, dims).await,
            Backend::Memory(m) => m.resize(handle, dims).await,
        }
    }

    async fn detach(&self, handle: &MuxHandle) -> Result<(), MuxError> {
        match self {
            Backend::Tmux(m) => m.detach(handle).await,
            Backend::Memory(m) => m.detach(handle).await,
        }
    }

    async fn kill(&self, handle: &MuxHandle) -> Result<(), MuxError> {
        match self {
            Backend::Tmux(m) => m.kill(handle).await,
            Backend::Memory(m) => m.kill(handle).await,
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        match self {
            Backend::Tmux(m) => m.list_sessions().await,
            Backend::Memory(m) => m.list_sessions().await,
        }
    }
}
