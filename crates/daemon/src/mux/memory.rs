//! In-process multiplexer.
//!
//! Sessions are plain buffers: input written to a session is echoed to every
//! attachment, and resize calls follow the real multiplexer's rule of
//! ignoring unchanged dimensions. Used by `backend = "memory"` and by tests,
//! which also use the inspection helpers to observe what the engine did.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use protocol::Dimensions;
use tokio::sync::mpsc;

use super::{Attachment, MuxError, MuxHandle, Multiplexer};
use crate::session::SpawnParams;

/// One resize call observed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeCall {
    pub name: String,
    pub dims: Dimensions,
    /// Whether the call changed the dimensions.
    pub applied: bool,
}

#[derive(Default)]
struct MemorySession {
    dims: Dimensions,
    attachments: HashMap<u64, mpsc::UnboundedSender<Bytes>>,
    input: Vec<u8>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, MemorySession>,
    resize_log: Vec<ResizeCall>,
}

/// Multiplexer backend living entirely in memory.
pub struct MemoryMultiplexer {
    prefix: String,
    state: Mutex<State>,
    next_attach_id: AtomicU64,
    available: AtomicBool,
    spawn_delay: Mutex<Option<Duration>>,
}

impl MemoryMultiplexer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(State::default()),
            next_attach_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            spawn_delay: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the data is
        // still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_attachment(&self, session: &mut MemorySession, name: &str) -> Attachment {
        let attach_id = self.next_attach_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        session.attachments.insert(attach_id, tx);
        Attachment {
            handle: MuxHandle::new(name, attach_id),
            output: rx,
        }
    }

    fn ensure_available(&self) -> Result<(), MuxError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MuxError::Unavailable("memory backend switched off".to_string()))
        }
    }

    /// Simulates the multiplexer service going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delays every subsequent spawn, to exercise confirmation timeouts.
    pub fn set_spawn_delay(&self, delay: Option<Duration>) {
        *self.spawn_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Creates a session without attaching, as if started outside the daemon.
    pub fn insert_external(&self, name: &str, dims: Dimensions) {
        self.state().sessions.insert(
            name.to_string(),
            MemorySession {
                dims,
                ..Default::default()
            },
        );
    }

    /// Pushes output to every attachment of a session.
    pub fn emit(&self, name: &str, data: &[u8]) -> bool {
        let mut state = self.state();
        let Some(session) = state.sessions.get_mut(name) else {
            return false;
        };
        let chunk = Bytes::copy_from_slice(data);
        session
            .attachments
            .retain(|_, tx| tx.send(chunk.clone()).is_ok());
        true
    }

    /// Simulates the hosted process exiting: every output stream ends.
    pub fn exit(&self, name: &str) -> bool {
        self.state().sessions.remove(name).is_some()
    }

    /// All input written to a session so far.
    pub fn input_of(&self, name: &str) -> Vec<u8> {
        self.state()
            .sessions
            .get(name)
            .map(|s| s.input.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state().sessions.contains_key(name)
    }

    pub fn dimensions(&self, name: &str) -> Option<Dimensions> {
        self.state().sessions.get(name).map(|s| s.dims)
    }

    pub fn attachment_count(&self, name: &str) -> usize {
        self.state()
            .sessions
            .get(name)
            .map(|s| s.attachments.len())
            .unwrap_or(0)
    }

    /// Every resize call received, in order.
    pub fn resize_log(&self) -> Vec<ResizeCall> {
        self.state().resize_log.clone()
    }

    /// Resize calls for one session that the backend applied.
    pub fn applied_resizes(&self, name: &str) -> Vec<Dimensions> {
        self.state()
            .resize_log
            .iter()
            .filter(|c| c.name == name && c.applied)
            .map(|c| c.dims)
            .collect()
    }
}

impl Multiplexer for MemoryMultiplexer {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn spawn(&self, mux_name: &str, params: &SpawnParams) -> Result<Attachment, MuxError> {
        self.ensure_available()?;
        let delay = *self.spawn_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.sessions.contains_key(mux_name) {
            return Err(MuxError::AlreadyExists(mux_name.to_string()));
        }
        let mut session = MemorySession {
            dims: params.dimensions,
            ..Default::default()
        };
        let attachment = self.open_attachment(&mut session, mux_name);
        state.sessions.insert(mux_name.to_string(), session);
        Ok(attachment)
    }

    async fn attach(&self, mux_name: &str, _dims: Dimensions) -> Result<Attachment, MuxError> {
        self.ensure_available()?;
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(mux_name)
            .ok_or_else(|| MuxError::NotFound(mux_name.to_string()))?;
        Ok(self.open_attachment(session, mux_name))
    }

    async fn write(&self, handle: &MuxHandle, data: &[u8]) -> Result<(), MuxError> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(&handle.name)
            .ok_or_else(|| MuxError::NotFound(handle.name.clone()))?;
        if !session.attachments.contains_key(&handle.attach_id) {
            return Err(MuxError::HandleClosed(handle.name.clone()));
        }
        session.input.extend_from_slice(data);
        let chunk = Bytes::copy_from_slice(data);
        session
            .attachments
            .retain(|_, tx| tx.send(chunk.clone()).is_ok());
        Ok(())
    }

    async fn resize(&self, handle: &MuxHandle, dims: Dimensions) -> Result<bool, MuxError> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(&handle.name)
            .ok_or_else(|| MuxError::NotFound(handle.name.clone()))?;
        let applied = session.dims != dims;
        session.dims = dims;
        state.resize_log.push(ResizeCall {
            name: handle.name.clone(),
            dims,
            applied,
        });
        Ok(applied)
    }

    async fn detach(&self, handle: &MuxHandle) -> Result<(), MuxError> {
        if let Some(session) = self.state().sessions.get_mut(&handle.name) {
            session.attachments.remove(&handle.attach_id);
        }
        Ok(())
    }

    async fn kill(&self, handle: &MuxHandle) -> Result<(), MuxError> {
        self.state()
            .sessions
            .remove(&handle.name)
            .map(|_| ())
            .ok_or_else(|| MuxError::NotFound(handle.name.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        self.ensure_available()?;
        let mut names: Vec<String> = self
            .state()
            .sessions
            .keys()
            .filter(|name| name.starts_with(&self.prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}
