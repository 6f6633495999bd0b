//! Connection ownership router.
//!
//! Tracks live client connections and routes session bytes between them and
//! the multiplexer. Which connections own which session is never stored
//! here: it lives in [`SessionRecord::owners`](crate::session::SessionRecord)
//! and is read and changed through the store.
//!
//! Output for a session goes only to its owners, and with window isolation
//! enabled only to owners in the window the session is bound to. Each
//! connection has a single unbounded FIFO queue, so chunks of one session
//! reach every subscriber in emission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::messages::SessionOutput;
use protocol::ServerMessage;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::mux::{MuxHandle, Multiplexer};
use crate::session::{ConnectionId, SessionId, SessionRecord, SessionStore, WindowId};

/// Counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages queued for the connection.
    pub messages_sent: u64,
    /// Output chunks withheld because of a window mismatch.
    pub violations: u64,
}

/// A registered client connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    window_id: WindowId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    sent: AtomicU64,
    violations: AtomicU64,
}

impl ConnectionHandle {
    /// Creates a handle and the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        window_id: WindowId,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            window_id,
            tx,
            sent: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn window_id(&self) -> &WindowId {
        &self.window_id
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
        }
    }

    /// Queues a message. Returns `false` if the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        if self.tx.send(message).is_ok() {
            self.sent.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            tracing::trace!(connection_id = %self.id, "Connection queue closed");
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Routes bytes between connections and multiplexer sessions.
pub struct OwnershipRouter<M: Multiplexer> {
    store: Arc<SessionStore>,
    mux: Arc<M>,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    /// Live attachment per session. Owned by the adapter; this is only the key.
    handles: DashMap<SessionId, MuxHandle>,
    isolate_windows: bool,
}

impl<M: Multiplexer> OwnershipRouter<M> {
    pub fn new(store: Arc<SessionStore>, mux: Arc<M>, isolate_windows: bool) -> Self {
        Self {
            store,
            mux,
            connections: DashMap::new(),
            handles: DashMap::new(),
            isolate_windows,
        }
    }

    /// Registers a connection and returns its outbound queue.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        window_id: WindowId,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (handle, rx) = ConnectionHandle::new(connection_id.clone(), window_id.clone());
        self.connections
            .insert(connection_id.clone(), Arc::new(handle));
        tracing::debug!(connection_id = %connection_id, window_id = %window_id, "Registered connection");
        rx
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(connection_id)
            .map(|c| Arc::clone(c.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn require_connection(&self, connection_id: &str) -> Result<Arc<ConnectionHandle>, EngineError> {
        self.connection(connection_id).ok_or_else(|| {
            EngineError::OwnershipViolation(format!("unknown connection {connection_id}"))
        })
    }

    /// Makes `connection_id` an owner of `session_id`.
    ///
    /// Moves a detached session to `running`. With window isolation on, a
    /// session owned from one window cannot be subscribed from another.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<SessionRecord, EngineError> {
        let connection = self.require_connection(connection_id)?;
        let isolate = self.isolate_windows;

        let record = self
            .store
            .mutate(session_id, |record| {
                if isolate
                    && record.is_owned()
                    && record.window_id.as_deref() != Some(connection.window_id().as_str())
                {
                    return Err(EngineError::OwnershipViolation(format!(
                        "session {} is bound to another window",
                        record.id
                    )));
                }
                record.add_owner(connection.id().clone(), connection.window_id());
                Ok(record.clone())
            })
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))??;

        tracing::info!(
            session_id = %session_id,
            connection_id = %connection_id,
            owners = record.owners.len(),
            "Connection subscribed to session"
        );
        Ok(record)
    }

    /// Removes `connection_id` from the owners of `session_id`.
    ///
    /// Returns `true` when this was the last owner, i.e. the session just
    /// became detached. The session's process is never touched.
    pub async fn unsubscribe(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<bool, EngineError> {
        let (removed, detached) = self
            .store
            .mutate(session_id, |record| {
                let removed = record.remove_owner(connection_id);
                (removed, removed && !record.is_owned())
            })
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;

        if removed {
            tracing::info!(
                session_id = %session_id,
                connection_id = %connection_id,
                detached,
                "Connection unsubscribed from session"
            );
        }
        Ok(detached)
    }

    /// Delivers an output chunk to the session's owners.
    ///
    /// Returns the number of connections the chunk was queued for.
    pub async fn route_output(&self, session_id: &str, data: &[u8]) -> usize {
        let Ok(record) = self.store.get(session_id).await else {
            tracing::trace!(session_id = %session_id, "Output for unknown session dropped");
            return 0;
        };

        let mut delivered = 0;
        for owner in &record.owners {
            let Some(connection) = self.connection(owner) else {
                continue;
            };
            if self.isolate_windows
                && record.window_id.as_deref() != Some(connection.window_id().as_str())
            {
                connection.violations.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session_id = %session_id,
                    connection_id = %owner,
                    window_id = %connection.window_id(),
                    "Ownership violation: output withheld from connection outside session window"
                );
                continue;
            }
            let message = ServerMessage::Output(SessionOutput {
                id: session_id.to_string(),
                data: data.to_vec(),
            });
            if connection.send(message) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Forwards input from an owner to the multiplexer.
    pub async fn route_input(
        &self,
        connection_id: &str,
        session_id: &str,
        data: &[u8],
    ) -> Result<(), EngineError> {
        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;
        if !record.is_owner(connection_id) {
            tracing::warn!(
                session_id = %session_id,
                connection_id = %connection_id,
                "Ownership violation: input from non-owner rejected"
            );
            return Err(EngineError::OwnershipViolation(format!(
                "connection {connection_id} does not own session {session_id}"
            )));
        }

        let handle = self
            .handle(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.mux.write(&handle, data).await?;

        self.store.mutate(session_id, |r| r.touch()).await?;
        Ok(())
    }

    /// Forgets a connection and removes it from every session it owned.
    ///
    /// Returns the sessions that became detached as a result.
    pub async fn drop_connection(&self, connection_id: &str) -> Vec<SessionId> {
        let stats = self
            .connections
            .remove(connection_id)
            .map(|(_, c)| c.stats());

        let mut detached = Vec::new();
        for session_id in self.store.ids() {
            let result = self
                .store
                .mutate(&session_id, |record| {
                    let removed = record.remove_owner(connection_id);
                    removed && !record.is_owned()
                })
                .await;
            if let Ok(true) = result {
                detached.push(session_id);
            }
        }

        tracing::info!(
            connection_id = %connection_id,
            detached = detached.len(),
            stats = ?stats,
            "Dropped connection"
        );
        detached
    }

    /// Sessions currently owned by a connection, derived from the store.
    pub async fn sessions_of(&self, connection_id: &str) -> Vec<SessionId> {
        self.store
            .list()
            .await
            .into_iter()
            .filter(|r| r.is_owner(connection_id))
            .map(|r| r.id)
            .collect()
    }

    pub async fn is_owner(&self, connection_id: &str, session_id: &str) -> bool {
        self.store
            .get(session_id)
            .await
            .map(|r| r.is_owner(connection_id))
            .unwrap_or(false)
    }

    /// Sends a message to every owner of a session.
    pub async fn notify_owners(&self, session_id: &str, message: ServerMessage) -> usize {
        let Ok(record) = self.store.get(session_id).await else {
            return 0;
        };
        self.notify(record.owners.iter(), message)
    }

    /// Sends a message to each listed connection that is still registered.
    pub fn notify<'a>(
        &self,
        connections: impl IntoIterator<Item = &'a ConnectionId>,
        message: ServerMessage,
    ) -> usize {
        connections
            .into_iter()
            .filter_map(|id| self.connection(id))
            .filter(|c| c.send(message.clone()))
            .count()
    }

    /// Sends a message to one connection.
    pub fn send_to(&self, connection_id: &str, message: ServerMessage) -> bool {
        self.connection(connection_id)
            .map(|c| c.send(message))
            .unwrap_or(false)
    }

    /// Records the live attachment for a session, returning any previous one.
    pub fn bind(&self, session_id: &str, handle: MuxHandle) -> Option<MuxHandle> {
        self.handles.insert(session_id.to_string(), handle)
    }

    pub fn unbind(&self, session_id: &str) -> Option<MuxHandle> {
        self.handles.remove(session_id).map(|(_, h)| h)
    }

    pub fn handle(&self, session_id: &str) -> Option<MuxHandle> {
        self.handles.get(session_id).map(|h| h.value().clone())
    }

    /// Whether `handle` is still the session's live attachment.
    pub fn is_bound(&self, session_id: &str, handle: &MuxHandle) -> bool {
        self.handles
            .get(session_id)
            .map(|h| h.value() == handle)
            .unwrap_or(false)
    }
}
