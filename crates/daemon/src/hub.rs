//! Session hub.
//!
//! The hub ties the engine together: it owns the store, the multiplexer
//! adapter, the ownership router, the resize coordinator and the layout
//! arena, and exposes one method per client operation. Transports and the
//! message router call into it; nothing here knows about sockets.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use protocol::messages::{
    GroupView, ReattachRequest, Reattached, SessionList, SessionRef, SessionState, SessionView,
    SpawnRequest, SplitRequest,
};
use protocol::{Dimensions, ResizeKind, ServerMessage, SessionStatus};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::error::EngineError;
use crate::layout::{LayoutManager, ReattachTarget};
use crate::mux::{Attachment, MuxError, MuxHandle, Multiplexer};
use crate::ownership::OwnershipRouter;
use crate::resize::{ResizeCoordinator, ResizeOutcome, ResizeSettings};
use crate::session::{
    ConnectionId, SessionId, SessionRecord, SessionStore, SpawnParams, StoreError, WindowId,
};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSettings {
    pub session_prefix: String,
    pub max_sessions: usize,
    pub default_dimensions: Dimensions,
    /// How long the multiplexer may take to confirm a spawn or attach.
    pub spawn_timeout: Duration,
    pub isolate_windows: bool,
    pub resize: ResizeSettings,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            session_prefix: "panehub-".to_string(),
            max_sessions: 64,
            default_dimensions: Dimensions::default(),
            spawn_timeout: Duration::from_secs(5),
            isolate_windows: true,
            resize: ResizeSettings::default(),
        }
    }
}

/// Identity assigned to a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub window_id: WindowId,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStatus {
    pub sessions: usize,
    pub running: usize,
    pub detached: usize,
    pub errored: usize,
    pub connections: usize,
    pub groups: usize,
}

/// Facade over the session engine.
pub struct SessionHub<M: Multiplexer> {
    store: Arc<SessionStore>,
    mux: Arc<M>,
    router: Arc<OwnershipRouter<M>>,
    coordinator: Arc<ResizeCoordinator<M>>,
    layout: Mutex<LayoutManager>,
    /// Serializes attachment changes per session.
    attach_locks: DashMap<SessionId, Arc<AsyncMutex<()>>>,
    settings: HubSettings,
}

impl<M: Multiplexer> SessionHub<M> {
    pub fn new(mux: Arc<M>, settings: HubSettings) -> Arc<Self> {
        let store = Arc::new(SessionStore::new(settings.session_prefix.clone()));
        let router = Arc::new(OwnershipRouter::new(
            Arc::clone(&store),
            Arc::clone(&mux),
            settings.isolate_windows,
        ));
        let coordinator = Arc::new(ResizeCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&mux),
            Arc::clone(&router),
            settings.resize,
        ));
        Arc::new(Self {
            store,
            mux,
            router,
            coordinator,
            layout: Mutex::new(LayoutManager::new()),
            attach_locks: DashMap::new(),
            settings,
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn mux(&self) -> &Arc<M> {
        &self.mux
    }

    pub fn router(&self) -> &Arc<OwnershipRouter<M>> {
        &self.router
    }

    pub fn coordinator(&self) -> &Arc<ResizeCoordinator<M>> {
        &self.coordinator
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    fn layout(&self) -> MutexGuard<'_, LayoutManager> {
        self.layout.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.attach_locks.entry(session_id.to_string()).or_default())
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Registers a new connection. A missing window id gets a fresh one.
    pub fn connect(
        &self,
        window_id: Option<String>,
    ) -> (ConnectionInfo, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = Uuid::new_v4().to_string();
        let window_id = window_id
            .filter(|w| !w.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let rx = self
            .router
            .register(connection_id.clone(), window_id.clone());
        (
            ConnectionInfo {
                connection_id,
                window_id,
            },
            rx,
        )
    }

    /// Forgets a connection after its transport closed.
    ///
    /// Sessions left without owners become detached and their attachments
    /// are released; the hosted processes keep running.
    pub async fn disconnect(&self, connection_id: &str) {
        let detached = self.router.drop_connection(connection_id).await;
        for session_id in detached {
            self.release_attachment(&session_id).await;
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    fn spawn_params(&self, request: &SpawnRequest) -> Result<SpawnParams, EngineError> {
        let defaults = self.settings.default_dimensions;
        let dimensions = Dimensions::new(
            request.cols.unwrap_or(defaults.cols),
            request.rows.unwrap_or(defaults.rows),
        );
        if dimensions.cols == 0 || dimensions.rows == 0 {
            return Err(EngineError::InvalidRequest(format!(
                "invalid dimensions {dimensions}"
            )));
        }
        Ok(SpawnParams {
            name: request.name.clone(),
            command: request.command.clone(),
            cwd: request.cwd.clone(),
            dimensions,
        })
    }

    async fn ensure_available(&self) -> Result<(), EngineError> {
        if self.mux.is_available().await {
            return Ok(());
        }
        self.mark_unavailable().await;
        Err(EngineError::MultiplexerUnavailable(
            "multiplexer service not reachable".to_string(),
        ))
    }

    fn mux_error(err: MuxError) -> EngineError {
        match err {
            MuxError::Unavailable(msg) => EngineError::MultiplexerUnavailable(msg),
            other => EngineError::Mux(other),
        }
    }

    /// Creates a session and makes the caller its first owner.
    ///
    /// If the multiplexer does not confirm within the spawn timeout, the
    /// half-created record is rolled back.
    pub async fn spawn(
        self: &Arc<Self>,
        connection_id: &str,
        request: SpawnRequest,
    ) -> Result<SessionView, EngineError> {
        let params = self.spawn_params(&request)?;
        self.ensure_available().await?;
        let record = self
            .store
            .try_create(&params, self.settings.max_sessions)
            .map_err(|e| match e {
                StoreError::LimitReached(limit) => EngineError::SessionLimit(limit),
                other => EngineError::Store(other),
            })?;
        let spawned =
            tokio::time::timeout(self.settings.spawn_timeout, self.mux.spawn(&record.mux_name, &params))
                .await;

        let attachment = match spawned {
            Ok(Ok(attachment)) => attachment,
            Ok(Err(e)) => {
                tracing::error!(session_id = %record.id, mux_name = %record.mux_name, error = %e, "Spawn failed");
                self.rollback(&record).await;
                return Err(Self::mux_error(e));
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %record.id,
                    mux_name = %record.mux_name,
                    timeout = ?self.settings.spawn_timeout,
                    "Spawn not confirmed in time, rolling back"
                );
                self.rollback(&record).await;
                let _ = self.mux.kill(&MuxHandle::detached(&record.mux_name)).await;
                return Err(EngineError::SpawnTimeout {
                    name: record.mux_name.clone(),
                    timeout: self.settings.spawn_timeout,
                });
            }
        };

        self.start_pump(&record.id, attachment);
        let record = self.router.subscribe(connection_id, &record.id).await?;

        tracing::info!(
            session_id = %record.id,
            mux_name = %record.mux_name,
            cols = record.dimensions.cols,
            rows = record.dimensions.rows,
            "Spawned session"
        );
        Ok(record.to_view())
    }

    /// Deletes a record that never got an owner.
    async fn rollback(&self, record: &SessionRecord) {
        self.coordinator.forget(&record.id);
        self.router.unbind(&record.id);
        self.attach_locks.remove(&record.id);
        if let Err(e) = self.store.delete(&record.id).await {
            tracing::error!(session_id = %record.id, error = %e, "Rollback failed");
        }
    }

    /// Streams an attachment's output through the resize coordinator to the
    /// session's owners.
    fn start_pump(self: &Arc<Self>, session_id: &str, attachment: Attachment) {
        let Attachment { handle, mut output } = attachment;
        if let Some(previous) = self.router.bind(session_id, handle.clone()) {
            tracing::warn!(session_id = %session_id, attach_id = previous.attach_id, "Replaced attachment, releasing the old one");
            let mux = Arc::clone(&self.mux);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = mux.detach(&previous).await {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to release replaced attachment");
                }
            });
        }

        let hub = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                hub.coordinator.deliver_output(&session_id, chunk).await;
            }
            // Released on purpose if no longer bound; otherwise the process went away.
            if hub.router.is_bound(&session_id, &handle) {
                hub.router.unbind(&session_id);
                hub.handle_process_exit(&session_id).await;
            }
        });
    }

    async fn handle_process_exit(&self, session_id: &str) {
        tracing::error!(session_id = %session_id, "Multiplexer session ended unexpectedly");
        self.set_status(session_id, SessionStatus::Error).await;
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) {
        if self
            .store
            .mutate(session_id, |r| r.status = status)
            .await
            .is_ok()
        {
            self.router
                .notify_owners(
                    session_id,
                    ServerMessage::SessionState(SessionState {
                        id: session_id.to_string(),
                        status,
                    }),
                )
                .await;
        }
    }

    /// Marks every record `error` after the multiplexer became unreachable.
    pub async fn mark_unavailable(&self) {
        let ids = self.store.ids();
        tracing::error!(sessions = ids.len(), "Multiplexer unavailable, marking sessions as errored");
        for id in ids {
            self.set_status(&id, SessionStatus::Error).await;
        }
    }

    /// Drops the attachment of a session nobody displays any more.
    async fn release_attachment(&self, session_id: &str) {
        let lock = self.attach_lock(session_id);
        let _guard = lock.lock().await;
        // A reattach may have won the lock first.
        if let Ok(record) = self.store.get(session_id).await {
            if record.is_owned() {
                return;
            }
        }
        self.coordinator.cancel_pending(session_id);
        if let Some(handle) = self.router.unbind(session_id) {
            if let Err(e) = self.mux.detach(&handle).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to release attachment");
            }
        }
        tracing::debug!(session_id = %session_id, "Session detached; process left running");
    }

    /// Resumes a session, or a whole group, for the caller.
    ///
    /// The target may be a session id, a multiplexer name, or a group id. A
    /// session inside a detached group brings the whole group back.
    pub async fn reattach(
        self: &Arc<Self>,
        connection_id: &str,
        request: ReattachRequest,
    ) -> Result<Reattached, EngineError> {
        let fit = match (request.cols, request.rows) {
            (Some(cols), Some(rows)) if cols > 0 && rows > 0 => Some(Dimensions::new(cols, rows)),
            _ => None,
        };

        let target = if self.layout().contains_group(&request.target) {
            self.layout().reattach(&request.target)
        } else {
            let record = self
                .store
                .resolve(&request.target)
                .await
                .map_err(|e| EngineError::from_lookup(&request.target, e))?;
            self.layout().reattach(&record.id)
        };

        match target {
            ReattachTarget::Session(id) => {
                let view = self.reattach_session(connection_id, &id, fit).await?;
                Ok(Reattached {
                    sessions: vec![view],
                    group: None,
                })
            }
            ReattachTarget::Group { group, sessions } => {
                let mut views = Vec::with_capacity(sessions.len());
                let mut subscribed = Vec::new();
                for id in &sessions {
                    let owned_before = self
                        .store
                        .get(id)
                        .await
                        .map(|r| r.is_owner(connection_id))
                        .unwrap_or(false);
                    match self.reattach_session(connection_id, id, None).await {
                        Ok(view) => {
                            if !owned_before {
                                subscribed.push(view.id.clone());
                            }
                            views.push(view);
                        }
                        Err(EngineError::SessionNotFound(_)) => {
                            tracing::warn!(group_id = %group.id, session_id = %id, "Group member no longer exists");
                        }
                        Err(e) => {
                            tracing::warn!(group_id = %group.id, session_id = %id, error = %e, "Group reattach failed, undoing");
                            for restored in &subscribed {
                                if let Err(err) = self.detach(connection_id, restored).await {
                                    tracing::warn!(session_id = %restored, error = %err, "Failed to undo reattach");
                                }
                            }
                            return Err(e);
                        }
                    }
                }
                if views.is_empty() {
                    return Err(EngineError::SessionNotFound(request.target));
                }
                let group = self
                    .layout()
                    .mark_attached(&group.id)
                    .map(|g| g.to_view())
                    .unwrap_or_else(|| group.to_view());
                tracing::info!(group_id = %group.id, sessions = views.len(), "Reattached group");
                Ok(Reattached {
                    sessions: views,
                    group: Some(group),
                })
            }
        }
    }

    async fn reattach_session(
        self: &Arc<Self>,
        connection_id: &str,
        session_id: &str,
        fit: Option<Dimensions>,
    ) -> Result<SessionView, EngineError> {
        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;
        self.authorize(connection_id, &record)?;

        let lock = self.attach_lock(session_id);
        let guard = lock.lock().await;
        if self.router.handle(session_id).is_none() {
            let attached = tokio::time::timeout(
                self.settings.spawn_timeout,
                self.mux.attach(&record.mux_name, record.dimensions),
            )
            .await;
            match attached {
                Ok(Ok(attachment)) => self.start_pump(session_id, attachment),
                Ok(Err(MuxError::NotFound(_))) => {
                    tracing::warn!(
                        session_id = %session_id,
                        mux_name = %record.mux_name,
                        "Multiplexer session is gone, forgetting record"
                    );
                    self.forget_session(&record).await;
                    return Err(EngineError::SessionNotFound(session_id.to_string()));
                }
                Ok(Err(e)) => return Err(Self::mux_error(e)),
                Err(_) => {
                    tracing::warn!(session_id = %session_id, "Attach not confirmed in time");
                    return Err(EngineError::SpawnTimeout {
                        name: record.mux_name.clone(),
                        timeout: self.settings.spawn_timeout,
                    });
                }
            }
        }

        self.router.subscribe(connection_id, session_id).await?;
        drop(guard);
        let fit = fit.unwrap_or(record.dimensions);
        match self.coordinator.reconnect(session_id, fit).await {
            Ok(outcome) => {
                tracing::debug!(session_id = %session_id, ?outcome, "Reconnection resize done")
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Reconnection resize failed")
            }
        }

        let record = self.store.get(session_id).await?;
        tracing::info!(
            session_id = %session_id,
            connection_id = %connection_id,
            mux_name = %record.mux_name,
            "Reattached session"
        );
        Ok(record.to_view())
    }

    /// Removes a record whose process is known to be gone.
    async fn forget_session(&self, record: &SessionRecord) {
        let owners: Vec<ConnectionId> = record.owners.iter().cloned().collect();
        for owner in &owners {
            let _ = self.router.unsubscribe(owner, &record.id).await;
        }
        self.coordinator.forget(&record.id);
        self.router.unbind(&record.id);
        self.attach_locks.remove(&record.id);
        self.layout().remove_session(&record.id);
        if let Err(e) = self.store.delete(&record.id).await {
            tracing::error!(session_id = %record.id, error = %e, "Failed to forget session");
        }
    }

    /// Rejects a connection touching a session bound to another window.
    fn authorize(&self, connection_id: &str, record: &SessionRecord) -> Result<(), EngineError> {
        if !self.settings.isolate_windows || !record.is_owned() {
            return Ok(());
        }
        let window = self
            .router
            .connection(connection_id)
            .map(|c| c.window_id().clone());
        if window.is_some() && window == record.window_id {
            Ok(())
        } else {
            tracing::warn!(
                session_id = %record.id,
                connection_id = %connection_id,
                "Ownership violation: session is bound to another window"
            );
            Err(EngineError::OwnershipViolation(format!(
                "session {} is bound to another window",
                record.id
            )))
        }
    }

    /// Authorizes the caller against every session under the given panes.
    async fn authorize_panes(&self, connection_id: &str, panes: &[&str]) -> Result<(), EngineError> {
        let sessions: Vec<SessionId> = {
            let layout = self.layout();
            panes
                .iter()
                .flat_map(|pane| {
                    if layout.contains_group(pane) {
                        layout.sessions_of(pane)
                    } else {
                        vec![pane.to_string()]
                    }
                })
                .collect()
        };
        for id in &sessions {
            if let Ok(record) = self.store.get(id).await {
                self.authorize(connection_id, &record)?;
            }
        }
        Ok(())
    }

    /// Forwards input from an owner.
    pub async fn input(
        &self,
        connection_id: &str,
        session_id: &str,
        data: &[u8],
    ) -> Result<(), EngineError> {
        self.router.route_input(connection_id, session_id, data).await
    }

    /// Hands a viewport change to the resize coordinator.
    pub async fn resize(
        &self,
        connection_id: &str,
        session_id: &str,
        dims: Dimensions,
        kind: ResizeKind,
    ) -> Result<ResizeOutcome, EngineError> {
        if dims.cols == 0 || dims.rows == 0 {
            return Err(EngineError::InvalidRequest(format!("invalid dimensions {dims}")));
        }
        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;
        if !record.is_owner(connection_id) {
            return Err(EngineError::OwnershipViolation(format!(
                "connection {connection_id} does not own session {session_id}"
            )));
        }
        self.coordinator.handle_resize(session_id, dims, kind)
    }

    /// Removes the caller's ownership. Never kills the process.
    pub async fn detach(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<SessionView, EngineError> {
        if self.router.unsubscribe(connection_id, session_id).await? {
            self.release_attachment(session_id).await;
        }
        Ok(self.store.get(session_id).await?.to_view())
    }

    /// Removes every owner of a session and releases its attachment.
    async fn detach_all(&self, session_id: &str) {
        let Ok(record) = self.store.get(session_id).await else {
            return;
        };
        for owner in &record.owners {
            let _ = self.router.unsubscribe(owner, session_id).await;
        }
        self.router.notify(
            record.owners.iter(),
            ServerMessage::SessionState(SessionState {
                id: session_id.to_string(),
                status: SessionStatus::Detached,
            }),
        );
        self.release_attachment(session_id).await;
    }

    /// Kills a session on behalf of a connection.
    pub async fn close(&self, connection_id: &str, session_id: &str) -> Result<(), EngineError> {
        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;
        self.authorize(connection_id, &record)?;
        self.kill_session(session_id).await?;
        // Owners were already told by kill_session.
        if !record.is_owner(connection_id) {
            self.router.send_to(
                connection_id,
                ServerMessage::Closed(SessionRef {
                    id: session_id.to_string(),
                }),
            );
        }
        Ok(())
    }

    /// Kills a session's process and deletes its record.
    ///
    /// Owners are removed first and told the session is gone.
    pub async fn kill_session(&self, session_id: &str) -> Result<(), EngineError> {
        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;

        for owner in &record.owners {
            self.router.unsubscribe(owner, session_id).await?;
        }
        self.coordinator.forget(session_id);
        let handle = self
            .router
            .unbind(session_id)
            .unwrap_or_else(|| MuxHandle::detached(&record.mux_name));
        match self.mux.kill(&handle).await {
            Ok(()) | Err(MuxError::NotFound(_)) => {}
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to kill multiplexer session");
                return Err(Self::mux_error(e));
            }
        }
        self.store.delete(session_id).await?;
        self.attach_locks.remove(session_id);

        let group = self.layout().remove_session(session_id);
        self.router.notify(
            record.owners.iter(),
            ServerMessage::Closed(SessionRef {
                id: session_id.to_string(),
            }),
        );
        if let Some(group) = group {
            self.router
                .notify(record.owners.iter(), ServerMessage::GroupState(group.to_view()));
        }

        tracing::info!(session_id = %session_id, mux_name = %record.mux_name, "Closed session");
        Ok(())
    }

    /// Renames a session's display label.
    pub async fn rename(
        &self,
        connection_id: &str,
        session_id: &str,
        name: &str,
    ) -> Result<SessionView, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("name must not be empty".to_string()));
        }
        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;
        self.authorize(connection_id, &record)?;
        Ok(self.store.rename(session_id, name).await?.to_view())
    }

    // ------------------------------------------------------------------
    // Split layouts
    // ------------------------------------------------------------------

    /// Spawns a session and places it beside an existing pane.
    pub async fn split(
        self: &Arc<Self>,
        connection_id: &str,
        request: SplitRequest,
    ) -> Result<GroupView, EngineError> {
        let pane_exists =
            self.layout().contains_group(&request.pane_id) || self.store.contains(&request.pane_id);
        if !pane_exists {
            return Err(EngineError::SessionNotFound(request.pane_id));
        }
        self.authorize_panes(connection_id, &[request.pane_id.as_str()]).await?;

        let view = self.spawn(connection_id, request.spawn).await?;
        let split = self.layout().split(
            &request.pane_id,
            &view.id,
            request.orientation,
            request.position,
        );
        match split {
            Ok(group) => Ok(group.to_view()),
            Err(e) => {
                tracing::warn!(pane_id = %request.pane_id, error = %e, "Split failed, closing new session");
                let _ = self.kill_session(&view.id).await;
                Err(e.into())
            }
        }
    }

    /// Kills a pane's sessions and collapses its group.
    pub async fn close_pane(
        &self,
        connection_id: &str,
        group_id: &str,
        pane_id: &str,
    ) -> Result<Option<GroupView>, EngineError> {
        self.authorize_panes(connection_id, &[group_id, pane_id]).await?;
        let removal = self.layout().close_pane(group_id, pane_id)?;
        for session_id in &removal.sessions {
            if let Err(e) = self.kill_session(session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to close pane session");
            }
        }
        Ok(removal.group.map(|g| g.to_view()))
    }

    /// Detaches a pane out of its group and collapses the group.
    pub async fn detach_pane(
        &self,
        connection_id: &str,
        group_id: &str,
        pane_id: &str,
    ) -> Result<Option<GroupView>, EngineError> {
        self.authorize_panes(connection_id, &[group_id, pane_id]).await?;
        let removal = self.layout().detach_pane(group_id, pane_id)?;
        for session_id in &removal.sessions {
            self.detach_all(session_id).await;
        }
        Ok(removal.group.map(|g| g.to_view()))
    }

    /// Detaches every pane of a group, keeping the arrangement for later.
    pub async fn detach_group(
        &self,
        connection_id: &str,
        group_id: &str,
    ) -> Result<GroupView, EngineError> {
        self.authorize_panes(connection_id, &[group_id]).await?;
        let (group, sessions) = self.layout().detach_group(group_id)?;
        for session_id in &sessions {
            self.detach_all(session_id).await;
        }
        tracing::info!(group_id = %group_id, sessions = sessions.len(), "Detached group");
        Ok(group.to_view())
    }

    // ------------------------------------------------------------------
    // Queries and maintenance
    // ------------------------------------------------------------------

    /// Snapshot of every session and group.
    pub async fn list(&self) -> SessionList {
        let sessions = self
            .store
            .list()
            .await
            .iter()
            .map(SessionRecord::to_view)
            .collect();
        let groups = self.layout().groups().into_iter().map(|g| g.to_view()).collect();
        SessionList { sessions, groups }
    }

    pub async fn status(&self) -> HubStatus {
        let records = self.store.list().await;
        let count = |status: SessionStatus| records.iter().filter(|r| r.status == status).count();
        HubStatus {
            sessions: records.len(),
            running: count(SessionStatus::Running),
            detached: count(SessionStatus::Detached),
            errored: count(SessionStatus::Error),
            connections: self.router.connection_count(),
            groups: self.layout().len(),
        }
    }

    /// Registers multiplexer sessions in this application's namespace that
    /// the store does not know yet, e.g. after a daemon restart.
    ///
    /// Returns the number of sessions adopted.
    pub async fn reconcile(&self) -> Result<usize, EngineError> {
        let names = self.mux.list_sessions().await.map_err(Self::mux_error)?;
        let mut adopted = 0;
        for name in names {
            if !self.store.owns_name(&name) || self.store.find_by_mux_name(&name).await.is_ok() {
                continue;
            }
            let display_name = name
                .strip_prefix(self.store.prefix())
                .unwrap_or(&name)
                .to_string();
            let mut record = SessionRecord::new(
                Uuid::new_v4().to_string(),
                name.clone(),
                display_name,
                self.settings.default_dimensions,
            );
            record.status = SessionStatus::Detached;
            match self.store.insert_restored(record) {
                Ok(()) => {
                    adopted += 1;
                    tracing::info!(mux_name = %name, "Adopted existing multiplexer session");
                }
                Err(StoreError::DuplicateName(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(adopted)
    }

    /// Pushes output into a session as if the multiplexer produced it.
    pub async fn inject_output(&self, session_id: &str, data: &[u8]) -> usize {
        self.coordinator
            .deliver_output(session_id, Bytes::copy_from_slice(data))
            .await
    }

    /// Ids of every session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.store.ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::mux::MemoryMultiplexer;
    use protocol::{Orientation, PanePosition};

    fn settings() -> HubSettings {
        HubSettings {
            spawn_timeout: Duration::from_millis(100),
            resize: ResizeSettings {
                debounce: Duration::from_millis(20),
                reconnect_debounce: Duration::from_millis(100),
                clear_threshold_cols: 5,
                trick_settle: Duration::from_millis(1),
            },
            ..HubSettings::default()
        }
    }

    fn hub() -> Arc<SessionHub<MemoryMultiplexer>> {
        SessionHub::new(Arc::new(MemoryMultiplexer::new("panehub-")), settings())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn reattach_request(target: &str) -> ReattachRequest {
        ReattachRequest {
            target: target.to_string(),
            cols: None,
            rows: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_makes_caller_owner() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));

        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();
        assert_eq!(view.status, SessionStatus::Running);
        assert_eq!(view.owners, 1);
        assert_eq!((view.cols, view.rows), (80, 24));
        assert_ne!(view.id, view.mux_name);
        assert!(hub.mux().contains(&view.mux_name));
        assert!(hub.router().handle(&view.id).is_some());
    }

    #[tokio::test]
    async fn test_detach_then_reattach_keeps_identity() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();

        let detached = hub.detach(&conn.connection_id, &view.id).await.unwrap();
        assert_eq!(detached.status, SessionStatus::Detached);
        assert_eq!(detached.owners, 0);
        assert!(hub.mux().contains(&view.mux_name));
        assert!(hub.router().handle(&view.id).is_none());

        let reattached = hub
            .reattach(&conn.connection_id, reattach_request(&view.id))
            .await
            .unwrap();
        let again = &reattached.sessions[0];
        assert_eq!(again.id, view.id);
        assert_eq!(again.mux_name, view.mux_name);
        assert_eq!(again.status, SessionStatus::Running);
        assert!(reattached.group.is_none());

        // Equal dimensions force the two-step redraw.
        assert_eq!(
            hub.mux().applied_resizes(&view.mux_name),
            vec![Dimensions::new(80, 23), Dimensions::new(80, 24)]
        );
    }

    #[tokio::test]
    async fn test_reattach_by_mux_name() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();
        hub.detach(&conn.connection_id, &view.id).await.unwrap();

        let reattached = hub
            .reattach(&conn.connection_id, reattach_request(&view.mux_name))
            .await
            .unwrap();
        assert_eq!(reattached.sessions[0].id, view.id);
    }

    #[tokio::test]
    async fn test_reattach_to_dead_process_reports_not_found() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();
        hub.detach(&conn.connection_id, &view.id).await.unwrap();
        hub.mux().exit(&view.mux_name);

        let err = hub
            .reattach(&conn.connection_id, reattach_request(&view.id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
        assert!(!hub.store().contains(&view.id));
        // Nothing was respawned under the old name.
        assert!(!hub.mux().contains(&view.mux_name));

        let err = hub
            .reattach(&conn.connection_id, reattach_request("unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_spawn_timeout_rolls_back() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        hub.mux().set_spawn_delay(Some(Duration::from_millis(500)));

        let err = hub
            .spawn(&conn.connection_id, SpawnRequest::named("slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SpawnTimeout { .. }));
        assert!(hub.store().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_multiplexer_marks_records_error() {
        let hub = hub();
        let (conn, mut rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();

        hub.mux().set_available(false);
        let err = hub
            .spawn(&conn.connection_id, SpawnRequest::named("another"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MultiplexerUnavailable(_)));

        let record = hub.store().get(&view.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Error);
        assert!(drain(&mut rx).iter().any(|m| matches!(
            m,
            ServerMessage::SessionState(SessionState { status: SessionStatus::Error, .. })
        )));
    }

    #[tokio::test]
    async fn test_process_exit_marks_error() {
        let hub = hub();
        let (conn, mut rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();

        hub.mux().exit(&view.mux_name);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = hub.store().get(&view.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Error);
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::SessionState(_))));
    }

    #[tokio::test]
    async fn test_close_kills_and_forgets() {
        let hub = hub();
        let (conn, mut rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();

        hub.close(&conn.connection_id, &view.id).await.unwrap();
        assert!(!hub.store().contains(&view.id));
        assert!(!hub.mux().contains(&view.mux_name));
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Closed(r) if r.id == view.id)));

        let err = hub.close(&conn.connection_id, &view.id).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_foreign_window_cannot_close_or_reattach() {
        let hub = hub();
        let (a, _rx_a) = hub.connect(Some("w1".into()));
        let (b, _rx_b) = hub.connect(Some("w2".into()));
        let view = hub.spawn(&a.connection_id, SpawnRequest::named("dev")).await.unwrap();

        assert!(matches!(
            hub.close(&b.connection_id, &view.id).await,
            Err(EngineError::OwnershipViolation(_))
        ));
        assert!(matches!(
            hub.reattach(&b.connection_id, reattach_request(&view.id)).await,
            Err(EngineError::OwnershipViolation(_))
        ));
        assert!(hub.store().contains(&view.id));
    }

    #[tokio::test]
    async fn test_disconnect_detaches_sessions() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();

        hub.disconnect(&conn.connection_id).await;
        let record = hub.store().get(&view.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Detached);
        assert!(hub.mux().contains(&view.mux_name));
        assert_eq!(hub.mux().attachment_count(&view.mux_name), 0);
    }

    #[tokio::test]
    async fn test_resize_requires_ownership() {
        let hub = hub();
        let (a, _rx_a) = hub.connect(Some("w1".into()));
        let (b, _rx_b) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&a.connection_id, SpawnRequest::named("dev")).await.unwrap();

        let outcome = hub
            .resize(&a.connection_id, &view.id, Dimensions::new(100, 30), ResizeKind::Window)
            .await
            .unwrap();
        assert_eq!(outcome, ResizeOutcome::Scheduled);
        assert!(matches!(
            hub.resize(&b.connection_id, &view.id, Dimensions::new(90, 30), ResizeKind::Window)
                .await,
            Err(EngineError::OwnershipViolation(_))
        ));
        assert!(matches!(
            hub.resize(&a.connection_id, &view.id, Dimensions::new(0, 30), ResizeKind::Window)
                .await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let hub = SessionHub::new(
            Arc::new(MemoryMultiplexer::new("panehub-")),
            HubSettings {
                max_sessions: 1,
                ..settings()
            },
        );
        let (conn, _rx) = hub.connect(None);
        hub.spawn(&conn.connection_id, SpawnRequest::named("a")).await.unwrap();
        assert!(matches!(
            hub.spawn(&conn.connection_id, SpawnRequest::named("b")).await,
            Err(EngineError::SessionLimit(1))
        ));
    }

    #[tokio::test]
    async fn test_split_and_close_pane_collapses() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let first = hub.spawn(&conn.connection_id, SpawnRequest::named("left")).await.unwrap();

        let group = hub
            .split(
                &conn.connection_id,
                SplitRequest {
                    pane_id: first.id.clone(),
                    spawn: SpawnRequest::named("right"),
                    orientation: Orientation::Horizontal,
                    position: PanePosition::After,
                },
            )
            .await
            .unwrap();
        assert_eq!(group.panes.len(), 2);
        assert_eq!(hub.store().len(), 2);

        let collapsed = hub.close_pane(&conn.connection_id, &group.id, &first.id).await.unwrap().unwrap();
        assert_eq!(collapsed.id, group.id);
        assert_eq!(collapsed.layout, protocol::Layout::Single);
        assert_eq!(hub.store().len(), 1);
        assert!(!hub.store().contains(&first.id));
    }

    #[tokio::test]
    async fn test_split_unknown_pane() {
        let hub = hub();
        let (conn, _rx) = hub.connect(None);
        let err = hub
            .split(
                &conn.connection_id,
                SplitRequest {
                    pane_id: "nope".into(),
                    spawn: SpawnRequest::named("x"),
                    orientation: Orientation::Vertical,
                    position: PanePosition::After,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
        assert!(hub.store().is_empty());
    }

    #[tokio::test]
    async fn test_reattach_pane_of_detached_group_restores_siblings() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let first = hub.spawn(&conn.connection_id, SpawnRequest::named("a")).await.unwrap();
        let group = hub
            .split(
                &conn.connection_id,
                SplitRequest {
                    pane_id: first.id.clone(),
                    spawn: SpawnRequest::named("b"),
                    orientation: Orientation::Vertical,
                    position: PanePosition::After,
                },
            )
            .await
            .unwrap();

        let detached = hub.detach_group(&conn.connection_id, &group.id).await.unwrap();
        assert!(detached.detached);
        for view in hub.list().await.sessions {
            assert_eq!(view.status, SessionStatus::Detached);
        }

        let reattached = hub
            .reattach(&conn.connection_id, reattach_request(&first.id))
            .await
            .unwrap();
        assert_eq!(reattached.sessions.len(), 2);
        let group_view = reattached.group.unwrap();
        assert_eq!(group_view.id, group.id);
        assert!(!group_view.detached);
        for view in hub.list().await.sessions {
            assert_eq!(view.status, SessionStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_detach_pane_leaves_session_standalone() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let first = hub.spawn(&conn.connection_id, SpawnRequest::named("a")).await.unwrap();
        let group = hub
            .split(
                &conn.connection_id,
                SplitRequest {
                    pane_id: first.id.clone(),
                    spawn: SpawnRequest::named("b"),
                    orientation: Orientation::Horizontal,
                    position: PanePosition::Before,
                },
            )
            .await
            .unwrap();

        let remaining = hub.detach_pane(&conn.connection_id, &group.id, &first.id).await.unwrap().unwrap();
        assert_eq!(remaining.id, group.id);
        assert_eq!(remaining.panes.len(), 1);
        let record = hub.store().get(&first.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Detached);
        assert!(hub.mux().contains(&record.mux_name));
    }

    #[tokio::test]
    async fn test_reconcile_adopts_prefixed_sessions() {
        let hub = hub();
        hub.mux().insert_external("panehub-survivor", Dimensions::new(80, 24));
        hub.mux().insert_external("unrelated", Dimensions::new(80, 24));

        assert_eq!(hub.reconcile().await.unwrap(), 1);
        assert_eq!(hub.reconcile().await.unwrap(), 0);

        let record = hub.store().find_by_mux_name("panehub-survivor").await.unwrap();
        assert_eq!(record.status, SessionStatus::Detached);
        assert_eq!(record.display_name, "survivor");

        let (conn, _rx) = hub.connect(None);
        let reattached = hub
            .reattach(&conn.connection_id, reattach_request("panehub-survivor"))
            .await
            .unwrap();
        assert_eq!(reattached.sessions[0].id, record.id);
    }

    #[tokio::test]
    async fn test_rename_and_status() {
        let hub = hub();
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();

        let renamed = hub.rename(&conn.connection_id, &view.id, "build").await.unwrap();
        assert_eq!(renamed.display_name, "build");
        assert_eq!(renamed.mux_name, view.mux_name);
        assert!(hub.rename(&conn.connection_id, &view.id, "  ").await.is_err());

        let status = hub.status().await;
        assert_eq!(status.sessions, 1);
        assert_eq!(status.running, 1);
        assert_eq!(status.connections, 1);
    }

    /// Memory backend with slow attaches and per-name attach failures.
    struct GatedMux {
        inner: MemoryMultiplexer,
        attach_delay: Duration,
        attach_calls: AtomicUsize,
        fail_attach: std::sync::Mutex<HashSet<String>>,
    }

    impl GatedMux {
        fn new(attach_delay: Duration) -> Self {
            Self {
                inner: MemoryMultiplexer::new("panehub-"),
                attach_delay,
                attach_calls: AtomicUsize::new(0),
                fail_attach: std::sync::Mutex::new(HashSet::new()),
            }
        }

        fn fail_attach_to(&self, name: &str) {
            self.fail_attach.lock().unwrap().insert(name.to_string());
        }

        fn clear_failures(&self) {
            self.fail_attach.lock().unwrap().clear();
        }
    }

    impl Multiplexer for GatedMux {
        async fn is_available(&self) -> bool {
            self.inner.is_available().await
        }
        async fn spawn(&self, name: &str, params: &SpawnParams) -> Result<Attachment, MuxError> {
            self.inner.spawn(name, params).await
        }
        async fn attach(&self, name: &str, dims: Dimensions) -> Result<Attachment, MuxError> {
            self.attach_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.attach_delay).await;
            if self.fail_attach.lock().unwrap().contains(name) {
                return Err(MuxError::Unavailable(format!("attach to {name} refused")));
            }
            self.inner.attach(name, dims).await
        }
        async fn write(&self, handle: &MuxHandle, data: &[u8]) -> Result<(), MuxError> {
            self.inner.write(handle, data).await
        }
        async fn resize(&self, handle: &MuxHandle, dims: Dimensions) -> Result<bool, MuxError> {
            self.inner.resize(handle, dims).await
        }
        async fn detach(&self, handle: &MuxHandle) -> Result<(), MuxError> {
            self.inner.detach(handle).await
        }
        async fn kill(&self, handle: &MuxHandle) -> Result<(), MuxError> {
            self.inner.kill(handle).await
        }
        async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
            self.inner.list_sessions().await
        }
    }

    fn gated_hub(attach_delay: Duration) -> Arc<SessionHub<GatedMux>> {
        SessionHub::new(Arc::new(GatedMux::new(attach_delay)), settings())
    }

    fn outputs(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> usize {
        drain(rx)
            .iter()
            .filter(|m| matches!(m, ServerMessage::Output(_)))
            .count()
    }

    async fn split_pair<M: Multiplexer>(
        hub: &Arc<SessionHub<M>>,
        connection_id: &str,
    ) -> (SessionView, GroupView) {
        let first = hub.spawn(connection_id, SpawnRequest::named("left")).await.unwrap();
        let group = hub
            .split(
                connection_id,
                SplitRequest {
                    pane_id: first.id.clone(),
                    spawn: SpawnRequest::named("right"),
                    orientation: Orientation::Horizontal,
                    position: PanePosition::After,
                },
            )
            .await
            .unwrap();
        (first, group)
    }

    #[tokio::test]
    async fn test_concurrent_reattach_opens_one_attachment() {
        let hub = gated_hub(Duration::from_millis(20));
        let (c1, mut rx1) = hub.connect(Some("w1".into()));
        let (c2, mut rx2) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&c1.connection_id, SpawnRequest::named("dev")).await.unwrap();
        hub.detach(&c1.connection_id, &view.id).await.unwrap();
        assert_eq!(hub.mux().inner.attachment_count(&view.mux_name), 0);

        let (a, b) = tokio::join!(
            hub.reattach(&c1.connection_id, reattach_request(&view.id)),
            hub.reattach(&c2.connection_id, reattach_request(&view.id)),
        );
        assert_eq!(a.unwrap().sessions[0].id, view.id);
        assert_eq!(b.unwrap().sessions[0].id, view.id);
        assert_eq!(hub.mux().attach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.mux().inner.attachment_count(&view.mux_name), 1);
        assert_eq!(hub.store().get(&view.id).await.unwrap().owners.len(), 2);

        drain(&mut rx1);
        drain(&mut rx2);
        hub.mux().inner.emit(&view.mux_name, b"X");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(outputs(&mut rx1), 1);
        assert_eq!(outputs(&mut rx2), 1);
    }

    #[tokio::test]
    async fn test_replaced_attachment_is_released() {
        let hub = hub();
        let (conn, mut rx) = hub.connect(Some("w1".into()));
        let view = hub.spawn(&conn.connection_id, SpawnRequest::named("dev")).await.unwrap();
        let first = hub.router().handle(&view.id).unwrap();

        let second = hub.mux().attach(&view.mux_name, Dimensions::new(80, 24)).await.unwrap();
        hub.start_pump(&view.id, second);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_ne!(hub.router().handle(&view.id).unwrap(), first);
        assert_eq!(hub.mux().attachment_count(&view.mux_name), 1);

        drain(&mut rx);
        hub.mux().emit(&view.mux_name, b"X");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(outputs(&mut rx), 1);
        assert_eq!(hub.store().get(&view.id).await.unwrap().status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_pane_operations_reject_other_window() {
        let hub = hub();
        let (owner, _rx1) = hub.connect(Some("w1".into()));
        let (intruder, _rx2) = hub.connect(Some("w2".into()));
        let (first, group) = split_pair(&hub, &owner.connection_id).await;

        assert!(matches!(
            hub.close_pane(&intruder.connection_id, &group.id, &first.id).await,
            Err(EngineError::OwnershipViolation(_))
        ));
        assert!(matches!(
            hub.detach_pane(&intruder.connection_id, &group.id, &first.id).await,
            Err(EngineError::OwnershipViolation(_))
        ));
        assert!(matches!(
            hub.detach_group(&intruder.connection_id, &group.id).await,
            Err(EngineError::OwnershipViolation(_))
        ));
        let split = hub
            .split(
                &intruder.connection_id,
                SplitRequest {
                    pane_id: first.id.clone(),
                    spawn: SpawnRequest::named("sneaky"),
                    orientation: Orientation::Vertical,
                    position: PanePosition::Before,
                },
            )
            .await;
        assert!(matches!(split, Err(EngineError::OwnershipViolation(_))));

        assert_eq!(hub.store().len(), 2);
        let layout = hub.layout().get(&group.id).cloned().unwrap();
        assert_eq!(layout.panes.len(), 2);
        assert!(!layout.detached);
        for view in hub.list().await.sessions {
            assert_eq!(view.status, SessionStatus::Running);
            assert_eq!(view.owners, 1);
        }
    }

    #[tokio::test]
    async fn test_pane_operations_allow_same_window() {
        let hub = hub();
        let (owner, _rx1) = hub.connect(Some("w1".into()));
        let (sibling, _rx2) = hub.connect(Some("w1".into()));
        let (_, group) = split_pair(&hub, &owner.connection_id).await;

        let detached = hub.detach_group(&sibling.connection_id, &group.id).await.unwrap();
        assert!(detached.detached);
        assert_eq!(hub.store().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_group_reattach_leaves_group_detached() {
        let hub = gated_hub(Duration::ZERO);
        let (conn, _rx) = hub.connect(Some("w1".into()));
        let (first, group) = split_pair(&hub, &conn.connection_id).await;
        let second_id = hub
            .layout()
            .sessions_of(&group.id)
            .into_iter()
            .find(|id| *id != first.id)
            .unwrap();
        let second = hub.store().get(&second_id).await.unwrap();

        hub.detach_group(&conn.connection_id, &group.id).await.unwrap();
        hub.mux().fail_attach_to(&second.mux_name);

        let err = hub
            .reattach(&conn.connection_id, reattach_request(&first.id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MultiplexerUnavailable(_)));

        assert!(hub.layout().get(&group.id).unwrap().detached);
        for id in [&first.id, &second_id] {
            let record = hub.store().get(id).await.unwrap();
            assert!(record.owners.is_empty());
            assert_eq!(record.status, SessionStatus::Detached);
            assert!(hub.router().handle(id).is_none());
        }
        assert_eq!(hub.mux().inner.attachment_count(&first.mux_name), 0);

        hub.mux().clear_failures();
        let restored = hub
            .reattach(&conn.connection_id, reattach_request(&first.id))
            .await
            .unwrap();
        assert_eq!(restored.sessions.len(), 2);
        assert!(!restored.group.unwrap().detached);
        assert!(!hub.layout().get(&group.id).unwrap().detached);
    }
}
