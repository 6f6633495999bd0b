//! Message router for dispatching client messages to the session hub.
//!
//! Every [`ClientMessage`] variant has exactly one handler. Handlers return
//! the direct reply, if any; asynchronous notifications (output, state
//! changes, clear-buffer hints) reach connections through their outbound
//! queues instead.

use std::sync::Arc;

use protocol::messages::{
    ErrorMessage, GroupRef, PaneRequest, Ping, Pong, ReattachRequest, RenameRequest,
    ResizeRequest, SessionInput, SessionRef, SessionState, SpawnRequest, SplitRequest,
};
use protocol::{ClientMessage, Dimensions, ErrorCode, ServerMessage};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::hub::SessionHub;
use crate::mux::Multiplexer;

/// Result type for router operations.
pub type RouterResult = Result<Option<ServerMessage>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The frame could not be understood.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Convert the error to a protocol error reply.
    pub fn to_error_message(&self) -> ErrorMessage {
        let (code, context) = match self {
            RouterError::Engine(e) => (e.code(), e.context()),
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, None),
        };
        ErrorMessage {
            code,
            message: self.to_string(),
            context,
            recoverable: matches!(code, ErrorCode::Unavailable | ErrorCode::Timeout),
        }
    }
}

/// Dispatches decoded client messages for one hub.
pub struct MessageRouter<M: Multiplexer> {
    hub: Arc<SessionHub<M>>,
}

impl<M: Multiplexer> Clone for MessageRouter<M> {
    fn clone(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
        }
    }
}

impl<M: Multiplexer> MessageRouter<M> {
    pub fn new(hub: Arc<SessionHub<M>>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<SessionHub<M>> {
        &self.hub
    }

    /// Decodes a text frame and routes it, turning any failure into an
    /// error reply.
    pub async fn route_text(&self, connection_id: &str, text: &str) -> Option<ServerMessage> {
        let result = match ClientMessage::from_json(text) {
            Ok(message) => self.route(connection_id, message).await,
            Err(e) => Err(RouterError::InvalidRequest(e.to_string())),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Request failed");
                Some(ServerMessage::Error(e.to_error_message()))
            }
        }
    }

    /// Route a message to its handler.
    ///
    /// Returns `Ok(Some(reply))` if a reply should be sent back, `Ok(None)`
    /// if not.
    pub async fn route(&self, connection_id: &str, message: ClientMessage) -> RouterResult {
        match message {
            ClientMessage::Spawn(req) => self.handle_spawn(connection_id, req).await,
            ClientMessage::Reattach(req) => self.handle_reattach(connection_id, req).await,
            ClientMessage::Input(input) => self.handle_input(connection_id, input).await,
            ClientMessage::Resize(req) => self.handle_resize(connection_id, req).await,
            ClientMessage::Detach(req) => self.handle_detach(connection_id, req).await,
            ClientMessage::Close(req) => self.handle_close(connection_id, req).await,
            ClientMessage::Split(req) => self.handle_split(connection_id, req).await,
            ClientMessage::ClosePane(req) => self.handle_close_pane(connection_id, req).await,
            ClientMessage::DetachPane(req) => self.handle_detach_pane(connection_id, req).await,
            ClientMessage::DetachGroup(req) => self.handle_detach_group(connection_id, req).await,
            ClientMessage::Rename(req) => self.handle_rename(connection_id, req).await,
            ClientMessage::List => self.handle_list().await,
            ClientMessage::Ping(ping) => self.handle_ping(ping),
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_spawn(&self, connection_id: &str, req: SpawnRequest) -> RouterResult {
        info!(connection_id = %connection_id, name = %req.name, command = ?req.command, "Spawning session");
        let view = self.hub.spawn(connection_id, req).await?;
        Ok(Some(ServerMessage::SpawnResult(view)))
    }

    async fn handle_reattach(&self, connection_id: &str, req: ReattachRequest) -> RouterResult {
        info!(connection_id = %connection_id, target = %req.target, "Reattaching");
        let reattached = self.hub.reattach(connection_id, req).await?;
        Ok(Some(ServerMessage::Reattached(reattached)))
    }

    async fn handle_input(&self, connection_id: &str, input: SessionInput) -> RouterResult {
        self.hub
            .input(connection_id, &input.id, &input.data)
            .await?;
        Ok(None)
    }

    async fn handle_resize(&self, connection_id: &str, req: ResizeRequest) -> RouterResult {
        debug!(
            session_id = %req.id,
            cols = req.cols,
            rows = req.rows,
            kind = ?req.kind,
            "Resize requested"
        );
        self.hub
            .resize(
                connection_id,
                &req.id,
                Dimensions::new(req.cols, req.rows),
                req.kind,
            )
            .await?;
        Ok(None)
    }

    async fn handle_detach(&self, connection_id: &str, req: SessionRef) -> RouterResult {
        let view = self.hub.detach(connection_id, &req.id).await?;
        Ok(Some(ServerMessage::SessionState(SessionState {
            id: view.id,
            status: view.status,
        })))
    }

    async fn handle_close(&self, connection_id: &str, req: SessionRef) -> RouterResult {
        // The hub sends `closed` to the caller and every owner.
        self.hub.close(connection_id, &req.id).await?;
        Ok(None)
    }

    // =========================================================================
    // Split Handlers
    // =========================================================================

    async fn handle_split(&self, connection_id: &str, req: SplitRequest) -> RouterResult {
        info!(
            pane_id = %req.pane_id,
            orientation = ?req.orientation,
            position = ?req.position,
            "Splitting pane"
        );
        let group = self.hub.split(connection_id, req).await?;
        Ok(Some(ServerMessage::SplitResult(group)))
    }

    async fn handle_close_pane(&self, connection_id: &str, req: PaneRequest) -> RouterResult {
        let group = self.hub.close_pane(connection_id, &req.group_id, &req.pane_id).await?;
        Ok(group.map(ServerMessage::GroupState))
    }

    async fn handle_detach_pane(&self, connection_id: &str, req: PaneRequest) -> RouterResult {
        let group = self.hub.detach_pane(connection_id, &req.group_id, &req.pane_id).await?;
        Ok(group.map(ServerMessage::GroupState))
    }

    async fn handle_detach_group(&self, connection_id: &str, req: GroupRef) -> RouterResult {
        let group = self.hub.detach_group(connection_id, &req.group_id).await?;
        Ok(Some(ServerMessage::GroupState(group)))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    async fn handle_rename(&self, connection_id: &str, req: RenameRequest) -> RouterResult {
        self.hub.rename(connection_id, &req.id, &req.name).await?;
        Ok(Some(ServerMessage::SessionList(self.hub.list().await)))
    }

    async fn handle_list(&self) -> RouterResult {
        Ok(Some(ServerMessage::SessionList(self.hub.list().await)))
    }

    fn handle_ping(&self, ping: Ping) -> RouterResult {
        debug!(timestamp = ping.timestamp, "Received ping");
        Ok(Some(ServerMessage::Pong(Pong {
            timestamp: ping.timestamp,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::hub::HubSettings;
    use crate::mux::MemoryMultiplexer;
    use protocol::messages::SessionView;
    use protocol::{Orientation, PanePosition, ResizeKind, SessionStatus};

    fn create_test_router() -> MessageRouter<MemoryMultiplexer> {
        let hub = SessionHub::new(
            Arc::new(MemoryMultiplexer::new("panehub-")),
            HubSettings {
                spawn_timeout: Duration::from_millis(200),
                ..HubSettings::default()
            },
        );
        MessageRouter::new(hub)
    }

    async fn spawn(router: &MessageRouter<MemoryMultiplexer>, conn: &str, name: &str) -> SessionView {
        match router
            .route(conn, ClientMessage::Spawn(SpawnRequest::named(name)))
            .await
            .unwrap()
        {
            Some(ServerMessage::SpawnResult(view)) => view,
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_spawn() {
        let router = create_test_router();
        let (conn, _rx) = router.hub().connect(Some("w".into()));

        let view = spawn(&router, &conn.connection_id, "dev").await;
        assert_eq!(view.display_name, "dev");
        assert_eq!(view.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_route_input_reaches_multiplexer() {
        let router = create_test_router();
        let (conn, _rx) = router.hub().connect(Some("w".into()));
        let view = spawn(&router, &conn.connection_id, "dev").await;

        let reply = router
            .route(
                &conn.connection_id,
                ClientMessage::Input(SessionInput {
                    id: view.id.clone(),
                    data: b"ls\n".to_vec(),
                }),
            )
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(router.hub().mux().input_of(&view.mux_name), b"ls\n");
    }

    #[tokio::test]
    async fn test_route_input_from_non_owner_rejected() {
        let router = create_test_router();
        let (owner, _rx) = router.hub().connect(Some("w".into()));
        let (other, _rx2) = router.hub().connect(Some("w".into()));
        let view = spawn(&router, &owner.connection_id, "dev").await;

        let err = router
            .route(
                &other.connection_id,
                ClientMessage::Input(SessionInput {
                    id: view.id,
                    data: b"x".to_vec(),
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_error_message().code, ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_route_detach_replies_with_state() {
        let router = create_test_router();
        let (conn, _rx) = router.hub().connect(Some("w".into()));
        let view = spawn(&router, &conn.connection_id, "dev").await;

        let reply = router
            .route(&conn.connection_id, ClientMessage::Detach(SessionRef { id: view.id.clone() }))
            .await
            .unwrap();
        assert_eq!(
            reply,
            Some(ServerMessage::SessionState(SessionState {
                id: view.id,
                status: SessionStatus::Detached,
            }))
        );
    }

    #[tokio::test]
    async fn test_route_resize_layout_is_silent() {
        let router = create_test_router();
        let (conn, _rx) = router.hub().connect(Some("w".into()));
        let view = spawn(&router, &conn.connection_id, "dev").await;

        let reply = router
            .route(
                &conn.connection_id,
                ClientMessage::Resize(ResizeRequest {
                    id: view.id,
                    cols: 40,
                    rows: 24,
                    kind: ResizeKind::Layout,
                }),
            )
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(router.hub().mux().resize_log().is_empty());
    }

    #[tokio::test]
    async fn test_route_split_and_list() {
        let router = create_test_router();
        let (conn, _rx) = router.hub().connect(Some("w".into()));
        let view = spawn(&router, &conn.connection_id, "dev").await;

        let reply = router
            .route(
                &conn.connection_id,
                ClientMessage::Split(SplitRequest {
                    pane_id: view.id,
                    spawn: SpawnRequest::named("logs"),
                    orientation: Orientation::Vertical,
                    position: PanePosition::After,
                }),
            )
            .await
            .unwrap();
        let Some(ServerMessage::SplitResult(group)) = reply else {
            panic!("expected split result");
        };
        assert_eq!(group.panes.len(), 2);

        let Some(ServerMessage::SessionList(list)) =
            router.route(&conn.connection_id, ClientMessage::List).await.unwrap()
        else {
            panic!("expected session list");
        };
        assert_eq!(list.sessions.len(), 2);
        assert_eq!(list.groups.len(), 1);
    }

    #[tokio::test]
    async fn test_route_rename() {
        let router = create_test_router();
        let (conn, _rx) = router.hub().connect(Some("w".into()));
        let view = spawn(&router, &conn.connection_id, "dev").await;

        let Some(ServerMessage::SessionList(list)) = router
            .route(
                &conn.connection_id,
                ClientMessage::Rename(RenameRequest {
                    id: view.id,
                    name: "build".into(),
                }),
            )
            .await
            .unwrap()
        else {
            panic!("expected session list");
        };
        assert_eq!(list.sessions[0].display_name, "build");
    }

    #[tokio::test]
    async fn test_route_ping() {
        let router = create_test_router();
        let reply = router
            .route("conn", ClientMessage::Ping(Ping { timestamp: 42 }))
            .await
            .unwrap();
        assert_eq!(reply, Some(ServerMessage::Pong(Pong { timestamp: 42 })));
    }

    #[tokio::test]
    async fn test_route_text_invalid_frame() {
        let router = create_test_router();
        let reply = router.route_text("conn", "{not json").await;
        match reply {
            Some(ServerMessage::Error(err)) => {
                assert_eq!(err.code, ErrorCode::InvalidRequest);
                assert!(!err.recoverable);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_text_unknown_session() {
        let router = create_test_router();
        let (conn, _rx) = router.hub().connect(None);
        let reply = router
            .route_text(
                &conn.connection_id,
                r#"{"type":"reattach","data":{"target":"gone"}}"#,
            )
            .await;
        match reply {
            Some(ServerMessage::Error(err)) => {
                assert_eq!(err.code, ErrorCode::NotFound);
                assert_eq!(err.message, "session no longer exists: gone");
                assert_eq!(err.context.as_deref(), Some("gone"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_router_error_to_message() {
        let err = RouterError::Engine(EngineError::MultiplexerUnavailable("down".into()));
        let msg = err.to_error_message();
        assert_eq!(msg.code, ErrorCode::Unavailable);
        assert!(msg.recoverable);
    }
}
