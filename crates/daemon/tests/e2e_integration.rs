//! End-to-end integration tests for panehub.
//!
//! These tests drive complete flows on the in-memory multiplexer:
//! - Two windows sharing a session and seeing identical output
//! - Detach and reattach keeping the session identity
//! - Split groups surviving a detach
//! - The same flows over a real WebSocket connection

use std::sync::Arc;
use std::time::Duration;

use daemon::config::{BackendKind, Config};
use daemon::hub::{HubSettings, SessionHub};
use daemon::mux::MemoryMultiplexer;
use daemon::orchestrator::{Daemon, DaemonState};
use daemon::resize::ResizeSettings;
use futures_util::{SinkExt, StreamExt};
use protocol::messages::{
    ReattachRequest, SessionInput, SessionRef, SpawnRequest, SplitRequest,
};
use protocol::{ClientMessage, Orientation, PanePosition, ServerMessage, SessionStatus};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn test_settings() -> HubSettings {
    HubSettings {
        spawn_timeout: Duration::from_millis(200),
        resize: ResizeSettings {
            debounce: Duration::from_millis(20),
            reconnect_debounce: Duration::from_millis(100),
            clear_threshold_cols: 5,
            trick_settle: Duration::from_millis(1),
        },
        ..HubSettings::default()
    }
}

fn test_hub() -> Arc<SessionHub<MemoryMultiplexer>> {
    SessionHub::new(Arc::new(MemoryMultiplexer::new("panehub-")), test_settings())
}

fn reattach(target: &str) -> ReattachRequest {
    ReattachRequest {
        target: target.to_string(),
        cols: None,
        rows: None,
    }
}

/// Collects output bytes for `session_id` until `expected` bytes arrived.
async fn collect_output(
    rx: &mut UnboundedReceiver<ServerMessage>,
    session_id: &str,
    expected: usize,
) -> Vec<u8> {
    let mut data = Vec::new();
    while data.len() < expected {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("connection queue closed");
        if let ServerMessage::Output(output) = message {
            if output.id == session_id {
                data.extend_from_slice(&output.data);
            }
        }
    }
    data
}

// =============================================================================
// Hub flows
// =============================================================================

#[tokio::test]
async fn test_two_windows_share_output_in_order() {
    let hub = test_hub();
    let (first, mut first_rx) = hub.connect(Some("window-a".into()));
    let (second, mut second_rx) = hub.connect(Some("window-a".into()));

    let mut request = SpawnRequest::named("shared");
    request.cols = Some(80);
    request.rows = Some(24);
    let view = hub.spawn(&first.connection_id, request).await.unwrap();
    assert_eq!((view.cols, view.rows), (80, 24));

    let joined = hub
        .reattach(&second.connection_id, reattach(&view.id))
        .await
        .unwrap();
    assert_eq!(joined.sessions[0].id, view.id);
    assert_eq!(joined.sessions[0].owners, 2);

    for chunk in [&b"ls\n"[..], b"pwd\n", b"exit 0\n"] {
        hub.input(&first.connection_id, &view.id, chunk).await.unwrap();
    }
    let expected = b"ls\npwd\nexit 0\n".to_vec();

    let seen_first = collect_output(&mut first_rx, &view.id, expected.len()).await;
    let seen_second = collect_output(&mut second_rx, &view.id, expected.len()).await;
    assert_eq!(seen_first, expected);
    assert_eq!(seen_second, expected);
}

#[tokio::test]
async fn test_other_window_never_sees_output() {
    let hub = test_hub();
    let (owner, mut owner_rx) = hub.connect(Some("window-a".into()));
    let (stranger, mut stranger_rx) = hub.connect(Some("window-b".into()));

    let view = hub
        .spawn(&owner.connection_id, SpawnRequest::named("private"))
        .await
        .unwrap();
    assert!(hub
        .input(&stranger.connection_id, &view.id, b"whoami\n")
        .await
        .is_err());

    hub.input(&owner.connection_id, &view.id, b"id\n").await.unwrap();
    assert_eq!(collect_output(&mut owner_rx, &view.id, 3).await, b"id\n");

    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(message) = stranger_rx.try_recv() {
        assert!(!matches!(message, ServerMessage::Output(_)));
    }
}

#[tokio::test]
async fn test_reload_keeps_session_identity() {
    let hub = test_hub();
    let (tab, _rx) = hub.connect(Some("window-a".into()));
    let view = hub
        .spawn(&tab.connection_id, SpawnRequest::named("build"))
        .await
        .unwrap();

    // Page reload: the old connection disappears without a detach.
    hub.disconnect(&tab.connection_id).await;
    let stored = hub.store().get(&view.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Detached);
    assert!(hub.mux().contains(&view.mux_name));

    let (reloaded, mut rx) = hub.connect(Some("window-a".into()));
    let resumed = hub
        .reattach(&reloaded.connection_id, reattach(&view.id))
        .await
        .unwrap();
    assert_eq!(resumed.sessions[0].id, view.id);
    assert_eq!(resumed.sessions[0].mux_name, view.mux_name);
    assert_eq!(resumed.sessions[0].status, SessionStatus::Running);

    hub.input(&reloaded.connection_id, &view.id, b"make\n")
        .await
        .unwrap();
    assert_eq!(collect_output(&mut rx, &view.id, 5).await, b"make\n");
}

#[tokio::test]
async fn test_detached_group_comes_back_whole() {
    let hub = test_hub();
    let (tab, _rx) = hub.connect(Some("window-a".into()));
    let left = hub
        .spawn(&tab.connection_id, SpawnRequest::named("left"))
        .await
        .unwrap();

    let group = hub
        .split(
            &tab.connection_id,
            SplitRequest {
                pane_id: left.id.clone(),
                spawn: SpawnRequest::named("right"),
                orientation: Orientation::Vertical,
                position: PanePosition::After,
            },
        )
        .await
        .unwrap();
    assert_eq!(group.panes.len(), 2);

    let detached = hub.detach_group(&tab.connection_id, &group.id).await.unwrap();
    assert!(detached.detached);
    assert_eq!(hub.status().await.detached, 2);

    // Reattaching any member restores the whole group.
    let restored = hub
        .reattach(&tab.connection_id, reattach(&left.id))
        .await
        .unwrap();
    let restored_group = restored.group.expect("group restored");
    assert_eq!(restored_group.id, group.id);
    assert!(!restored_group.detached);
    assert_eq!(restored.sessions.len(), 2);
    assert!(restored
        .sessions
        .iter()
        .all(|s| s.status == SessionStatus::Running));
}

#[tokio::test]
async fn test_close_kills_process_and_notifies_owners() {
    let hub = test_hub();
    let (first, _first_rx) = hub.connect(Some("window-a".into()));
    let (second, mut second_rx) = hub.connect(Some("window-a".into()));
    let view = hub
        .spawn(&first.connection_id, SpawnRequest::named("doomed"))
        .await
        .unwrap();
    hub.reattach(&second.connection_id, reattach(&view.id))
        .await
        .unwrap();

    hub.close(&first.connection_id, &view.id).await.unwrap();
    assert!(!hub.mux().contains(&view.mux_name));
    assert!(!hub.store().contains(&view.id));

    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match second_rx.recv().await {
                Some(ServerMessage::Closed(session)) => return session.id,
                Some(_) => continue,
                None => panic!("queue closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(closed, view.id);
}

// =============================================================================
// WebSocket transport
// =============================================================================

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_daemon() -> (Daemon, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().to_path_buf();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.multiplexer.backend = BackendKind::Memory;
    config.resize.debounce_ms = 20;
    config.resize.reconnect_debounce_ms = 100;
    config.resize.trick_settle_ms = 1;

    let mut daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    assert_eq!(daemon.state().await, DaemonState::Running);
    (daemon, temp_dir)
}

async fn open(daemon: &Daemon, window: &str) -> WsClient {
    let addr = daemon.local_addr().unwrap();
    let url = format!("ws://{}/?window={}", addr, window);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    match next_message(&mut ws).await {
        ServerMessage::Hello(hello) => assert_eq!(hello.window_id, window),
        other => panic!("expected hello, got {:?}", other),
    }
    ws
}

async fn send(ws: &mut WsClient, message: ClientMessage) {
    ws.send(WsMessage::Text(message.to_json().unwrap()))
        .await
        .unwrap();
}

async fn next_message(ws: &mut WsClient) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return ServerMessage::from_json(&text).unwrap();
        }
    }
}

/// Skips notifications until `pick` accepts a message.
async fn wait_for<T>(ws: &mut WsClient, mut pick: impl FnMut(ServerMessage) -> Option<T>) -> T {
    loop {
        if let Some(found) = pick(next_message(ws).await) {
            return found;
        }
    }
}

async fn ws_output(ws: &mut WsClient, session_id: &str, expected: usize) -> Vec<u8> {
    let mut data = Vec::new();
    while data.len() < expected {
        let chunk = wait_for(ws, |m| match m {
            ServerMessage::Output(o) if o.id == session_id => Some(o.data),
            _ => None,
        })
        .await;
        data.extend_from_slice(&chunk);
    }
    data
}

#[tokio::test]
async fn test_websocket_two_clients_and_reattach() {
    let (mut daemon, _temp_dir) = start_daemon().await;

    let mut first = open(&daemon, "tab-1").await;
    let mut request = SpawnRequest::named("ws");
    request.cols = Some(80);
    request.rows = Some(24);
    send(&mut first, ClientMessage::Spawn(request)).await;
    let view = wait_for(&mut first, |m| match m {
        ServerMessage::SpawnResult(view) => Some(view),
        _ => None,
    })
    .await;
    assert_eq!((view.cols, view.rows), (80, 24));

    let mut second = open(&daemon, "tab-1").await;
    send(&mut second, ClientMessage::Reattach(reattach(&view.id))).await;
    let joined = wait_for(&mut second, |m| match m {
        ServerMessage::Reattached(r) => Some(r),
        _ => None,
    })
    .await;
    assert_eq!(joined.sessions[0].id, view.id);

    send(
        &mut first,
        ClientMessage::Input(SessionInput {
            id: view.id.clone(),
            data: b"echo hi\n".to_vec(),
        }),
    )
    .await;
    assert_eq!(ws_output(&mut first, &view.id, 8).await, b"echo hi\n");
    assert_eq!(ws_output(&mut second, &view.id, 8).await, b"echo hi\n");

    // Both clients leave; the shell keeps running.
    send(&mut first, ClientMessage::Detach(SessionRef { id: view.id.clone() })).await;
    wait_for(&mut first, |m| match m {
        ServerMessage::SessionState(state) => Some(state),
        _ => None,
    })
    .await;
    second.close(None).await.unwrap();
    drop(second);

    let hub = Arc::clone(daemon.hub());
    let detached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(record) = hub.store().get(&view.id).await {
                if record.status == SessionStatus::Detached {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(detached.mux_name, view.mux_name);

    let mut third = open(&daemon, "tab-1").await;
    send(&mut third, ClientMessage::Reattach(reattach(&view.id))).await;
    let resumed = wait_for(&mut third, |m| match m {
        ServerMessage::Reattached(r) => Some(r),
        _ => None,
    })
    .await;
    assert_eq!(resumed.sessions[0].id, view.id);
    assert_eq!(resumed.sessions[0].status, SessionStatus::Running);

    daemon.stop().await.unwrap();
    assert_eq!(daemon.state().await, DaemonState::Stopped);
}

#[tokio::test]
async fn test_websocket_rejects_malformed_frames() {
    let (mut daemon, _temp_dir) = start_daemon().await;
    let mut client = open(&daemon, "tab-1").await;

    client
        .send(WsMessage::Text("{\"type\":\"launch\"}".to_string()))
        .await
        .unwrap();
    let error = wait_for(&mut client, |m| match m {
        ServerMessage::Error(e) => Some(e),
        _ => None,
    })
    .await;
    assert_eq!(error.code, protocol::ErrorCode::InvalidRequest);

    send(&mut client, ClientMessage::Close(SessionRef { id: "missing".into() })).await;
    let error = wait_for(&mut client, |m| match m {
        ServerMessage::Error(e) => Some(e),
        _ => None,
    })
    .await;
    assert_eq!(error.code, protocol::ErrorCode::NotFound);

    daemon.stop().await.unwrap();
}
