//! Wire message definitions for panehub.
//!
//! Browser clients speak JSON over WebSocket text frames. Every message is an
//! adjacently tagged object: `{"type": "spawn", "data": {...}}`. Raw terminal
//! bytes travel base64-encoded in the `data` field of `input`/`output`.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current protocol version, announced in [`ServerMessage::Hello`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Messages sent from a client connection to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a new multiplexer-hosted session.
    Spawn(SpawnRequest),
    /// Resume a session or split group by id or multiplexer name.
    Reattach(ReattachRequest),
    /// Keyboard input for a session.
    Input(SessionInput),
    /// Viewport change for a session.
    Resize(ResizeRequest),
    /// Stop displaying a session without killing it.
    Detach(SessionRef),
    /// Kill a session and forget it.
    Close(SessionRef),
    /// Split an existing pane, spawning a new session beside it.
    Split(SplitRequest),
    /// Close one pane of a split group.
    ClosePane(PaneRequest),
    /// Detach one pane out of a split group.
    DetachPane(PaneRequest),
    /// Detach every pane of a split group, keeping its arrangement.
    DetachGroup(GroupRef),
    /// Change a session's display name.
    Rename(RenameRequest),
    /// List known sessions and split groups.
    List,
    /// Application-level keepalive.
    Ping(Ping),
}

/// Messages sent from the daemon to a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    Hello(Hello),
    /// Terminal output for a session.
    Output(SessionOutput),
    /// Lifecycle status change for a session.
    SessionState(SessionState),
    /// The session was killed and forgotten.
    Closed(SessionRef),
    /// Reply to a successful spawn.
    SpawnResult(SessionView),
    /// Reply to a successful reattach.
    Reattached(Reattached),
    /// Reply to a successful split.
    SplitResult(GroupView),
    /// A split group changed shape.
    GroupState(GroupView),
    /// The client should blank its rendered buffer before the next redraw.
    ClearBuffer(SessionRef),
    /// Reply to [`ClientMessage::List`].
    SessionList(SessionList),
    /// Reply to [`ClientMessage::Ping`].
    Pong(Pong),
    /// A request failed.
    Error(ErrorMessage),
}

// ============================================================================
// Shared value types
// ============================================================================

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl Dimensions {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Absolute column difference to `other`.
    pub fn col_delta(&self, other: &Dimensions) -> u16 {
        self.cols.abs_diff(other.cols)
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The multiplexer has not confirmed the session yet.
    Spawning,
    /// At least one connection is displaying the session.
    Running,
    /// Nobody is displaying the session; the shell keeps running.
    Detached,
    /// The multiplexer reported a failure for this session.
    Error,
}

/// Arrangement of a split group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Single,
    Horizontal,
    Vertical,
}

/// Direction of a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Panes side by side.
    Horizontal,
    /// Panes stacked top to bottom.
    Vertical,
}

impl From<Orientation> for Layout {
    fn from(orientation: Orientation) -> Self {
        match orientation {
            Orientation::Horizontal => Layout::Horizontal,
            Orientation::Vertical => Layout::Vertical,
        }
    }
}

/// Where the new pane lands relative to the pane being split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanePosition {
    Before,
    #[default]
    After,
}

/// How a resize was caused on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeKind {
    /// The browser window itself was resized.
    #[default]
    Window,
    /// Tab switch, sidebar drag, divider drag and similar layout jiggles.
    Layout,
}

// ============================================================================
// Client requests
// ============================================================================

/// Request to spawn a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Human-readable name; also the slug of the multiplexer name.
    pub name: String,
    /// Command to run instead of the default shell.
    #[serde(default)]
    pub command: Option<String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Initial columns (daemon default when absent).
    #[serde(default)]
    pub cols: Option<u16>,
    /// Initial rows (daemon default when absent).
    #[serde(default)]
    pub rows: Option<u16>,
}

impl SpawnRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            cwd: None,
            cols: None,
            rows: None,
        }
    }
}

/// Request to resume a session or a split group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachRequest {
    /// Session id, multiplexer session name, or split group id.
    pub target: String,
    /// The client's current fit, if it already knows it.
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

/// Keyboard input for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Viewport change for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub kind: ResizeKind,
}

/// Reference to a single session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: String,
}

/// Reference to a split group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub group_id: String,
}

/// A pane within a split group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneRequest {
    pub group_id: String,
    /// Session id or nested group id.
    pub pane_id: String,
}

/// Request to split a pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    /// Session id or group id of the pane being split.
    pub pane_id: String,
    /// Parameters for the session spawned into the new pane.
    pub spawn: SpawnRequest,
    pub orientation: Orientation,
    #[serde(default)]
    pub position: PanePosition,
}

/// Request to change a session's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRequest {
    pub id: String,
    pub name: String,
}

/// Keepalive ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: u64,
}

// ============================================================================
// Server replies and notifications
// ============================================================================

/// Greeting sent when a connection is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub connection_id: String,
    pub window_id: String,
    pub protocol_version: u8,
}

/// Terminal output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Session status notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub status: SessionStatus,
}

/// Snapshot of a session for clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub mux_name: String,
    pub display_name: String,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    /// Number of connections currently displaying the session.
    pub owners: usize,
    pub created_at: u64,
    pub last_activity_at: u64,
}

/// One pane of a split group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaneView {
    Session(String),
    Group(String),
}

/// Snapshot of a split group for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupView {
    pub id: String,
    pub layout: Layout,
    pub panes: Vec<PaneView>,
    pub split_ratio: f32,
    pub detached: bool,
}

/// Reply to a reattach: every session that was restored, and the group they
/// belong to when a whole group was restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reattached {
    pub sessions: Vec<SessionView>,
    pub group: Option<GroupView>,
}

/// Reply to a list request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionView>,
    pub groups: Vec<GroupView>,
}

/// Keepalive reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: u64,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
    /// Session or group id the error relates to, if any.
    pub context: Option<String>,
    /// Whether retrying the same request may succeed.
    pub recoverable: bool,
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The session or group no longer exists.
    NotFound,
    /// The multiplexer service cannot be reached.
    Unavailable,
    /// The connection is not allowed to touch that session.
    Forbidden,
    /// The multiplexer did not confirm in time.
    Timeout,
    /// Malformed or contradictory request.
    InvalidRequest,
    /// Anything else.
    Internal,
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl ClientMessage {
    /// Parse a message from a WebSocket text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a message into a WebSocket text frame payload.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Convenience constructor for an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>, context: Option<String>) -> Self {
        let recoverable = matches!(code, ErrorCode::Unavailable | ErrorCode::Timeout);
        ServerMessage::Error(ErrorMessage {
            code,
            message: message.into(),
            context,
            recoverable,
        })
    }
}

/// Base64 (standard alphabet) encoding for raw terminal bytes.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
