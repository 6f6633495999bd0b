//! Session records.
//!
//! A [`SessionRecord`] is the in-memory description of one multiplexer-hosted
//! shell. It carries no I/O of its own; the store serializes every mutation.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::messages::SessionView;
use protocol::{Dimensions, SessionStatus};

/// Unique identifier for a session.
pub type SessionId = String;

/// Unique identifier for a client connection.
pub type ConnectionId = String;

/// Logical browser window a connection belongs to.
pub type WindowId = String;

/// Parameters for creating a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnParams {
    /// Human-readable name, also used to derive the multiplexer name.
    pub name: String,
    /// Command to run instead of the default shell.
    pub command: Option<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Initial terminal size.
    pub dimensions: Dimensions,
}

impl SpawnParams {
    pub fn new(name: impl Into<String>, dimensions: Dimensions) -> Self {
        Self {
            name: name.into(),
            command: None,
            cwd: None,
            dimensions,
        }
    }
}

/// One multiplexer-hosted shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Stable id, survives detach/reattach and display renames.
    pub id: SessionId,
    /// Name the multiplexer knows the session by.
    pub mux_name: String,
    /// Label shown to users.
    pub display_name: String,
    pub status: SessionStatus,
    /// Last dimensions the multiplexer was told about.
    pub dimensions: Dimensions,
    /// Connections currently displaying this session.
    pub owners: HashSet<ConnectionId>,
    /// Window the current owners belong to. `None` while unowned.
    pub window_id: Option<WindowId>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    /// Unix epoch milliseconds.
    pub last_activity_at: u64,
}

impl SessionRecord {
    /// Creates a record in the `Spawning` state with no owners.
    pub fn new(
        id: SessionId,
        mux_name: String,
        display_name: String,
        dimensions: Dimensions,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            mux_name,
            display_name,
            status: SessionStatus::Spawning,
            dimensions,
            owners: HashSet::new(),
            window_id: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Returns whether any connection currently displays the session.
    pub fn is_owned(&self) -> bool {
        !self.owners.is_empty()
    }

    pub fn is_owner(&self, connection_id: &str) -> bool {
        self.owners.contains(connection_id)
    }

    /// Adds an owner and moves the record to `Running`.
    ///
    /// The first owner binds the record to its window. Returns `true` if the
    /// connection was not already an owner.
    pub fn add_owner(&mut self, connection_id: ConnectionId, window_id: &str) -> bool {
        if self.owners.is_empty() {
            self.window_id = Some(window_id.to_string());
        }
        let inserted = self.owners.insert(connection_id);
        self.status = SessionStatus::Running;
        self.touch();
        inserted
    }

    /// Removes an owner.
    ///
    /// When the last owner leaves a running record it becomes `Detached`; the
    /// record itself and its process are left alone. Returns `true` if the
    /// connection was an owner.
    pub fn remove_owner(&mut self, connection_id: &str) -> bool {
        let removed = self.owners.remove(connection_id);
        if self.owners.is_empty() {
            self.window_id = None;
            if self.status == SessionStatus::Running {
                self.status = SessionStatus::Detached;
            }
        }
        removed
    }

    /// Updates the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity_at = now_millis();
    }

    /// Builds the client-facing snapshot.
    pub fn to_view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            mux_name: self.mux_name.clone(),
            display_name: self.display_name.clone(),
            status: self.status,
            cols: self.dimensions.cols,
            rows: self.dimensions.rows,
            owners: self.owners.len(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
