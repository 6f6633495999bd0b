//! Engine error taxonomy.

use std::time::Duration;

use protocol::ErrorCode;
use thiserror::Error;

use crate::layout::LayoutError;
use crate::mux::MuxError;
use crate::session::StoreError;

/// Errors surfaced by the session engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The session id or name is unknown, or its process is gone.
    #[error("session no longer exists: {0}")]
    SessionNotFound(String),

    #[error("split group not found: {0}")]
    GroupNotFound(String),

    /// The multiplexer service cannot be reached.
    #[error("multiplexer unavailable: {0}")]
    MultiplexerUnavailable(String),

    /// The multiplexer ignored a resize. Handled internally by the redraw
    /// fallback and never sent to clients.
    #[error("multiplexer ignored resize for session {0}")]
    ResizeIgnored(String),

    /// A connection touched a session outside its ownership or window scope.
    #[error("ownership violation: {0}")]
    OwnershipViolation(String),

    /// The multiplexer did not confirm a spawn or attach in time.
    #[error("multiplexer did not confirm {name} within {timeout:?}")]
    SpawnTimeout { name: String, timeout: Duration },

    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl EngineError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::SessionNotFound(_) | EngineError::GroupNotFound(_) => ErrorCode::NotFound,
            EngineError::MultiplexerUnavailable(_) => ErrorCode::Unavailable,
            EngineError::ResizeIgnored(_) => ErrorCode::Internal,
            EngineError::OwnershipViolation(_) => ErrorCode::Forbidden,
            EngineError::SpawnTimeout { .. } => ErrorCode::Timeout,
            EngineError::SessionLimit(_) | EngineError::InvalidRequest(_) => {
                ErrorCode::InvalidRequest
            }
            EngineError::Store(e) => match e {
                StoreError::NotFound(_) => ErrorCode::NotFound,
                StoreError::HasOwners { .. } => ErrorCode::Forbidden,
                StoreError::DuplicateName(_) => ErrorCode::InvalidRequest,
                StoreError::LimitReached(_) => ErrorCode::InvalidRequest,
            },
            EngineError::Mux(e) => match e {
                MuxError::NotFound(_) => ErrorCode::NotFound,
                MuxError::Unavailable(_) => ErrorCode::Unavailable,
                MuxError::AlreadyExists(_) => ErrorCode::InvalidRequest,
                _ => ErrorCode::Internal,
            },
            EngineError::Layout(e) => match e {
                LayoutError::GroupNotFound(_) => ErrorCode::NotFound,
                _ => ErrorCode::InvalidRequest,
            },
        }
    }

    /// Session or group id the error is about, when there is one.
    pub fn context(&self) -> Option<String> {
        match self {
            EngineError::SessionNotFound(id)
            | EngineError::GroupNotFound(id)
            | EngineError::ResizeIgnored(id) => Some(id.clone()),
            EngineError::SpawnTimeout { name, .. } => Some(name.clone()),
            EngineError::Store(StoreError::NotFound(id)) => Some(id.clone()),
            EngineError::Store(StoreError::HasOwners { id, .. }) => Some(id.clone()),
            EngineError::Layout(LayoutError::GroupNotFound(id)) => Some(id.clone()),
            _ => None,
        }
    }

    /// Converts a store lookup failure into the user-facing "no longer exists".
    pub(crate) fn from_lookup(target: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => EngineError::SessionNotFound(target.to_string()),
            other => EngineError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            EngineError::SessionNotFound("a".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            EngineError::Mux(MuxError::Unavailable("x".into())).code(),
            ErrorCode::Unavailable
        );
        assert_eq!(
            EngineError::OwnershipViolation("x".into()).code(),
            ErrorCode::Forbidden
        );
        assert_eq!(
            EngineError::SpawnTimeout {
                name: "a".into(),
                timeout: Duration::from_secs(5)
            }
            .code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            EngineError::Store(StoreError::HasOwners {
                id: "a".into(),
                owners: 2
            })
            .code(),
            ErrorCode::Forbidden
        );
        assert_eq!(
            EngineError::Layout(LayoutError::PaneNotInGroup {
                group: "g".into(),
                pane: "p".into()
            })
            .code(),
            ErrorCode::InvalidRequest
        );
    }

    #[test]
    fn test_lookup_maps_to_session_not_found() {
        let err = EngineError::from_lookup("abc", StoreError::NotFound("abc".into()));
        assert!(matches!(err, EngineError::SessionNotFound(ref id) if id == "abc"));
        assert_eq!(err.context().as_deref(), Some("abc"));
        assert_eq!(err.to_string(), "session no longer exists: abc");
    }
}
