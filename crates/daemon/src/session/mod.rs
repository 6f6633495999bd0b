//! Session records and the store that owns them.
//!
//! Records are pure data; the processes behind them belong to the
//! multiplexer adapter in [`crate::mux`].

pub mod record;
pub mod store;

pub use record::{ConnectionId, SessionId, SessionRecord, SpawnParams, WindowId};
pub use store::{SessionStore, StoreError};
