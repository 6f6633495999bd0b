//! # panehub Protocol Library
//!
//! Message schema shared by the panehub daemon and its browser clients.
//!
//! ## Overview
//!
//! Clients attach to long-lived, multiplexer-hosted shell sessions over a
//! WebSocket. Each text frame carries one JSON message:
//!
//! - [`ClientMessage`]: spawn, reattach, input, resize, detach, close, and the
//!   split-layout operations
//! - [`ServerMessage`]: output, session state, replies, and errors
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerMessage};
//! use protocol::messages::{Pong, SpawnRequest};
//!
//! let request = ClientMessage::Spawn(SpawnRequest::named("build"));
//! let frame = request.to_json().unwrap();
//! assert_eq!(ClientMessage::from_json(&frame).unwrap(), request);
//!
//! let reply = ServerMessage::Pong(Pong { timestamp: 7 });
//! assert!(reply.to_json().unwrap().contains("pong"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, Dimensions, ErrorCode, Layout, Orientation, PanePosition, ResizeKind,
    ServerMessage, SessionStatus, PROTOCOL_VERSION,
};
