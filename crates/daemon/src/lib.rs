//! # panehub daemon library
//!
//! Session multiplexing and resize coordination for browser terminals.
//!
//! ## Overview
//!
//! Shells live inside a terminal multiplexer (tmux in production), so they
//! survive browser reloads, network drops and daemon restarts. The daemon
//! provides:
//!
//! - **Session registry**: stable session ids mapped to multiplexer names
//! - **Ownership routing**: output reaches only the connections that own a session
//! - **Reattachment**: a reloaded window resumes its sessions under the same ids
//! - **Resize coordination**: debounced resizes plus the redraw trick on reconnect
//! - **Split layouts**: pane groups that can be closed, detached and restored
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Daemon                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌───────────────┐   ┌──────────────────┐   │
//! │  │  WsServer  │──▶│ MessageRouter │──▶│    SessionHub    │   │
//! │  └────────────┘   └───────────────┘   └──────────────────┘   │
//! │                                         │    │    │    │     │
//! │     SessionStore ◀──────────────────────┘    │    │    │     │
//! │     OwnershipRouter ◀────────────────────────┘    │    │     │
//! │     ResizeCoordinator ◀───────────────────────────┘    │     │
//! │     LayoutManager ◀────────────────────────────────────┘     │
//! │                                                              │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │     Multiplexer (tmux CLI + PTY attach, or memory)    │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut daemon = Daemon::new(config)?;
//!     daemon.start().await?;
//!     daemon.wait_for_shutdown().await;
//!
//!     // Hosted shells keep running after stop.
//!     daemon.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session records and the registry
//! - [`mux`]: Multiplexer adapter and backends
//! - [`ownership`]: Connection registry and output routing
//! - [`resize`]: Resize coordination
//! - [`layout`]: Split pane groups
//! - [`hub`]: The engine tying the above together
//! - [`router`]: Client message dispatch
//! - [`server`]: WebSocket transport
//! - [`ipc`]: Control socket for the CLI
//! - [`orchestrator`]: Daemon lifecycle

pub mod config;
pub mod error;
pub mod hub;
pub mod ipc;
pub mod layout;
pub mod mux;
pub mod orchestrator;
pub mod ownership;
pub mod resize;
pub mod router;
pub mod server;
pub mod session;

pub use protocol;

pub use config::{Config, ConfigError};
pub use error::EngineError;
pub use hub::{ConnectionInfo, HubSettings, HubStatus, SessionHub};
pub use layout::{LayoutError, LayoutManager, SplitGroup};
pub use mux::{Backend, MemoryMultiplexer, MuxError, Multiplexer, TmuxMultiplexer};
pub use orchestrator::{Daemon, DaemonEvent, DaemonState};
pub use ownership::OwnershipRouter;
pub use resize::{ResizeCoordinator, ResizeOutcome, ResizeSettings};
pub use router::{MessageRouter, RouterError, RouterResult};
pub use server::{ServerError, WsServer};
pub use session::{SessionId, SessionRecord, SessionStore, StoreError};
