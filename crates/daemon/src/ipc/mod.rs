//! Unix Domain Socket IPC for CLI-daemon communication.
//!
//! The control plane uses a JSON newline-delimited protocol: each message is
//! a single JSON object followed by a newline. The socket and PID file live
//! under the daemon's data directory (see [`Config::socket_path`]).
//!
//! [`Config::socket_path`]: crate::config::Config::socket_path
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::config::Config;
//! use daemon::ipc::IpcClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default()?;
//!     let mut client = IpcClient::connect(&config.socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use pidfile::{daemon_pid, remove_pid_file, write_pid_file};
pub use server::{IpcConnection, IpcError, IpcHandler, IpcServer};
