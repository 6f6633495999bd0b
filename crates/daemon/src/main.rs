//! panehub daemon
//!
//! Hosts multiplexer-backed terminal sessions for browser clients.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{daemon_pid, remove_pid_file, IpcClient, IpcResponse, IpcSessionInfo};
use daemon::orchestrator::{Daemon, DaemonEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// panehub - terminal sessions that survive browser reloads.
#[derive(Parser, Debug)]
#[command(name = "panehub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Send SIGKILL instead of asking the daemon to exit
        #[arg(long, short)]
        force: bool,

        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage hosted sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List hosted sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Close a session and kill its shell
    Close {
        /// Session id or multiplexer session name
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let file_logging = matches!(cli.command, Commands::Start);
    let _guard = init_tracing(&config, cli.verbose, file_logging);

    match cli.command {
        Commands::Start => {
            if let Some(pid) = daemon_pid(&config.pid_path()) {
                eprintln!("Error: daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop it, run:");
                eprintln!("  panehub stop");
                std::process::exit(1);
            }
            run_daemon(config).await?;
        }
        Commands::Stop { force, timeout } => {
            let result = if force {
                force_stop_daemon(&config)
            } else {
                graceful_stop_daemon(&config, timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: panehub stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query_status(&config).await {
            Ok(status) => print!("{}", status),
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(SessionsCommands::List { json }) => {
            match query_sessions(&config).await {
                Ok(sessions) if json => println!("{}", serde_json::to_string_pretty(&sessions)?),
                Ok(sessions) => print_sessions_table(&sessions),
                Err(e) => {
                    eprintln!("Failed to list sessions: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(SessionsCommands::Close { session_id }) => {
            match close_session(&config, &session_id).await {
                Ok(closed) => println!("Session {} closed", closed),
                Err(e) => {
                    eprintln!("Failed to close session {}: {}", session_id, e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Installs the global subscriber. The returned guard flushes the log file
/// on drop and must live as long as the process.
fn init_tracing(config: &Config, verbose: bool, file_logging: bool) -> Option<WorkerGuard> {
    let default_level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = config
        .daemon
        .log_dir
        .as_deref()
        .filter(|_| file_logging)
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "panehub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let mut daemon = Daemon::new(config)?;
    let mut events = daemon.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DaemonEvent::StateChanged(state) => tracing::info!("Daemon state: {:?}", state),
                DaemonEvent::SessionsAdopted { count } => {
                    tracing::debug!(count, "Reconciled multiplexer sessions")
                }
                DaemonEvent::MultiplexerUnavailable => {
                    tracing::warn!("Multiplexer unavailable at startup")
                }
                DaemonEvent::Error { message } => tracing::error!("Daemon error: {}", message),
            }
        }
    });

    daemon.start().await?;
    if let Some(addr) = daemon.local_addr() {
        tracing::info!("Listening on ws://{}", addr);
    }

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = daemon.wait_for_shutdown() => {
            tracing::info!("Shutdown requested");
        }
    }

    daemon.stop().await
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&config.socket_path(), Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("cannot connect to {}", config.socket_path().display()))
}

async fn query_status(config: &Config) -> anyhow::Result<String> {
    let mut client = connect(config).await?;
    match client.status().await? {
        IpcResponse::Status {
            running,
            uptime_secs,
            backend,
            listen_addr,
            session_count,
            detached_count,
            connection_count,
        } => Ok(format!(
            "Daemon Status: {}\n  Uptime:      {}\n  Backend:     {}\n  Listening:   {}\n  Sessions:    {} ({} detached)\n  Connections: {}\n",
            if running { "running" } else { "stopped" },
            format_duration(uptime_secs),
            backend,
            listen_addr,
            session_count,
            detached_count,
            connection_count,
        )),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

async fn query_sessions(config: &Config) -> anyhow::Result<Vec<IpcSessionInfo>> {
    let mut client = connect(config).await?;
    match client.list_sessions().await? {
        IpcResponse::Sessions { sessions } => Ok(sessions),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

async fn close_session(config: &Config, session_id: &str) -> anyhow::Result<String> {
    let mut client = connect(config).await?;
    match client.close_session(session_id.to_string()).await? {
        IpcResponse::SessionClosed { session_id } => Ok(session_id),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Asks the daemon to exit, then polls until its socket goes away.
async fn graceful_stop_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = config.socket_path();
    let mut client = connect(config).await?;

    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while tokio::time::Instant::now() < deadline {
        if !socket_path.exists()
            || IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
                .await
                .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Sends SIGKILL to the daemon named in the PID file and removes its files.
fn force_stop_daemon(config: &Config) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = config.pid_path();
    let pid = daemon_pid(&pid_path)
        .ok_or_else(|| anyhow::anyhow!("no running daemon found in {}", pid_path.display()))?;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    remove_pid_file(&pid_path);
    remove_stale_socket(&config.socket_path());
    Ok(())
}

fn remove_stale_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket");
        }
    }
}

fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(2).max(2);
    let name_width = sessions
        .iter()
        .map(|s| s.display_name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<id_width$}  {:<name_width$}  {:<8}  {:>7}  {:>6}  {:>8}",
        "ID", "NAME", "STATUS", "SIZE", "OWNERS", "CREATED",
    );
    println!("{}", "-".repeat(id_width + name_width + 43));

    for session in sessions {
        println!(
            "{:<id_width$}  {:<name_width$}  {:<8}  {:>7}  {:>6}  {:>8}",
            session.id,
            session.display_name,
            session.status,
            format!("{}x{}", session.cols, session.rows),
            session.owners,
            format_relative_time(session.created_at / 1000),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Formats a Unix timestamp in seconds as "5m ago".
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(timestamp);
    let elapsed = now.saturating_sub(timestamp);

    match elapsed {
        0..=59 => format!("{}s ago", elapsed),
        60..=3599 => format!("{}m ago", elapsed / 60),
        3600..=86399 => format!("{}h ago", elapsed / 3600),
        _ => format!("{}d ago", elapsed / 86400),
    }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
