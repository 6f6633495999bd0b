//! Configuration management for the panehub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/panehub/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Dimensions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::HubSettings;
use crate::resize::ResizeSettings;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("listen_addr must be a socket address like 127.0.0.1:7681, got {0}")]
    InvalidListenAddr(String),

    #[error("default dimensions must be non-zero, got {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },

    #[error("session_prefix must be non-empty and contain only [A-Za-z0-9_-], got {0:?}")]
    InvalidPrefix(String),

    #[error("spawn_timeout_ms must be between 100 and 60000, got {0}")]
    InvalidSpawnTimeout(u64),

    #[error("debounce_ms must be at most 5000, got {0}")]
    InvalidDebounce(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the panehub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub server: ServerConfig,
    pub multiplexer: MultiplexerConfig,
    pub resize: ResizeConfig,
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for runtime files (IPC socket, PID file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,

    /// Keep sessions bound to the window that first owned them.
    pub isolate_windows: bool,
}

/// Which multiplexer backend hosts sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Tmux,
    /// In-process backend without real processes, for development.
    Memory,
}

/// Multiplexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub backend: BackendKind,

    /// tmux executable, looked up in `PATH` when not absolute.
    pub tmux_command: String,

    /// Namespace prefix for every multiplexer session name.
    pub session_prefix: String,

    /// Shell for sessions spawned without a command.
    pub default_shell: String,

    /// How long a spawn or attach may take to be confirmed.
    pub spawn_timeout_ms: u64,
}

/// Resize coordination timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResizeConfig {
    pub debounce_ms: u64,
    pub reconnect_debounce_ms: u64,
    pub clear_threshold_cols: u16,
    pub trick_settle_ms: u64,
}

/// Session limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of sessions, attached or not.
    pub max_sessions: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7681".to_string(),
            isolate_windows: true,
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Tmux,
            tmux_command: "tmux".to_string(),
            session_prefix: "panehub-".to_string(),
            default_shell: default_shell(),
            spawn_timeout_ms: 5000,
        }
    }
}

impl Default for ResizeConfig {
    fn default() -> Self {
        let defaults = ResizeSettings::default();
        Self {
            debounce_ms: defaults.debounce.as_millis() as u64,
            reconnect_debounce_ms: defaults.reconnect_debounce.as_millis() as u64,
            clear_threshold_cols: defaults.clear_threshold_cols,
            trick_settle_ms: defaults.trick_settle.as_millis() as u64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("panehub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("panehub")
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl ResizeConfig {
    pub fn to_settings(&self) -> ResizeSettings {
        ResizeSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            reconnect_debounce: Duration::from_millis(self.reconnect_debounce_ms),
            clear_threshold_cols: self.clear_threshold_cols,
            trick_settle: Duration::from_millis(self.trick_settle_ms),
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PANEHUB_LISTEN_ADDR: Override the WebSocket listen address
    /// - PANEHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PANEHUB_TMUX_COMMAND: Override the tmux executable
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_override("PANEHUB_LISTEN_ADDR") {
            tracing::info!(listen_addr = %addr, "Overriding listen_addr from environment");
            self.server.listen_addr = addr;
        }

        if let Some(level) = env_override("PANEHUB_LOG_LEVEL") {
            tracing::info!(log_level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }

        if let Some(command) = env_override("PANEHUB_TMUX_COMMAND") {
            tracing::info!(tmux_command = %command, "Overriding tmux_command from environment");
            self.multiplexer.tmux_command = command;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.server.listen_addr.clone()));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidDimensions {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        let prefix = &self.multiplexer.session_prefix;
        let prefix_ok = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !prefix_ok {
            return Err(ConfigError::InvalidPrefix(prefix.clone()));
        }

        let timeout = self.multiplexer.spawn_timeout_ms;
        if !(100..=60_000).contains(&timeout) {
            return Err(ConfigError::InvalidSpawnTimeout(timeout));
        }

        if self.resize.debounce_ms > 5000 {
            return Err(ConfigError::InvalidDebounce(self.resize.debounce_ms));
        }

        let shell = &self.multiplexer.default_shell;
        let shell_path = Path::new(shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Engine settings derived from this configuration.
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            session_prefix: self.multiplexer.session_prefix.clone(),
            max_sessions: self.session.max_sessions,
            default_dimensions: Dimensions::new(
                self.session.default_cols,
                self.session.default_rows,
            ),
            spawn_timeout: Duration::from_millis(self.multiplexer.spawn_timeout_ms),
            isolate_windows: self.server.isolate_windows,
            resize: self.resize.to_settings(),
        }
    }

    /// Path of the control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon.data_dir.join("panehub.sock")
    }

    /// Path of the PID file.
    pub fn pid_path(&self) -> PathBuf {
        self.daemon.data_dir.join("panehub.pid")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();
    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }
    msg
}
