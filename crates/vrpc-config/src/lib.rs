//! Layered configuration shared by the `vrpc` host CLI and the `vrpcd` agent.
//!
//! Values resolve, in increasing precedence, from built-in defaults, a TOML
//! configuration file, `VRPC_*` environment variables, and command-line
//! flags. Loading is delegated to `ortho_config`.

mod defaults;
mod logging;

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_ALLOWED_COMMANDS, DEFAULT_ALLOWED_PATHS, DEFAULT_CHUNK_SIZE,
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DEVICE_PATH, DEFAULT_IDLE_POLL_MS, DEFAULT_LOG_FILTER,
    DEFAULT_READ_TIMEOUT_MS, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF,
    DEFAULT_RETRY_INTERVAL_MS, DEFAULT_WRITE_TIMEOUT_MS, default_allowed_commands,
    default_allowed_paths, default_device_path, default_log_filter, default_log_filter_string,
    default_log_format, default_socket_path,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Resolved configuration for both ends of the channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "VRPC")]
pub struct Config {
    /// Guest-side character device carrying the channel.
    #[ortho_config(default = default_device_path())]
    pub device_path: Utf8PathBuf,
    /// Host-side domain socket connected to the guest's port.
    #[ortho_config(default = default_socket_path())]
    pub socket_path: Utf8PathBuf,
    /// `tracing` filter directive.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Socket connect timeout in milliseconds.
    #[ortho_config(default = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,
    /// Deadline for reading one response, in milliseconds.
    #[ortho_config(default = DEFAULT_READ_TIMEOUT_MS)]
    pub read_timeout_ms: u64,
    /// Deadline for writing one message, in milliseconds.
    #[ortho_config(default = DEFAULT_WRITE_TIMEOUT_MS)]
    pub write_timeout_ms: u64,
    /// Agent-side wait for the next request before polling again.
    #[ortho_config(default = DEFAULT_IDLE_POLL_MS)]
    pub idle_poll_ms: u64,
    /// Total attempts for retried client calls.
    #[ortho_config(default = DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[ortho_config(default = DEFAULT_RETRY_INTERVAL_MS)]
    pub retry_interval_ms: u64,
    /// Multiplier applied to the retry delay after each attempt.
    #[ortho_config(default = DEFAULT_RETRY_BACKOFF)]
    pub retry_backoff: u32,
    /// Chunk size for chunked transfers, in bytes.
    #[ortho_config(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
    /// Path roots the agent may touch. Empty selects the built-in roots.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Commands the agent may execute. Empty selects the built-in list.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            socket_path: default_socket_path(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            idle_poll_ms: DEFAULT_IDLE_POLL_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            chunk_size: DEFAULT_CHUNK_SIZE,
            allowed_paths: Vec::new(),
            allowed_commands: Vec::new(),
        }
    }
}

impl Config {
    /// Guest device path.
    #[must_use]
    pub fn device_path(&self) -> &Utf8PathBuf {
        &self.device_path
    }

    /// Host socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Utf8PathBuf {
        &self.socket_path
    }

    /// Log filter directive.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Socket connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Response read deadline.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Message write deadline.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Idle wait used by the agent between polls.
    #[must_use]
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Chunk size for transfers, never zero.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    /// Allowed path roots, falling back to [`DEFAULT_ALLOWED_PATHS`].
    #[must_use]
    pub fn allowed_paths(&self) -> Vec<Utf8PathBuf> {
        if self.allowed_paths.is_empty() {
            DEFAULT_ALLOWED_PATHS.iter().map(Utf8PathBuf::from).collect()
        } else {
            self.allowed_paths.iter().map(Utf8PathBuf::from).collect()
        }
    }

    /// Allowed commands, falling back to [`DEFAULT_ALLOWED_COMMANDS`].
    #[must_use]
    pub fn allowed_commands(&self) -> Vec<String> {
        if self.allowed_commands.is_empty() {
            default_allowed_commands()
        } else {
            self.allowed_commands.clone()
        }
    }
}
