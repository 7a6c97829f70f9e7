use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

use crate::logging::LogFormat;

/// Default guest-side virtio-serial port.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/virtio-ports/vrpc.agent.0";

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default socket connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default deadline for reading one response, in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;

/// Default deadline for writing one message, in milliseconds.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 30_000;

/// How long the agent waits for a request before polling again.
pub const DEFAULT_IDLE_POLL_MS: u64 = 5_000;

/// Default number of attempts for retried client calls.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Default multiplier applied to the retry delay after each attempt.
pub const DEFAULT_RETRY_BACKOFF: u32 = 2;

/// Default chunk size for chunked transfers.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Roots the agent may read and write when none are configured.
pub const DEFAULT_ALLOWED_PATHS: &[&str] = &["/tmp/", "/var/log/", "/home/", "/opt/"];

/// Commands the agent may execute when none are configured.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "grep", "find", "wc", "df", "free", "top", "ps", "netstat", "ss",
    "ip", "systemctl", "service", "journalctl", "date", "uptime", "hostname", "uname", "whoami",
    "pwd", "echo", "env", "printenv", "which", "type", "file", "stat", "id", "groups", "last",
    "who", "w", "dmidecode", "lscpu", "lsmem", "lsblk", "lspci", "lsusb", "mount", "fdisk",
    "blkid", "iptables", "firewall-cmd", "docker", "podman", "crictl",
];

/// Default guest device path.
#[must_use]
pub fn default_device_path() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_DEVICE_PATH)
}

/// Default log filter expression used by the binaries.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required.
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Computes the default host-side socket path.
///
/// Prefers `$XDG_RUNTIME_DIR/vrpc/vrpc.sock`; without a runtime directory
/// the temporary directory is used with a per-user namespace.
#[must_use]
pub fn default_socket_path() -> Utf8PathBuf {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("vrpc");
    if apply_namespace {
        base.push(user_namespace());
    }
    base.join("vrpc.sock")
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[cfg(not(unix))]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    None
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn user_namespace() -> String {
    String::from("shared")
}

/// Built-in allowed path roots as owned strings.
#[must_use]
pub fn default_allowed_paths() -> Vec<String> {
    DEFAULT_ALLOWED_PATHS.iter().map(|root| (*root).to_owned()).collect()
}

/// Built-in command allow-list as owned strings.
#[must_use]
pub fn default_allowed_commands() -> Vec<String> {
    DEFAULT_ALLOWED_COMMANDS
        .iter()
        .map(|command| (*command).to_owned())
        .collect()
}
