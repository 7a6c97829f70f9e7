//! CLI argument definitions for the `vrpc` host tool.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// Host-side client for the `vrpcd` guest agent.
#[derive(Parser, Debug)]
#[command(name = "vrpc", version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Operations the host can request from the guest.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum CliCommand {
    /// Checks that the agent answers.
    Ping,
    /// Shows guest system information.
    Info,
    /// Shows guest CPU, memory, and disk usage.
    Status,
    /// Runs a shell command on the guest.
    Exec {
        /// Command line passed to `sh -c`.
        command: String,
        /// Seconds before the agent kills the command.
        #[arg(long, short = 't', default_value_t = 30)]
        timeout: u64,
        /// Directory the command runs in.
        #[arg(long, short = 'w')]
        workdir: Option<String>,
    },
    /// Copies a local file to the guest.
    Upload {
        /// Local source file.
        local: Utf8PathBuf,
        /// Destination path on the guest.
        remote: String,
        /// Octal permission bits for the remote file.
        #[arg(long, short = 'm', default_value = "0644")]
        mode: String,
        /// Refuses to replace an existing remote file.
        #[arg(long)]
        no_overwrite: bool,
    },
    /// Copies a guest file to the host.
    Download {
        /// Source path on the guest.
        remote: String,
        /// Local destination file.
        local: Utf8PathBuf,
    },
    /// Shows metadata for a guest path.
    FileInfo {
        /// Path on the guest.
        path: String,
    },
    /// Controls a systemd unit on the guest.
    Service {
        /// Unit name, for example `nginx`.
        name: String,
        /// Action to apply.
        #[arg(value_parser = ["start", "stop", "restart", "status", "enable", "disable", "reload"])]
        action: String,
    },
}

impl CliCommand {
    /// Whether the command maps to an idempotent read that may be retried.
    pub(crate) const fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Ping | Self::Info | Self::Status | Self::FileInfo { .. } | Self::Download { .. }
        )
    }
}
