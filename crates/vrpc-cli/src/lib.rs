//! Host side of the `vrpc` channel.
//!
//! [`RpcClient`] drives one request at a time over any
//! [`vrpc_transport::Transport`], turning error envelopes back into
//! [`vrpc_protocol::RpcFault`]s. Idempotent reads are wrapped in a
//! [`RetryPolicy`]; file transfers larger than one chunk use the agent's
//! session protocol (see [`transfer`]).
//!
//! [`run`] is the `vrpc` command line: configuration flags first, then one
//! subcommand, with the reply envelope printed as JSON on stdout.

mod cli;
pub mod client;
mod config;
mod errors;
pub mod retry;
mod telemetry;
pub mod transfer;

#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8Path;
use clap::Parser;
use tracing::{debug, warn};
use vrpc_config::Config;
use vrpc_protocol::{Envelope, RpcFault};
use vrpc_transport::{Transport, UnixSocketTransport};

use crate::cli::{Cli, CliCommand};
use crate::config::{ConfigLoader, OrthoConfigLoader, command_arguments, split_config_arguments};
use crate::errors::AppError;

pub use client::{ClientSettings, EXEC_GRACE, ExecOptions, RpcClient, UploadOptions};
pub use retry::RetryPolicy;

pub(crate) const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::client");
pub(crate) const TRANSFER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transfer");

/// Builds the transport a command talks over.
pub(crate) trait Connector {
    type Channel: Transport;

    fn channel(&self, config: &Config) -> Self::Channel;
}

/// Connects to the configured host-side domain socket.
pub(crate) struct SocketConnector;

impl Connector for SocketConnector {
    type Channel = UnixSocketTransport;

    fn channel(&self, config: &Config) -> Self::Channel {
        UnixSocketTransport::new(config.socket_path().as_std_path(), config.connect_timeout())
    }
}

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with(args, stdout, stderr, &OrthoConfigLoader, &SocketConnector)
}

pub(crate) fn run_with<I, W, E, L, C>(
    args: I,
    stdout: &mut W,
    stderr: &mut E,
    loader: &L,
    connector: &C,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
    C: Connector,
{
    let arguments: Vec<OsString> = args.into_iter().collect();
    let split = split_config_arguments(&arguments);

    let outcome = Cli::try_parse_from(command_arguments(&arguments, &split))
        .map_err(AppError::CliUsage)
        .and_then(|cli| {
            loader
                .load(&split.config_arguments)
                .map(|config| (cli, config))
        })
        .and_then(|(cli, config)| {
            telemetry::initialise(&config)?;
            let envelope = execute(&cli.command, &config, connector)?;
            emit(&envelope, stdout)
        });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppError::CliUsage(error)) if !error.use_stderr() => {
            write!(stdout, "{error}").ok();
            ExitCode::SUCCESS
        }
        Err(error) => {
            writeln!(stderr, "{error}").ok();
            ExitCode::FAILURE
        }
    }
}

fn execute<C: Connector>(
    request: &CliCommand,
    config: &Config,
    connector: &C,
) -> Result<Envelope, AppError> {
    let mut client = RpcClient::from_config(connector.channel(config), config);
    if let Err(fault) = client.connect() {
        if !request.is_idempotent() {
            return Err(fault.into());
        }
        warn!(target: CLIENT_TARGET, %fault, "initial connect failed");
    }
    let outcome = dispatch(&mut client, request);
    client.disconnect();
    outcome.map_err(AppError::from)
}

fn dispatch<T: Transport>(
    client: &mut RpcClient<T>,
    request: &CliCommand,
) -> Result<Envelope, RpcFault> {
    match request {
        CliCommand::Ping => client.ping(),
        CliCommand::Info => client.system_info(),
        CliCommand::Status => client.system_status(),
        CliCommand::Exec {
            command,
            timeout,
            workdir,
        } => {
            let options = ExecOptions {
                timeout: Duration::from_secs(*timeout),
                working_dir: workdir.clone(),
                env: Vec::new(),
            };
            client.exec(command, &options)
        }
        CliCommand::Upload {
            local,
            remote,
            mode,
            no_overwrite,
        } => {
            let options = UploadOptions {
                mode: mode.clone(),
                overwrite: !no_overwrite,
            };
            upload(client, local, remote, &options)
        }
        CliCommand::Download { remote, local } => client.download_file(remote, local.as_std_path()),
        CliCommand::FileInfo { path } => client.file_info(path),
        CliCommand::Service { name, action } => client.control_service(name, action),
    }
}

/// Uploads in one request, or through a session when the file is larger
/// than one chunk.
fn upload<T: Transport>(
    client: &mut RpcClient<T>,
    local: &Utf8Path,
    remote: &str,
    options: &UploadOptions,
) -> Result<Envelope, RpcFault> {
    // A missing file falls through to the single-shot path, which reports it.
    let size = fs::metadata(local).map_or(0, |metadata| metadata.len());
    let limit = u64::try_from(client.settings().piece_size()).unwrap_or(u64::MAX);
    if size > limit {
        client.chunked_upload(local.as_std_path(), remote, options, |sent, total| {
            debug!(target: TRANSFER_TARGET, sent, total, "upload progress");
        })
    } else {
        client.upload_file(local.as_std_path(), remote, options)
    }
}

fn emit<W: Write>(envelope: &Envelope, stdout: &mut W) -> Result<(), AppError> {
    serde_json::to_writer_pretty(&mut *stdout, envelope)
        .map_err(AppError::SerialiseReply)?;
    stdout.write_all(b"\n").map_err(AppError::EmitReply)?;
    stdout.flush().map_err(AppError::EmitReply)
}
