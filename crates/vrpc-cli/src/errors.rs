//! Error types for the CLI runtime.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use vrpc_protocol::RpcFault;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("error [{code}]: {message}", code = .0.code(), message = .0.message())]
    Fault(#[from] RpcFault),
    #[error("failed to serialise reply: {0}")]
    SerialiseReply(serde_json::Error),
    #[error("failed to write reply: {0}")]
    EmitReply(io::Error),
}
