//! Error taxonomy shared by the guest agent and the host client.
//!
//! Every fault that crosses the channel is identified by a stable numeric
//! code grouped by its leading digit:
//!
//! - `1xxx` command execution faults,
//! - `2xxx` request-shape faults,
//! - `3xxx` not-found faults,
//! - `4xxx` permission faults,
//! - `5xxx` internal faults,
//! - `6xxx` channel faults.
//!
//! Each kind maps to exactly one transport status. Execution faults map to
//! `200` because the call itself succeeded and carries an application-level
//! failure in its envelope.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Envelope code reported by successful calls.
pub const SUCCESS_CODE: u32 = 0;

/// Envelope message reported by successful calls.
pub const SUCCESS_MESSAGE: &str = "success";

/// Closed set of fault kinds understood by both ends of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The command ran but could not complete successfully.
    CommandFailed,
    /// The command exceeded its execution deadline.
    CommandTimeout,
    /// The command binary could not be found.
    CommandNotFound,
    /// A request parameter has an invalid value.
    InvalidParams,
    /// A message or body could not be parsed.
    JsonParse,
    /// A required request parameter is absent.
    MissingRequired,
    /// No route matches the request method and path.
    EndpointNotFound,
    /// A referenced file does not exist.
    FileNotFound,
    /// The operation is not permitted by the agent policy.
    PermissionDenied,
    /// An unexpected server-side failure.
    Internal,
    /// The agent cannot serve the request right now.
    ServiceUnavailable,
    /// The channel is closed or was never opened.
    ConnectionLost,
    /// No complete message arrived before the deadline.
    ReadTimeout,
    /// The message could not be written before the deadline.
    WriteTimeout,
    /// The peer refused the connection attempt.
    ConnectionRefused,
}

impl ErrorKind {
    /// Every kind in code order.
    pub const ALL: [Self; 15] = [
        Self::CommandFailed,
        Self::CommandTimeout,
        Self::CommandNotFound,
        Self::InvalidParams,
        Self::JsonParse,
        Self::MissingRequired,
        Self::EndpointNotFound,
        Self::FileNotFound,
        Self::PermissionDenied,
        Self::Internal,
        Self::ServiceUnavailable,
        Self::ConnectionLost,
        Self::ReadTimeout,
        Self::WriteTimeout,
        Self::ConnectionRefused,
    ];

    /// Returns the stable numeric code carried on the wire.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::CommandFailed => 1001,
            Self::CommandTimeout => 1002,
            Self::CommandNotFound => 1003,
            Self::InvalidParams => 2001,
            Self::JsonParse => 2002,
            Self::MissingRequired => 2003,
            Self::EndpointNotFound => 3001,
            Self::FileNotFound => 3002,
            Self::PermissionDenied => 4001,
            Self::Internal => 5001,
            Self::ServiceUnavailable => 5002,
            Self::ConnectionLost => 6001,
            Self::ReadTimeout => 6002,
            Self::WriteTimeout => 6003,
            Self::ConnectionRefused => 6004,
        }
    }

    /// Looks up the kind registered for `code`.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Looks up the kind for `code`, falling back to [`ErrorKind::Internal`].
    #[must_use]
    pub fn resolve(code: u32) -> Self {
        Self::from_code(code).unwrap_or(Self::Internal)
    }

    /// Returns the message used when a fault does not supply its own.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::CommandFailed => "Command execution failed",
            Self::CommandTimeout => "Command execution timeout",
            Self::CommandNotFound => "Command not found",
            Self::InvalidParams => "Invalid parameters",
            Self::JsonParse => "JSON parse error",
            Self::MissingRequired => "Missing required parameter",
            Self::EndpointNotFound => "Endpoint not found",
            Self::FileNotFound => "File not found",
            Self::PermissionDenied => "Permission denied",
            Self::Internal => "Internal server error",
            Self::ServiceUnavailable => "Service unavailable",
            Self::ConnectionLost => "Connection lost",
            Self::ReadTimeout => "Read timeout",
            Self::WriteTimeout => "Write timeout",
            Self::ConnectionRefused => "Connection refused",
        }
    }

    /// Returns the transport status paired with this kind.
    #[must_use]
    pub const fn status(self) -> TransportStatus {
        match self {
            Self::CommandFailed | Self::CommandTimeout | Self::CommandNotFound => {
                TransportStatus::OK
            }
            Self::InvalidParams | Self::JsonParse | Self::MissingRequired => {
                TransportStatus::BAD_REQUEST
            }
            Self::EndpointNotFound | Self::FileNotFound => TransportStatus::NOT_FOUND,
            Self::PermissionDenied => TransportStatus::FORBIDDEN,
            Self::ServiceUnavailable => TransportStatus::SERVICE_UNAVAILABLE,
            Self::Internal
            | Self::ConnectionLost
            | Self::ReadTimeout
            | Self::WriteTimeout
            | Self::ConnectionRefused => TransportStatus::INTERNAL_SERVER_ERROR,
        }
    }

    /// Reports whether the kind describes a channel-level fault (`6xxx`).
    #[must_use]
    pub const fn is_channel_fault(self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::ReadTimeout | Self::WriteTimeout | Self::ConnectionRefused
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Status code and reason phrase written on a response status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatus {
    /// Numeric status code.
    pub code: u16,
    /// Reason phrase following the code.
    pub reason: &'static str,
}

impl TransportStatus {
    /// `200 OK`.
    pub const OK: Self = Self::new(200, "OK");
    /// `400 Bad Request`.
    pub const BAD_REQUEST: Self = Self::new(400, "Bad Request");
    /// `403 Forbidden`.
    pub const FORBIDDEN: Self = Self::new(403, "Forbidden");
    /// `404 Not Found`.
    pub const NOT_FOUND: Self = Self::new(404, "Not Found");
    /// `500 Internal Server Error`.
    pub const INTERNAL_SERVER_ERROR: Self = Self::new(500, "Internal Server Error");
    /// `503 Service Unavailable`.
    pub const SERVICE_UNAVAILABLE: Self = Self::new(503, "Service Unavailable");

    const fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    /// Resolves the status for an envelope code.
    ///
    /// The success code maps to `200`; unrecognised codes map to `500`.
    #[must_use]
    pub fn for_code(code: u32) -> Self {
        if code == SUCCESS_CODE {
            return Self::OK;
        }
        ErrorKind::from_code(code).map_or(Self::INTERNAL_SERVER_ERROR, ErrorKind::status)
    }
}

/// Application fault carried verbatim across the channel.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{code}] {message}", code = .kind.code())]
pub struct RpcFault {
    kind: ErrorKind,
    message: String,
    data: Option<Value>,
}

impl RpcFault {
    /// Builds a fault carrying the kind's default message.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.default_message().to_owned(),
            data: None,
        }
    }

    /// Builds a fault with an explicit message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    /// Rebuilds a fault from a decoded error envelope.
    ///
    /// Unknown codes fall back to [`ErrorKind::Internal`] while the remote
    /// message and data are kept unmodified.
    #[must_use]
    pub fn from_remote(code: u32, message: String, data: Option<Value>) -> Self {
        Self {
            kind: ErrorKind::resolve(code),
            message,
            data,
        }
    }

    /// Attaches structured data to the fault.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Fault for an invalid parameter value.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InvalidParams, message)
    }

    /// Fault for an absent required parameter.
    #[must_use]
    pub fn missing_required(field: &str) -> Self {
        Self::with_message(
            ErrorKind::MissingRequired,
            format!("Missing required parameter: {field}"),
        )
    }

    /// Fault for a path that does not exist.
    #[must_use]
    pub fn file_not_found(path: impl fmt::Display) -> Self {
        Self::with_message(ErrorKind::FileNotFound, format!("File not found: {path}"))
    }

    /// Fault for an operation rejected by policy or by the filesystem.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::PermissionDenied, message)
    }

    /// Fault for an unexpected server-side failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::Internal, message)
    }

    /// Returns the fault kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the numeric wire code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        self.kind.code()
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the structured data attached to the fault, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Returns the transport status paired with the fault kind.
    #[must_use]
    pub const fn status(&self) -> TransportStatus {
        self.kind.status()
    }

    /// Splits the fault into its parts.
    #[must_use]
    pub fn into_parts(self) -> (ErrorKind, String, Option<Value>) {
        (self.kind, self.message, self.data)
    }
}

impl From<ErrorKind> for RpcFault {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}
