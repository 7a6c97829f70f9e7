//! Error types for channel operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use vrpc_protocol::{ErrorKind, RpcFault};

/// Errors surfaced while opening, reading from, or writing to a channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has not been opened or was already closed.
    #[error("transport is not open")]
    NotOpen,
    /// The character device could not be opened.
    #[error("failed to open device {path}: {source}", path = .path.display())]
    Open {
        /// Device path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The domain socket could not be connected.
    #[error("failed to connect to socket {path}: {source}", path = .path.display())]
    Connect {
        /// Socket path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// No complete frame arrived before the deadline.
    ///
    /// Any partially received frame has been discarded.
    #[error("timed out waiting for a complete message ({received} bytes discarded)")]
    ReadTimeout {
        /// Bytes of the incomplete frame that were discarded.
        received: usize,
    },
    /// The outgoing bytes could not be written before the deadline.
    #[error("timed out writing message after {written} of {total} bytes")]
    WriteTimeout {
        /// Bytes accepted by the channel before the deadline.
        written: usize,
        /// Size of the outgoing message.
        total: usize,
    },
    /// The peer closed the channel or hung up.
    #[error("channel closed by peer")]
    Closed,
    /// A writable channel accepted zero bytes.
    #[error("channel accepted no bytes after {written} of {total}")]
    WriteZero {
        /// Bytes accepted before the stall.
        written: usize,
        /// Size of the outgoing message.
        total: usize,
    },
    /// A frame exceeds the maximum accepted size.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Declared or accumulated frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Polling, reading, or writing failed.
    #[error("channel IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Reports whether the error is a read or write deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimeout { .. } | Self::WriteTimeout { .. })
    }

    /// Returns the taxonomy kind reported for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReadTimeout { .. } => ErrorKind::ReadTimeout,
            Self::WriteTimeout { .. } => ErrorKind::WriteTimeout,
            Self::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused => {
                ErrorKind::ConnectionRefused
            }
            Self::FrameTooLarge { .. } => ErrorKind::InvalidParams,
            Self::NotOpen
            | Self::Open { .. }
            | Self::Connect { .. }
            | Self::Closed
            | Self::WriteZero { .. }
            | Self::Io(_) => ErrorKind::ConnectionLost,
        }
    }
}

impl From<TransportError> for RpcFault {
    fn from(error: TransportError) -> Self {
        Self::with_message(error.kind(), error.to_string())
    }
}
