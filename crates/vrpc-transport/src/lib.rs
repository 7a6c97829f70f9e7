//! Deadline-driven message transports for the `vrpc` channel.
//!
//! The channel between host and guest is a plain byte stream with no message
//! boundaries. [`FrameBuffer`] reassembles complete frames from arbitrary
//! splits by reading the declared `Content-Length`, and [`FramedChannel`]
//! drives non-blocking reads and writes to completion under a deadline.
//!
//! Two transports implement [`Transport`]: [`CharDeviceTransport`] for the
//! guest's virtio-serial port and [`UnixSocketTransport`] for the host's
//! domain socket. Both share the same framing and polling logic.

mod channel;
mod device;
mod errors;
mod framing;
mod poll;
mod socket;

#[cfg(test)]
mod tests;

use std::time::Duration;

pub use self::channel::FramedChannel;
pub use self::device::CharDeviceTransport;
pub use self::errors::TransportError;
pub use self::framing::{FrameBuffer, MAX_FRAME_BYTES, MAX_HEAD_BYTES, declared_body_length};
pub use self::socket::UnixSocketTransport;

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// A point-to-point channel carrying one framed message at a time.
///
/// Implementations must never return a partial frame from
/// [`Transport::read_message`]: a frame is either complete or the call fails.
pub trait Transport {
    /// Opens or connects the underlying channel. Opening an open transport
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Open`] or [`TransportError::Connect`] when
    /// the channel cannot be established.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Reads exactly one complete frame within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReadTimeout`] when no complete frame
    /// arrives in time, [`TransportError::Closed`] when the peer hangs up,
    /// and [`TransportError::NotOpen`] before [`Transport::open`].
    fn read_message(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Writes all of `bytes` within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::WriteTimeout`] when the deadline passes
    /// and [`TransportError::Closed`] or [`TransportError::WriteZero`] when
    /// the channel is broken.
    fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Releases the channel. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Reports whether the channel is open.
    fn is_open(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn read_message(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_message(timeout)
    }

    fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        (**self).write_all(bytes, timeout)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
