//! Deadline-driven framed IO shared by every transport.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::TRANSPORT_TARGET;
use crate::errors::TransportError;
use crate::framing::FrameBuffer;
use crate::poll::{Interest, Readiness, wait_ready};

/// Longest single readiness wait, so deadlines are re-checked regularly.
const POLL_SLICE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

/// A non-blocking stream paired with a frame reassembly buffer.
///
/// The stream must already be in non-blocking mode.
#[derive(Debug)]
pub struct FramedChannel<S> {
    stream: S,
    frames: FrameBuffer,
}

impl<S> FramedChannel<S>
where
    S: Read + Write + AsRawFd,
{
    /// Wraps a non-blocking stream.
    pub const fn new(stream: S) -> Self {
        Self {
            stream,
            frames: FrameBuffer::new(),
        }
    }

    /// Wraps a non-blocking stream, refusing frames larger than `limit`.
    pub const fn with_frame_limit(stream: S, limit: usize) -> Self {
        Self {
            stream,
            frames: FrameBuffer::with_limit(limit),
        }
    }

    /// Changes the frame size limit.
    pub const fn set_frame_limit(&mut self, limit: usize) {
        self.frames.set_limit(limit);
    }

    /// Returns the wrapped stream.
    pub const fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Reads until one complete frame is buffered or `timeout` elapses.
    ///
    /// Bytes received after the frame stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReadTimeout`] after discarding any partial
    /// frame, [`TransportError::Closed`] when the peer hangs up, and
    /// [`TransportError::FrameTooLarge`] for oversized frames.
    pub fn read_message(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.frames.take_frame()? {
                trace!(target: TRANSPORT_TARGET, bytes = frame.len(), "frame received");
                return Ok(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let received = self.frames.discard();
                return Err(TransportError::ReadTimeout { received });
            }
            match wait_ready(self.stream.as_raw_fd(), Interest::Read, remaining.min(POLL_SLICE))? {
                Readiness::Pending => continue,
                Readiness::Ready | Readiness::HangUp => {}
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.frames.discard();
                    return Err(TransportError::Closed);
                }
                Ok(count) => self.frames.push(chunk.get(..count).unwrap_or_default())?,
                Err(error) if is_retryable(&error) => {}
                Err(error) => return Err(TransportError::Io(error)),
            }
        }
    }

    /// Writes every byte of `bytes` before `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::WriteTimeout`] when the deadline passes,
    /// [`TransportError::WriteZero`] when the stream accepts nothing, and
    /// [`TransportError::Closed`] when the peer has gone away.
    pub fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let total = bytes.len();
        let mut written = 0;
        while written < total {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::WriteTimeout { written, total });
            }
            match wait_ready(self.stream.as_raw_fd(), Interest::Write, remaining.min(POLL_SLICE))? {
                Readiness::Pending => continue,
                Readiness::HangUp => return Err(TransportError::Closed),
                Readiness::Ready => {}
            }
            let pending = bytes.get(written..).unwrap_or_default();
            match self.stream.write(pending) {
                Ok(0) => return Err(TransportError::WriteZero { written, total }),
                Ok(count) => written += count,
                Err(error) if is_retryable(&error) => {}
                Err(error) if is_disconnect(&error) => return Err(TransportError::Closed),
                Err(error) => return Err(TransportError::Io(error)),
            }
        }
        self.stream.flush().or_else(|error| {
            if is_retryable(&error) {
                Ok(())
            } else {
                Err(error)
            }
        })?;
        trace!(target: TRANSPORT_TARGET, bytes = total, "frame written");
        Ok(())
    }
}

fn is_retryable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}
