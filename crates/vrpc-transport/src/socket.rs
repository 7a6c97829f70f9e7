//! Domain-socket transport used by the host side.

use std::io;
use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

use crate::channel::FramedChannel;
use crate::errors::TransportError;
use crate::framing::MAX_FRAME_BYTES;
use crate::{TRANSPORT_TARGET, Transport};

/// Transport over a connected UNIX domain stream socket.
#[derive(Debug)]
pub struct UnixSocketTransport {
    path: PathBuf,
    connect_timeout: Duration,
    frame_limit: usize,
    channel: Option<FramedChannel<UnixStream>>,
}

impl UnixSocketTransport {
    /// Creates a disconnected transport for the socket at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            connect_timeout,
            frame_limit: MAX_FRAME_BYTES,
            channel: None,
        }
    }

    /// Wraps an already connected stream.
    ///
    /// The transport reports itself as open; [`Transport::open`] is a no-op
    /// until it is closed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the stream cannot be switched to
    /// non-blocking mode.
    pub fn from_stream(stream: UnixStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        let path = stream
            .peer_addr()
            .ok()
            .and_then(|address| address.as_pathname().map(Path::to_path_buf))
            .unwrap_or_default();
        Ok(Self {
            path,
            connect_timeout: Duration::ZERO,
            frame_limit: MAX_FRAME_BYTES,
            channel: Some(FramedChannel::new(stream)),
        })
    }

    /// Refuses incoming frames larger than `limit` bytes.
    #[must_use]
    pub const fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = limit;
        if let Some(channel) = self.channel.as_mut() {
            channel.set_frame_limit(limit);
        }
        self
    }

    /// Returns the socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn channel(&mut self) -> Result<&mut FramedChannel<UnixStream>, TransportError> {
        self.channel.as_mut().ok_or(TransportError::NotOpen)
    }

    fn connect(&self) -> io::Result<UnixStream> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let address = SockAddr::unix(&self.path)?;
        if self.connect_timeout.is_zero() {
            socket.connect(&address)?;
        } else {
            socket.connect_timeout(&address, self.connect_timeout)?;
        }
        let stream = UnixStream::from(OwnedFd::from(socket));
        stream.set_nonblocking(true)?;
        Ok(stream)
    }
}

impl Transport for UnixSocketTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.channel.is_some() {
            return Ok(());
        }
        let stream = self.connect().map_err(|source| TransportError::Connect {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            target: TRANSPORT_TARGET,
            path = %self.path.display(),
            "socket connected"
        );
        self.channel = Some(FramedChannel::with_frame_limit(stream, self.frame_limit));
        Ok(())
    }

    fn read_message(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.channel()?.read_message(timeout)
    }

    fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.channel()?.write_all(bytes, timeout)
    }

    fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.get_ref().shutdown(Shutdown::Both).ok();
            debug!(
                target: TRANSPORT_TARGET,
                path = %self.path.display(),
                "socket closed"
            );
        }
    }

    fn is_open(&self) -> bool {
        self.channel.is_some()
    }
}
