//! Character-device transport used by the guest agent.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::channel::FramedChannel;
use crate::errors::TransportError;
use crate::{TRANSPORT_TARGET, Transport};

/// Transport over a pollable character device such as a virtio-serial port.
///
/// The device is opened once for non-blocking reading and writing. While the
/// host end is detached, reads report [`TransportError::Closed`]; callers
/// are expected to wait and try again.
#[derive(Debug)]
pub struct CharDeviceTransport {
    path: PathBuf,
    channel: Option<FramedChannel<File>>,
}

impl CharDeviceTransport {
    /// Creates a closed transport for the device at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            channel: None,
        }
    }

    /// Returns the device path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn channel(&mut self) -> Result<&mut FramedChannel<File>, TransportError> {
        self.channel.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for CharDeviceTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.channel.is_some() {
            return Ok(());
        }
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|source| TransportError::Open {
                path: self.path.clone(),
                source,
            })?;
        debug!(
            target: TRANSPORT_TARGET,
            path = %self.path.display(),
            "character device opened"
        );
        self.channel = Some(FramedChannel::new(device));
        Ok(())
    }

    fn read_message(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.channel()?.read_message(timeout)
    }

    fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.channel()?.write_all(bytes, timeout)
    }

    fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!(
                target: TRANSPORT_TARGET,
                path = %self.path.display(),
                "character device closed"
            );
        }
    }

    fn is_open(&self) -> bool {
        self.channel.is_some()
    }
}
