//! Readiness waits on raw file descriptors.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Direction a caller is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Outcome of a single readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// The descriptor is ready for the requested direction.
    Ready,
    /// Nothing happened within the slice, or a signal interrupted the wait.
    Pending,
    /// The peer hung up and no data is pending.
    HangUp,
}

/// Waits up to `timeout` for `fd` to become ready.
///
/// Sub-millisecond timeouts are rounded up so a nearly expired deadline does
/// not degrade into a busy loop.
pub(crate) fn wait_ready(
    fd: RawFd,
    interest: Interest,
    timeout: Duration,
) -> io::Result<Readiness> {
    let events = match interest {
        Interest::Read => libc::POLLIN,
        Interest::Write => libc::POLLOUT,
    };
    let mut descriptor = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis().max(1)).unwrap_or(libc::c_int::MAX);

    let result = unsafe { libc::poll(&raw mut descriptor, 1, timeout_ms) };

    if result < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::Pending);
        }
        return Err(error);
    }
    if result == 0 {
        return Ok(Readiness::Pending);
    }
    if descriptor.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor is not open",
        ));
    }
    if descriptor.revents & events != 0 {
        return Ok(Readiness::Ready);
    }
    if descriptor.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
        return Ok(Readiness::HangUp);
    }
    Ok(Readiness::Pending)
}
