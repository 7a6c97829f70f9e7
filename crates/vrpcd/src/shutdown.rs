//! Termination signal handling.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use thiserror::Error;

/// Signals that stop the server loop.
pub const SHUTDOWN_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

/// Errors reported while installing signal handlers.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing a signal handler failed.
    #[error("failed to install handler for signal {signal}: {source}")]
    Install {
        /// Signal number.
        signal: i32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Returns a flag raised when `SIGINT` or `SIGTERM` arrives.
///
/// The handlers replace the default termination action; the server loop
/// polls the flag between iterations.
///
/// # Errors
///
/// Returns [`ShutdownError::Install`] when a handler cannot be registered.
pub fn install_shutdown_flag() -> Result<Arc<AtomicBool>, ShutdownError> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in SHUTDOWN_SIGNALS {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .map_err(|source| ShutdownError::Install { signal, source })?;
    }
    Ok(flag)
}
