//! Retry wrapper for idempotent client calls.

use std::thread;
use std::time::Duration;

use tracing::warn;
use vrpc_config::Config;
use vrpc_protocol::RpcFault;
use vrpc_transport::Transport;

use crate::CLIENT_TARGET;
use crate::client::RpcClient;

/// Exponential backoff applied to calls that may safely be repeated.
///
/// Only channel faults (`6xxx`) are retried. The connection is re-opened
/// before each further attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    interval: Duration,
    backoff: u32,
}

impl RetryPolicy {
    /// Builds a policy making at most `attempts` tries.
    ///
    /// Zero attempts is treated as one.
    #[must_use]
    pub fn new(attempts: u32, interval: Duration, backoff: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
            backoff: backoff.max(1),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            interval: Duration::ZERO,
            backoff: 1,
        }
    }

    /// Reads `retry_attempts`, `retry_interval_ms`, and `retry_backoff`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.retry_attempts,
            config.retry_interval(),
            config.retry_backoff,
        )
    }

    /// Maximum number of tries.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    #[must_use]
    pub const fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff.saturating_pow(attempt.saturating_sub(1));
        self.interval.saturating_mul(factor)
    }

    /// Runs `operation`, retrying channel faults with backoff.
    ///
    /// # Errors
    ///
    /// Returns the first non-channel fault, or the last fault once all
    /// attempts are spent.
    pub fn run<T, R, F>(&self, client: &mut RpcClient<T>, mut operation: F) -> Result<R, RpcFault>
    where
        T: Transport,
        F: FnMut(&mut RpcClient<T>) -> Result<R, RpcFault>,
    {
        let mut attempt = 1_u32;
        let mut outcome = operation(client);
        loop {
            match outcome {
                Err(fault) if fault.kind().is_channel_fault() && attempt < self.attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        target: CLIENT_TARGET,
                        attempt,
                        attempts = self.attempts,
                        code = fault.code(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying after channel fault"
                    );
                    thread::sleep(delay);
                    attempt = attempt.saturating_add(1);
                    client.disconnect();
                    outcome = client.connect().and_then(|()| operation(client));
                }
                settled => return settled,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}
