//! Blocking RPC client for the host end of the channel.
//!
//! [`RpcClient`] owns one [`Transport`] and issues a single request at a
//! time, waiting for the paired reply before the next call may start.
//! Error envelopes are turned back into [`RpcFault`]s carrying the remote
//! code, message, and data unchanged.

use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use vrpc_config::Config;
use vrpc_protocol::{Envelope, ErrorKind, Request, RpcFault, decode_response, routes};
use vrpc_transport::Transport;

use crate::CLIENT_TARGET;
use crate::retry::RetryPolicy;

/// Extra time granted to the channel beyond a command's own timeout.
pub const EXEC_GRACE: Duration = Duration::from_secs(5);

/// Deadlines and sizes the client applies to each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Default deadline for a reply.
    pub read_timeout: Duration,
    /// Deadline for writing one request.
    pub write_timeout: Duration,
    /// Piece size for chunked transfers.
    pub chunk_size: usize,
}

impl ClientSettings {
    /// Derives settings from the shared configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            chunk_size: config.chunk_size(),
        }
    }

    /// Transfer piece size, never below one byte.
    #[must_use]
    pub const fn piece_size(&self) -> usize {
        if self.chunk_size == 0 {
            1
        } else {
            self.chunk_size
        }
    }
}

/// Options for `POST /api/v1/shell/exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Command timeout enforced by the agent.
    pub timeout: Duration,
    /// Directory the command runs in.
    pub working_dir: Option<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

/// Options shared by single-shot and chunked uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// Octal permission bits applied to the remote file.
    pub mode: String,
    /// Whether an existing remote file may be replaced.
    pub overwrite: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            mode: "0644".to_owned(),
            overwrite: true,
        }
    }
}

/// Host-side client issuing one call at a time over a transport.
#[derive(Debug)]
pub struct RpcClient<T> {
    transport: T,
    settings: ClientSettings,
    retry: RetryPolicy,
}

impl<T: Transport> RpcClient<T> {
    /// Wraps a transport. The transport is not opened until
    /// [`RpcClient::connect`].
    #[must_use]
    pub const fn new(transport: T, settings: ClientSettings, retry: RetryPolicy) -> Self {
        Self {
            transport,
            settings,
            retry,
        }
    }

    /// Builds a client from the shared configuration.
    #[must_use]
    pub fn from_config(transport: T, config: &Config) -> Self {
        Self::new(
            transport,
            ClientSettings::from_config(config),
            RetryPolicy::from_config(config),
        )
    }

    /// Opens the underlying transport.
    ///
    /// # Errors
    ///
    /// Returns a `6xxx` fault when the channel cannot be established.
    pub fn connect(&mut self) -> Result<(), RpcFault> {
        self.transport.open().map_err(RpcFault::from)
    }

    /// Closes the underlying transport.
    pub fn disconnect(&mut self) {
        self.transport.close();
    }

    /// Reports whether the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Retry policy applied to idempotent reads.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Borrows the transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends one request and waits for its reply.
    ///
    /// `timeout` overrides the configured read deadline. A success envelope
    /// is returned as decoded.
    ///
    /// # Errors
    ///
    /// Returns `6001` when the client is not connected, the remote fault for
    /// an error envelope, `2002` for an undecodable reply, and a `6xxx`
    /// fault when the channel fails. Channel failures close the connection
    /// so a late reply cannot be paired with a later request.
    pub fn call(
        &mut self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RpcFault> {
        if !self.transport.is_open() {
            return Err(RpcFault::with_message(
                ErrorKind::ConnectionLost,
                "Not connected to server",
            ));
        }
        let request = Request::new(method, path, body.cloned()).with_default_headers();
        let request_id = request.request_id().map(str::to_owned);
        let bytes = request.to_bytes()?;
        debug!(
            target: CLIENT_TARGET,
            method,
            path,
            request_id = request_id.as_deref().unwrap_or_default(),
            size = bytes.len(),
            "sending request"
        );

        let deadline = timeout.unwrap_or(self.settings.read_timeout);
        if let Err(error) = self.transport.write_all(&bytes, self.settings.write_timeout) {
            self.transport.close();
            return Err(error.into());
        }
        let reply = match self.transport.read_message(deadline) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(target: CLIENT_TARGET, method, path, %error, "dropping connection");
                self.transport.close();
                return Err(error.into());
            }
        };

        let response = decode_response(&reply)?;
        if response.request_id() != request_id.as_deref() {
            warn!(
                target: CLIENT_TARGET,
                expected = request_id.as_deref().unwrap_or_default(),
                received = response.request_id().unwrap_or_default(),
                "reply carries a different request id"
            );
        }
        response.envelope()?.into_result()
    }

    /// `GET /api/v1/ping`, retried on channel faults.
    ///
    /// # Errors
    ///
    /// Returns the final fault once retries are exhausted.
    pub fn ping(&mut self) -> Result<Envelope, RpcFault> {
        self.call_idempotent(routes::PING)
    }

    /// `GET /api/v1/system/info`, retried on channel faults.
    ///
    /// # Errors
    ///
    /// Returns the final fault once retries are exhausted.
    pub fn system_info(&mut self) -> Result<Envelope, RpcFault> {
        self.call_idempotent(routes::SYSTEM_INFO)
    }

    /// `GET /api/v1/system/status`, retried on channel faults.
    ///
    /// # Errors
    ///
    /// Returns the final fault once retries are exhausted.
    pub fn system_status(&mut self) -> Result<Envelope, RpcFault> {
        self.call_idempotent(routes::SYSTEM_STATUS)
    }

    /// `GET /api/v1/file/info` for a remote path, retried on channel faults.
    ///
    /// # Errors
    ///
    /// Returns the final fault once retries are exhausted.
    pub fn file_info(&mut self, remote: &str) -> Result<Envelope, RpcFault> {
        let path = format!(
            "{}?path={}",
            routes::FILE_INFO,
            utf8_percent_encode(remote, NON_ALPHANUMERIC)
        );
        self.call_idempotent(&path)
    }

    /// Runs a shell command on the guest.
    ///
    /// The reply deadline is the command timeout plus [`EXEC_GRACE`], or the
    /// configured read deadline when that is longer.
    ///
    /// # Errors
    ///
    /// Returns the remote fault, for example `1002` on timeout.
    pub fn exec(&mut self, command: &str, options: &ExecOptions) -> Result<Envelope, RpcFault> {
        let mut body = Map::new();
        body.insert("command".to_owned(), json!(command));
        body.insert("timeout".to_owned(), json!(options.timeout.as_secs()));
        if let Some(dir) = &options.working_dir {
            body.insert("working_dir".to_owned(), json!(dir));
        }
        if !options.env.is_empty() {
            let env: Map<String, Value> = options
                .env
                .iter()
                .map(|(key, value)| (key.clone(), json!(value)))
                .collect();
            body.insert("env".to_owned(), Value::Object(env));
        }
        let deadline = options
            .timeout
            .saturating_add(EXEC_GRACE)
            .max(self.settings.read_timeout);
        self.call(
            "POST",
            routes::SHELL_EXEC,
            Some(&Value::Object(body)),
            Some(deadline),
        )
    }

    /// Controls a systemd unit with `action`.
    ///
    /// # Errors
    ///
    /// Returns the remote fault.
    pub fn control_service(&mut self, name: &str, action: &str) -> Result<Envelope, RpcFault> {
        let body = json!({"name": name, "action": action});
        self.call("POST", routes::SERVICE_CONTROL, Some(&body), None)
    }

    fn call_idempotent(&mut self, path: &str) -> Result<Envelope, RpcFault> {
        let policy = self.retry;
        policy.run(self, |client| client.call("GET", path, None, None))
    }
}
