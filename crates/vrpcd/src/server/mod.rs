//! Sequential request loop for the guest agent.
//!
//! Each iteration waits for one framed message, decodes it, routes it,
//! dispatches it, and writes exactly one reply before reading again. Any
//! fault raised after a frame has been read becomes the reply envelope, so a
//! framed request is never left unanswered.

mod context;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
use vrpc_config::Config;
use vrpc_protocol::headers::RESPONSE_TIME;
use vrpc_protocol::{Envelope, ErrorKind, Request, Response, RpcFault, decode_request};
use vrpc_transport::{Transport, TransportError};

pub use self::context::{Handler, Params, RequestContext};
use crate::handlers::policy::AgentPolicy;
use crate::handlers::register_default_routes;
use crate::router::{RouteError, Router, split_query};
use crate::transfer::UploadSessions;

pub(crate) const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_SLICE: Duration = Duration::from_millis(100);

/// Outcome of a single wait on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// A request was read and a reply written.
    Replied,
    /// No message arrived before the idle deadline.
    Idle,
}

/// The agent's request loop and the state shared across requests.
pub struct Server<T> {
    transport: T,
    router: Router<Handler>,
    config: Config,
    policy: AgentPolicy,
    sessions: UploadSessions,
    started: Instant,
}

impl<T: Transport> Server<T> {
    /// Builds a server over `transport` with an explicit route table.
    #[must_use]
    pub fn new(transport: T, router: Router<Handler>, config: Config) -> Self {
        let policy = AgentPolicy::from_config(&config);
        Self {
            transport,
            router,
            config,
            policy,
            sessions: UploadSessions::new(),
            started: Instant::now(),
        }
    }

    /// Builds a server carrying every built-in route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if a built-in pattern fails to compile.
    pub fn with_default_routes(transport: T, config: Config) -> Result<Self, RouteError> {
        let mut router = Router::new();
        register_default_routes(&mut router)?;
        Ok(Self::new(transport, router, config))
    }

    /// Borrows the transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Borrows the configuration handlers see.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Borrows the route table.
    #[must_use]
    pub const fn router(&self) -> &Router<Handler> {
        &self.router
    }

    /// Borrows the upload session store.
    #[must_use]
    pub const fn sessions(&self) -> &UploadSessions {
        &self.sessions
    }

    /// Runs until `shutdown` is raised, then closes the transport.
    ///
    /// Idle timeouts are expected and only traced. Channel faults are
    /// logged and followed by a short pause; a closed transport is reopened
    /// on the next pass.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!(
            target: SERVER_TARGET,
            routes = self.router.len(),
            "server loop started"
        );
        let mut hung_up = false;
        while !shutdown.load(Ordering::SeqCst) {
            if !self.transport.is_open() {
                if let Err(error) = self.transport.open() {
                    error!(target: SERVER_TARGET, error = %error, "failed to open transport");
                    pause(shutdown);
                    continue;
                }
                info!(target: SERVER_TARGET, "transport reopened");
            }
            match self.serve_once() {
                Ok(Served::Replied) => hung_up = false,
                Ok(Served::Idle) => {
                    trace!(target: SERVER_TARGET, "no request before idle deadline");
                }
                Err(TransportError::ReadTimeout { received }) => {
                    warn!(
                        target: SERVER_TARGET,
                        discarded = received,
                        "incomplete request discarded"
                    );
                }
                Err(TransportError::Closed) => {
                    if !hung_up {
                        warn!(target: SERVER_TARGET, "peer not attached; waiting");
                    }
                    hung_up = true;
                    pause(shutdown);
                }
                Err(loop_error) => {
                    error!(target: SERVER_TARGET, error = %loop_error, "server loop fault");
                    if matches!(loop_error, TransportError::NotOpen | TransportError::Io(_)) {
                        self.transport.close();
                    }
                    pause(shutdown);
                }
            }
        }
        self.transport.close();
        info!(target: SERVER_TARGET, "server loop stopped");
    }

    /// Waits up to the idle deadline for one request and answers it.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] raised while reading or writing. A
    /// read that ends with nothing buffered is reported as [`Served::Idle`].
    /// An oversized frame is answered with a `2001` reply.
    pub fn serve_once(&mut self) -> Result<Served, TransportError> {
        let started = Instant::now();
        let reply = match self.transport.read_message(self.config.idle_poll()) {
            Ok(frame) => self.handle_frame(&frame),
            Err(TransportError::ReadTimeout { received: 0 }) => return Ok(Served::Idle),
            Err(oversized @ TransportError::FrameTooLarge { .. }) => {
                warn!(target: SERVER_TARGET, error = %oversized, "oversized request refused");
                let fault = RpcFault::from(oversized);
                encode_reply(&Envelope::failure(&fault), None, started)
            }
            Err(read_error) => return Err(read_error),
        };
        self.transport
            .write_all(&reply, self.config.write_timeout())?;
        Ok(Served::Replied)
    }

    /// Builds the encoded reply for one framed message.
    ///
    /// Never fails: decode, routing, and handler faults are all folded into
    /// the reply envelope.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        let started = Instant::now();
        let request = match decode_request(frame) {
            Ok(request) => request,
            Err(decode_error) => {
                warn!(target: SERVER_TARGET, error = %decode_error, "undecodable request");
                let fault = RpcFault::from(decode_error);
                return encode_reply(&Envelope::failure(&fault), None, started);
            }
        };
        let request_id = request.request_id();
        info!(
            target: SERVER_TARGET,
            request_id,
            method = %request.method,
            path = %request.path,
            "request received"
        );
        let envelope = match self.dispatch(&request) {
            Ok(data) => Envelope::success(Some(data)),
            Err(fault) => {
                warn!(
                    target: SERVER_TARGET,
                    request_id,
                    code = fault.code(),
                    fault = fault.message(),
                    "request failed"
                );
                Envelope::failure(&fault)
            }
        };
        let reply = encode_reply(&envelope, request_id, started);
        debug!(
            target: SERVER_TARGET,
            request_id,
            code = envelope.code,
            elapsed_ms = millis(started.elapsed()),
            "reply built"
        );
        reply
    }

    fn dispatch(&mut self, request: &Request) -> Result<Value, RpcFault> {
        let Some(route) = self.router.find(&request.method, &request.path) else {
            let (path, _) = split_query(&request.path);
            return Err(RpcFault::with_message(
                ErrorKind::EndpointNotFound,
                format!("Endpoint not found: {} {path}", request.method),
            ));
        };
        debug!(target: SERVER_TARGET, pattern = %route.pattern, "route matched");
        let mut ctx = RequestContext {
            request,
            path_params: &route.path_params,
            query_params: &route.query_params,
            config: &self.config,
            policy: &self.policy,
            uptime: self.started.elapsed(),
            sessions: &mut self.sessions,
        };
        let handler = route.handler;
        panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx))).unwrap_or_else(|_| {
            error!(target: SERVER_TARGET, pattern = %route.pattern, "handler panicked");
            Err(RpcFault::with_message(
                ErrorKind::Internal,
                format!("Internal error in {} {}", request.method, route.pattern),
            ))
        })
    }
}

/// Encodes `envelope` with the echoed request id and a processing time.
///
/// Falls back to a bare internal-fault reply if the envelope cannot be
/// serialised.
fn encode_reply(envelope: &Envelope, request_id: Option<&str>, started: Instant) -> Vec<u8> {
    let mut response = Response::from_envelope(envelope, request_id);
    response
        .headers
        .insert(RESPONSE_TIME, millis(started.elapsed()).to_string());
    response.to_bytes().unwrap_or_else(|encode_error| {
        error!(target: SERVER_TARGET, error = %encode_error, "failed to encode reply");
        let fallback = Envelope::for_code(ErrorKind::Internal.code(), None, None);
        Response::from_envelope(&fallback, None)
            .to_bytes()
            .unwrap_or_default()
    })
}

/// Sleeps for the error backoff, waking early on shutdown.
fn pause(shutdown: &AtomicBool) {
    let deadline = Instant::now().checked_add(ERROR_BACKOFF);
    while !shutdown.load(Ordering::SeqCst)
        && deadline.is_some_and(|limit| Instant::now() < limit)
    {
        thread::sleep(BACKOFF_SLICE);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
