//! Shared fixtures for handler and server tests.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::Value;
use tempfile::TempDir;
use vrpc_config::Config;
use vrpc_protocol::headers::REQUEST_ID;
use vrpc_protocol::{Headers, Request, Response, RpcFault, decode_response, encode_request};
use vrpc_transport::{MAX_FRAME_BYTES, Transport, UnixSocketTransport};

use crate::handlers::policy::AgentPolicy;
use crate::server::{Handler, RequestContext, Served, Server};
use crate::transfer::UploadSessions;

pub(crate) const CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);

/// A scratch directory that is the only allowed root, plus the state a
/// handler needs.
pub(crate) struct HandlerHarness {
    pub(crate) dir: TempDir,
    pub(crate) config: Config,
    pub(crate) policy: AgentPolicy,
    pub(crate) sessions: UploadSessions,
}

impl HandlerHarness {
    pub(crate) fn new() -> Self {
        Self::with_chunk_size(vrpc_config::DEFAULT_CHUNK_SIZE)
    }

    pub(crate) fn with_chunk_size(chunk_size: usize) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
        let config = scratch_config(&root, chunk_size);
        let policy = AgentPolicy::from_config(&config);
        Self {
            dir,
            config,
            policy,
            sessions: UploadSessions::new(),
        }
    }

    /// Absolute path of `name` inside the scratch directory.
    pub(crate) fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    pub(crate) fn call(&mut self, handler: Handler, body: Value) -> Result<Value, RpcFault> {
        self.call_with_query(handler, Some(body), &[])
    }

    pub(crate) fn call_with_query(
        &mut self,
        handler: Handler,
        body: Option<Value>,
        query: &[(&str, &str)],
    ) -> Result<Value, RpcFault> {
        let request = Request::new("POST", "/test", body);
        let path_params = HashMap::new();
        let query_params: HashMap<String, String> = query
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        let mut ctx = RequestContext {
            request: &request,
            path_params: &path_params,
            query_params: &query_params,
            config: &self.config,
            policy: &self.policy,
            uptime: Duration::from_secs(7),
            sessions: &mut self.sessions,
        };
        handler(&mut ctx)
    }
}

fn scratch_config(root: &Utf8PathBuf, chunk_size: usize) -> Config {
    Config {
        allowed_paths: vec![root.to_string()],
        chunk_size,
        idle_poll_ms: 100,
        write_timeout_ms: 5_000,
        ..Config::default()
    }
}

/// A server wired to an in-process host end over a socket pair.
pub(crate) struct ChannelHarness {
    pub(crate) dir: TempDir,
    pub(crate) server: Server<UnixSocketTransport>,
    pub(crate) host: UnixSocketTransport,
}

impl ChannelHarness {
    pub(crate) fn new() -> Self {
        Self::with_frame_limit(MAX_FRAME_BYTES)
    }

    /// Builds a harness whose agent refuses frames above `limit` bytes.
    pub(crate) fn with_frame_limit(limit: usize) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
        let (guest_end, host_end) = UnixStream::pair().expect("socket pair");
        let guest = UnixSocketTransport::from_stream(guest_end)
            .expect("wrap guest end")
            .with_frame_limit(limit);
        let host = UnixSocketTransport::from_stream(host_end).expect("wrap host end");
        let config = scratch_config(&root, vrpc_config::DEFAULT_CHUNK_SIZE);
        let server = Server::with_default_routes(guest, config).expect("default routes");
        Self { dir, server, host }
    }

    /// Absolute path of `name` inside the scratch directory.
    pub(crate) fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    /// Sends one request from the host end without serving it.
    pub(crate) fn send(
        &mut self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        request_id: Option<&str>,
    ) {
        let mut headers = Headers::new();
        if let Some(id) = request_id {
            headers.insert(REQUEST_ID, id);
        }
        let bytes = encode_request(method, path, headers, body).expect("encode request");
        self.host
            .write_all(&bytes, CHANNEL_TIMEOUT)
            .expect("send request");
    }

    /// Reads and decodes the next reply on the host end.
    pub(crate) fn receive(&mut self) -> Response {
        let frame = self.host.read_message(CHANNEL_TIMEOUT).expect("read reply");
        decode_response(&frame).expect("decode reply")
    }

    /// Sends a request, lets the server answer it, and returns the reply.
    pub(crate) fn round_trip(
        &mut self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        request_id: Option<&str>,
    ) -> Response {
        self.send(method, path, body, request_id);
        assert_eq!(self.server.serve_once().expect("serve"), Served::Replied);
        self.receive()
    }
}
