//! Test suites for the guest agent.

pub(crate) mod support;

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rstest::{fixture, rstest};
use serde_json::{Value, json};
use vrpc_config::Config;
use vrpc_protocol::headers::RESPONSE_TIME;
use vrpc_protocol::{ErrorKind, Headers, RpcFault, decode_response, encode_request};
use vrpc_transport::{Transport, UnixSocketTransport};

use crate::handlers::{self, register_default_routes};
use crate::router::Router;
use crate::server::{Handler, RequestContext, Served, Server};
use support::ChannelHarness;

#[fixture]
fn channel() -> ChannelHarness {
    ChannelHarness::new()
}

#[rstest]
fn ping_reply_echoes_the_request_id(mut channel: ChannelHarness) {
    let response = channel.round_trip("GET", handlers::PING, None, Some("req-42"));
    assert_eq!(response.status, 200);
    assert_eq!(response.request_id(), Some("req-42"));
    assert!(response.headers.get(RESPONSE_TIME).is_some());
    let envelope = response.envelope().expect("envelope");
    assert_eq!(envelope.code, 0);
    assert_eq!(envelope.message, "success");
    assert_eq!(envelope.data.expect("data")["message"], "pong");
}

#[rstest]
fn unknown_endpoints_are_not_found(mut channel: ChannelHarness) {
    let response = channel.round_trip("DELETE", "/api/v1/nothing?x=1", None, None);
    assert_eq!(response.status, 404);
    let envelope = response.envelope().expect("envelope");
    assert_eq!(envelope.code, ErrorKind::EndpointNotFound.code());
    assert_eq!(envelope.message, "Endpoint not found: DELETE /api/v1/nothing");
}

#[rstest]
fn handler_faults_keep_their_code_and_status(mut channel: ChannelHarness) {
    let body = json!({"path": channel.path("absent.txt")});
    let response = channel.round_trip("POST", handlers::FILE_DOWNLOAD, Some(&body), Some("dl-1"));
    assert_eq!(response.status, 404);
    assert_eq!(response.request_id(), Some("dl-1"));
    let envelope = response.envelope().expect("envelope");
    assert_eq!(envelope.code, 3002);
    assert!(envelope.message.starts_with("File not found: "));
}

#[rstest]
fn query_parameters_reach_get_handlers(mut channel: ChannelHarness) {
    let response = channel.round_trip(
        "GET",
        "/api/v1/file/info?path=%2Fetc%2Fshadow",
        None,
        None,
    );
    let data = response.envelope().expect("envelope").data.expect("data");
    assert_eq!(data, json!({"path": "/etc/shadow", "exists": false}));
}

#[rstest]
fn undecodable_frames_get_a_parse_fault(mut channel: ChannelHarness) {
    let reply = channel.server.handle_frame(b"NOT-A-REQUEST\r\n\r\n");
    let response = decode_response(&reply).expect("decode");
    assert_eq!(response.status, 400);
    assert_eq!(response.request_id(), None);
    assert_eq!(
        response.envelope().expect("envelope").code,
        ErrorKind::JsonParse.code()
    );
}

#[test]
fn oversized_frames_are_refused_and_the_stream_recovers() {
    let mut channel = ChannelHarness::with_frame_limit(1024);
    let mut oversized =
        b"POST /api/v1/file/upload HTTP/1.1\r\nContent-Length: 4096\r\n\r\n".to_vec();
    oversized.resize(oversized.len() + 4096, b'x');
    channel
        .host
        .write_all(&oversized, support::CHANNEL_TIMEOUT)
        .expect("send oversized frame");
    channel.send("GET", handlers::PING, None, Some("after"));

    assert_eq!(channel.server.serve_once().expect("refuse"), Served::Replied);
    let refused = channel.receive();
    assert_eq!(refused.request_id(), None);
    assert_eq!(
        refused.envelope().expect("envelope").code,
        ErrorKind::InvalidParams.code()
    );

    assert_eq!(channel.server.serve_once().expect("serve"), Served::Replied);
    let pong = channel.receive();
    assert_eq!(pong.request_id(), Some("after"));
    assert_eq!(pong.envelope().expect("envelope").code, 0);
}

#[rstest]
fn quiet_channel_reports_idle(mut channel: ChannelHarness) {
    assert_eq!(channel.server.serve_once().expect("idle"), Served::Idle);
}

#[rstest]
fn queued_requests_are_answered_in_order(mut channel: ChannelHarness) {
    channel.send("GET", handlers::PING, None, Some("first"));
    channel.send("GET", handlers::SYSTEM_INFO, None, Some("second"));

    for expected in ["first", "second"] {
        assert_eq!(channel.server.serve_once().expect("serve"), Served::Replied);
        assert_eq!(channel.receive().request_id(), Some(expected));
    }
}

fn explode() -> Value {
    panic!("handler exploded")
}

fn exploding(_ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    Ok(explode())
}

#[test]
fn panicking_handlers_become_internal_faults() {
    let (guest_end, _host_end) = UnixStream::pair().expect("pair");
    let guest = UnixSocketTransport::from_stream(guest_end).expect("wrap");
    let mut router: Router<Handler> = Router::new();
    router
        .add_route("GET", "/explode", exploding)
        .expect("route");
    let mut server = Server::new(guest, router, Config::default());

    let request = encode_request("GET", "/explode", Headers::new(), None).expect("encode");
    let response = decode_response(&server.handle_frame(&request)).expect("decode");
    assert_eq!(response.status, 500);
    let envelope = response.envelope().expect("envelope");
    assert_eq!(envelope.code, 5001);
    assert_eq!(envelope.message, "Internal error in GET /explode");
}

#[test]
fn default_routes_register_cleanly() {
    let mut router: Router<Handler> = Router::new();
    register_default_routes(&mut router).expect("routes");
    assert!(router.find("POST", handlers::SHELL_EXEC).is_some());
    assert!(router.find("GET", handlers::CHUNKED_DOWNLOAD).is_some());
    assert!(router.find("POST", handlers::FILE_INFO).is_none());
}

#[rstest]
fn run_serves_until_shutdown_and_closes(mut channel: ChannelHarness) {
    let shutdown = AtomicBool::new(false);
    let flag = &shutdown;
    thread::scope(|scope| {
        let ChannelHarness { server, host, .. } = &mut channel;
        let serving = scope.spawn(move || server.run(flag));

        let bytes = encode_request("GET", handlers::PING, Headers::new(), None).expect("encode");
        host.write_all(&bytes, support::CHANNEL_TIMEOUT).expect("send");
        let frame = host.read_message(support::CHANNEL_TIMEOUT).expect("reply");
        let envelope = decode_response(&frame)
            .expect("decode")
            .envelope()
            .expect("envelope");
        assert_eq!(envelope.code, 0);

        shutdown.store(true, Ordering::SeqCst);
        let started = Instant::now();
        serving.join().expect("server thread");
        assert!(started.elapsed() < Duration::from_secs(2));
    });
    assert!(!channel.server.transport().is_open());
}
