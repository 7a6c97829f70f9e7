//! Crate-level tests exercising transports together with the codec.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde_json::json;
use vrpc_protocol::{Headers, decode_request, decode_response, encode_request, encode_response};

use crate::{Transport, UnixSocketTransport};


#[test]
fn encoded_request_survives_the_channel() {
    let (local, mut peer) = UnixStream::pair().expect("socket pair");
    let mut transport = UnixSocketTransport::from_stream(local).expect("wrap");
    let body = json!({"path": "/tmp/a.txt", "offset": 0});
    let bytes = encode_request("POST", "/api/v1/file/download", Headers::new(), Some(&body))
        .expect("encode");

    for piece in bytes.chunks(7) {
        peer.write_all(piece).expect("write piece");
    }

    let frame = transport
        .read_message(Duration::from_secs(2))
        .expect("read frame");
    let request = decode_request(&frame).expect("decode");
    assert_eq!(request.path, "/api/v1/file/download");
    assert_eq!(request.body, Some(body));
}

#[test]
fn response_written_through_transport_decodes() {
    let (local, peer) = UnixStream::pair().expect("socket pair");
    let mut sender = UnixSocketTransport::from_stream(local).expect("wrap sender");
    let mut receiver = UnixSocketTransport::from_stream(peer).expect("wrap receiver");
    let bytes =
        encode_response(0, None, Some(json!({"message": "pong"})), Some("id-1")).expect("encode");

    sender
        .write_all(&bytes, Duration::from_secs(1))
        .expect("write");
    let frame = receiver
        .read_message(Duration::from_secs(1))
        .expect("read");
    let response = decode_response(&frame).expect("decode");
    assert_eq!(response.status, 200);
    assert_eq!(response.request_id(), Some("id-1"));
}

#[test]
fn boxed_transports_delegate() {
    let (local, _peer) = UnixStream::pair().expect("socket pair");
    let mut boxed: Box<dyn Transport> =
        Box::new(UnixSocketTransport::from_stream(local).expect("wrap"));
    assert!(boxed.is_open());
    boxed.close();
    assert!(!boxed.is_open());
}
