//! Test suites for the host client and CLI.

pub(crate) mod support;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mockall::mock;
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use vrpc_protocol::{ErrorKind, decode_request, encode_response, routes, sha256_hex};
use vrpc_transport::{Transport, TransportError};

use crate::client::{ClientSettings, ExecOptions, RpcClient, UploadOptions};
use crate::retry::RetryPolicy;
use support::{LiveAgent, TEST_CHUNK, payload, run_cli};

mock! {
    Channel {}
    impl Transport for Channel {
        fn open(&mut self) -> Result<(), TransportError>;
        fn read_message(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
        fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError>;
        fn close(&mut self);
        fn is_open(&self) -> bool;
    }
}

const SETTINGS: ClientSettings = ClientSettings {
    read_timeout: Duration::from_secs(1),
    write_timeout: Duration::from_secs(1),
    chunk_size: 4,
};

fn reply(code: u32, data: Option<Value>) -> Vec<u8> {
    encode_response(code, None, data, None).expect("encode reply")
}

fn mock_client(channel: MockChannel, retry: RetryPolicy) -> RpcClient<MockChannel> {
    RpcClient::new(channel, SETTINGS, retry)
}

#[fixture]
fn agent() -> LiveAgent {
    LiveAgent::start()
}

#[test]
fn calls_fail_fast_when_not_connected() {
    let mut channel = MockChannel::new();
    channel.expect_is_open().return_const(false);
    channel.expect_write_all().never();
    let mut client = mock_client(channel, RetryPolicy::once());

    let fault = client
        .call("GET", routes::PING, None, None)
        .expect_err("not connected");
    assert_eq!(fault.kind(), ErrorKind::ConnectionLost);
    assert_eq!(fault.message(), "Not connected to server");
}

#[test]
fn read_timeouts_drop_the_connection() {
    let mut channel = MockChannel::new();
    channel.expect_is_open().return_const(true);
    channel.expect_write_all().times(1).returning(|_, _| Ok(()));
    channel
        .expect_read_message()
        .times(1)
        .returning(|_| Err(TransportError::ReadTimeout { received: 0 }));
    channel.expect_close().times(1).return_const(());
    let mut client = mock_client(channel, RetryPolicy::once());

    let fault = client
        .call("GET", routes::PING, None, None)
        .expect_err("timeout");
    assert_eq!(fault.code(), 6002);
}

#[test]
fn error_envelopes_become_remote_faults() {
    let mut channel = MockChannel::new();
    channel.expect_is_open().return_const(true);
    channel.expect_write_all().returning(|_, _| Ok(()));
    channel.expect_read_message().times(1).returning(|_| {
        Ok(encode_response(3002, Some("File not found: /x".to_owned()), None, None)
            .expect("encode"))
    });
    let mut client = mock_client(channel, RetryPolicy::new(3, Duration::ZERO, 2));

    let fault = client.file_info("/x").expect_err("remote fault");
    assert_eq!(fault.kind(), ErrorKind::FileNotFound);
    assert_eq!(fault.message(), "File not found: /x");
}

#[test]
fn unknown_remote_codes_fall_back_to_internal() {
    let mut channel = MockChannel::new();
    channel.expect_is_open().return_const(true);
    channel.expect_write_all().returning(|_, _| Ok(()));
    channel.expect_read_message().returning(|_| {
        Ok(encode_response(7777, Some("odd".to_owned()), Some(json!({"k": 1})), None)
            .expect("encode"))
    });
    let mut client = mock_client(channel, RetryPolicy::once());

    let fault = client
        .call("GET", routes::PING, None, None)
        .expect_err("remote fault");
    assert_eq!(fault.kind(), ErrorKind::Internal);
    assert_eq!(fault.message(), "odd");
    assert_eq!(fault.data(), Some(&json!({"k": 1})));
}

#[test]
fn idempotent_reads_retry_channel_faults() {
    let mut channel = MockChannel::new();
    channel.expect_is_open().return_const(true);
    channel.expect_write_all().returning(|_, _| Ok(()));
    channel.expect_close().return_const(());
    channel.expect_open().times(2).returning(|| Ok(()));
    let mut reads = 0_u32;
    channel.expect_read_message().times(3).returning(move |_| {
        reads += 1;
        if reads < 3 {
            Err(TransportError::ReadTimeout { received: 0 })
        } else {
            Ok(reply(0, Some(json!({"message": "pong"}))))
        }
    });
    let mut client = mock_client(channel, RetryPolicy::new(3, Duration::ZERO, 2));

    let envelope = client.ping().expect("third attempt succeeds");
    assert_eq!(envelope.data, Some(json!({"message": "pong"})));
}

#[test]
fn retries_stop_after_the_configured_attempts() {
    let mut channel = MockChannel::new();
    channel.expect_is_open().return_const(true);
    channel.expect_write_all().returning(|_, _| Ok(()));
    channel.expect_close().return_const(());
    channel.expect_open().times(1).returning(|| Ok(()));
    channel
        .expect_read_message()
        .times(2)
        .returning(|_| Err(TransportError::Closed));
    let mut client = mock_client(channel, RetryPolicy::new(2, Duration::ZERO, 2));

    let fault = client.system_status().expect_err("exhausted");
    assert_eq!(fault.code(), 6001);
}

#[test]
fn failed_chunks_abort_the_session() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = Arc::clone(&seen);
    let mut channel = MockChannel::new();
    channel.expect_is_open().return_const(true);
    channel.expect_write_all().returning(move |bytes, _| {
        let request = decode_request(bytes).expect("decode request");
        recorder.lock().expect("lock").push(request.path);
        Ok(())
    });
    let mut replies = vec![
        reply(0, Some(json!({"message": "aborted"}))),
        reply(2001, None),
        reply(0, Some(json!({"session_id": "s-1", "chunk_size": 4}))),
    ];
    channel
        .expect_read_message()
        .times(3)
        .returning(move |_| Ok(replies.pop().expect("scripted reply")));
    let mut client = mock_client(channel, RetryPolicy::once());

    let dir = tempfile::tempdir().expect("temp dir");
    let local = dir.path().join("source.bin");
    fs::write(&local, b"0123456789").expect("write source");
    let fault = client
        .chunked_upload(&local, "/tmp/target.bin", &UploadOptions::default(), |_, _| {})
        .expect_err("chunk rejected");

    assert_eq!(fault.code(), 2001);
    assert_eq!(
        *seen.lock().expect("lock"),
        vec![
            routes::CHUNKED_UPLOAD_INIT.to_owned(),
            routes::CHUNKED_UPLOAD_CHUNK.to_owned(),
            routes::CHUNKED_UPLOAD_ABORT.to_owned(),
        ]
    );
}

#[rstest]
#[case(1, Duration::from_millis(100))]
#[case(2, Duration::from_millis(200))]
#[case(3, Duration::from_millis(400))]
fn backoff_grows_geometrically(#[case] attempt: u32, #[case] expected: Duration) {
    let policy = RetryPolicy::new(4, Duration::from_millis(100), 2);
    assert_eq!(policy.delay_after(attempt), expected);
}

#[test]
fn zero_attempts_still_try_once() {
    assert_eq!(RetryPolicy::new(0, Duration::ZERO, 0).attempts(), 1);
}

#[rstest]
fn ping_reaches_a_live_agent(mut agent: LiveAgent) {
    let mut client = agent.client();
    let envelope = client.ping().expect("ping");
    assert_eq!(envelope.code, 0);
    assert_eq!(envelope.data.expect("data")["message"], "pong");
}

#[rstest]
fn exec_returns_command_output(mut agent: LiveAgent) {
    let mut client = agent.client();
    let options = ExecOptions {
        timeout: Duration::from_secs(5),
        ..ExecOptions::default()
    };
    let data = client
        .exec("echo hi", &options)
        .expect("exec")
        .data
        .expect("data");
    assert_eq!(data["exit_code"], 0);
    assert_eq!(data["stdout"], "hi\n");
}

#[rstest]
fn chunked_upload_commits_every_piece(mut agent: LiveAgent) {
    let bytes = payload(10_000);
    let local = agent.write_local("source.bin", &bytes);
    let remote = agent.remote("uploaded.bin");
    let mut client = agent.client();

    let mut updates = Vec::new();
    let envelope = client
        .chunked_upload(&local, &remote, &UploadOptions::default(), |sent, total| {
            updates.push((sent, total));
        })
        .expect("upload");

    assert_eq!(updates, vec![(4096, 10_000), (8192, 10_000), (10_000, 10_000)]);
    let data = envelope.data.expect("data");
    assert_eq!(data["sha256"], sha256_hex(&bytes));
    assert_eq!(fs::read(&remote).expect("read remote"), bytes);
}

#[rstest]
fn zero_chunk_size_falls_back_to_single_bytes(mut agent: LiveAgent) {
    let bytes = payload(10);
    let local = agent.write_local("tiny.bin", &bytes);
    let remote = agent.remote("tiny.bin");
    let settings = ClientSettings {
        chunk_size: 0,
        ..ClientSettings::from_config(agent.config())
    };
    let mut client = RpcClient::new(agent.take_host(), settings, RetryPolicy::once());
    assert_eq!(client.settings().piece_size(), 1);

    let mut pieces = 0_usize;
    let envelope = client
        .chunked_upload(&local, &remote, &UploadOptions::default(), |_, _| pieces += 1)
        .expect("upload");

    assert_eq!(pieces, 10);
    assert_eq!(envelope.data.expect("data")["chunks_received"], 10);
    assert_eq!(fs::read(&remote).expect("read remote"), bytes);
}

#[rstest]
fn chunked_download_follows_next_offset(mut agent: LiveAgent) {
    let bytes = payload(TEST_CHUNK * 2 + 17);
    agent.write_remote("large.bin", &bytes);
    let remote = agent.remote("large.bin");
    let local = agent.local("nested/large.bin");
    let mut client = agent.client();

    let mut last = (0, 0);
    let envelope = client
        .chunked_download(&remote, &local, |received, total| last = (received, total))
        .expect("download");

    let size = u64::try_from(bytes.len()).expect("size");
    assert_eq!(last, (size, size));
    assert_eq!(envelope.data.expect("data")["sha256"], sha256_hex(&bytes));
    assert_eq!(fs::read(&local).expect("read local"), bytes);
}

#[rstest]
#[case::single_shot(100)]
#[case::chunked(TEST_CHUNK * 3)]
fn download_file_picks_a_strategy_by_size(mut agent: LiveAgent, #[case] size: usize) {
    let bytes = payload(size);
    agent.write_remote("file.bin", &bytes);
    let remote = agent.remote("file.bin");
    let local = agent.local("file.bin");
    let mut client = agent.client();

    let envelope = client.download_file(&remote, &local).expect("download");
    assert_eq!(envelope.data.expect("data")["size"], json!(size));
    assert_eq!(fs::read(&local).expect("read local"), bytes);
}

#[rstest]
fn missing_remote_files_are_reported_before_transfer(mut agent: LiveAgent) {
    let remote = agent.remote("absent.bin");
    let local = agent.local("absent.bin");
    let mut client = agent.client();

    let fault = client.download_file(&remote, &local).expect_err("missing");
    assert_eq!(fault.kind(), ErrorKind::FileNotFound);
    assert_eq!(fault.message(), format!("Remote file not found: {remote}"));
    assert!(!local.exists());
}

#[rstest]
fn cli_prints_the_reply_envelope(mut agent: LiveAgent) {
    let outcome = run_cli(&mut agent, &["ping"]);
    assert!(outcome.success, "stderr: {}", outcome.stderr);
    let printed: Value = serde_json::from_str(&outcome.stdout).expect("json output");
    assert_eq!(printed["code"], 0);
    assert_eq!(printed["data"]["message"], "pong");
}

#[rstest]
fn cli_uploads_large_files_in_chunks(mut agent: LiveAgent) {
    let bytes = payload(TEST_CHUNK + 1);
    let local = agent.write_local("big.bin", &bytes);
    let remote = agent.remote("big.bin");
    let local_arg = local.to_string_lossy().into_owned();

    let outcome = run_cli(&mut agent, &["upload", &local_arg, &remote, "--mode", "0600"]);
    assert!(outcome.success, "stderr: {}", outcome.stderr);
    assert!(outcome.stdout.contains("chunks_received"));
    assert_eq!(fs::read(&remote).expect("read remote"), bytes);
}

#[rstest]
fn cli_reports_faults_with_their_code(mut agent: LiveAgent) {
    let remote = agent.remote("absent.bin");
    let local = agent.local("absent.bin").to_string_lossy().into_owned();

    let outcome = run_cli(&mut agent, &["download", &remote, &local]);
    assert!(!outcome.success);
    assert!(outcome.stdout.is_empty());
    assert!(
        outcome
            .stderr
            .starts_with("error [3002]: Remote file not found: "),
        "stderr: {}",
        outcome.stderr
    );
}

#[rstest]
fn cli_help_goes_to_stdout(mut agent: LiveAgent) {
    let outcome = run_cli(&mut agent, &["--help"]);
    assert!(outcome.success);
    assert!(outcome.stdout.contains("file-info"));
}
