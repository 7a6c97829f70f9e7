//! Fixtures running a real agent on the far end of a socket pair.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tempfile::TempDir;
use vrpc_config::Config;
use vrpc_transport::UnixSocketTransport;
use vrpcd::Server;

use crate::client::RpcClient;
use crate::config::ConfigLoader;
use crate::errors::AppError;
use crate::{Connector, run_with};

/// Piece size small enough to force several chunks in tests.
pub(crate) const TEST_CHUNK: usize = 4096;

/// Bytes with a repeating, non-trivial pattern.
pub(crate) fn payload(size: usize) -> Vec<u8> {
    (0..=250_u8).cycle().take(size).collect()
}

/// A `vrpcd` server thread whose only allowed root is a scratch directory.
pub(crate) struct LiveAgent {
    guest_dir: TempDir,
    host_dir: TempDir,
    config: Config,
    host: Option<UnixSocketTransport>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LiveAgent {
    pub(crate) fn start() -> Self {
        let guest_dir = TempDir::new().expect("guest dir");
        let host_dir = TempDir::new().expect("host dir");
        let config = Config {
            allowed_paths: vec![guest_dir.path().to_string_lossy().into_owned()],
            chunk_size: TEST_CHUNK,
            idle_poll_ms: 50,
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            retry_attempts: 1,
            retry_interval_ms: 0,
            log_filter: "warn".to_owned(),
            ..Config::default()
        };

        let (guest_end, host_end) = UnixStream::pair().expect("socket pair");
        let guest = UnixSocketTransport::from_stream(guest_end).expect("guest end");
        let mut server =
            Server::with_default_routes(guest, config.clone()).expect("default routes");
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let worker = thread::spawn(move || server.run(&flag));

        Self {
            guest_dir,
            host_dir,
            config,
            host: Some(UnixSocketTransport::from_stream(host_end).expect("host end")),
            shutdown,
            worker: Some(worker),
        }
    }

    pub(crate) const fn config(&self) -> &Config {
        &self.config
    }

    /// Hands out the host end of the channel. Only one client per agent.
    pub(crate) fn take_host(&mut self) -> UnixSocketTransport {
        self.host.take().expect("host end already taken")
    }

    pub(crate) fn client(&mut self) -> RpcClient<UnixSocketTransport> {
        let host = self.take_host();
        RpcClient::from_config(host, &self.config)
    }

    /// Path of `name` on the guest side.
    pub(crate) fn remote(&self, name: &str) -> String {
        self.guest_dir.path().join(name).to_string_lossy().into_owned()
    }

    /// Path of `name` on the host side.
    pub(crate) fn local(&self, name: &str) -> PathBuf {
        self.host_dir.path().join(name)
    }

    pub(crate) fn write_remote(&self, name: &str, bytes: &[u8]) {
        fs::write(self.remote(name), bytes).expect("write guest file");
    }

    pub(crate) fn write_local(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.local(name);
        fs::write(&path, bytes).expect("write host file");
        path
    }
}

impl Drop for LiveAgent {
    fn drop(&mut self) {
        self.host = None;
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

/// Loader returning a fixed configuration.
pub(crate) struct StaticLoader(pub(crate) Config);

impl ConfigLoader for StaticLoader {
    fn load(&self, _args: &[OsString]) -> Result<Config, AppError> {
        Ok(self.0.clone())
    }
}

/// Connector handing out one pre-connected transport.
pub(crate) struct PairConnector(RefCell<Option<UnixSocketTransport>>);

impl PairConnector {
    pub(crate) fn new(transport: UnixSocketTransport) -> Self {
        Self(RefCell::new(Some(transport)))
    }
}

impl Connector for PairConnector {
    type Channel = UnixSocketTransport;

    fn channel(&self, _config: &Config) -> Self::Channel {
        self.0.borrow_mut().take().expect("connector used once")
    }
}

/// Captured result of one CLI invocation.
pub(crate) struct CliOutcome {
    pub(crate) success: bool,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

/// Runs the CLI against `agent` with `args` after the program name.
pub(crate) fn run_cli(agent: &mut LiveAgent, args: &[&str]) -> CliOutcome {
    let loader = StaticLoader(agent.config().clone());
    let connector = PairConnector::new(agent.take_host());
    let arguments = std::iter::once("vrpc")
        .chain(args.iter().copied())
        .map(OsString::from);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = run_with(arguments, &mut stdout, &mut stderr, &loader, &connector);
    CliOutcome {
        success: code == std::process::ExitCode::SUCCESS,
        stdout: String::from_utf8(stdout).expect("utf-8 stdout"),
        stderr: String::from_utf8(stderr).expect("utf-8 stderr"),
    }
}
