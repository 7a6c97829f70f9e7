//! Agent bootstrap orchestration.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;
use tracing::info;

use vrpc_config::Config;
use vrpc_transport::{CharDeviceTransport, Transport, TransportError};

use crate::router::RouteError;
use crate::server::{SERVER_TARGET, Server};
use crate::shutdown::{ShutdownError, install_shutdown_flag};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader {
    /// Loads the agent configuration.
    ///
    /// # Errors
    ///
    /// Returns the loader's error when no valid configuration can be built.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The channel could not be opened.
    #[error("failed to open channel: {source}")]
    Channel {
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// A built-in route failed to compile.
    #[error("failed to register routes: {source}")]
    Routes {
        /// Underlying routing error.
        #[source]
        source: RouteError,
    },
    /// Signal handlers could not be installed.
    #[error(transparent)]
    Signals(#[from] ShutdownError),
}

/// A bootstrapped agent, ready to serve.
pub struct Agent<T> {
    server: Server<T>,
    telemetry: TelemetryHandle,
}

impl<T: Transport> Agent<T> {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        self.server.config()
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Borrows the request loop.
    #[must_use]
    pub const fn server(&self) -> &Server<T> {
        &self.server
    }

    /// Serves requests until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        self.server.run(shutdown);
    }
}

/// Bootstraps the agent using the supplied collaborators.
///
/// `make_transport` builds the channel from the resolved configuration; it
/// is opened before the agent is returned.
///
/// # Errors
///
/// Returns [`BootstrapError`] naming the first stage that failed.
pub fn bootstrap_with<T, F>(
    loader: &dyn ConfigLoader,
    make_transport: F,
) -> Result<Agent<T>, BootstrapError>
where
    T: Transport,
    F: FnOnce(&Config) -> T,
{
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;

    let mut transport = make_transport(&config);
    transport
        .open()
        .map_err(|source| BootstrapError::Channel { source })?;

    let server = Server::with_default_routes(transport, config)
        .map_err(|source| BootstrapError::Routes { source })?;
    info!(
        target: SERVER_TARGET,
        routes = server.router().len(),
        "agent bootstrapped"
    );
    Ok(Agent { server, telemetry })
}

/// Loads configuration, opens the guest device, and serves until
/// `SIGINT` or `SIGTERM`.
///
/// # Errors
///
/// Returns [`BootstrapError`] when any startup stage fails.
pub fn run_agent() -> Result<(), BootstrapError> {
    let mut agent = bootstrap_with(&SystemConfigLoader, |config| {
        CharDeviceTransport::new(config.device_path().as_std_path())
    })?;
    let shutdown = install_shutdown_flag()?;
    info!(
        target: SERVER_TARGET,
        device = %agent.config().device_path(),
        "agent listening"
    );
    agent.run(&shutdown);
    Ok(())
}
