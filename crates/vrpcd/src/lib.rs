//! Guest agent for the `vrpc` host-guest channel.
//!
//! The agent owns one end of a virtio-serial port and answers HTTP-like
//! requests from the host, one at a time. Each request is routed by method
//! and path to a handler returning either the data of a success envelope or
//! a taxonomy fault; the [`Server`] loop turns both into a reply before the
//! next request is read.
//!
//! Handlers cover liveness and host telemetry, shell execution, single-shot
//! and chunked file transfer, file metadata, and systemd unit control. Every
//! filesystem path and command passes through [`handlers::policy`] first.
//!
//! Startup is staged in [`bootstrap_with`]: configuration, telemetry, the
//! channel, then the route table. [`run_agent`] wires the production
//! collaborators and serves until `SIGINT` or `SIGTERM`.

mod bootstrap;
pub mod handlers;
pub mod router;
pub mod server;
mod shutdown;
mod telemetry;
pub mod transfer;

pub use bootstrap::{
    Agent, BootstrapError, ConfigLoader, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
    run_agent,
};
pub use handlers::register_default_routes;
pub use router::{RouteError, RouteMatch, Router};
pub use server::{Handler, Params, RequestContext, Served, Server};
pub use shutdown::{SHUTDOWN_SIGNALS, ShutdownError, install_shutdown_flag};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
