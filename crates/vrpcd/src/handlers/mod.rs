//! Route handlers and the default route table.
//!
//! Handlers are plain functions with the [`Handler`] signature. They know
//! nothing about framing or the channel; the server loop wraps whatever they
//! return in an envelope.

pub mod file;
pub mod policy;
pub mod service;
pub mod shell;
pub mod system;

use vrpc_protocol::RpcFault;

use crate::router::{RouteError, Router};
use crate::server::Handler;
use crate::transfer;

pub use vrpc_protocol::routes::{
    CHUNKED_DOWNLOAD, CHUNKED_UPLOAD_ABORT, CHUNKED_UPLOAD_CHUNK, CHUNKED_UPLOAD_FINISH,
    CHUNKED_UPLOAD_INIT, FILE_DOWNLOAD, FILE_INFO, FILE_UPLOAD, PING, SERVICE_CONTROL,
    SHELL_EXEC, SYSTEM_INFO, SYSTEM_STATUS,
};

/// Tracing target for handler diagnostics.
pub(crate) const HANDLER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handlers");

/// Registers every built-in route in its canonical order.
///
/// # Errors
///
/// Returns [`RouteError`] if a built-in pattern fails to compile.
pub fn register_default_routes(router: &mut Router<Handler>) -> Result<(), RouteError> {
    let table: [(&str, &str, Handler); 14] = [
        ("GET", PING, system::ping),
        ("GET", SYSTEM_INFO, system::info),
        ("GET", SYSTEM_STATUS, system::status),
        ("POST", SHELL_EXEC, shell::exec),
        ("POST", FILE_UPLOAD, file::upload),
        ("POST", FILE_DOWNLOAD, file::download),
        ("GET", FILE_INFO, file::info),
        ("POST", CHUNKED_UPLOAD_INIT, transfer::upload_init),
        ("POST", CHUNKED_UPLOAD_CHUNK, transfer::upload_chunk),
        ("POST", CHUNKED_UPLOAD_FINISH, transfer::upload_finish),
        ("POST", CHUNKED_UPLOAD_ABORT, transfer::upload_abort),
        ("POST", CHUNKED_DOWNLOAD, transfer::download),
        ("GET", CHUNKED_DOWNLOAD, transfer::download),
        ("POST", SERVICE_CONTROL, service::control),
    ];
    for (method, pattern, handler) in table {
        router.add_route(method, pattern, handler)?;
    }
    Ok(())
}

/// `part / whole` as a percentage rounded to two decimal places.
///
/// An empty `whole` counts as complete.
#[expect(
    clippy::float_arithmetic,
    clippy::cast_precision_loss,
    reason = "percentages are reported as JSON floats"
)]
pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 100.0;
    }
    let ratio = part as f64 / whole as f64 * 100.0;
    (ratio * 100.0).round() / 100.0
}

/// Parses an octal permission string such as `"0644"`.
pub(crate) fn parse_mode(raw: &str) -> Result<u32, RpcFault> {
    let digits = raw.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| RpcFault::invalid_params(format!("Invalid mode: {raw}")))
}
