//! systemd unit control through `systemctl`.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::warn;
use vrpc_protocol::{ErrorKind, RpcFault};

use super::HANDLER_TARGET;
use super::shell::{ExecOutput, ExecRequest, run_command};
use crate::server::RequestContext;

/// Actions accepted by `service/control`.
pub const ALLOWED_ACTIONS: &[&str] = &[
    "start", "stop", "restart", "status", "enable", "disable", "reload",
];

const ACTION_TIMEOUT: Duration = Duration::from_secs(30);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Point-in-time view of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Unit name as requested.
    pub name: String,
    /// Output of `systemctl is-active`, or `unknown`.
    pub status: String,
    /// Whether the unit is active.
    pub active: bool,
    /// Whether the unit is enabled.
    pub enabled: bool,
    /// Main process id, if running.
    pub pid: Option<u32>,
    /// Unit description.
    pub description: String,
    /// systemd sub-state, if reported.
    pub sub_state: Option<String>,
}

impl ServiceStatus {
    fn unknown(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: "unknown".to_owned(),
            active: false,
            enabled: false,
            pid: None,
            description: String::new(),
            sub_state: None,
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "status": self.status,
            "active": self.active,
            "enabled": self.enabled,
            "pid": self.pid,
            "description": self.description,
            "sub_state": self.sub_state,
        })
    }

    /// Folds `systemctl show` `Key=Value` output into the status.
    fn apply_show_output(&mut self, output: &str) {
        for (key, value) in output.lines().filter_map(|line| line.split_once('=')) {
            match key {
                "MainPID" => self.pid = value.trim().parse().ok().filter(|pid| *pid > 0),
                "Description" => value.clone_into(&mut self.description),
                "SubState" => self.sub_state = Some(value.to_owned()),
                _ => {}
            }
        }
    }
}

/// Runs `{name, action="status"}` against a unit.
///
/// # Errors
///
/// Returns `2003` without a name, `2001` for an unknown action or a name
/// outside `[A-Za-z0-9-_.@]`, and `1001` with `{exit_code, stderr, status}`
/// when `systemctl` reports failure.
pub fn control(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let name = params.required_string("name")?;
    let action = params
        .string("action")?
        .unwrap_or("status")
        .to_ascii_lowercase();
    if !ALLOWED_ACTIONS.contains(&action.as_str()) {
        return Err(RpcFault::invalid_params(format!(
            "Invalid action: {action}. Allowed: {}",
            ALLOWED_ACTIONS.join(", ")
        )));
    }
    if !is_valid_unit_name(name) {
        return Err(RpcFault::invalid_params(format!(
            "Invalid service name: {name}"
        )));
    }
    if action == "status" {
        return Ok(query_status(name).to_value());
    }

    let outcome = systemctl(&format!("{action} {name}"), ACTION_TIMEOUT)?;
    let status = query_status(name);
    if outcome.exit_code != 0 {
        warn!(target: HANDLER_TARGET, name, action = %action, exit_code = outcome.exit_code, "systemctl failed");
        return Err(RpcFault::with_message(
            ErrorKind::CommandFailed,
            format!("Failed to {action} service {name}"),
        )
        .with_data(json!({
            "exit_code": outcome.exit_code,
            "stderr": outcome.stderr,
            "status": status.to_value(),
        })));
    }
    Ok(json!({
        "name": name,
        "action": action,
        "success": true,
        "status": status.status,
        "active": status.active,
        "enabled": status.enabled,
        "pid": status.pid,
    }))
}

/// Unit names are non-empty and limited to shell-inert characters.
#[must_use]
pub fn is_valid_unit_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@'))
}

fn query_status(name: &str) -> ServiceStatus {
    let mut status = ServiceStatus::unknown(name);
    let Ok(active) = systemctl(&format!("is-active {name}"), QUERY_TIMEOUT) else {
        return status;
    };
    let state = active.stdout.trim();
    if !state.is_empty() {
        state.clone_into(&mut status.status);
    }
    status.active = state == "active";
    if let Ok(enabled) = systemctl(&format!("is-enabled {name}"), QUERY_TIMEOUT) {
        status.enabled = enabled.stdout.trim() == "enabled";
    }
    if let Ok(show) = systemctl(
        &format!("show {name} --property=MainPID,Description,ActiveState,SubState"),
        QUERY_TIMEOUT,
    ) {
        status.apply_show_output(&show.stdout);
    }
    status
}

fn systemctl(arguments: &str, timeout: Duration) -> Result<ExecOutput, RpcFault> {
    run_command(&ExecRequest {
        command: format!("systemctl {arguments}"),
        timeout,
        working_dir: None,
        env: Vec::new(),
    })
    .inspect_err(|fault| {
        warn!(target: HANDLER_TARGET, arguments, error = %fault, "systemctl unavailable");
    })
}
