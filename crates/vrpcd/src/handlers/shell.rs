//! Shell command execution.
//!
//! Commands run through `sh -c` in their own process group so a timeout can
//! kill the whole pipeline, including grandchildren that still hold the
//! output pipes.

use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, info, warn};
use vrpc_protocol::{ErrorKind, RpcFault};

use super::HANDLER_TARGET;
use crate::server::RequestContext;

/// Deadline applied when a request does not name one.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// A validated command ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Command line passed to `sh -c`.
    pub command: String,
    /// Hard deadline for the whole process group.
    pub timeout: Duration,
    /// Directory to run in, if not the agent's own.
    pub working_dir: Option<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, or the negated signal number for signalled processes.
    pub exit_code: i32,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
    /// Wall-clock run time.
    pub duration: Duration,
}

/// Runs `{command, timeout, working_dir?, env?}` and reports its output.
///
/// A non-zero exit is still a successful call; the exit code is part of the
/// result.
///
/// # Errors
///
/// Returns `2003` without a command, `4001` when policy rejects it, `3002`
/// for a missing working directory, `1002` on timeout and `1001`/`1003` when
/// the shell cannot be started.
pub fn exec(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let command = params.required_string("command")?;
    let timeout_secs = params
        .unsigned("timeout")?
        .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
    let working_dir = params.string("working_dir")?.filter(|dir| !dir.is_empty());
    let env = params
        .object("env")?
        .map(|vars| {
            vars.iter()
                .map(|(key, value)| match value {
                    Value::String(text) => Ok((key.clone(), text.clone())),
                    Value::Number(_) | Value::Bool(_) => Ok((key.clone(), value.to_string())),
                    _ => Err(RpcFault::invalid_params(format!(
                        "Invalid environment value for {key}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    ctx.policy.commands.check(command)?;
    if let Some(dir) = working_dir.filter(|dir| !Path::new(dir).is_dir()) {
        return Err(RpcFault::with_message(
            ErrorKind::FileNotFound,
            format!("Working directory not found: {dir}"),
        ));
    }

    let output = run_command(&ExecRequest {
        command: command.to_owned(),
        timeout: Duration::from_secs(timeout_secs),
        working_dir: working_dir.map(str::to_owned),
        env,
    })?;
    Ok(json!({
        "exit_code": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
        "duration_ms": millis(output.duration),
    }))
}

/// Runs a command without policy checks, enforcing its deadline.
///
/// # Errors
///
/// Returns `1002` with `{timeout, duration_ms}` data when the deadline
/// passes, `1003` when the shell binary is missing, and `1001` for other
/// spawn or wait failures.
pub fn run_command(request: &ExecRequest) -> Result<ExecOutput, RpcFault> {
    let started = Instant::now();
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&request.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(request.env.iter().map(|(key, value)| (key, value)))
        .process_group(0);
    if let Some(dir) = &request.working_dir {
        command.current_dir(dir);
    }
    debug!(target: HANDLER_TARGET, command = %request.command, "spawning shell command");
    let mut child = command.spawn().map_err(|error| spawn_fault(&error))?;
    let deadline = started.checked_add(request.timeout);
    let pipes = PipeDrain::start(&mut child);

    let status = match wait_with_deadline(&mut child, deadline) {
        Ok(Some(status)) => status,
        Ok(None) => {
            kill_group(&mut child);
            return Err(timeout_fault(request, started.elapsed()));
        }
        Err(error) => {
            kill_group(&mut child);
            return Err(RpcFault::with_message(
                ErrorKind::CommandFailed,
                format!("Command execution failed: {error}"),
            ));
        }
    };

    // Background jobs inherit the pipes and keep them open after `sh` exits.
    let Some(captured) = pipes.finish(deadline) else {
        kill_group(&mut child);
        return Err(timeout_fault(request, started.elapsed()));
    };

    let output = ExecOutput {
        exit_code: exit_code(status),
        stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&captured.stderr).into_owned(),
        duration: started.elapsed(),
    };
    info!(
        target: HANDLER_TARGET,
        command = %request.command,
        exit_code = output.exit_code,
        elapsed_ms = millis(output.duration),
        "command finished"
    );
    Ok(output)
}

fn timeout_fault(request: &ExecRequest, elapsed: Duration) -> RpcFault {
    warn!(
        target: HANDLER_TARGET,
        command = %request.command,
        timeout_ms = millis(request.timeout),
        "command timed out"
    );
    RpcFault::with_message(
        ErrorKind::CommandTimeout,
        format!("Command timed out after {} seconds", request.timeout.as_secs()),
    )
    .with_data(json!({
        "timeout": request.timeout.as_secs(),
        "duration_ms": millis(elapsed),
    }))
}

/// Polls the child until it exits or `deadline` passes. `None` never expires.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|limit| Instant::now() >= limit) {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}

/// Kills the child's process group, then reaps the child.
fn kill_group(child: &mut Child) {
    if let Some(group) = libc::pid_t::try_from(child.id())
        .ok()
        .and_then(libc::pid_t::checked_neg)
    {
        // SAFETY: signalling a process group has no memory-safety
        // preconditions; failure only means the group is already gone.
        unsafe {
            libc::kill(group, libc::SIGKILL);
        }
    }
    child.kill().ok();
    child.wait().ok();
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Reader threads draining the child's output pipes.
struct PipeDrain {
    receiver: Receiver<(Pipe, Vec<u8>)>,
    pending: usize,
}

impl PipeDrain {
    fn start(child: &mut Child) -> Self {
        let (sender, receiver) = mpsc::channel();
        let mut pending = 0_usize;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(Pipe::Stdout, stdout, sender.clone());
            pending = pending.saturating_add(1);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(Pipe::Stderr, stderr, sender);
            pending = pending.saturating_add(1);
        }
        Self { receiver, pending }
    }

    /// Waits for both pipes to reach end of file. `None` once `deadline`
    /// passes with a pipe still open.
    fn finish(self, deadline: Option<Instant>) -> Option<Captured> {
        let mut captured = Captured::default();
        for _ in 0..self.pending {
            let received = match deadline {
                Some(limit) => self
                    .receiver
                    .recv_timeout(limit.saturating_duration_since(Instant::now())),
                None => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((Pipe::Stdout, bytes)) => captured.stdout = bytes,
                Ok((Pipe::Stderr, bytes)) => captured.stderr = bytes,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Some(captured)
    }
}

fn spawn_reader<R>(pipe: Pipe, mut reader: R, sender: Sender<(Pipe, Vec<u8>)>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).ok();
        sender.send((pipe, buffer)).ok();
    });
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(i32::saturating_neg))
        .unwrap_or(-1)
}

fn spawn_fault(error: &io::Error) -> RpcFault {
    if error.kind() == io::ErrorKind::NotFound {
        RpcFault::with_message(ErrorKind::CommandNotFound, "Command not found: sh")
    } else {
        RpcFault::with_message(
            ErrorKind::CommandFailed,
            format!("Command execution failed: {error}"),
        )
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
