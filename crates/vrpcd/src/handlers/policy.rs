//! Path and command restrictions enforced by the handlers.

use std::collections::HashSet;
use std::env;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tracing::warn;
use vrpc_config::Config;
use vrpc_protocol::RpcFault;

use super::HANDLER_TARGET;

/// Prefixes that are never readable or writable.
pub const FORBIDDEN_PATHS: &[&str] = &["/etc/shadow", "/etc/sudoers", "/root/.ssh/", "/proc/", "/sys/"];

/// Substrings that reject a shell command outright.
pub const DANGEROUS_SEQUENCES: &[&str] = &[";", "&&", "||", "`", "$(", "${", "\n", "\r"];

/// Restrictions shared by every handler, built once at startup.
#[derive(Debug, Clone)]
pub struct AgentPolicy {
    /// Filesystem restrictions.
    pub paths: PathPolicy,
    /// Shell command restrictions.
    pub commands: CommandPolicy,
}

impl AgentPolicy {
    /// Derives the policy from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            paths: PathPolicy::new(config.allowed_paths()),
            commands: CommandPolicy::new(config.allowed_commands()),
        }
    }
}

/// Restricts filesystem access to allowed roots.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    allowed: Vec<Utf8PathBuf>,
}

impl PathPolicy {
    /// Creates a policy allowing access beneath `allowed` roots.
    #[must_use]
    pub fn new(allowed: Vec<Utf8PathBuf>) -> Self {
        let allowed = allowed
            .iter()
            .map(|root| normalize(root))
            .collect();
        Self { allowed }
    }

    /// Resolves `raw` to an absolute, lexically normalised path and checks
    /// it against the policy.
    ///
    /// # Errors
    ///
    /// Returns `4001` for forbidden paths and paths outside every allowed
    /// root.
    pub fn resolve(&self, raw: &str) -> Result<Utf8PathBuf, RpcFault> {
        let resolved = absolutize(Utf8Path::new(raw));
        if is_forbidden(&resolved) {
            warn!(target: HANDLER_TARGET, path = raw, "forbidden path requested");
            return Err(RpcFault::permission_denied(format!("Access denied: {raw}")));
        }
        if !self.allowed.iter().any(|root| resolved.starts_with(root)) {
            warn!(target: HANDLER_TARGET, path = raw, "path outside allowed roots");
            return Err(RpcFault::permission_denied(format!(
                "Path not in allowed list: {raw}"
            )));
        }
        Ok(resolved)
    }
}

fn is_forbidden(path: &Utf8Path) -> bool {
    let text = path.as_str();
    FORBIDDEN_PATHS.iter().any(|forbidden| {
        text.starts_with(forbidden) || text == forbidden.trim_end_matches('/')
    })
}

fn absolutize(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        return normalize(path);
    }
    let base = env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("/"));
    normalize(&base.join(path))
}

/// Removes `.` and `..` components without touching the filesystem.
#[must_use]
pub fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut normalized = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir => {
                normalized.push(component.as_str());
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                normalized.pop();
            }
            Utf8Component::Normal(part) => normalized.push(part),
        }
    }
    if normalized.as_str().is_empty() {
        normalized.push("/");
    }
    normalized
}

/// Restricts shell commands to an allow-list of programs.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: HashSet<String>,
}

impl CommandPolicy {
    /// Creates a policy allowing the named programs.
    #[must_use]
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Checks `command` against the dangerous sequences and the allow-list.
    ///
    /// # Errors
    ///
    /// Returns `4001` naming the program when the command is rejected.
    pub fn check(&self, command: &str) -> Result<(), RpcFault> {
        let program = program_name(command);
        let denied = || RpcFault::permission_denied(format!("Command not allowed: {program}"));
        if let Some(sequence) = DANGEROUS_SEQUENCES
            .iter()
            .find(|sequence| command.contains(**sequence))
        {
            warn!(target: HANDLER_TARGET, sequence = sequence.escape_debug().to_string(), "dangerous sequence in command");
            return Err(denied());
        }
        if !self.allowed.contains(program) {
            warn!(target: HANDLER_TARGET, program, "command not in allow-list");
            return Err(denied());
        }
        Ok(())
    }
}

/// Basename of the first word of `command`, without surrounding quotes.
fn program_name(command: &str) -> &str {
    let first = command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(['"', '\'']);
    first.rsplit('/').next().unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use vrpc_protocol::ErrorKind;

    use super::*;

    fn paths() -> PathPolicy {
        PathPolicy::new(vec![Utf8PathBuf::from("/tmp/"), Utf8PathBuf::from("/home/")])
    }

    #[rstest]
    #[case("/tmp/a.txt", "/tmp/a.txt")]
    #[case("/tmp/./x/../a.txt", "/tmp/a.txt")]
    #[case("/home/user/", "/home/user")]
    fn allowed_paths_resolve(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(paths().resolve(raw).expect("allowed"), Utf8PathBuf::from(expected));
    }

    #[rstest]
    #[case::escape("/tmp/../etc/passwd")]
    #[case::outside("/var/lib/x")]
    #[case::sibling_prefix("/tmpfoo/x")]
    #[case::forbidden("/proc/self/environ")]
    #[case::forbidden_exact("/etc/shadow")]
    fn rejected_paths_are_permission_faults(#[case] raw: &str) {
        let fault = paths().resolve(raw).expect_err("denied");
        assert_eq!(fault.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn forbidden_prefixes_beat_allowed_roots() {
        let policy = PathPolicy::new(vec![Utf8PathBuf::from("/")]);
        assert!(policy.resolve("/root/.ssh/id_rsa").is_err());
        assert!(policy.resolve("/etc/sudoers").is_err());
        assert!(policy.resolve("/etc/hostname").is_ok());
    }

    #[test]
    fn normalisation_never_climbs_above_root() {
        assert_eq!(normalize(Utf8Path::new("/../../tmp")), Utf8PathBuf::from("/tmp"));
    }

    fn commands() -> CommandPolicy {
        CommandPolicy::new(["echo".to_owned(), "ls".to_owned()])
    }

    #[rstest]
    #[case("echo hi")]
    #[case("/bin/ls -la /tmp")]
    #[case("ls /tmp | wc -l")]
    fn allowed_commands_pass(#[case] command: &str) {
        commands().check(command).expect("allowed");
    }

    #[rstest]
    #[case::chained("echo hi; rm -rf /")]
    #[case::and("echo a && echo b")]
    #[case::or("echo a || echo b")]
    #[case::backtick("echo `id`")]
    #[case::substitution("echo $(id)")]
    #[case::expansion("echo ${HOME}")]
    #[case::newline("echo a\nrm x")]
    #[case::unlisted("rm -rf /tmp/x")]
    #[case::empty("")]
    fn rejected_commands_are_permission_faults(#[case] command: &str) {
        let fault = commands().check(command).expect_err("denied");
        assert_eq!(fault.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn rejection_names_the_program() {
        let fault = commands().check("/usr/bin/rm x").expect_err("denied");
        assert_eq!(fault.message(), "Command not allowed: rm");
    }
}
