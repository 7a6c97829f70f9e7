//! Configuration loading for the `vrpc` CLI.
//!
//! Configuration flags are peeled off the front of the argument list and
//! handed to `ortho_config`; everything from the first other token onwards
//! is parsed by clap as the subcommand.

use std::ffi::{OsStr, OsString};

use ortho_config::OrthoConfig;
use vrpc_config::Config;

use crate::errors::AppError;

/// CLI flags recognised by the configuration loader.
///
/// Keep in sync with the host-side fields of [`Config`].
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--socket-path",
    "--log-filter",
    "--log-format",
    "--connect-timeout-ms",
    "--read-timeout-ms",
    "--write-timeout-ms",
    "--retry-attempts",
    "--retry-interval-ms",
    "--retry-backoff",
    "--chunk-size",
];

pub(crate) trait ConfigLoader {
    /// Loads configuration for the CLI.
    ///
    /// Configuration flags must appear before the subcommand. Flags after
    /// it are parsed as subcommand arguments.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        Config::load_from_iter(args.iter().cloned()).map_err(AppError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

fn process_config_flag(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Skip;
    }
    let (flag, inline_value) = text
        .split_once('=')
        .map_or((&*text, false), |(name, _)| (name, true));
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !inline_value,
        }
    } else {
        FlagAction::Skip
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_start: usize,
}

/// Separates leading configuration flags from the subcommand.
///
/// The program name is kept as the first configuration argument.
pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let mut remaining = args.iter();
    let Some(program) = remaining.next() else {
        return ConfigArgumentSplit {
            config_arguments: Vec::new(),
            command_start: 0,
        };
    };

    let mut config_arguments = vec![program.clone()];
    let mut command_start = 1_usize;
    let mut awaiting_value = false;
    for argument in remaining {
        if awaiting_value {
            awaiting_value = false;
        } else {
            match process_config_flag(argument) {
                FlagAction::Include { needs_value } => awaiting_value = needs_value,
                FlagAction::Skip => break,
            }
        }
        config_arguments.push(argument.clone());
        command_start = command_start.saturating_add(1);
    }

    ConfigArgumentSplit {
        config_arguments,
        command_start,
    }
}

/// Program name followed by the subcommand tokens.
pub(crate) fn command_arguments(args: &[OsString], split: &ConfigArgumentSplit) -> Vec<OsString> {
    args.first()
        .into_iter()
        .chain(args.iter().skip(split.command_start))
        .cloned()
        .collect()
}
