//! `vrpcd` guest agent binary.

use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    match vrpcd::run_agent() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            writeln!(io::stderr().lock(), "vrpcd: {error}").ok();
            ExitCode::FAILURE
        }
    }
}
