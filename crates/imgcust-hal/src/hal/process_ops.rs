//! Process execution helpers.
//!
//! External commands are considered "world-touching" and must go through the HAL so we can
//! test workflows without spawning real processes.

use crate::HalResult;
use std::process::Output;

/// Process execution trait (external command runner).
///
/// Implementations return `HalError::CommandFailed` for a non-zero exit, carrying the
/// program name, exit code and stderr. Commands run to completion; there is no timeout.
pub trait ProcessOps {
    fn command_output(&self, program: &str, args: &[&str]) -> HalResult<Output>;
}
