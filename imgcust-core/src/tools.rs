//! External tool invocation for pipeline stages.

use imgcust_error::{ImageError, ImageResult};
use imgcust_hal::ProcessOps;
use std::process::Output;

/// Run `program` for `stage`, logging its stdout line by line.
///
/// A failure becomes [`ImageError::ExternalTool`] naming the stage; the wrapped HAL error
/// carries the program, exit code and stderr.
pub fn run_tool<H: ProcessOps + ?Sized>(
    hal: &H,
    stage: &str,
    program: &str,
    args: &[&str],
) -> ImageResult<Output> {
    log::info!("[{}] {} {}", stage, program, args.join(" "));
    let output = hal
        .command_output(program, args)
        .map_err(|e| ImageError::tool(stage, e))?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        log::debug!("[{}] {}", program, line);
    }
    Ok(output)
}
