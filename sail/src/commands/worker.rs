//! Worker-protocol child process.

use anyhow::Result;

/// Serves the worker pool protocol on stdin/stdout until the parent closes
/// the pipe.
pub fn cmd_worker() -> Result<i32> {
    sail_core::worker::serve(std::io::stdin().lock(), std::io::stdout().lock())?;
    Ok(0)
}
