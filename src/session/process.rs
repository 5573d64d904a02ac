use std::process::{Command, Stdio};
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Builder;

use crate::error::TransportError;
use crate::session::transport::CommandOutput;

/// Run a prepared command to completion, capturing its output
///
/// Blocks the caller. The child runs under a single-threaded tokio runtime so the timeout can
/// bound `output()` as a whole; a child still running at the deadline is killed.
pub fn run_command(cmd: Command, label: &str, timeout: Option<Duration>) -> Result<CommandOutput, TransportError> {
    debug!("{:?}", &cmd);
    let process_error = |source: std::io::Error| TransportError::Process { command: label.to_string(), source };
    let runtime = Builder::new_current_thread().enable_all().build().map_err(process_error)?;

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let output = runtime.block_on(async {
        match timeout {
            None => Ok(cmd.output().await),
            Some(timeout) => tokio::time::timeout(timeout, cmd.output()).await.map_err(|_| timeout),
        }
    });

    match output {
        Ok(Ok(output)) => Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        }),
        Ok(Err(source)) => Err(process_error(source)),
        Err(timeout) => {
            warn!("'{label}' timed out after {timeout:?}, killed it");
            Err(TransportError::Timeout { command: label.to_string(), timeout })
        }
    }
}
