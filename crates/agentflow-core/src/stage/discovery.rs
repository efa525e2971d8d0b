//! Discovery commands for dynamic stages.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;

use crate::agent::wait_for_cancel;
use crate::domain::{FlowError, Result};

/// Run `command` through `sh -c` and return its non-empty output lines, trimmed.
///
/// A non-zero exit, a timeout or cancellation is an error.
pub async fn discover(
    command: &str,
    working_dir: Option<&Path>,
    timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<Vec<String>> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let child = cmd
        .spawn()
        .map_err(|e| FlowError::Discovery(format!("failed to run {command:?}: {e}")))?;

    let output = tokio::select! {
        output = child.wait_with_output() => output,
        _ = tokio::time::sleep(timeout) => {
            return Err(FlowError::Discovery(format!(
                "{command:?} timed out after {timeout:?}"
            )));
        }
        _ = wait_for_cancel(cancel) => return Err(FlowError::Cancelled),
    };
    let output =
        output.map_err(|e| FlowError::Discovery(format!("failed to wait for {command:?}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FlowError::Discovery(format!(
            "{command:?} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
