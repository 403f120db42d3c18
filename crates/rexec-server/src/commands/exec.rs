//! Child-process execution with a wall-clock bound.
//!
//! Output is captured as text: stdout followed by stderr, decoded lossily.
//! When the bound expires the child is not killed; it keeps running detached
//! and the caller only gets a timeout error.

use rexec_core::{decode_lossy, RexecError, RexecResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Run a fixed argv, no shell involved.
pub async fn run_argv(argv: &[String], timeout: Duration) -> RexecResult<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RexecError::Execution("empty command".into()))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    capture(cmd, program, timeout).await
}

/// Run a full command line through the platform command interpreter.
pub async fn run_shell_line(line: &str, timeout: Duration) -> RexecResult<String> {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(line);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        cmd
    };
    capture(cmd, line, timeout).await
}

async fn capture(mut cmd: Command, label: &str, timeout: Duration) -> RexecResult<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    debug!(command = %label, "executing");

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            warn!(command = %label, ?timeout, "command timed out, leaving it running");
            RexecError::Timeout(timeout)
        })?
        .map_err(|e| RexecError::Execution(format!("failed to run '{label}': {e}")))?;

    if !output.status.success() {
        debug!(command = %label, status = %output.status, "command exited with failure");
    }

    let mut text = decode_lossy(&output.stdout);
    text.push_str(&decode_lossy(&output.stderr));
    Ok(text)
}
