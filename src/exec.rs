//! Process execution with timeout, cancellation, and output capture.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default command timeout in seconds, applied when a request leaves the
/// timeout unset.
pub const DEFAULT_COMMAND_TIMEOUT: u64 = 300;

/// Maximum command timeout in seconds.
pub const MAX_COMMAND_TIMEOUT: u64 = 3600;

/// Outcome of one process execution.
///
/// Spawn failures, timeouts, and cancellations are folded into
/// `success=false` with the reason in `error`; exit codes are data, never
/// surfaced as `Err`.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

impl ExecOutcome {
    fn spawn_failed(error: String) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            success: false,
            timed_out: false,
            cancelled: false,
            error: Some(error),
        }
    }
}

/// Clamp a requested timeout in seconds into `[1, MAX_COMMAND_TIMEOUT]`,
/// substituting the default for zero.
pub fn clamp_timeout(requested: u64) -> Duration {
    let secs = if requested == 0 {
        DEFAULT_COMMAND_TIMEOUT
    } else {
        requested.clamp(1, MAX_COMMAND_TIMEOUT)
    };
    Duration::from_secs(secs)
}

/// Run `command` with `args` in `work_dir`, capturing stdout and stderr
/// into separate buffers. The child is killed when the timeout elapses or
/// when `cancel` fires; partial output captured up to that point is kept.
///
/// Callers must not hold any service lock across this call.
pub async fn run(
    command: &str,
    args: &[String],
    work_dir: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ExecOutcome {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !env.is_empty() {
        // Explicit overrides replace the inherited environment entirely.
        cmd.env_clear();
        cmd.envs(env);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(command, error = %e, "failed to spawn command");
            return ExecOutcome::spawn_failed(format!("failed to spawn '{command}': {e}"));
        }
    };

    let stdout_task = tokio::spawn(drain(child.stdout.take()));
    let stderr_task = tokio::spawn(drain(child.stderr.take()));

    let timeout_sleep = tokio::time::sleep(timeout);
    tokio::pin!(timeout_sleep);

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut timeout_sleep, if !timed_out && !cancelled => {
                timed_out = true;
            }
            _ = cancel.cancelled(), if !timed_out && !cancelled => {
                cancelled = true;
            }
        }
        let _ = child.kill().await;
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let (exit_code, wait_error) = match status {
        Ok(status) => (status.code().unwrap_or(-1), None),
        Err(e) => (-1, Some(format!("failed to wait for command: {e}"))),
    };

    let error = if timed_out {
        Some(format!("command timed out after {}s", timeout.as_secs()))
    } else if cancelled {
        Some("command cancelled".to_string())
    } else {
        wait_error
    };
    let success = exit_code == 0 && error.is_none();

    info!(
        command,
        exit_code, success, timed_out, cancelled, "command finished"
    );

    ExecOutcome {
        exit_code,
        stdout,
        stderr,
        success,
        timed_out,
        cancelled,
        error,
    }
}

async fn drain<R>(reader: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}
