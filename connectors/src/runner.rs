//! Bounded-timeout execution of external processes.
//!
//! Every external step (virtual environment creation, pip, tap discovery)
//! blocks its caller until the process exits or the deadline passes. A
//! timed-out process is killed; the timeout is reported as
//! [`SyncError::Timeout`] and never retried here.

use anyhow::Result;
use intake::SyncError;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// How much of a failing process's stderr is kept in error messages.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Captured output of a finished process.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Runs `program args...` to completion within `timeout`.
///
/// A non-zero exit is a [`SyncError::Connection`] carrying the tail of stderr.
pub async fn exec_cmd<S: AsRef<OsStr>>(
    label: &str,
    program: impl AsRef<Path>,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput> {
    let program = program.as_ref();
    let command_line = render_command(program, args);
    debug!(label, command = %command_line, "Running external command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SyncError::Connection(format!("failed to start [{}]: {}", command_line, e)))?;

    // Dropping the future on timeout drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result
            .map_err(|e| SyncError::Connection(format!("[{}] failed: {}", command_line, e)))?,
        Err(_) => {
            return Err(SyncError::Timeout {
                operation: format!("{} [{}]", label, command_line),
                timeout,
            }
            .into())
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    for line in stderr.lines() {
        debug!(label, "{}", line);
    }

    check_status(&command_line, output.status, &stderr)?;

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr,
    })
}

/// Maps a non-successful exit status to a [`SyncError::Connection`].
pub fn check_status(command_line: &str, status: ExitStatus, stderr: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(SyncError::Connection(format!(
        "[{}] exited with {}: {}",
        command_line,
        status,
        tail(stderr, STDERR_TAIL_BYTES)
    ))
    .into())
}

pub fn render_command<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    let mut parts = vec![program.display().to_string()];
    parts.extend(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Last `max` bytes of `s`, cut on a char boundary.
pub fn tail(s: &str, max: usize) -> &str {
    let s = s.trim_end();
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
