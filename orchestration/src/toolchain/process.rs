//! Subprocess execution with timeout and cancellation
//!
//! Every external invocation (compile, upload, library install, port
//! listing) goes through [`run_command`]. Children get their own process
//! group on Unix. On timeout or cancellation the whole group is sent SIGKILL
//! (uploaders such as avrdude run as grandchildren and hold the serial port),
//! and `kill_on_drop` reaps the direct child.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a subprocess ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum ProcessStatus {
    /// Exited on its own (None = killed by a signal)
    Exited(Option<i32>),
    /// Killed after exceeding its time budget
    TimedOut,
}

impl ProcessStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(Some(0)))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => *code,
            Self::TimedOut => None,
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(Some(code)) => write!(f, "exit {code}"),
            Self::Exited(None) => write!(f, "killed by signal"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Captured output of a finished subprocess
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// stdout followed by stderr, the way a terminal would show them
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Why a subprocess could not produce an output
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} cancelled")]
    Cancelled { program: String },
}

impl ProcessError {
    /// Spawn failures caused by the environment (binary missing, no permission)
    pub fn is_environment_fault(&self) -> bool {
        match self {
            Self::Spawn { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            Self::Cancelled { .. } => false,
        }
    }
}

/// Run a command to completion, honoring a timeout and a cancellation token.
///
/// A timeout is an ordinary outcome (`ProcessStatus::TimedOut`); cancellation
/// is an error because the caller asked for the result to be abandoned.
pub async fn run_command(
    cmd: &mut tokio::process::Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled { program });
    }

    let start = Instant::now();
    let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!(program = %program, "Subprocess cancelled, killing");
            kill_process_group(pid);
            Err(ProcessError::Cancelled { program })
        }
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(Ok(output)) => Ok(ProcessOutput {
                status: ProcessStatus::Exited(output.status.code()),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: start.elapsed(),
            }),
            Ok(Err(source)) => Err(ProcessError::Spawn { program, source }),
            Err(_) => {
                tracing::warn!(
                    program = %program,
                    timeout_secs = timeout.as_secs(),
                    "Subprocess timed out, killing"
                );
                kill_process_group(pid);
                Ok(ProcessOutput {
                    status: ProcessStatus::TimedOut,
                    stdout: String::new(),
                    stderr: format!("{program} timed out after {}s", timeout.as_secs()),
                    duration: start.elapsed(),
                })
            }
        },
    }
}

/// SIGKILL every process in the child's group; the group id is the child's
/// pid because of `process_group(0)`
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
