//! Foreground workload execution.
//!
//! Runs the client's real command with inherited stdio so it can be fully
//! interactive. SIGINT/SIGTERM received by the launcher are forwarded to the
//! child, and the launcher keeps waiting — it must survive the signal so the
//! session release still runs after the workload dies. The workload's exit
//! status is the launcher's overall exit status; death by signal maps to the
//! shell convention `128 + signo`.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Errors from workload execution.
#[derive(Debug)]
pub enum WorkloadError {
    /// No command given (guarded by the CLI layer; kept for completeness).
    Empty,
    /// The command could not be started.
    Spawn(String, std::io::Error),
    /// Waiting on the child failed.
    Wait(std::io::Error),
}

impl std::fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadError::Empty => write!(f, "No command to run"),
            WorkloadError::Spawn(cmd, e) => write!(f, "Failed to run '{cmd}': {e}"),
            WorkloadError::Wait(e) => write!(f, "Failed waiting for command: {e}"),
        }
    }
}

impl std::error::Error for WorkloadError {}

impl WorkloadError {
    /// Exit code to report when the workload never produced one.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkloadError::Spawn(_, e) if e.kind() == std::io::ErrorKind::NotFound => 127,
            _ => 1,
        }
    }
}

/// Run `command` in the foreground and return its exit code.
pub async fn run(command: &[String]) -> Result<i32, WorkloadError> {
    let (program, args) = command.split_first().ok_or(WorkloadError::Empty)?;

    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .map_err(|e| WorkloadError::Spawn(program.clone(), e))?;
    let child_pid = child.id();
    info!("workload '{program}' started (pid {child_pid:?})");

    let mut sigint = signal(SignalKind::interrupt()).map_err(WorkloadError::Wait)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(WorkloadError::Wait)?;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(WorkloadError::Wait)?;
                let code = exit_code(status);
                info!("workload exited with code {code}");
                return Ok(code);
            }
            _ = sigint.recv() => {
                warn!("forwarding SIGINT to workload");
                forward(child_pid, libc::SIGINT);
            }
            _ = sigterm.recv() => {
                warn!("forwarding SIGTERM to workload");
                forward(child_pid, libc::SIGTERM);
            }
        }
    }
}

fn forward(pid: Option<u32>, sig: i32) {
    if let Some(pid) = pid {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, sig);
        }
    }
}

/// Exit code from a status: the code itself, or `128 + signo` when the
/// process was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_exit_code() {
        assert_eq!(run(&["true".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_propagates() {
        let cmd = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        assert_eq!(run(&cmd).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_signal_death_maps_to_128_plus_signo() {
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "kill -TERM $$".to_string(),
        ];
        assert_eq!(run(&cmd).await.unwrap(), 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_missing_command_reports_127() {
        let cmd = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let err = run(&cmd).await.unwrap_err();
        assert_eq!(err.exit_code(), 127);
    }

    #[tokio::test]
    async fn test_empty_command() {
        assert!(matches!(run(&[]).await, Err(WorkloadError::Empty)));
    }
}
