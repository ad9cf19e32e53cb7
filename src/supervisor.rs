//! Tunnel process lifecycle: spawn, liveness, termination, endpoint scan.
//!
//! The external tunnel CLI is opaque: it prints a line containing an
//! `https://` URL once the tunnel is established, gives no other readiness
//! signal, and may itself be a wrapper that forks the real worker. This
//! module owns all interaction with it:
//!
//! - [`check_binary`] / [`ensure_authenticated`] — preflight, before any
//!   lock-store state is touched.
//! - [`start`] — spawn detached (own session, output to the tunnel log),
//!   wait a fixed settle delay, confirm liveness, and record both the
//!   wrapper PID and (via `/proc`) the real worker PID when obtainable.
//! - [`terminate`] — SIGTERM, bounded liveness polling, then SIGKILL.
//! - [`wait_for_endpoint`] — scan the tunnel log for the first URL line.
//!
//! The settle delay is a heuristic stand-in for a readiness handshake; it is
//! isolated here so it can be replaced if the CLI ever exposes one.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;

/// PIDs of the spawned tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TunnelProcess {
    /// PID of the process we spawned.
    pub pid: u32,
    /// PID of the real worker, when the spawned process forked one.
    pub real_pid: Option<u32>,
}

/// Errors from tunnel supervision.
#[derive(Debug)]
pub enum SupervisorError {
    /// The tunnel binary is not installed or not executable.
    ToolMissing(String),
    /// The interactive login flow failed; cannot proceed unauthenticated.
    AuthRequired(String),
    /// The tunnel process could not be spawned.
    Spawn(std::io::Error),
    /// The tunnel process exited during the settle delay.
    DiedOnStartup(String),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::ToolMissing(bin) => {
                write!(f, "Tunnel binary '{bin}' not found — is it installed and on PATH?")
            }
            SupervisorError::AuthRequired(bin) => {
                write!(f, "Login with '{bin} tunnel user login' failed; cannot continue")
            }
            SupervisorError::Spawn(e) => write!(f, "Failed to spawn tunnel process: {e}"),
            SupervisorError::DiedOnStartup(name) => {
                write!(f, "Tunnel '{name}' exited during startup — see the tunnel log")
            }
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Verify the tunnel binary exists by probing `<binary> --version`.
pub async fn check_binary(config: &TunnelConfig) -> Result<(), SupervisorError> {
    let result = Command::new(&config.binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(_) => Err(SupervisorError::ToolMissing(config.binary.clone())),
    }
}

/// Make sure the CLI is authenticated, running the interactive login flow
/// once if it is not.
///
/// `<binary> tunnel user show` exiting 0 means authenticated. Otherwise
/// `<binary> tunnel user login --provider <provider>` runs synchronously
/// with inherited stdio so the user can complete the flow; failure there is
/// fatal.
pub async fn ensure_authenticated(config: &TunnelConfig) -> Result<(), SupervisorError> {
    let status = Command::new(&config.binary)
        .args(["tunnel", "user", "show"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|_| SupervisorError::ToolMissing(config.binary.clone()))?;
    if status.success() {
        debug!("tunnel CLI already authenticated");
        return Ok(());
    }

    info!("not authenticated, starting interactive login");
    println!(
        "Tunnel login required — completing '{} tunnel user login' first",
        config.binary
    );
    let status = Command::new(&config.binary)
        .args(["tunnel", "user", "login", "--provider", &config.provider])
        .status()
        .await
        .map_err(|_| SupervisorError::ToolMissing(config.binary.clone()))?;
    if status.success() {
        Ok(())
    } else {
        Err(SupervisorError::AuthRequired(config.binary.clone()))
    }
}

/// Spawn the tunnel process detached and confirm it survives the settle delay.
///
/// The child gets its own session via `setsid` and its combined output goes
/// to `log_path`, so it is not tied to this process's terminal or lifetime —
/// other sessions keep using it after the creator exits.
pub async fn start(
    config: &TunnelConfig,
    name: &str,
    log_path: &Path,
) -> Result<TunnelProcess, SupervisorError> {
    let stdout = std::fs::File::create(log_path).map_err(SupervisorError::Spawn)?;
    let stderr = stdout.try_clone().map_err(SupervisorError::Spawn)?;

    let mut cmd = Command::new(&config.binary);
    cmd.args(["tunnel", "--name", name, "--accept-server-license-terms"])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    // SAFETY: setsid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SupervisorError::ToolMissing(config.binary.clone())
        } else {
            SupervisorError::Spawn(e)
        }
    })?;
    let Some(pid) = child.id() else {
        return Err(SupervisorError::DiedOnStartup(name.to_string()));
    };
    info!("spawned tunnel '{name}' (pid {pid})");

    // No ready signal from the CLI — wait, then confirm it is still running.
    tokio::time::sleep(Duration::from_secs(config.settle_delay_secs)).await;
    match child.try_wait() {
        Ok(Some(status)) => {
            warn!("tunnel '{name}' exited during settle: {status}");
            return Err(SupervisorError::DiedOnStartup(name.to_string()));
        }
        Ok(None) => {}
        Err(e) => {
            warn!("tunnel '{name}' status check failed: {e}");
            return Err(SupervisorError::Spawn(e));
        }
    }
    // Intentionally dropped without wait(): the child outlives this process.
    drop(child);

    let real_pid = find_worker_pid(pid, &config.binary);
    if let Some(rp) = real_pid {
        debug!("tunnel worker pid {rp} (wrapper {pid})");
    }
    Ok(TunnelProcess { pid, real_pid })
}

/// Non-destructive liveness probe (signal 0).
///
/// "Not found" and "permission denied" both count as not alive — for cleanup
/// purposes a process we cannot signal is as good as gone.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0
}

/// Terminate a process: SIGTERM, poll liveness a bounded number of times,
/// then SIGKILL if it is still running. Never fails — callers releasing a
/// session must not be blocked by a stubborn child.
pub async fn terminate(config: &TunnelConfig, pid: u32) {
    if !is_alive(pid) {
        return;
    }
    #[allow(clippy::cast_possible_wrap)]
    let raw = pid as i32;
    unsafe {
        libc::kill(raw, libc::SIGTERM);
    }
    for _ in 0..config.kill_poll_attempts {
        tokio::time::sleep(Duration::from_millis(config.kill_poll_interval_ms)).await;
        if !is_alive(pid) {
            debug!("pid {pid} exited after SIGTERM");
            return;
        }
    }
    unsafe {
        libc::kill(raw, libc::SIGKILL);
    }
    info!("pid {pid} required SIGKILL");
}

/// Scan the tunnel log for the first line containing an `https://` URL,
/// polling until `wait_secs` elapses.
pub async fn wait_for_endpoint(log_path: &Path, wait_secs: u64) -> Option<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
    loop {
        if let Ok(content) = tokio::fs::read_to_string(log_path).await {
            if let Some(url) = extract_url(&content) {
                return Some(url);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// First `https://` URL in the content, trimmed of trailing punctuation.
fn extract_url(content: &str) -> Option<String> {
    for line in content.lines() {
        if let Some(idx) = line.find("https://") {
            let url = line[idx..]
                .split_whitespace()
                .next()?
                .trim_end_matches(['"', '\'', ')', ',', '.']);
            return Some(url.to_string());
        }
    }
    None
}

/// Find a direct child of `parent` whose cmdline names the tunnel binary.
///
/// The CLI sometimes runs as a wrapper that forks the real worker; liveness
/// and termination need both PIDs. Returns `None` when no such child is
/// visible (the spawned process may be the worker itself).
fn find_worker_pid(parent: u32, binary: &str) -> Option<u32> {
    let needle = Path::new(binary)
        .file_name()
        .map_or_else(|| binary.to_string(), |n| n.to_string_lossy().into_owned());
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if parse_stat_ppid(&stat) != Some(parent) {
            continue;
        }
        // cmdline is NUL-separated; check any argument for the binary name
        let matches = std::fs::read(format!("/proc/{pid}/cmdline"))
            .ok()
            .map(|bytes| {
                bytes
                    .split(|&b| b == 0)
                    .filter_map(|arg| std::str::from_utf8(arg).ok())
                    .any(|arg| arg.contains(&needle))
            })
            .unwrap_or(false);
        if matches {
            return Some(pid);
        }
    }
    None
}

/// Parent PID from `/proc/<pid>/stat` content. The comm field may contain
/// spaces and parentheses, so fields are taken after the last `)`.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // after the comm: state(0) ppid(1) pgrp(2) ...
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fast_config(binary: &str) -> TunnelConfig {
        TunnelConfig {
            binary: binary.to_string(),
            settle_delay_secs: 0,
            kill_poll_interval_ms: 50,
            ..TunnelConfig::default()
        }
    }

    fn write_script(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-tunnel");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_extract_url_first_line_wins() {
        let content = "starting up\nOpen this link: https://vscode.dev/tunnel/abc to connect\nsecond https://example.com\n";
        assert_eq!(
            extract_url(content).unwrap(),
            "https://vscode.dev/tunnel/abc"
        );
    }

    #[test]
    fn test_extract_url_trims_punctuation() {
        assert_eq!(
            extract_url("see (https://example.com/x).").unwrap(),
            "https://example.com/x"
        );
    }

    #[test]
    fn test_extract_url_none_without_match() {
        assert!(extract_url("no endpoint yet\nhttp://insecure\n").is_none());
    }

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(parse_stat_ppid("123 (sleep) S 77 123 456 0 -1"), Some(77));
        // comm containing spaces and parens
        assert_eq!(
            parse_stat_ppid("9 (my (weird) app) R 1 9 9 0 -1"),
            Some(1)
        );
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn test_is_alive_semantics() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        // Far above any real pid_max
        assert!(!is_alive(2_000_000_000));
    }

    #[tokio::test]
    async fn test_check_binary_missing() {
        let config = fast_config("definitely-not-a-real-binary-xyz");
        assert!(matches!(
            check_binary(&config).await,
            Err(SupervisorError::ToolMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_escalation_on_live_process() {
        let config = fast_config("unused");
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().unwrap();
        // Reap in the background so the liveness probe sees it disappear
        let waiter = tokio::spawn(async move { child.wait().await });

        assert!(is_alive(pid));
        terminate(&config, pid).await;
        let _ = waiter.await;
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_on_dead_pid_is_noop() {
        let config = fast_config("unused");
        terminate(&config, 2_000_000_000).await;
    }

    #[tokio::test]
    async fn test_start_and_endpoint_scan() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo \"link: https://tunnel.example/abc\"\nexec sleep 30",
        );
        let config = fast_config(&script);
        let log = dir.path().join("tunnel.log");

        let proc = start(&config, "test-tunnel", &log).await.unwrap();
        assert!(is_alive(proc.pid));

        let url = wait_for_endpoint(&log, 5).await.unwrap();
        assert_eq!(url, "https://tunnel.example/abc");

        terminate(&config, proc.pid).await;
    }

    #[tokio::test]
    async fn test_start_detects_startup_death() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo failing >&2\nexit 3");
        let mut config = fast_config(&script);
        config.settle_delay_secs = 1;
        let log = dir.path().join("tunnel.log");

        assert!(matches!(
            start(&config, "test-tunnel", &log).await,
            Err(SupervisorError::DiedOnStartup(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_authenticated_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let ok_script = write_script(dir.path(), "exit 0");
        let config = fast_config(&ok_script);
        assert!(ensure_authenticated(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_authenticated_login_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fail_script = write_script(dir.path(), "exit 1");
        let config = fast_config(&fail_script);
        assert!(matches!(
            ensure_authenticated(&config).await,
            Err(SupervisorError::AuthRequired(_))
        ));
    }
}
