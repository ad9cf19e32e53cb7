//! Session lifecycle: acquire a claim on the shared tunnel, release it on
//! exit, tear down when the last session leaves.
//!
//! A [`SessionContext`] represents one client invocation. `acquire` and
//! `release` do all their record and reference-count work inside the lock
//! store's exclusive critical section, so concurrent sessions are strictly
//! serialized:
//!
//! - **Join path** — a record exists and its owner is alive: add a reference
//!   entry and use the running tunnel.
//! - **Create path** — no record, or the recorded owner is dead (stale):
//!   clear any stale state, resolve a name, start a fresh tunnel, persist
//!   the record, add the first reference entry.
//! - **Release** — remove this session's entry; if none remain, terminate
//!   the tunnel (both tracked PIDs) and delete all record state. Releasing
//!   without an entry is a logged no-op, never an error.
//!
//! Crash recovery is lazy: a session killed with `kill -9` leaks its
//! reference entry, and the next acquire that finds the owner dead clears
//! everything and starts over.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::naming;
use crate::store::{LockStore, ResourceRecord, StoreError, StoreGuard};
use crate::supervisor::{self, SupervisorError};
use crate::util::now_ms;

/// How an acquire resolved.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// This session started a new tunnel.
    Created { name: String },
    /// This session joined a tunnel another session started.
    Joined { name: String, sessions: usize },
}

impl AcquireOutcome {
    pub fn name(&self) -> &str {
        match self {
            AcquireOutcome::Created { name } | AcquireOutcome::Joined { name, .. } => name,
        }
    }
}

/// How a release resolved.
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// Other sessions remain; the tunnel keeps running.
    Remaining(usize),
    /// This was the last session; the tunnel was terminated and all state
    /// removed.
    TornDown { name: Option<String> },
    /// No reference entry for this session existed — benign no-op.
    NoSession,
}

/// Read-only snapshot for `tunshare status`.
#[derive(Debug)]
pub struct StatusReport {
    pub record: Option<ResourceRecord>,
    pub owner_alive: bool,
    pub sessions: usize,
}

/// Errors from session acquire/release.
#[derive(Debug)]
pub enum SessionError {
    Store(StoreError),
    Supervisor(SupervisorError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Store(e) => write!(f, "{e}"),
            SessionError::Supervisor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

impl From<SupervisorError> for SessionError {
    fn from(e: SupervisorError) -> Self {
        SessionError::Supervisor(e)
    }
}

/// One client session's handle on the shared tunnel.
pub struct SessionContext {
    config: Config,
    store: LockStore,
    /// PID of the client process holding this session.
    session_pid: u32,
    /// Working directory at startup, used by the naming resolver.
    cwd: PathBuf,
    /// Explicit `--name` override, bypassing the resolver.
    name_override: Option<String>,
}

impl SessionContext {
    /// Create a session context backed by the configured state directory.
    pub fn new(
        config: Config,
        session_pid: u32,
        cwd: &Path,
        name_override: Option<String>,
    ) -> Result<Self, StoreError> {
        let store = LockStore::open(&config.state_dir())?;
        Ok(Self {
            config,
            store,
            session_pid,
            cwd: cwd.to_path_buf(),
            name_override,
        })
    }

    /// Acquire a claim on the shared tunnel, starting one if needed.
    pub async fn acquire(&self) -> Result<AcquireOutcome, SessionError> {
        let guard = self.store.lock().await?;

        if let Some(record) = guard.read_record()? {
            if supervisor::is_alive(record.pid) {
                guard.link_session(self.session_pid)?;
                let sessions = guard.session_count()?;
                info!(
                    "joined tunnel '{}' (owner pid {}, {sessions} sessions)",
                    record.name, record.pid
                );
                return Ok(AcquireOutcome::Joined {
                    name: record.name,
                    sessions,
                });
            }
            // Stale: owner died without releasing (e.g. kill -9). Clear and
            // recreate. The worker may have survived the owner — kill it too.
            warn!(
                "stale record for tunnel '{}': owner pid {} not running, clearing",
                record.name, record.pid
            );
            if let Some(real_pid) = record.real_pid {
                supervisor::terminate(&self.config.tunnel, real_pid).await;
            }
            guard.clear_all()?;
        }

        let name = match &self.name_override {
            Some(raw) => naming::normalize(raw, self.config.naming.max_len),
            None => naming::resolve(&naming::gather_context(&self.config, &self.cwd)),
        };
        let process =
            supervisor::start(&self.config.tunnel, &name, &self.store.tunnel_log_path()).await?;
        let record = ResourceRecord {
            pid: process.pid,
            real_pid: process.real_pid,
            name: name.clone(),
            created_ms: now_ms(),
        };
        if let Err(e) = guard.write_record(&record) {
            // Don't leak a tunnel nothing tracks
            supervisor::terminate(&self.config.tunnel, process.pid).await;
            return Err(e.into());
        }
        guard.cache_name(&name)?;
        guard.link_session(self.session_pid)?;
        info!("created tunnel '{name}' (pid {})", process.pid);
        Ok(AcquireOutcome::Created { name })
    }

    /// Release this session's claim. Tears the tunnel down only when the
    /// removed entry was the last one.
    pub async fn release(&self) -> Result<ReleaseOutcome, SessionError> {
        let guard = self.store.lock().await?;

        if !guard.unlink_session(self.session_pid)? {
            debug!("release with no session entry (pid {}), no-op", self.session_pid);
            return Ok(ReleaseOutcome::NoSession);
        }
        let remaining = guard.session_count()?;
        if remaining > 0 {
            info!("released session, {remaining} sessions remain");
            return Ok(ReleaseOutcome::Remaining(remaining));
        }

        let name = self.teardown(&guard).await?;
        Ok(ReleaseOutcome::TornDown { name })
    }

    /// Announce the tunnel endpoint once per resource lifetime.
    ///
    /// Scans the tunnel log for the URL without holding the lock (it can take
    /// up to `url_wait_secs`), then takes the lock for the test-and-set on
    /// the announcement marker. Returns the URL only for the session that won
    /// the announcement.
    pub async fn announce_endpoint(&self) -> Result<Option<String>, SessionError> {
        {
            let guard = self.store.lock().await?;
            if guard.announcement_shown() {
                return Ok(None);
            }
        }
        let Some(url) = supervisor::wait_for_endpoint(
            &self.store.tunnel_log_path(),
            self.config.tunnel.url_wait_secs,
        )
        .await
        else {
            warn!("no endpoint URL appeared in the tunnel log");
            return Ok(None);
        };

        let guard = self.store.lock().await?;
        if guard.announcement_shown() {
            return Ok(None);
        }
        guard.mark_announced()?;
        Ok(Some(url))
    }

    /// Read-only state snapshot. Holds the lock only to read consistently;
    /// never mutates and never performs stale cleanup.
    pub async fn status(&self) -> Result<StatusReport, SessionError> {
        let guard = self.store.lock().await?;
        let record = guard.read_record()?;
        let owner_alive = record.as_ref().is_some_and(|r| supervisor::is_alive(r.pid));
        let sessions = guard.session_count()?;
        Ok(StatusReport {
            record,
            owner_alive,
            sessions,
        })
    }

    /// Operator escape hatch: terminate the tunnel and remove all state
    /// regardless of reference count. Returns the tunnel name if one was
    /// running.
    pub async fn force_shutdown(&self) -> Result<Option<String>, SessionError> {
        let guard = self.store.lock().await?;
        self.teardown(&guard).await
    }

    async fn teardown(&self, guard: &StoreGuard<'_>) -> Result<Option<String>, SessionError> {
        let record = guard.read_record()?;
        let name = match &record {
            Some(record) => {
                info!("last session closed, stopping tunnel '{}'", record.name);
                supervisor::terminate(&self.config.tunnel, record.pid).await;
                if let Some(real_pid) = record.real_pid {
                    if real_pid != record.pid {
                        supervisor::terminate(&self.config.tunnel, real_pid).await;
                    }
                }
                Some(record.name.clone())
            }
            None => None,
        };
        guard.clear_all()?;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Build a config pointing at a private state dir with a fake tunnel
    /// binary that prints an endpoint URL and then sleeps.
    fn test_config(dir: &Path) -> Config {
        let script = dir.join("fake-tunnel");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"link: https://tunnel.example/fixture\"\nexec sleep 600\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.tunnel.binary = script.to_string_lossy().into_owned();
        config.tunnel.settle_delay_secs = 0;
        config.tunnel.url_wait_secs = 5;
        config.tunnel.kill_poll_interval_ms = 50;
        config.paths.state_dir = dir.join("state").to_string_lossy().into_owned();
        config
    }

    fn ctx(config: &Config, dir: &Path, session_pid: u32) -> SessionContext {
        SessionContext::new(config.clone(), session_pid, dir, None).unwrap()
    }

    async fn tunnel_pid(ctx: &SessionContext) -> u32 {
        let guard = ctx.store.lock().await.unwrap();
        guard.read_record().unwrap().unwrap().pid
    }

    /// A killed child stays a zombie until the runtime reaps it, so poll
    /// briefly instead of asserting death immediately.
    async fn wait_dead(pid: u32) {
        for _ in 0..40 {
            if !supervisor::is_alive(pid) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("pid {pid} still alive");
    }

    #[tokio::test]
    async fn test_create_join_release_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let a = ctx(&config, dir.path(), 11111);
        let b = ctx(&config, dir.path(), 22222);
        let c = ctx(&config, dir.path(), 33333);

        // A creates, B and C join
        let outcome = a.acquire().await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Created { .. }));
        let name = outcome.name().to_string();

        match b.acquire().await.unwrap() {
            AcquireOutcome::Joined {
                name: joined,
                sessions,
            } => {
                assert_eq!(joined, name);
                assert_eq!(sessions, 2);
            }
            other => panic!("expected join, got {other:?}"),
        }
        match c.acquire().await.unwrap() {
            AcquireOutcome::Joined { sessions, .. } => assert_eq!(sessions, 3),
            other => panic!("expected join, got {other:?}"),
        }

        let pid = tunnel_pid(&a).await;
        assert!(supervisor::is_alive(pid));

        // Releases in arbitrary order; only the last one tears down
        assert!(matches!(
            c.release().await.unwrap(),
            ReleaseOutcome::Remaining(2)
        ));
        assert!(supervisor::is_alive(pid));
        assert!(matches!(
            a.release().await.unwrap(),
            ReleaseOutcome::Remaining(1)
        ));
        assert!(supervisor::is_alive(pid));
        match b.release().await.unwrap() {
            ReleaseOutcome::TornDown { name: torn } => assert_eq!(torn.as_deref(), Some(&*name)),
            other => panic!("expected teardown, got {other:?}"),
        }
        wait_dead(pid).await;

        // All state removed
        let report = b.status().await.unwrap();
        assert!(report.record.is_none());
        assert_eq!(report.sessions, 0);
    }

    #[tokio::test]
    async fn test_stale_record_recovered_on_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let a = ctx(&config, dir.path(), 11111);

        // Plant a record whose owner cannot be a live process, plus a leaked
        // reference entry from the dead session
        {
            let guard = a.store.lock().await.unwrap();
            guard
                .write_record(&ResourceRecord {
                    pid: 2_000_000_000,
                    real_pid: None,
                    name: "stale-tunnel".to_string(),
                    created_ms: 0,
                })
                .unwrap();
            guard.link_session(99999).unwrap();
        }

        let outcome = a.acquire().await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Created { .. }));

        let report = a.status().await.unwrap();
        let record = report.record.unwrap();
        assert_ne!(record.pid, 2_000_000_000);
        assert!(report.owner_alive);
        // The leaked entry was swept with the stale record
        assert_eq!(report.sessions, 1);

        a.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let a = ctx(&config, dir.path(), 11111);
        let b = ctx(&config, dir.path(), 22222);

        a.acquire().await.unwrap();
        // B never acquired; releasing must not disturb A's claim
        assert!(matches!(
            b.release().await.unwrap(),
            ReleaseOutcome::NoSession
        ));
        let report = a.status().await.unwrap();
        assert_eq!(report.sessions, 1);
        assert!(report.record.is_some());

        assert!(matches!(
            a.release().await.unwrap(),
            ReleaseOutcome::TornDown { .. }
        ));
        // Double release after teardown is also a no-op
        assert!(matches!(
            a.release().await.unwrap(),
            ReleaseOutcome::NoSession
        ));
    }

    #[tokio::test]
    async fn test_announcement_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let a = ctx(&config, dir.path(), 11111);
        let b = ctx(&config, dir.path(), 22222);

        a.acquire().await.unwrap();
        b.acquire().await.unwrap();

        let url = a.announce_endpoint().await.unwrap();
        assert_eq!(url.as_deref(), Some("https://tunnel.example/fixture"));
        // Second claimant is suppressed by the marker
        assert!(b.announce_endpoint().await.unwrap().is_none());

        b.release().await.unwrap();
        a.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_shutdown_ignores_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let a = ctx(&config, dir.path(), 11111);
        let b = ctx(&config, dir.path(), 22222);

        a.acquire().await.unwrap();
        b.acquire().await.unwrap();
        let pid = tunnel_pid(&a).await;

        let name = a.force_shutdown().await.unwrap();
        assert!(name.is_some());
        wait_dead(pid).await;

        let report = a.status().await.unwrap();
        assert!(report.record.is_none());
        assert_eq!(report.sessions, 0);
    }
}
