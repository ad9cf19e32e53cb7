//! Filesystem-backed lock store and reference-count ledger.
//!
//! All shared state for one tunnel lives in a single state directory:
//!
//! ```text
//! state_dir/
//!   lock          — flock(2) file gating every read-modify-write sequence
//!   record.json   — the resource record (owner PID, real PID, name)
//!   refs/
//!     <pid>.ref   — one marker file per live client session
//!   name.cache    — resolved tunnel name, for joiners and `status`
//!   announced     — one-shot endpoint-announcement marker
//!   tunnel.log    — combined output of the tunnel child process
//! ```
//!
//! The reference count is the number of entries in `refs/` — every session,
//! creator included, owns exactly one marker file. "Last session" is derived
//! strictly from "zero entries remain after removing my own", never from a
//! threshold constant.
//!
//! ## Concurrency
//!
//! [`LockStore::lock`] takes a blocking exclusive `flock` on the lock file
//! and returns a [`StoreGuard`]. Every mutation method lives on the guard, so
//! state cannot be touched outside the critical section. The lock is released
//! when the guard drops; if the process dies mid-section the OS reclaims it.
//! Acquisition runs on a blocking thread so the async runtime is not stalled
//! while another session holds the lock.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::util::now_ms;

/// The persisted record of the single running tunnel instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// PID of the spawned tunnel process (the wrapper, when the CLI forks).
    pub pid: u32,
    /// PID of the real worker process, when discoverable.
    pub real_pid: Option<u32>,
    /// Resolved tunnel name.
    pub name: String,
    /// Creation timestamp in milliseconds since epoch.
    pub created_ms: u64,
}

/// Errors from lock-store operations.
///
/// Everything here is a storage error: the state directory being
/// uncreatable or unlockable is a deployment problem, fatal before any
/// session is acquired.
#[derive(Debug)]
pub enum StoreError {
    /// The state directory could not be created.
    CreateDir(PathBuf, std::io::Error),
    /// The lock file could not be opened or locked.
    Lock(String),
    /// A filesystem operation inside the critical section failed.
    Io(&'static str, std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::CreateDir(path, e) => {
                write!(f, "Failed to create state directory {}: {e}", path.display())
            }
            StoreError::Lock(e) => write!(f, "Failed to acquire state lock: {e}"),
            StoreError::Io(op, e) => write!(f, "State {op} failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Handle to the state directory. Cheap to clone paths from; all access to
/// mutable state goes through [`LockStore::lock`].
pub struct LockStore {
    dir: PathBuf,
}

impl LockStore {
    /// Open (and create if needed) the state directory.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir.join("refs"))
            .map_err(|e| StoreError::CreateDir(dir.to_path_buf(), e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Path of the tunnel child's output log.
    pub fn tunnel_log_path(&self) -> PathBuf {
        self.dir.join("tunnel.log")
    }

    /// Acquire the exclusive advisory lock, blocking until it is obtainable.
    ///
    /// Lock hold times are short (file reads/writes and spawning), so an
    /// unbounded wait is fine. The flock itself happens on a blocking thread.
    pub async fn lock(&self) -> Result<StoreGuard<'_>, StoreError> {
        let lock_path = self.dir.join("lock");
        let flock = tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|e| StoreError::Lock(format!("open {}: {e}", lock_path.display())))?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| StoreError::Lock(format!("flock: {errno}")))
        })
        .await
        .map_err(|e| StoreError::Lock(format!("lock task failed: {e}")))??;

        debug!("acquired state lock");
        Ok(StoreGuard {
            dir: &self.dir,
            _flock: flock,
        })
    }
}

/// Exclusive access to the state directory. Dropping releases the lock.
pub struct StoreGuard<'a> {
    dir: &'a Path,
    _flock: Flock<File>,
}

impl StoreGuard<'_> {
    /// Read the resource record, if one exists.
    ///
    /// An unparseable record is treated as absent (and logged) — the caller's
    /// stale-state path then clears and recreates it.
    pub fn read_record(&self) -> Result<Option<ResourceRecord>, StoreError> {
        let path = self.dir.join("record.json");
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io("record read", e)),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Corrupt resource record, treating as absent: {e}");
                Ok(None)
            }
        }
    }

    /// Persist the resource record.
    pub fn write_record(&self, record: &ResourceRecord) -> Result<(), StoreError> {
        let content = serde_json::to_string(record)
            .map_err(|e| StoreError::Io("record serialize", e.into()))?;
        fs::write(self.dir.join("record.json"), content)
            .map_err(|e| StoreError::Io("record write", e))
    }

    /// Add a reference entry for `session_pid`.
    pub fn link_session(&self, session_pid: u32) -> Result<(), StoreError> {
        let path = self.ref_path(session_pid);
        fs::write(&path, now_ms().to_string()).map_err(|e| StoreError::Io("session link", e))
    }

    /// Remove the reference entry for `session_pid`.
    ///
    /// Idempotent: returns `Ok(false)` if no entry existed (double release or
    /// already-cleaned-up state), which is a no-op rather than an error.
    pub fn unlink_session(&self, session_pid: u32) -> Result<bool, StoreError> {
        match fs::remove_file(self.ref_path(session_pid)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io("session unlink", e)),
        }
    }

    /// Number of live reference entries.
    pub fn session_count(&self) -> Result<usize, StoreError> {
        let refs = self.dir.join("refs");
        let entries = match fs::read_dir(&refs) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::Io("refs list", e)),
        };
        let mut count = 0;
        for entry in entries.flatten() {
            if entry.path().extension().is_some_and(|e| e == "ref") {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Cached resolved name from the session that created the tunnel.
    pub fn cached_name(&self) -> Option<String> {
        let name = fs::read_to_string(self.dir.join("name.cache")).ok()?;
        let name = name.trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// Persist the resolved name for joiners and `status`.
    pub fn cache_name(&self, name: &str) -> Result<(), StoreError> {
        fs::write(self.dir.join("name.cache"), name).map_err(|e| StoreError::Io("name cache", e))
    }

    /// Whether the endpoint URL has already been announced for this tunnel.
    pub fn announcement_shown(&self) -> bool {
        self.dir.join("announced").exists()
    }

    /// Mark the endpoint URL as announced (one-shot per resource lifetime).
    pub fn mark_announced(&self) -> Result<(), StoreError> {
        fs::write(self.dir.join("announced"), now_ms().to_string())
            .map_err(|e| StoreError::Io("announce mark", e))
    }

    /// Remove all resource state: record, reference entries, name cache, and
    /// announcement marker. The lock file itself stays.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        for file in ["record.json", "name.cache", "announced"] {
            match fs::remove_file(self.dir.join(file)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io("state clear", e)),
            }
        }
        let refs = self.dir.join("refs");
        if let Ok(entries) = fs::read_dir(&refs) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|e| e == "ref") {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(StoreError::Io("refs clear", e)),
                    }
                }
            }
        }
        Ok(())
    }

    fn ref_path(&self, session_pid: u32) -> PathBuf {
        self.dir.join("refs").join(format!("{session_pid}.ref"))
    }
}
