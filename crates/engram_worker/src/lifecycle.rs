//! Worker lifecycle: host-wide mutex and self-exit policy.
//!
//! At most one in-process worker runs per host. The lock is a pid file
//! created with exclusive-create semantics; a stale file left by a dead
//! process is collected on the next acquisition attempt.

use engram_protocol::defaults::{WORKER_IDLE_TIMEOUT, WORKER_MAX_RUNTIME};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a worker's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No tasks for the idle window.
    Idle,
    /// Total runtime budget spent.
    MaxRuntime,
    /// Backend connection lost (no auto-reconnect).
    Disconnected,
    /// `server:shutdown` received.
    Shutdown,
}

/// Self-exit thresholds for `Worker::run`.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleLimits {
    pub idle_timeout: Duration,
    pub max_runtime: Duration,
}

impl Default for LifecycleLimits {
    fn default() -> Self {
        Self {
            idle_timeout: WORKER_IDLE_TIMEOUT,
            max_runtime: WORKER_MAX_RUNTIME,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to create lock file {0}: {1}")]
    CreateFailed(PathBuf, #[source] io::Error),

    #[error("Failed to read lock file {0}: {1}")]
    ReadFailed(PathBuf, #[source] io::Error),
}

/// Guard holding the host-wide in-process worker lock. Dropping it deletes
/// the lock file.
#[derive(Debug)]
pub struct WorkerLock {
    path: PathBuf,
}

impl WorkerLock {
    /// Try to become the host's in-process worker.
    ///
    /// Returns `Ok(None)` when another live process holds the lock. A lock
    /// file whose pid is no longer alive is deleted and acquisition
    /// retried exactly once.
    pub fn acquire(path: &Path) -> Result<Option<WorkerLock>, LockError> {
        match Self::try_create(path)? {
            Some(lock) => return Ok(Some(lock)),
            None => {}
        }

        let holder = Self::read_holder(path)?;
        match holder {
            Some(pid) if process_alive(pid) => {
                debug!("Worker lock held by live pid {}", pid);
                Ok(None)
            }
            holder => {
                // Dead holder (or unreadable file): collect and retry once.
                warn!(
                    "Collecting stale worker lock at {} (holder: {:?})",
                    path.display(),
                    holder
                );
                let _ = fs::remove_file(path);
                Self::try_create(path)
            }
        }
    }

    /// Exclusive-create the pid file. `Ok(None)` when it already exists.
    fn try_create(path: &Path) -> Result<Option<WorkerLock>, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LockError::CreateFailed(path.to_path_buf(), e))?;
        }
        let result = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path);
        match result {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())
                    .map_err(|e| LockError::CreateFailed(path.to_path_buf(), e))?;
                info!("Acquired worker lock: {}", path.display());
                Ok(Some(WorkerLock {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(LockError::CreateFailed(path.to_path_buf(), e)),
        }
    }

    fn read_holder(path: &Path) -> Result<Option<u32>, LockError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::ReadFailed(path.to_path_buf(), e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        debug!("Releasing worker lock: {}", self.path.display());
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove worker lock {}: {}", self.path.display(), e);
        }
    }
}

/// Signal-0 liveness probe.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill(pid, 0) probes without signalling; EPERM still means alive.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a probe, assume the holder is alive; exclusivity beats
/// stale-lock collection.
#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
