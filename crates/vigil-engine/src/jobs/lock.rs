//! Per-job advisory locks.
//!
//! A lock is a `.lock` marker file in the job directory, created with
//! `O_CREAT|O_EXCL` so concurrent acquisitions against the same job
//! yield exactly one winner. The marker is the sole admission control
//! for dispatch: its presence means a run is (or recently was) in
//! flight; its absence is the only authorization to start a new run.
//!
//! A crash between acquisition and PID persistence leaves a stale
//! marker. That is an accepted limitation: the engine never queues,
//! retries, or removes a stale lock on its own; `release` (operator
//! action) is the only recovery path.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info};

use super::JobId;

/// Name of the lock marker inside a job directory.
pub const LOCK_MARKER: &str = ".lock";

/// Filesystem-marker lock table keyed by job ID.
#[derive(Debug, Clone)]
pub struct LockManager {
    jobs_root: PathBuf,
}

impl LockManager {
    pub fn new(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
        }
    }

    /// Path of the lock marker for a job.
    pub fn marker_path(&self, job: &JobId) -> PathBuf {
        self.jobs_root.join(job.as_str()).join(LOCK_MARKER)
    }

    /// Try to acquire the job lock.
    ///
    /// Returns `Ok(true)` when this caller created the marker,
    /// `Ok(false)` when it is already held. Never blocks or retries.
    pub fn try_acquire(&self, job: &JobId) -> Result<bool, LockError> {
        let path = self.marker_path(job);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // Marker content is informational only; presence is the lock.
                let _ = writeln!(file, "{job}");
                info!(job = %job, "Acquired job lock");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(job = %job, "Job lock already held");
                Ok(false)
            }
            Err(e) => Err(LockError::Io { path, source: e }),
        }
    }

    /// Remove the marker unconditionally. Idempotent.
    pub fn release(&self, job: &JobId) -> Result<(), LockError> {
        let path = self.marker_path(job);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(job = %job, "Released job lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io { path, source: e }),
        }
    }

    /// Pure observation of the marker.
    pub fn is_held(&self, job: &JobId) -> bool {
        self.marker_path(job).exists()
    }
}

/// Errors from lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
