//! Process supervision and lifecycle teardown.
//!
//! The supervisor owns the `Child` handle returned by the backend
//! launch; completion is observed by awaiting that handle, never by
//! polling the process table. The `pid` file persisted in the job
//! directory exists solely so an external canceller can reach the
//! process with nothing but the job ID.
//!
//! Teardown ordering on completion is fixed: remove `pid` first, then
//! the lock marker. An observer holding only the job ID must never see
//! the job unlocked while a pid is still recorded.

use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::jobs::{JobId, JobStore, LockError, LockManager};

/// Probe a process for liveness without delivering a signal.
#[allow(unsafe_code)]
pub fn is_alive(pid: i32) -> bool {
    // Signal 0 only performs the existence and permission checks.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[allow(unsafe_code)]
pub(crate) fn send_sigterm(pid: i32) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[allow(unsafe_code)]
pub(crate) fn send_sigkill(pid: i32) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Externally observable state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Lock held and the recorded process is alive.
    Running { pid: i32 },
    /// Lock held but no live process behind it.
    Crashed,
    /// No lock marker.
    Idle,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running { pid } => write!(f, "running (pid {pid})"),
            Self::Crashed => f.write_str("crashed (lock held, no live process)"),
            Self::Idle => f.write_str("idle"),
        }
    }
}

/// Outcome of an external cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Whether a courtesy SIGTERM reached a recorded process.
    pub signalled: bool,
}

/// A launched run under supervision. Owns the child handle.
#[derive(Debug)]
pub struct RunningJob {
    job: JobId,
    child: Child,
}

impl RunningJob {
    /// Await process termination through the owned handle.
    pub async fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SupervisorError::Wait {
                job: self.job.clone(),
                source: e,
            })?;
        info!(job = %self.job, code = ?status.code(), "Supervised process terminated");
        Ok(status)
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    store: JobStore,
    locks: LockManager,
}

impl Supervisor {
    pub fn new(store: JobStore, locks: LockManager) -> Self {
        Self { store, locks }
    }

    /// Take ownership of a freshly launched child and persist its PID
    /// for external cancellation.
    pub fn start(&self, job: &JobId, child: Child) -> Result<RunningJob, SupervisorError> {
        match child.id() {
            Some(pid) => self.persist_pid(job, pid)?,
            // Process already reaped between spawn and here; nothing to
            // persist and nothing for a canceller to signal.
            None => warn!(job = %job, "Child exited before PID persistence"),
        }
        Ok(RunningJob {
            job: job.clone(),
            child,
        })
    }

    /// Persist this process itself as the job's recorded PID.
    ///
    /// Used by runs whose children are owned in-process (worker pool,
    /// rotation scan) rather than by a single backend child: status
    /// reads the run as live while this process is, and an external
    /// canceller's SIGTERM reaches the process supervising the workers.
    pub fn start_self(&self, job: &JobId) -> Result<(), SupervisorError> {
        self.persist_pid(job, std::process::id())
    }

    fn persist_pid(&self, job: &JobId, pid: u32) -> Result<(), SupervisorError> {
        let pid_path = self.store.pid_path(job);
        std::fs::write(&pid_path, format!("{pid}\n")).map_err(|e| SupervisorError::Io {
            path: pid_path.clone(),
            source: e,
        })?;
        info!(job = %job, pid, "Persisted run PID");
        Ok(())
    }

    /// Remove the persisted PID, then release the lock. Called on every
    /// completion path, clean or failed.
    pub fn finish(&self, job: &JobId) -> Result<(), SupervisorError> {
        self.remove_pid(job)?;
        self.locks.release(job)?;
        debug!(job = %job, "Run teardown complete");
        Ok(())
    }

    /// Courtesy cancellation: SIGTERM the recorded process if any, then
    /// tear down the marker state. Cluster pods left behind by an
    /// externally cancelled run are cleaned up by the next dispatch's
    /// pod delete, not here.
    pub fn cancel(&self, job: &JobId) -> Result<CancelOutcome, SupervisorError> {
        let signalled = match self.read_pid(job) {
            Some(pid) => {
                let delivered = send_sigterm(pid);
                info!(job = %job, pid, delivered, "Sent cancellation signal");
                delivered
            }
            None => {
                debug!(job = %job, "No recorded PID to cancel");
                false
            }
        };
        self.finish(job)?;
        Ok(CancelOutcome { signalled })
    }

    /// Observe job state from the marker files alone.
    pub fn status(&self, job: &JobId) -> JobState {
        if !self.locks.is_held(job) {
            return JobState::Idle;
        }
        match self.read_pid(job) {
            Some(pid) if is_alive(pid) => JobState::Running { pid },
            _ => JobState::Crashed,
        }
    }

    fn read_pid(&self, job: &JobId) -> Option<i32> {
        std::fs::read_to_string(self.store.pid_path(job))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn remove_pid(&self, job: &JobId) -> Result<(), SupervisorError> {
        let path = self.store.pid_path(job);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::Io { path, source: e }),
        }
    }
}

/// Errors from supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to wait on process for job {job}: {source}")]
    Wait {
        job: JobId,
        source: std::io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Supervisor I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn fixture(dir: &tempfile::TempDir) -> (Supervisor, LockManager, JobId) {
        let job: JobId = "42".parse().unwrap();
        std::fs::create_dir_all(dir.path().join("42")).unwrap();
        let store = JobStore::new(dir.path());
        let locks = LockManager::new(dir.path());
        (Supervisor::new(store, locks.clone()), locks, job)
    }

    #[tokio::test]
    async fn start_persists_pid_and_finish_clears_it() {
        let dir = tempfile::TempDir::new().unwrap();
        let (supervisor, locks, job) = fixture(&dir);
        assert!(locks.try_acquire(&job).unwrap());

        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id().unwrap();
        let mut running = supervisor.start(&job, child).unwrap();

        let recorded = std::fs::read_to_string(dir.path().join("42").join("pid")).unwrap();
        assert_eq!(recorded.trim(), pid.to_string());
        assert!(matches!(supervisor.status(&job), JobState::Running { .. }));

        supervisor.cancel(&job).unwrap();
        running.wait().await.unwrap();

        assert!(!dir.path().join("42").join("pid").exists());
        assert!(!locks.is_held(&job));
        assert_eq!(supervisor.status(&job), JobState::Idle);
    }

    #[tokio::test]
    async fn wait_observes_exit_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let (supervisor, _locks, job) = fixture(&dir);

        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let mut running = supervisor.start(&job, child).unwrap();
        let status = running.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn cancel_terminates_a_live_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let (supervisor, locks, job) = fixture(&dir);
        assert!(locks.try_acquire(&job).unwrap());

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut running = supervisor.start(&job, child).unwrap();

        let outcome = supervisor.cancel(&job).unwrap();
        assert!(outcome.signalled);

        let status = running.wait().await.unwrap();
        assert!(!status.success());
    }

    #[test]
    fn start_self_records_the_supervising_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let (supervisor, locks, job) = fixture(&dir);
        assert!(locks.try_acquire(&job).unwrap());

        supervisor.start_self(&job).unwrap();

        #[allow(clippy::cast_possible_wrap)]
        let own_pid = std::process::id() as i32;
        assert_eq!(supervisor.status(&job), JobState::Running { pid: own_pid });

        supervisor.finish(&job).unwrap();
        assert!(!dir.path().join("42").join("pid").exists());
        assert_eq!(supervisor.status(&job), JobState::Idle);
    }

    #[test]
    fn crashed_state_is_lock_without_live_pid() {
        let dir = tempfile::TempDir::new().unwrap();
        let (supervisor, locks, job) = fixture(&dir);

        assert_eq!(supervisor.status(&job), JobState::Idle);

        // Stale lock, no pid: the crash-between-acquire-and-persist gap.
        assert!(locks.try_acquire(&job).unwrap());
        assert_eq!(supervisor.status(&job), JobState::Crashed);

        // Stale lock plus a pid that no longer exists.
        std::fs::write(dir.path().join("42").join("pid"), "999999999\n").unwrap();
        assert_eq!(supervisor.status(&job), JobState::Crashed);
    }

    #[test]
    fn cancel_without_pid_still_clears_markers() {
        let dir = tempfile::TempDir::new().unwrap();
        let (supervisor, locks, job) = fixture(&dir);
        assert!(locks.try_acquire(&job).unwrap());

        let outcome = supervisor.cancel(&job).unwrap();
        assert!(!outcome.signalled);
        assert!(!locks.is_held(&job));
    }
}
