//! Filesystem-backed job store.
//!
//! One directory per job under the jobs root, one timestamped
//! subdirectory per run. The layout is a compatibility contract with
//! the external parser collaborator and must not change:
//!
//! ```text
//! <jobs-root>/<JobID>/app.input          canonical target list
//! <jobs-root>/<JobID>/app.dict           credential dictionary
//! <jobs-root>/<JobID>/app.users          username dictionary
//! <jobs-root>/<JobID>/app.<tool>.conf    tool-specific configuration
//! <jobs-root>/<JobID>/.lock              lock marker
//! <jobs-root>/<JobID>/pid                persisted process id
//! <jobs-root>/<JobID>/<timestamp>/...    one run per execution
//! ```
//!
//! Runs are retained indefinitely for audit; the store never deletes
//! them.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use super::JobId;

/// Canonical artifact names inside a job or run directory.
pub const INPUT_ARTIFACT: &str = "app.input";
pub const DICT_ARTIFACT: &str = "app.dict";
pub const USERS_ARTIFACT: &str = "app.users";
pub const LOG_ARTIFACT: &str = "app.log";
pub const TOKENS_ARTIFACT: &str = "app.tokens";
pub const PID_ARTIFACT: &str = "pid";

/// Subdirectory of a run that tools may use as scratch space.
pub const RESULTS_DIR: &str = "results";

/// Report artifact format, declared by the tool's parser kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    /// Newline-delimited plain text (`app.report.txt`).
    #[default]
    Text,
    /// One JSON document or NDJSON stream (`app.report.json`).
    Json,
}

impl ReportFormat {
    pub const fn artifact_name(self) -> &'static str {
        match self {
            Self::Text => "app.report.txt",
            Self::Json => "app.report.json",
        }
    }
}

/// Handle to one run directory.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
    timestamp: u64,
}

impl RunDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn report_path(&self, format: ReportFormat) -> PathBuf {
        self.path.join(format.artifact_name())
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_ARTIFACT)
    }

    pub fn input_path(&self) -> PathBuf {
        self.path.join(INPUT_ARTIFACT)
    }

    pub fn results_path(&self) -> PathBuf {
        self.path.join(RESULTS_DIR)
    }
}

/// Filesystem job store rooted at a jobs directory.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Home directory of a job. Does not create it.
    pub fn job_dir(&self, job: &JobId) -> PathBuf {
        self.root.join(job.as_str())
    }

    /// Whether the job exists (its directory is present).
    pub fn exists(&self, job: &JobId) -> bool {
        self.job_dir(job).is_dir()
    }

    /// Path of the persisted process id for a job. Lives in the job
    /// directory, not the run directory, so a canceller only needs the
    /// job ID.
    pub fn pid_path(&self, job: &JobId) -> PathBuf {
        self.job_dir(job).join(PID_ARTIFACT)
    }

    /// Path of a job-level artifact (`app.input`, `app.dict`, ...).
    pub fn artifact_path(&self, job: &JobId, name: &str) -> PathBuf {
        self.job_dir(job).join(name)
    }

    /// Create a fresh run directory named by the current Unix time in
    /// seconds, together with its `results/` scratch subtree.
    ///
    /// Timestamps must be strictly increasing per job: a second dispatch
    /// within the same second is rejected rather than disambiguated.
    pub fn create_run(&self, job: &JobId) -> Result<RunDir, StoreError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| StoreError::Clock)?
            .as_secs();
        self.create_run_at(job, timestamp)
    }

    fn create_run_at(&self, job: &JobId, timestamp: u64) -> Result<RunDir, StoreError> {
        if !self.exists(job) {
            return Err(StoreError::JobNotFound { job: job.clone() });
        }
        let path = self.job_dir(job).join(timestamp.to_string());
        if path.exists() {
            return Err(StoreError::RunExists {
                job: job.clone(),
                timestamp,
            });
        }
        std::fs::create_dir_all(path.join(RESULTS_DIR)).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        info!(job = %job, timestamp, "Created run directory");
        Ok(RunDir { path, timestamp })
    }

    /// List run directories for a job, newest first. Non-numeric
    /// directory names (artifacts, `results` leftovers) are ignored.
    pub fn list_runs(&self, job: &JobId) -> Result<Vec<RunDir>, StoreError> {
        let dir = self.job_dir(job);
        if !dir.is_dir() {
            return Err(StoreError::JobNotFound { job: job.clone() });
        }
        let mut runs = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Ok(timestamp) = name.parse::<u64>() {
                runs.push(RunDir { path, timestamp });
            }
        }
        runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        debug!(job = %job, count = runs.len(), "Listed runs");
        Ok(runs)
    }

    /// The most recent run, if any.
    pub fn latest_run(&self, job: &JobId) -> Result<Option<RunDir>, StoreError> {
        Ok(self.list_runs(job)?.into_iter().next())
    }

    /// Enumerate report artifacts across all runs of a job, for status
    /// display. Worker slice files are excluded.
    pub fn list_reports(&self, job: &JobId) -> Result<Vec<PathBuf>, StoreError> {
        let mut reports = Vec::new();
        for run in self.list_runs(job)? {
            let entries = std::fs::read_dir(run.path()).map_err(|e| StoreError::Io {
                path: run.path().to_path_buf(),
                source: e,
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with("app.report") && !name.contains("slice") {
                    reports.push(path);
                }
            }
        }
        Ok(reports)
    }
}

/// Errors from job store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {job}")]
    JobNotFound { job: JobId },

    #[error("Run already exists for job {job} at timestamp {timestamp}")]
    RunExists { job: JobId, timestamp: u64 },

    #[error("System clock is before the Unix epoch")]
    Clock,

    #[error("Store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn job(s: &str) -> JobId {
        s.parse().unwrap()
    }

    fn store_with_job(dir: &tempfile::TempDir, id: &str) -> JobStore {
        let store = JobStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join(id)).unwrap();
        store
    }

    #[test]
    fn create_run_makes_results_subtree() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with_job(&dir, "42");

        let run = store.create_run(&job("42")).unwrap();
        assert!(run.path().is_dir());
        assert!(run.results_path().is_dir());
        assert_eq!(
            run.path().file_name().unwrap().to_str().unwrap(),
            run.timestamp().to_string()
        );
    }

    #[test]
    fn create_run_rejects_missing_job() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let err = store.create_run(&job("missing")).unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound { .. }));
    }

    #[test]
    fn create_run_rejects_timestamp_ties() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with_job(&dir, "42");

        store.create_run_at(&job("42"), 1_700_000_000).unwrap();
        let err = store.create_run_at(&job("42"), 1_700_000_000).unwrap_err();
        assert!(matches!(err, StoreError::RunExists { .. }));
    }

    #[test]
    fn list_runs_is_newest_first_and_numeric_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with_job(&dir, "42");

        store.create_run_at(&job("42"), 100).unwrap();
        store.create_run_at(&job("42"), 300).unwrap();
        store.create_run_at(&job("42"), 200).unwrap();
        std::fs::create_dir(dir.path().join("42").join("not-a-run")).unwrap();

        let runs = store.list_runs(&job("42")).unwrap();
        let stamps: Vec<u64> = runs.iter().map(RunDir::timestamp).collect();
        assert_eq!(stamps, vec![300, 200, 100]);

        let latest = store.latest_run(&job("42")).unwrap().unwrap();
        assert_eq!(latest.timestamp(), 300);
    }

    #[test]
    fn report_paths_follow_declared_format() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with_job(&dir, "42");
        let run = store.create_run_at(&job("42"), 100).unwrap();

        assert!(
            run.report_path(ReportFormat::Json)
                .ends_with("app.report.json")
        );
        assert!(
            run.report_path(ReportFormat::Text)
                .ends_with("app.report.txt")
        );
    }

    #[test]
    fn list_reports_skips_slice_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with_job(&dir, "42");
        let run = store.create_run_at(&job("42"), 100).unwrap();

        std::fs::write(run.report_path(ReportFormat::Text), "x").unwrap();
        std::fs::write(run.path().join("app.report.slice.3.txt"), "x").unwrap();

        let reports = store.list_reports(&job("42")).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].ends_with("app.report.txt"));
    }

    #[test]
    fn pid_path_is_in_job_dir_not_run_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with_job(&dir, "42");
        assert_eq!(store.pid_path(&job("42")), dir.path().join("42").join("pid"));
    }
}
