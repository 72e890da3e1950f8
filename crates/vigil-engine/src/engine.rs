//! Engine façade: drives a job through its full lifecycle.
//!
//! Admission errors (unknown job, lock already held, unknown module)
//! surface synchronously to the caller. Everything after admission is
//! asynchronous from the operator's point of view: failures are written
//! to the run's `app.log` and the dispatch call itself still succeeds.

use std::io::Write;

use tracing::{error, info, warn};

use vigil_core::config::Config;
use vigil_core::targets::ParserKind;

use crate::alerts::{AlertConsumer, ConsumerError};
use crate::dispatch::{
    Backend, BackendKind, ClusterPod, DispatchError, LaunchRequest, LocalContainer,
    probe_cluster, read_cluster_flag, render_command, select_backend,
};
use crate::jobs::store::LOG_ARTIFACT;
use crate::jobs::{JobId, JobStore, LockError, LockManager, StoreError};
use crate::module::{ModuleError, ToolModule};
use crate::parser::ParserInvoker;
use crate::pool::{PoolError, PoolHandle, WorkerPool};
use crate::rotation::{RateLimitProbe, RotationError, RotationScan, TokenCycle};
use crate::staging::{InputStager, StageError};
use crate::supervisor::{CancelOutcome, JobState, Supervisor, SupervisorError};

/// Status report for one job.
#[derive(Debug)]
pub struct StatusReport {
    pub job: JobId,
    pub state: JobState,
    /// Canonical report artifacts across all runs, newest run first.
    pub reports: Vec<std::path::PathBuf>,
}

pub struct Engine {
    config: Config,
    store: JobStore,
    locks: LockManager,
    stager: InputStager,
    parser: ParserInvoker,
    supervisor: Supervisor,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let store = JobStore::new(&config.jobs.jobs_root);
        let locks = LockManager::new(&config.jobs.jobs_root);
        let stager = InputStager::new(store.clone(), config.jobs.normalizer_bin.clone());
        let parser = ParserInvoker::new(&config.jobs.parser_bin);
        let supervisor = Supervisor::new(store.clone(), locks.clone());
        Self {
            config,
            store,
            locks,
            stager,
            parser,
            supervisor,
        }
    }

    fn local_backend(&self) -> LocalContainer {
        LocalContainer::new(&self.config.backend.docker_bin)
    }

    fn load_module(&self, tool: &str) -> Result<ToolModule, EngineError> {
        Ok(ToolModule::load(&self.config.jobs.modules_root, tool)?)
    }

    /// Admission gate shared by every run-starting operation: the job
    /// must exist, the module must load, and the lock must be free.
    fn admit(&self, job: &JobId, tool: &str) -> Result<ToolModule, EngineError> {
        if !self.store.exists(job) {
            return Err(EngineError::UnknownJob { job: job.clone() });
        }
        let module = self.load_module(tool)?;
        if !self.locks.try_acquire(job)? {
            return Err(EngineError::AlreadyLocked { job: job.clone() });
        }
        Ok(module)
    }

    /// Dispatch a job. Returns an error only for admission failures;
    /// later failures land in `app.log` and tear the run down.
    pub async fn dispatch(&self, job: &JobId, tool: &str) -> Result<(), EngineError> {
        let module = self.admit(job, tool)?;
        info!(job = %job, tool, "Dispatch admitted");

        if let Err(e) = self.execute(job, &module).await {
            error!(job = %job, error = %e, "Run failed");
            self.log_failure(job, &e);
            if let Err(teardown) = self.supervisor.finish(job) {
                warn!(job = %job, error = %teardown, "Teardown after failed run");
            }
        }
        Ok(())
    }

    async fn execute(&self, job: &JobId, module: &ToolModule) -> Result<(), EngineError> {
        let kind: ParserKind = module
            .spec
            .parser_kind
            .parse()
            .map_err(|e| EngineError::BadParserKind(format!("{e}")))?;
        let cmdargs = module.cmdargs(&self.store.job_dir(job));
        let staged = self.stager.stage(job, module).await?;

        if module.spec.fan_out {
            let req = LaunchRequest::new(job.clone(), staged.run, module, String::new());
            // The workers are in-process children; record this process
            // as the run's PID so status and external cancel see it.
            self.supervisor.start_self(job)?;
            let pool = WorkerPool::new(
                self.config.pool.clone(),
                self.local_backend(),
                self.parser.clone(),
                self.supervisor.clone(),
            );
            // The pool removes the pid record and the lock itself when
            // the last worker ends.
            let handle = PoolHandle::new();
            pool.run(&req, module, cmdargs, kind, staged.targets, &handle)
                .await?;
            return Ok(());
        }

        let command = render_command(module, &cmdargs, None);
        let req = LaunchRequest::new(job.clone(), staged.run, module, command);

        let flag = read_cluster_flag(&self.config.backend.cluster_flag_file);
        let cluster_ok = if flag {
            probe_cluster(
                &self.config.backend.kubectl_bin,
                &self.config.backend.cluster_context,
            )
            .await
        } else {
            false
        };
        let backend = select_backend(flag, cluster_ok);
        info!(job = %job, %backend, "Backend selected");

        let cluster = ClusterPod::new(
            &self.config.backend.kubectl_bin,
            &self.config.backend.cluster_context,
            &self.config.backend.cluster_namespace,
            self.config.backend.pod_ready_timeout_secs,
        );
        let local = self.local_backend();

        let child = match backend {
            BackendKind::LocalContainer => local.launch(&req).await?,
            BackendKind::ClusterPod => cluster.launch(&req).await?,
        };
        let mut running = self.supervisor.start(job, child)?;
        let status = running.wait().await?;
        if !status.success() {
            // Runtime error: recorded, partial output still parsed.
            self.append_run_log(
                &req,
                &format!("tool exited with code {:?}\n", status.code()),
            );
        }

        let collected = match backend {
            BackendKind::LocalContainer => local.collect(&req).await,
            BackendKind::ClusterPod => cluster.collect(&req).await,
        };
        if let Err(e) = collected {
            warn!(job = %job, error = %e, "Artifact collection failed");
            self.append_run_log(&req, &format!("artifact collection failed: {e}\n"));
        }

        if let Err(e) = self.parser.invoke(job, kind, &req.report_path()).await {
            warn!(job = %job, error = %e, "Parser hand-off failed");
            self.append_run_log(&req, &format!("parser hand-off failed: {e}\n"));
        }

        self.supervisor.finish(job)?;
        info!(job = %job, run = req.run.timestamp(), "Run complete");
        Ok(())
    }

    /// Run a credential-rotating scan for a job.
    pub async fn rotate_scan(&self, job: &JobId, tool: &str) -> Result<(), EngineError> {
        let module = self.admit(job, tool)?;
        info!(job = %job, tool, "Rotation scan admitted");

        if let Err(e) = self.execute_rotation(job, &module).await {
            error!(job = %job, error = %e, "Rotation scan failed");
            self.log_failure(job, &e);
        }
        if let Err(teardown) = self.supervisor.finish(job) {
            warn!(job = %job, error = %teardown, "Rotation scan teardown");
        }
        Ok(())
    }

    async fn execute_rotation(&self, job: &JobId, module: &ToolModule) -> Result<(), EngineError> {
        let kind: ParserKind = module
            .spec
            .parser_kind
            .parse()
            .map_err(|e| EngineError::BadParserKind(format!("{e}")))?;
        let cmdargs = module.cmdargs(&self.store.job_dir(job));
        let staged = self.stager.stage(job, module).await?;
        let req = LaunchRequest::new(job.clone(), staged.run, module, String::new());
        // Sequential in-process scan; the recorded PID is this process.
        self.supervisor.start_self(job)?;

        let cycle = TokenCycle::load(&self.store, job, self.config.rotation.exhaustion_policy);
        let probe = RateLimitProbe::new(&self.config.rotation);
        let mut scan = RotationScan::new(cycle, probe, self.local_backend(), self.parser.clone());
        scan.run(&req, module, &cmdargs, kind, &staged.targets)
            .await?;
        Ok(())
    }

    /// Courtesy cancellation by job ID.
    pub fn cancel(&self, job: &JobId) -> Result<CancelOutcome, EngineError> {
        if !self.store.exists(job) {
            return Err(EngineError::UnknownJob { job: job.clone() });
        }
        Ok(self.supervisor.cancel(job)?)
    }

    /// Observe job state and enumerate its report artifacts.
    pub fn status(&self, job: &JobId) -> Result<StatusReport, EngineError> {
        if !self.store.exists(job) {
            return Err(EngineError::UnknownJob { job: job.clone() });
        }
        let state = self.supervisor.status(job);
        let reports = self.store.list_reports(job)?;
        Ok(StatusReport {
            job: job.clone(),
            state,
            reports,
        })
    }

    /// Run the alert queue consumer until interrupted.
    pub async fn consume_alerts(&self) -> Result<(), EngineError> {
        let consumer = AlertConsumer::new(self.config.alerts.clone());
        Ok(consumer.run().await?)
    }

    fn append_run_log(&self, req: &LaunchRequest, line: &str) {
        append_line(&req.run.log_path(), line);
    }

    /// Non-admission failures are recorded where the operator will look
    /// for them: the newest run's log, or the job-level log when the
    /// failure predates the run directory.
    fn log_failure(&self, job: &JobId, err: &EngineError) {
        let path = self
            .store
            .latest_run(job)
            .ok()
            .flatten()
            .map_or_else(|| self.store.artifact_path(job, LOG_ARTIFACT), |run| run.log_path());
        append_line(&path, &format!("ERROR: {err}\n"));
    }
}

fn append_line(path: &std::path::Path, line: &str) {
    let opened = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path);
    match opened {
        Ok(mut file) => {
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(path = %path.display(), error = %e, "Failed to append to run log");
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to open run log"),
    }
}

/// Engine-level errors. Only the admission variants reach the operator
/// synchronously; the rest are logged into the job's run log.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown job: {job}")]
    UnknownJob { job: JobId },

    #[error("Job {job} is already locked")]
    AlreadyLocked { job: JobId },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("Module declares an unknown parser kind: {0}")]
    BadParserKind(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

impl EngineError {
    /// Whether this error belongs to the synchronous admission phase.
    pub const fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::UnknownJob { .. } | Self::AlreadyLocked { .. } | Self::Module(_)
        )
    }
}
