//! Worker pool for target-parallel scans.
//!
//! Targets are partitioned statically over the pool with round-robin
//! assignment: target `i` belongs to worker `i mod W`. There is no
//! rebalancing; a worker stuck on a slow slice does not shed load. Each
//! worker owns a slice report and a sub-log, runs one child process per
//! target, and hands its own slice to the parser when the slice is
//! drained. There is no merge step.
//!
//! Completion is signalled internally by joining worker tasks. The
//! coarse poll interval only drives externally visible progress
//! logging. When the last worker finishes, the pool removes the job's
//! pid record and then its lock marker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vigil_core::config::PoolConfig;
use vigil_core::targets::ParserKind;

use crate::dispatch::{LaunchRequest, LocalContainer, render_command};
use crate::module::ToolModule;
use crate::parser::ParserInvoker;
use crate::supervisor::{Supervisor, SupervisorError, send_sigkill, send_sigterm};

/// Round-robin partition: target `i` goes to worker `i mod workers`.
/// Returned vector always has `workers` entries; trailing workers may
/// receive empty slices when targets run short.
pub fn partition(targets: Vec<String>, workers: usize) -> Vec<Vec<String>> {
    let workers = workers.max(1);
    let mut slices = vec![Vec::new(); workers];
    for (i, target) in targets.into_iter().enumerate() {
        slices[i % workers].push(target);
    }
    slices
}

/// Shared termination surface for a running pool. Cloneable; a
/// terminate from any holder reaches every recorded worker child.
#[derive(Debug, Clone, Default)]
pub struct PoolHandle {
    inner: Arc<PoolShared>,
}

#[derive(Debug, Default)]
struct PoolShared {
    kill: AtomicBool,
    pids: Mutex<HashMap<usize, i32>>,
    remaining: AtomicUsize,
}

impl PoolHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the pool: no new children are started and every recorded
    /// child PID receives SIGTERM in one sweep.
    pub fn terminate(&self) {
        self.inner.kill.store(true, Ordering::SeqCst);
        let pids = self.lock_pids();
        info!(children = pids.len(), "Terminating worker pool");
        for pid in pids.values() {
            send_sigterm(*pid);
        }
    }

    /// Targets not yet finished, for external status reporting.
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    fn killed(&self) -> bool {
        self.inner.kill.load(Ordering::SeqCst)
    }

    fn lock_pids(&self) -> std::sync::MutexGuard<'_, HashMap<usize, i32>> {
        self.inner
            .pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_pid(&self, worker: usize, pid: i32) {
        self.lock_pids().insert(worker, pid);
    }

    fn clear_pid(&self, worker: usize) {
        self.lock_pids().remove(&worker);
    }
}

/// Result of one pool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSummary {
    /// Workers that actually received targets.
    pub workers: usize,
    pub targets: usize,
    pub completed: usize,
    /// Spawn failures, non-zero exits and timed-out children. Partial
    /// output from these is kept in the slice files.
    pub failures: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerReport {
    completed: usize,
    failures: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    config: PoolConfig,
    backend: LocalContainer,
    parser: ParserInvoker,
    supervisor: Supervisor,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        backend: LocalContainer,
        parser: ParserInvoker,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            config,
            backend,
            parser,
            supervisor,
        }
    }

    /// Run a fan-out scan to completion.
    ///
    /// The job lock and pid record must already be held by the caller;
    /// the pool tears both down when the last worker is gone,
    /// terminated or not.
    pub async fn run(
        &self,
        req: &LaunchRequest,
        module: &ToolModule,
        cmdargs: Vec<String>,
        kind: ParserKind,
        targets: Vec<String>,
        handle: &PoolHandle,
    ) -> Result<PoolSummary, PoolError> {
        let total = targets.len();
        handle.inner.remaining.store(total, Ordering::SeqCst);
        self.backend.ensure_image(&req.image).await?;

        let mut set = JoinSet::new();
        let mut workers = 0;
        for (index, slice) in partition(targets, self.config.workers)
            .into_iter()
            .enumerate()
        {
            if slice.is_empty() {
                continue;
            }
            workers += 1;
            let ctx = WorkerCtx {
                index,
                targets: slice,
                req: req.clone(),
                module: module.clone(),
                cmdargs: cmdargs.clone(),
                kind,
                backend: self.backend.clone(),
                parser: self.parser.clone(),
                handle: handle.clone(),
                target_timeout: Duration::from_secs(self.config.target_timeout_secs),
                abort_timeout: Duration::from_secs(self.config.abort_timeout_secs),
            };
            set.spawn(run_worker(ctx));
        }
        info!(job = %req.job, workers, targets = total, "Worker pool started");

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.tick().await; // first tick fires immediately
        let mut report = WorkerReport::default();
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok(worker)) => {
                        report.completed += worker.completed;
                        report.failures += worker.failures;
                    }
                    Some(Err(e)) => {
                        warn!(job = %req.job, error = %e, "Worker task panicked");
                        report.failures += 1;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    info!(
                        job = %req.job,
                        remaining = handle.remaining(),
                        workers_live = set.len(),
                        "Pool progress"
                    );
                }
            }
        }

        // Last worker gone: remove the pid record, then the lock marker.
        self.supervisor.finish(&req.job)?;
        let summary = PoolSummary {
            workers,
            targets: total,
            completed: report.completed,
            failures: report.failures,
        };
        info!(job = %req.job, ?summary, "Worker pool finished");
        Ok(summary)
    }
}

struct WorkerCtx {
    index: usize,
    targets: Vec<String>,
    req: LaunchRequest,
    module: ToolModule,
    cmdargs: Vec<String>,
    kind: ParserKind,
    backend: LocalContainer,
    parser: ParserInvoker,
    handle: PoolHandle,
    target_timeout: Duration,
    abort_timeout: Duration,
}

impl WorkerCtx {
    fn slice_path(&self) -> PathBuf {
        self.req
            .run
            .path()
            .join(format!("app.report.slice.{}.txt", self.index))
    }

    fn sublog_path(&self) -> PathBuf {
        self.req.run.path().join(format!("app.log.slice.{}", self.index))
    }
}

async fn run_worker(ctx: WorkerCtx) -> WorkerReport {
    let mut report = WorkerReport::default();
    let slice_path = ctx.slice_path();
    let sublog_path = ctx.sublog_path();

    for target in &ctx.targets {
        if ctx.handle.killed() {
            debug!(worker = ctx.index, "Pool terminated, abandoning slice");
            break;
        }
        let command = render_command(&ctx.module, &ctx.cmdargs, Some(target));
        match ctx
            .backend
            .spawn_container_to(&ctx.req, &command, &slice_path, &sublog_path)
        {
            Ok(mut child) => {
                if let Some(pid) = child.id() {
                    #[allow(clippy::cast_possible_wrap)]
                    ctx.handle.record_pid(ctx.index, pid as i32);
                }
                let outcome =
                    wait_with_deadline(&mut child, ctx.target_timeout, ctx.abort_timeout).await;
                ctx.handle.clear_pid(ctx.index);
                match outcome {
                    Ok(status) if status.success() => report.completed += 1,
                    Ok(status) => {
                        // Partial slice output is kept for the parser.
                        warn!(
                            worker = ctx.index,
                            target = %target,
                            code = ?status.code(),
                            "Target child failed"
                        );
                        report.failures += 1;
                    }
                    Err(e) => {
                        warn!(worker = ctx.index, target = %target, error = %e, "Wait on target child failed");
                        report.failures += 1;
                    }
                }
            }
            Err(e) => {
                warn!(worker = ctx.index, target = %target, error = %e, "Failed to spawn target child");
                report.failures += 1;
            }
        }
        ctx.handle.inner.remaining.fetch_sub(1, Ordering::SeqCst);
    }

    // Decentralized hand-off: each worker parses its own slice.
    let has_output = std::fs::metadata(&slice_path).map(|m| m.len() > 0).unwrap_or(false);
    if has_output
        && let Err(e) = ctx.parser.invoke(&ctx.req.job, ctx.kind, &slice_path).await
    {
        warn!(worker = ctx.index, error = %e, "Slice parser hand-off failed");
        report.failures += 1;
    }
    report
}

/// Wait for a child with the soft timeout, then escalate: SIGTERM,
/// wait out the abort window, SIGKILL.
async fn wait_with_deadline(
    child: &mut Child,
    soft: Duration,
    abort: Duration,
) -> std::io::Result<ExitStatus> {
    if let Ok(status) = timeout(soft, child.wait()).await {
        return status;
    }
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        send_sigterm(pid as i32);
    }
    if let Ok(status) = timeout(abort, child.wait()).await {
        return status;
    }
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        send_sigkill(pid as i32);
    }
    child.wait().await
}

/// Errors from pool execution.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Dispatch(#[from] crate::dispatch::DispatchError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
