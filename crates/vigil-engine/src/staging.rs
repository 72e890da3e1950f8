//! Input staging.
//!
//! Materializes a run's inputs from the job store into a fresh run
//! directory: the canonical target list first (built-in normalization
//! or an external collaborator command), then snapshot copies of the
//! job's dictionary and tool-config artifacts. The run directory tree,
//! including `results/`, exists before any tool process starts.
//!
//! Staged copies are immutable snapshots: mutating the job's canonical
//! files afterwards must not affect an in-progress run.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use vigil_core::targets::{self, ParserKind};

use crate::jobs::store::{DICT_ARTIFACT, INPUT_ARTIFACT, USERS_ARTIFACT};
use crate::jobs::{JobId, JobStore, RunDir, StoreError};
use crate::module::ToolModule;

/// A successfully staged run: the run directory plus the canonical,
/// deduplicated target list it was staged with.
#[derive(Debug)]
pub struct StagedRun {
    pub run: RunDir,
    pub targets: Vec<String>,
}

/// Stages job inputs into run directories.
#[derive(Debug, Clone)]
pub struct InputStager {
    store: JobStore,
    normalizer_bin: Option<PathBuf>,
}

impl InputStager {
    pub fn new(store: JobStore, normalizer_bin: Option<PathBuf>) -> Self {
        Self {
            store,
            normalizer_bin,
        }
    }

    /// Stage a run for the given job and tool module.
    ///
    /// Fails loudly (and removes the partially created run directory)
    /// if the job does not exist or the canonical target list cannot be
    /// produced; no run is considered started in that case.
    pub async fn stage(
        &self,
        job: &JobId,
        module: &ToolModule,
    ) -> Result<StagedRun, StageError> {
        let kind: ParserKind = module
            .spec
            .parser_kind
            .parse()
            .map_err(|e| StageError::BadParserKind(format!("{e}")))?;

        let run = self.store.create_run(job)?;
        match self.stage_into(job, module, kind, &run).await {
            Ok(targets) => {
                info!(job = %job, run = run.timestamp(), targets = targets.len(), "Staging complete");
                Ok(StagedRun { run, targets })
            }
            Err(e) => {
                // No run started; drop the half-staged directory.
                if let Err(cleanup) = tokio::fs::remove_dir_all(run.path()).await {
                    warn!(job = %job, error = %cleanup, "Failed to remove half-staged run directory");
                }
                Err(e)
            }
        }
    }

    async fn stage_into(
        &self,
        job: &JobId,
        module: &ToolModule,
        kind: ParserKind,
        run: &RunDir,
    ) -> Result<Vec<String>, StageError> {
        let staged_input = run.input_path();

        if let Some(normalizer) = &self.normalizer_bin {
            let output = Command::new(normalizer)
                .arg("--job")
                .arg(job.as_str())
                .arg("--parser")
                .arg(kind.as_str())
                .arg("--output")
                .arg(&staged_input)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| StageError::NormalizerFailed {
                    reason: e.to_string(),
                })?;
            if !output.status.success() {
                return Err(StageError::NormalizerFailed {
                    reason: format!(
                        "exit {:?}: {}",
                        output.status.code(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        } else {
            let canonical = self.store.artifact_path(job, INPUT_ARTIFACT);
            let raw = tokio::fs::read_to_string(&canonical)
                .await
                .map_err(|e| StageError::MissingInput {
                    path: canonical.clone(),
                    source: e,
                })?;
            let normalized = targets::normalize(&raw, kind);
            tokio::fs::write(&staged_input, normalized.join("\n") + "\n")
                .await
                .map_err(StageError::Io)?;
        }

        // Read back the staged list; it is the single source of truth for
        // both dispatch paths.
        let staged = tokio::fs::read_to_string(&staged_input)
            .await
            .map_err(StageError::Io)?;
        let target_list: Vec<String> = staged
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if target_list.is_empty() {
            return Err(StageError::EmptyTargetList { job: job.clone() });
        }

        // Snapshot dictionary and config artifacts that exist on the job.
        let mut artifacts = vec![DICT_ARTIFACT.to_string(), USERS_ARTIFACT.to_string()];
        if let Some(config) = module.config_artifact_name() {
            artifacts.push(config);
        }
        for name in artifacts {
            let src = self.store.artifact_path(job, &name);
            if src.is_file() {
                tokio::fs::copy(&src, run.path().join(&name))
                    .await
                    .map_err(StageError::Io)?;
            }
        }

        Ok(target_list)
    }
}

/// Errors from input staging. All abort the dispatch before any tool
/// process is launched.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Module declares an unknown parser kind: {0}")]
    BadParserKind(String),

    #[error("Job input artifact missing at {}: {source}", path.display())]
    MissingInput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Input normalizer failed: {reason}")]
    NormalizerFailed { reason: String },

    #[error("Canonical target list is empty for job {job}")]
    EmptyTargetList { job: JobId },

    #[error("Staging I/O error: {0}")]
    Io(std::io::Error),
}
