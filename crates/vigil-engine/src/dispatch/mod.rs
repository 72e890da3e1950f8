//! Execution backends.
//!
//! A run executes either in a local container or in a cluster pod. The
//! choice is made per dispatch: a persisted feature flag nominates the
//! cluster, and a call-time context probe validates it. Any probe
//! failure degrades to the local backend; backend selection is never an
//! admission error.
//!
//! Both backends honor the same output contract: exactly one canonical
//! report artifact plus `app.log` in the run directory. Backends never
//! interpret tool output.

pub mod cluster;
pub mod local;

pub use cluster::ClusterPod;
pub use local::LocalContainer;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::jobs::store::{
    DICT_ARTIFACT, INPUT_ARTIFACT, LOG_ARTIFACT, RESULTS_DIR, ReportFormat, USERS_ARTIFACT,
};
use crate::jobs::{JobId, RunDir};
use crate::module::ToolModule;

/// Mount point of the run directory inside the container or pod.
pub const GUEST_WORKDIR: &str = "/vigil";

/// Which backend executes a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    LocalContainer,
    ClusterPod,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalContainer => f.write_str("local-container"),
            Self::ClusterPod => f.write_str("cluster-pod"),
        }
    }
}

/// Backend decision: the flag nominates the cluster, the probe has the
/// last word. A nominated but unreachable cluster degrades to local.
pub const fn select_backend(flag_enabled: bool, cluster_ok: bool) -> BackendKind {
    if flag_enabled && cluster_ok {
        BackendKind::ClusterPod
    } else {
        BackendKind::LocalContainer
    }
}

/// Read the cluster feature flag file. Missing file means disabled;
/// content `0`/`false` disables an existing file.
pub fn read_cluster_flag(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value = content.trim();
            !(value.eq_ignore_ascii_case("false") || value == "0")
        }
        Err(_) => false,
    }
}

/// Re-validate cluster reachability at call time: the live kubectl
/// context must resolve and match the expected name.
pub async fn probe_cluster(kubectl_bin: &Path, expected_context: &str) -> bool {
    let output = Command::new(kubectl_bin)
        .args(["config", "current-context"])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => {
            let current = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if current == expected_context {
                true
            } else {
                warn!(current, expected = expected_context, "Cluster context mismatch");
                false
            }
        }
        Ok(out) => {
            warn!(code = ?out.status.code(), "kubectl context probe failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "kubectl not reachable");
            false
        }
    }
}

/// Everything a backend needs to execute one run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub job: JobId,
    pub run: RunDir,
    pub image: String,
    /// Fully rendered guest-side command line.
    pub command: String,
    pub report_format: ReportFormat,
}

impl LaunchRequest {
    pub fn new(job: JobId, run: RunDir, module: &ToolModule, command: String) -> Self {
        Self {
            job,
            run,
            image: module.spec.image.clone(),
            command,
            report_format: module.spec.report_format,
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.run.report_path(self.report_format)
    }
}

/// One execution backend.
///
/// `launch` performs backend-specific setup and returns the child whose
/// lifetime is the run; the supervisor owns that handle. `collect` runs
/// after the child terminates, regardless of its exit status, and is
/// responsible for retrieving artifacts and tearing down backend state.
pub trait Backend {
    fn launch(
        &self,
        req: &LaunchRequest,
    ) -> impl Future<Output = Result<tokio::process::Child, DispatchError>> + Send;

    fn collect(
        &self,
        req: &LaunchRequest,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// Render a tool command template against the guest-side layout.
///
/// Placeholders: `{input}`, `{report}`, `{log}`, `{dict}`, `{users}`,
/// `{config}`, `{results}`, `{target}` and `{arg0}`..`{arg9}`.
pub fn render_command(
    module: &ToolModule,
    cmdargs: &[String],
    target: Option<&str>,
) -> String {
    let guest = |name: &str| format!("{GUEST_WORKDIR}/{name}");
    let config = module
        .config_artifact_name()
        .map_or_else(String::new, |name| guest(&name));

    let mut command = module
        .spec
        .command
        .replace("{input}", &guest(INPUT_ARTIFACT))
        .replace(
            "{report}",
            &guest(module.spec.report_format.artifact_name()),
        )
        .replace("{log}", &guest(LOG_ARTIFACT))
        .replace("{dict}", &guest(DICT_ARTIFACT))
        .replace("{users}", &guest(USERS_ARTIFACT))
        .replace("{config}", &config)
        .replace("{results}", &guest(RESULTS_DIR))
        .replace("{target}", target.unwrap_or_default());
    for (n, arg) in cmdargs.iter().enumerate() {
        command = command.replace(&format!("{{arg{n}}}"), arg);
    }
    debug!(module = %module.name, command, "Rendered tool command");
    command
}

/// Open a capture file for appending, usable as a child's stdout or
/// stderr handle.
pub(crate) fn log_append(path: &Path) -> Result<std::fs::File, DispatchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DispatchError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Errors from backend dispatch. Local failures are fatal to the run;
/// cluster failures before launch degrade to the local backend at the
/// selection stage, not here.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Image {image} unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Failed to launch tool process: {source}")]
    Spawn { source: std::io::Error },

    #[error("kubectl {action} failed: {reason}")]
    Kubectl { action: String, reason: String },

    #[error("Pod {pod} not ready within {timeout_secs}s")]
    PodNotReady { pod: String, timeout_secs: u64 },

    #[error("Dispatch I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
