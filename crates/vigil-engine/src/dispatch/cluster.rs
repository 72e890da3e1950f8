//! Cluster pod backend.
//!
//! One pod per run: apply a declarative manifest, wait for readiness,
//! copy staged inputs in, execute the tool, copy artifacts back out and
//! delete the pod. The delete happens unconditionally, success or
//! failure, so no scan pods accumulate in the namespace.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::jobs::store::LOG_ARTIFACT;

use super::{Backend, DispatchError, GUEST_WORKDIR, LaunchRequest, log_append};

#[derive(Debug, Clone)]
pub struct ClusterPod {
    kubectl_bin: PathBuf,
    context: String,
    namespace: String,
    ready_timeout_secs: u64,
}

impl ClusterPod {
    pub fn new(
        kubectl_bin: impl Into<PathBuf>,
        context: impl Into<String>,
        namespace: impl Into<String>,
        ready_timeout_secs: u64,
    ) -> Self {
        Self {
            kubectl_bin: kubectl_bin.into(),
            context: context.into(),
            namespace: namespace.into(),
            ready_timeout_secs,
        }
    }

    /// Deterministic pod name for a run, constrained to the DNS label
    /// charset.
    pub fn pod_name(req: &LaunchRequest) -> String {
        let raw = format!("vigil-{}-{}", req.job, req.run.timestamp());
        raw.to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect()
    }

    /// Declarative pod manifest. The container holds a sleep so the
    /// tool itself runs through `exec`, letting artifacts be copied in
    /// beforehand.
    fn manifest(&self, req: &LaunchRequest, pod: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod,
                "namespace": self.namespace,
                "labels": {
                    "app.kubernetes.io/name": "vigil-scan",
                    "vigil/job": req.job.as_str(),
                },
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "tool",
                    "image": req.image,
                    "command": ["sh", "-c", "sleep 2147483647"],
                    "workingDir": GUEST_WORKDIR,
                    "volumeMounts": [{
                        "name": "workdir",
                        "mountPath": GUEST_WORKDIR,
                    }],
                    "resources": {
                        "requests": {"cpu": "250m", "memory": "256Mi"},
                        "limits": {"cpu": "2", "memory": "2Gi"},
                    },
                    "securityContext": {
                        "runAsNonRoot": true,
                        "runAsUser": 1000,
                        "allowPrivilegeEscalation": false,
                    },
                }],
                "volumes": [{
                    "name": "workdir",
                    "emptyDir": {},
                }],
            },
        })
    }

    fn kubectl(&self) -> Command {
        let mut cmd = Command::new(&self.kubectl_bin);
        cmd.args(["--context", &self.context, "--namespace", &self.namespace]);
        cmd
    }

    async fn run_kubectl(
        &self,
        action: &str,
        args: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<(), DispatchError> {
        let mut cmd = self.kubectl();
        cmd.args(args).stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| DispatchError::Kubectl {
            action: action.to_string(),
            reason: e.to_string(),
        })?;
        if let Some(payload) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(&payload)
                .await
                .map_err(|e| DispatchError::Kubectl {
                    action: action.to_string(),
                    reason: e.to_string(),
                })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DispatchError::Kubectl {
                action: action.to_string(),
                reason: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DispatchError::Kubectl {
                action: action.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn wait_ready(&self, pod: &str) -> Result<(), DispatchError> {
        let timeout = format!("--timeout={}s", self.ready_timeout_secs);
        self.run_kubectl(
            "wait",
            &[
                "wait",
                "--for=condition=Ready",
                &format!("pod/{pod}"),
                &timeout,
            ],
            None,
        )
        .await
        .map_err(|_| DispatchError::PodNotReady {
            pod: pod.to_string(),
            timeout_secs: self.ready_timeout_secs,
        })
    }

    /// Copy staged `app.*` artifacts from the run directory into the pod.
    async fn copy_inputs(&self, req: &LaunchRequest, pod: &str) -> Result<(), DispatchError> {
        for name in staged_artifacts(req.run.path())? {
            let host = req.run.path().join(&name);
            let guest = format!("{}/{pod}:{GUEST_WORKDIR}/{name}", self.namespace);
            self.run_kubectl(
                "cp-in",
                &["cp", &host.display().to_string(), &guest],
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Best-effort retrieval of artifacts the tool wrote inside the pod.
    async fn copy_outputs(&self, req: &LaunchRequest, pod: &str) {
        for name in [
            req.report_format.artifact_name().to_string(),
            LOG_ARTIFACT.to_string(),
        ] {
            let guest = format!("{}/{pod}:{GUEST_WORKDIR}/{name}", self.namespace);
            let host = req.run.path().join(&name);
            if let Err(e) = self
                .run_kubectl("cp-out", &["cp", &guest, &host.display().to_string()], None)
                .await
            {
                warn!(pod, artifact = name, error = %e, "Artifact retrieval failed");
            }
        }
    }

    async fn delete_pod(&self, pod: &str) -> Result<(), DispatchError> {
        self.run_kubectl(
            "delete",
            &["delete", "pod", pod, "--ignore-not-found", "--wait=false"],
            None,
        )
        .await
    }
}

impl Backend for ClusterPod {
    async fn launch(&self, req: &LaunchRequest) -> Result<Child, DispatchError> {
        let pod = Self::pod_name(req);
        let manifest = serde_json::to_vec(&self.manifest(req, &pod))
            .map_err(|e| DispatchError::Kubectl {
                action: "apply".to_string(),
                reason: e.to_string(),
            })?;

        // Setup is sequenced; a failure at any step tears the pod down
        // before surfacing.
        let setup = async {
            self.run_kubectl("apply", &["apply", "-f", "-"], Some(manifest))
                .await?;
            self.wait_ready(&pod).await?;
            self.copy_inputs(req, &pod).await
        };
        if let Err(e) = setup.await {
            if let Err(cleanup) = self.delete_pod(&pod).await {
                warn!(pod, error = %cleanup, "Pod cleanup after failed setup");
            }
            return Err(e);
        }

        let log_path = req.run.log_path();
        let stdout = log_append(&log_path)?;
        let stderr = log_append(&log_path)?;
        let child = self
            .kubectl()
            .args(["exec", &pod, "--", "sh", "-c", &req.command])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| DispatchError::Spawn { source: e });
        match child {
            Ok(child) => {
                info!(job = %req.job, pod, image = %req.image, "Launched cluster pod run");
                Ok(child)
            }
            Err(e) => {
                if let Err(cleanup) = self.delete_pod(&pod).await {
                    warn!(pod, error = %cleanup, "Pod cleanup after failed exec");
                }
                Err(e)
            }
        }
    }

    async fn collect(&self, req: &LaunchRequest) -> Result<(), DispatchError> {
        let pod = Self::pod_name(req);
        self.copy_outputs(req, &pod).await;
        self.delete_pod(&pod).await
    }
}

/// Staged `app.*` files present in a run directory, excluding the run
/// log the engine itself appends to.
fn staged_artifacts(run_dir: &Path) -> Result<Vec<String>, DispatchError> {
    let entries = std::fs::read_dir(run_dir).map_err(|e| DispatchError::Io {
        path: run_dir.to_path_buf(),
        source: e,
    })?;
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|name| name.starts_with("app.") && name != LOG_ARTIFACT)
        .collect();
    names.sort();
    Ok(names)
}
