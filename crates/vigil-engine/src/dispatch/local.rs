//! Local container backend.
//!
//! Runs the tool with the container engine on the same host, the run
//! directory bind-mounted read-write at the guest workdir. The image is
//! pulled on demand when not present locally.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{Backend, DispatchError, GUEST_WORKDIR, LaunchRequest, log_append};

#[derive(Debug, Clone)]
pub struct LocalContainer {
    docker_bin: PathBuf,
}

impl LocalContainer {
    pub fn new(docker_bin: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    /// Make sure the image is present locally, pulling it if needed.
    pub(crate) async fn ensure_image(&self, image: &str) -> Result<(), DispatchError> {
        let inspect = Command::new(&self.docker_bin)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| DispatchError::ImageUnavailable {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        if inspect.success() {
            debug!(image, "Image present locally");
            return Ok(());
        }

        info!(image, "Pulling image");
        let pull = Command::new(&self.docker_bin)
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| DispatchError::ImageUnavailable {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        if pull.status.success() {
            Ok(())
        } else {
            Err(DispatchError::ImageUnavailable {
                image: image.to_string(),
                reason: String::from_utf8_lossy(&pull.stderr).trim().to_string(),
            })
        }
    }

    /// Spawn one containerized command with the run directory mounted,
    /// stdout and stderr appended to the run log.
    pub fn spawn_container(
        &self,
        req: &LaunchRequest,
        command: &str,
    ) -> Result<Child, DispatchError> {
        let log = req.run.log_path();
        self.spawn_container_to(req, command, &log, &log)
    }

    /// Spawn with explicit stdout/stderr capture files. The worker pool
    /// uses this to give each fan-out child its own slice and sub-log.
    pub fn spawn_container_to(
        &self,
        req: &LaunchRequest,
        command: &str,
        stdout_path: &std::path::Path,
        stderr_path: &std::path::Path,
    ) -> Result<Child, DispatchError> {
        let stdout = log_append(stdout_path)?;
        let stderr = log_append(stderr_path)?;
        let mount = format!("{}:{GUEST_WORKDIR}", req.run.path().display());
        Command::new(&self.docker_bin)
            .args(["run", "--rm", "-v", &mount, "-w", GUEST_WORKDIR])
            .arg(&req.image)
            .args(["sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| DispatchError::Spawn { source: e })
    }
}

impl Backend for LocalContainer {
    async fn launch(&self, req: &LaunchRequest) -> Result<Child, DispatchError> {
        self.ensure_image(&req.image).await?;
        let child = self.spawn_container(req, &req.command)?;
        info!(job = %req.job, image = %req.image, pid = child.id(), "Launched local container");
        Ok(child)
    }

    async fn collect(&self, _req: &LaunchRequest) -> Result<(), DispatchError> {
        // Artifacts land in the bind mount directly; nothing to retrieve.
        Ok(())
    }
}
