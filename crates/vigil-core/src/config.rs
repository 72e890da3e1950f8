//! Configuration resolution for Vigil.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`/etc/vigil/settings.json`, or `$VIGIL_CONFIG`)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default location of the global settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/vigil/settings.json";

/// Complete Vigil engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
}

/// Job store layout and collaborator commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Root of the per-job directory tree (`<jobs-root>/<JobID>/...`).
    pub jobs_root: PathBuf,
    /// Root of the per-tool module definitions (`<modules-root>/<tool>/tool.json`).
    pub modules_root: PathBuf,
    /// External input-normalization command, if the built-in normalizer
    /// is not sufficient for the declared parser kind.
    pub normalizer_bin: Option<PathBuf>,
    /// External parser collaborator command.
    pub parser_bin: PathBuf,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            jobs_root: PathBuf::from("/home/vigil/jobs"),
            modules_root: PathBuf::from("/opt/vigil/modules"),
            normalizer_bin: None,
            parser_bin: PathBuf::from("/opt/vigil/bin/parse-tools"),
        }
    }
}

/// Execution backend selection and binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Flag file holding a single boolean; `true` nominates the cluster
    /// pod backend. Read once per dispatch.
    pub cluster_flag_file: PathBuf,
    /// Expected kubectl context name; dispatch falls back to the local
    /// container backend when the live context does not match.
    pub cluster_context: String,
    /// Kubernetes namespace for scan pods.
    pub cluster_namespace: String,
    /// Path to the container engine binary.
    pub docker_bin: PathBuf,
    /// Path to the kubectl binary.
    pub kubectl_bin: PathBuf,
    /// Seconds to wait for a pod to report ready.
    pub pod_ready_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cluster_flag_file: PathBuf::from("/etc/vigil/cluster.flag"),
            cluster_context: "vigil-scans".to_string(),
            cluster_namespace: "vigil".to_string(),
            docker_bin: PathBuf::from("docker"),
            kubectl_bin: PathBuf::from("kubectl"),
            pod_ready_timeout_secs: 300,
        }
    }
}

/// Worker pool sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent workers for fan-out scans.
    pub workers: usize,
    /// Soft per-target timeout (seconds).
    pub target_timeout_secs: u64,
    /// Hard abort timeout per worker (seconds); escalates to SIGKILL.
    pub abort_timeout_secs: u64,
    /// Coarse status poll interval (seconds).
    pub poll_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 64,
            target_timeout_secs: 300,
            abort_timeout_secs: 3600,
            poll_interval_secs: 30,
        }
    }
}

impl PoolConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Alert mailbox directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Root directory holding `journal/`, `pending/`, `archive/` and `log`.
    pub alerts_root: PathBuf,
    /// Consumer poll interval (seconds).
    pub poll_interval_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            alerts_root: PathBuf::from("/home/vigil/alerts"),
            poll_interval_secs: 5,
        }
    }
}

impl AlertsConfig {
    pub fn journal_dir(&self) -> PathBuf {
        self.alerts_root.join("journal")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.alerts_root.join("pending")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.alerts_root.join("archive")
    }

    pub fn log_path(&self) -> PathBuf {
        self.alerts_root.join("log")
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Credential rotation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// What to do when the token list is exhausted with targets remaining.
    pub exhaustion_policy: ExhaustionPolicy,
    /// Endpoint answering the rate-limit probe for the current token.
    pub probe_url: Option<String>,
    /// Probe timeout (seconds).
    pub probe_timeout_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            exhaustion_policy: ExhaustionPolicy::ContinueUnauthenticated,
            probe_url: None,
            probe_timeout_secs: 10,
        }
    }
}

/// Behavior once the last credential token is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Keep scanning without a valid credential (historical behavior).
    #[default]
    ContinueUnauthenticated,
    /// Stop the scan with an error.
    Abort,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(settings_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    let global_path = settings_path.map_or_else(
        || {
            std::env::var("VIGIL_CONFIG")
                .map_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH), PathBuf::from)
        },
        Path::to_path_buf,
    );
    if global_path.exists() {
        config = load_config_file(&global_path)?;
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("VIGIL_JOBS_ROOT") {
        config.jobs.jobs_root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("VIGIL_MODULES_ROOT") {
        config.jobs.modules_root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("VIGIL_ALERTS_ROOT") {
        config.alerts.alerts_root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("VIGIL_POOL_WORKERS")
        && let Ok(n) = val.parse()
    {
        config.pool.workers = n;
    }
    if let Ok(val) = std::env::var("VIGIL_CLUSTER_FLAG_FILE") {
        config.backend.cluster_flag_file = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("VIGIL_CLUSTER_CONTEXT") {
        config.backend.cluster_context = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_is_64_workers() {
        let config = Config::default();
        assert_eq!(config.pool.workers, 64);
    }

    #[test]
    fn default_exhaustion_policy_continues() {
        let config = Config::default();
        assert_eq!(
            config.rotation.exhaustion_policy,
            ExhaustionPolicy::ContinueUnauthenticated
        );
    }

    #[test]
    fn alerts_paths_derive_from_root() {
        let alerts = AlertsConfig {
            alerts_root: PathBuf::from("/tmp/a"),
            poll_interval_secs: 5,
        };
        assert_eq!(alerts.pending_dir(), PathBuf::from("/tmp/a/pending"));
        assert_eq!(alerts.archive_dir(), PathBuf::from("/tmp/a/archive"));
        assert_eq!(alerts.log_path(), PathBuf::from("/tmp/a/log"));
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"pool": {"workers": 8, "target_timeout_secs": 60, "abort_timeout_secs": 120, "poll_interval_secs": 10}}"#,
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.pool.workers, 8);
        // Untouched sections keep defaults
        assert_eq!(config.alerts.poll_interval_secs, 5);
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/settings.json"))).unwrap();
        assert_eq!(config.pool.workers, 64);
    }
}
