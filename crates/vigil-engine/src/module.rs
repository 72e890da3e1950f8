//! Tool module definitions.
//!
//! Each scan tool is described by a directory under the modules root:
//!
//! ```text
//! <modules-root>/<tool>/tool.json    image, command template, parser kind
//! <modules-root>/<tool>/info         one-line human description
//! <modules-root>/<tool>/<n>.cmdarg   default command arguments (0..=9)
//! ```
//!
//! A job may override any `<n>.cmdarg` by placing a file of the same
//! name in its own directory; the job-level file wins.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::jobs::store::ReportFormat;

/// Maximum number of positional command arguments a module may declare.
pub const MAX_CMDARGS: usize = 10;

/// Declarative description of one scan tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Container image the tool runs in.
    pub image: String,
    /// Command template executed inside the container/pod. Placeholders:
    /// `{input}`, `{report}`, `{log}`, `{dict}`, `{users}`, `{config}`,
    /// `{results}` and `{arg0}`..`{arg9}`.
    pub command: String,
    /// Parser kind of the tool's input (`host`, `url`).
    pub parser_kind: String,
    /// Report artifact format.
    #[serde(default)]
    pub report_format: ReportFormat,
    /// Whether this tool fans out across the worker pool instead of a
    /// single long-running invocation.
    #[serde(default)]
    pub fan_out: bool,
    /// Name of the tool-specific config artifact, without the `app.`
    /// prefix (e.g. `nuclei.conf` for `app.nuclei.conf`).
    #[serde(default)]
    pub config_artifact: Option<String>,
}

/// A loaded tool module: spec plus resolved filesystem location.
#[derive(Debug, Clone)]
pub struct ToolModule {
    pub name: String,
    pub spec: ToolSpec,
    dir: PathBuf,
}

impl ToolModule {
    /// Load a module by name from the modules root.
    pub fn load(modules_root: &Path, name: &str) -> Result<Self, ModuleError> {
        let dir = modules_root.join(name);
        let spec_path = dir.join("tool.json");
        if !spec_path.is_file() {
            return Err(ModuleError::NotFound {
                name: name.to_string(),
            });
        }
        let content = std::fs::read_to_string(&spec_path).map_err(|e| ModuleError::Io {
            path: spec_path.clone(),
            source: e,
        })?;
        let spec: ToolSpec =
            serde_json::from_str(&content).map_err(|e| ModuleError::BadSpec {
                name: name.to_string(),
                source: e,
            })?;
        debug!(module = name, image = %spec.image, "Loaded tool module");
        Ok(Self {
            name: name.to_string(),
            spec,
            dir,
        })
    }

    /// One-line description from the module's `info` file.
    pub fn info(&self) -> String {
        std::fs::read_to_string(self.dir.join("info"))
            .map(|s| s.lines().next().unwrap_or_default().to_string())
            .unwrap_or_else(|_| format!("Info file not found for {}", self.name))
    }

    /// Resolve the positional command arguments, honoring per-job
    /// overrides: `<job-dir>/<n>.cmdarg` shadows the module default.
    pub fn cmdargs(&self, job_dir: &Path) -> Vec<String> {
        let mut args = Vec::new();
        for n in 0..MAX_CMDARGS {
            let file = format!("{n}.cmdarg");
            let job_override = job_dir.join(&file);
            let path = if job_override.is_file() {
                job_override
            } else {
                self.dir.join(&file)
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => args.push(content.trim_end().to_string()),
                Err(_) => args.push(String::new()),
            }
        }
        args
    }

    /// Name of the tool-specific config artifact (`app.<name>`), if the
    /// module declares one.
    pub fn config_artifact_name(&self) -> Option<String> {
        self.spec
            .config_artifact
            .as_ref()
            .map(|name| format!("app.{name}"))
    }
}

/// List modules available under the modules root: any directory holding
/// a `tool.json`.
pub fn list_modules(modules_root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(modules_root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().join("tool.json").is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .collect();
    names.sort();
    names
}

/// Errors from module loading.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Module not found: {name}")]
    NotFound { name: String },

    #[error("Module {name} has an invalid tool.json: {source}")]
    BadSpec {
        name: String,
        source: serde_json::Error,
    },

    #[error("Module I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
