//! Hand-off to the external report parser.
//!
//! The parser is a separate collaborator command. It receives the path
//! of a fully written report artifact, the parser kind, and a
//! `JobID:<id>` destination token so findings land on the right job.
//! It only ever reads the run directory; the engine never interprets
//! report contents itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use vigil_core::targets::ParserKind;

use crate::jobs::JobId;

/// Invokes the external parser collaborator.
#[derive(Debug, Clone)]
pub struct ParserInvoker {
    parser_bin: PathBuf,
}

impl ParserInvoker {
    pub fn new(parser_bin: impl Into<PathBuf>) -> Self {
        Self {
            parser_bin: parser_bin.into(),
        }
    }

    /// Hand one report artifact to the parser.
    ///
    /// Callers must only invoke this after the producing process has
    /// terminated and the artifact is fully written. The artifact may
    /// be partial output from a failed run; the parser decides what to
    /// keep.
    pub async fn invoke(
        &self,
        job: &JobId,
        kind: ParserKind,
        report: &Path,
    ) -> Result<(), ParserError> {
        if !report.is_file() {
            warn!(job = %job, report = %report.display(), "No report artifact to parse");
            return Ok(());
        }

        let output = Command::new(&self.parser_bin)
            .arg("--parser")
            .arg(kind.as_str())
            .arg("--report")
            .arg(report)
            .arg(format!("JobID:{job}"))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ParserError::Spawn {
                bin: self.parser_bin.clone(),
                source: e,
            })?;

        if output.status.success() {
            info!(job = %job, report = %report.display(), "Report handed to parser");
            Ok(())
        } else {
            Err(ParserError::Failed {
                job: job.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Errors from the parser hand-off.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("Failed to launch parser {}: {source}", bin.display())]
    Spawn {
        bin: PathBuf,
        source: std::io::Error,
    },

    #[error("Parser exited with code {code:?} for job {job}: {stderr}")]
    Failed {
        job: JobId,
        code: Option<i32>,
        stderr: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn stub_parser(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.join("parser.sh");
        std::fs::write(&bin, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).unwrap();
        bin
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_job_token_and_report_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let seen = dir.path().join("seen");
        let report = dir.path().join("app.report.txt");
        std::fs::write(&report, "finding\n").unwrap();

        let bin = stub_parser(dir.path(), &format!("echo \"$@\" > {}", seen.display()));
        let invoker = ParserInvoker::new(bin);
        invoker
            .invoke(&"42".parse().unwrap(), ParserKind::Url, &report)
            .await
            .unwrap();

        let args = std::fs::read_to_string(seen).unwrap();
        assert!(args.contains("JobID:42"), "args: {args}");
        assert!(args.contains("--parser url"), "args: {args}");
        assert!(args.contains("app.report.txt"), "args: {args}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn parser_failure_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let report = dir.path().join("app.report.txt");
        std::fs::write(&report, "finding\n").unwrap();

        let bin = stub_parser(dir.path(), "echo 'bad report' >&2; exit 2");
        let invoker = ParserInvoker::new(bin);
        let err = invoker
            .invoke(&"42".parse().unwrap(), ParserKind::Host, &report)
            .await
            .unwrap_err();
        match err {
            ParserError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "bad report");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_report_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let invoker = ParserInvoker::new(dir.path().join("never-run"));
        invoker
            .invoke(
                &"42".parse().unwrap(),
                ParserKind::Host,
                &dir.path().join("absent.txt"),
            )
            .await
            .unwrap();
    }
}
