//! Credential-rotating scans.
//!
//! Some tools burn through authenticated API quota per target. The
//! rotation scan walks the target list sequentially with an ordered,
//! pre-loaded token sequence: before each target a lightweight HTTP
//! probe checks the current token's rate-limit signal and advances to
//! the next token when it is spent. What happens past the last token is
//! an explicit policy, not an accident.
//!
//! Per-target output is appended incrementally to the cumulative report
//! artifact and handed to the parser one target at a time, so findings
//! stream out of a long scan instead of arriving at the end.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::process::Command;
use tracing::{debug, info, warn};

use vigil_core::config::{ExhaustionPolicy, RotationConfig};
use vigil_core::targets::ParserKind;

use crate::dispatch::{DispatchError, LaunchRequest, LocalContainer, render_command};
use crate::jobs::store::TOKENS_ARTIFACT;
use crate::jobs::{JobId, JobStore};
use crate::module::ToolModule;
use crate::parser::ParserInvoker;

/// Credential in effect for the next target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    Token(&'a str),
    /// Past the last token under `ContinueUnauthenticated`.
    Unauthenticated,
}

/// Ordered token sequence, consumed left to right.
#[derive(Debug, Clone)]
pub struct TokenCycle {
    tokens: Vec<String>,
    index: usize,
    policy: ExhaustionPolicy,
}

impl TokenCycle {
    pub fn new(tokens: Vec<String>, policy: ExhaustionPolicy) -> Self {
        Self {
            tokens,
            index: 0,
            policy,
        }
    }

    /// Load the job's token list from its `app.tokens` artifact. A
    /// missing artifact yields an empty sequence, which is immediately
    /// subject to the exhaustion policy.
    pub fn load(store: &JobStore, job: &JobId, policy: ExhaustionPolicy) -> Self {
        let tokens = std::fs::read_to_string(store.artifact_path(job, TOKENS_ARTIFACT))
            .map(|content| {
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Self::new(tokens, policy)
    }

    /// The credential for the next request, or the exhaustion outcome.
    pub fn current(&self) -> Result<Credential<'_>, RotationError> {
        match self.tokens.get(self.index) {
            Some(token) => Ok(Credential::Token(token)),
            None => match self.policy {
                ExhaustionPolicy::ContinueUnauthenticated => Ok(Credential::Unauthenticated),
                ExhaustionPolicy::Abort => Err(RotationError::Exhausted {
                    tokens: self.tokens.len(),
                }),
            },
        }
    }

    /// Move past a spent token.
    pub fn advance(&mut self) {
        if self.index < self.tokens.len() {
            self.index += 1;
            info!(
                spent = self.index,
                left = self.tokens.len() - self.index,
                "Rotated to next credential"
            );
        }
    }

    pub fn exhausted(&self) -> bool {
        self.index >= self.tokens.len()
    }
}

/// HTTP probe of the service's rate-limit signal for one token.
#[derive(Debug, Clone)]
pub struct RateLimitProbe {
    client: reqwest::Client,
    url: Option<String>,
    timeout: Duration,
}

impl RateLimitProbe {
    pub fn new(config: &RotationConfig) -> Self {
        // reqwest is built with rustls-no-provider; returns Err if a
        // provider is already installed, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            client: reqwest::Client::new(),
            url: config.probe_url.clone(),
            timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }

    /// Whether the given token is currently rate limited: HTTP 403/429,
    /// or a zeroed rate-limit-remaining header. Network trouble is not
    /// a rate-limit signal; the scan proceeds on the current token.
    pub async fn is_limited(&self, token: &str) -> bool {
        let Some(url) = &self.url else {
            return false;
        };
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await;
        match response {
            Ok(resp) => {
                if resp.status() == StatusCode::FORBIDDEN
                    || resp.status() == StatusCode::TOO_MANY_REQUESTS
                {
                    return true;
                }
                for header in ["x-ratelimit-remaining", "ratelimit-remaining"] {
                    if resp
                        .headers()
                        .get(header)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.trim() == "0")
                    {
                        return true;
                    }
                }
                false
            }
            Err(e) => {
                warn!(error = %e, "Rate-limit probe failed, keeping current token");
                false
            }
        }
    }
}

/// Result of one rotation scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSummary {
    pub targets: usize,
    pub completed: usize,
    pub failures: usize,
    /// Tokens spent during the scan.
    pub rotations: usize,
}

/// Sequential scan with credential rotation and streaming hand-off.
#[derive(Debug)]
pub struct RotationScan {
    cycle: TokenCycle,
    probe: RateLimitProbe,
    backend: LocalContainer,
    parser: ParserInvoker,
}

impl RotationScan {
    pub fn new(
        cycle: TokenCycle,
        probe: RateLimitProbe,
        backend: LocalContainer,
        parser: ParserInvoker,
    ) -> Self {
        Self {
            cycle,
            probe,
            backend,
            parser,
        }
    }

    /// Resolve the credential for the next target, rotating past any
    /// tokens the probe reports as spent.
    async fn next_credential(&mut self) -> Result<Option<String>, RotationError> {
        loop {
            match self.cycle.current()? {
                Credential::Unauthenticated => return Ok(None),
                Credential::Token(token) => {
                    if self.probe.is_limited(token).await {
                        self.cycle.advance();
                    } else {
                        return Ok(Some(token.to_string()));
                    }
                }
            }
        }
    }

    pub async fn run(
        &mut self,
        req: &LaunchRequest,
        module: &ToolModule,
        cmdargs: &[String],
        kind: ParserKind,
        targets: &[String],
    ) -> Result<RotationSummary, RotationError> {
        self.backend.ensure_image(&req.image).await?;
        let report_path = req.report_path();
        let log_path = req.run.log_path();
        let mut summary = RotationSummary {
            targets: targets.len(),
            completed: 0,
            failures: 0,
            rotations: 0,
        };

        for target in targets {
            let spent_before = self.cycle.index;
            let credential = self.next_credential().await?;
            summary.rotations += self.cycle.index - spent_before;
            if credential.is_none() && spent_before < self.cycle.tokens.len() {
                warn!(job = %req.job, "Token sequence exhausted, continuing unauthenticated");
            }

            let command = render_command(module, cmdargs, Some(target))
                .replace("{token}", credential.as_deref().unwrap_or_default());
            debug!(job = %req.job, target = %target, authenticated = credential.is_some(), "Scanning target");

            // Each child appends to the cumulative report.
            match self
                .backend
                .spawn_container_to(req, &command, &report_path, &log_path)
            {
                Ok(mut child) => match child.wait().await {
                    Ok(status) if status.success() => summary.completed += 1,
                    Ok(status) => {
                        warn!(job = %req.job, target = %target, code = ?status.code(), "Target scan failed");
                        summary.failures += 1;
                    }
                    Err(e) => {
                        warn!(job = %req.job, target = %target, error = %e, "Wait on target scan failed");
                        summary.failures += 1;
                    }
                },
                Err(e) => {
                    warn!(job = %req.job, target = %target, error = %e, "Failed to spawn target scan");
                    summary.failures += 1;
                }
            }

            // Streaming hand-off: the parser sees the report grow
            // target by target.
            if report_path.is_file()
                && let Err(e) = self.parser.invoke(&req.job, kind, &report_path).await
            {
                warn!(job = %req.job, error = %e, "Streaming parser hand-off failed");
            }
        }

        info!(job = %req.job, ?summary, "Rotation scan finished");
        Ok(summary)
    }
}

/// Errors from rotation scans.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("Token sequence exhausted after {tokens} tokens")]
    Exhausted { tokens: usize },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
