//! Vigil engine CLI
//!
//! One invocation drives one job operation: dispatch, cancel, status,
//! the alert queue consumer, or a credential-rotating scan. Concurrency
//! across jobs comes from running one engine process per job; the
//! filesystem lock markers are the only cross-process coordination.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use vigil_core::config::load_config;
use vigil_engine::engine::Engine;
use vigil_engine::jobs::JobId;

#[derive(Parser, Debug)]
#[command(name = "vigil-engine")]
#[command(version, about = "Vigil job orchestration and execution engine")]
struct Args {
    /// Path to the global settings file.
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the engine (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "VIGIL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "VIGIL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage inputs and run a tool against a job.
    Dispatch {
        /// Job identifier (directory name under the jobs root).
        job: String,
        /// Tool module name (directory name under the modules root).
        tool: String,
    },
    /// Send a courtesy SIGTERM to a running job and clear its markers.
    Cancel { job: String },
    /// Show job state and accumulated report artifacts.
    Status { job: String },
    /// Drain the alert queue mailbox until interrupted.
    ConsumeAlerts,
    /// Run a credential-rotating scan against a job.
    RotateScan { job: String, tool: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_filter = format!(
        "vigil_engine={level},vigil_core={level}",
        level = args.log_level
    );
    vigil_core::tracing_init::init_tracing(&log_filter, args.log_json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Engine operation failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        jobs_root = %config.jobs.jobs_root.display(),
        "Starting vigil-engine"
    );
    let engine = Engine::new(config);

    match args.command {
        Command::Dispatch { job, tool } => {
            let job: JobId = job.parse()?;
            engine.dispatch(&job, &tool).await?;
        }
        Command::Cancel { job } => {
            let job: JobId = job.parse()?;
            let outcome = engine.cancel(&job)?;
            if outcome.signalled {
                println!("job {job}: cancellation signal sent");
            } else {
                println!("job {job}: no running process, markers cleared");
            }
        }
        Command::Status { job } => {
            let job: JobId = job.parse()?;
            let report = engine.status(&job)?;
            println!("job {job}: {}", report.state);
            for path in &report.reports {
                println!("  {}", path.display());
            }
        }
        Command::ConsumeAlerts => engine.consume_alerts().await?,
        Command::RotateScan { job, tool } => {
            let job: JobId = job.parse()?;
            engine.rotate_scan(&job, &tool).await?;
        }
    }
    Ok(())
}
