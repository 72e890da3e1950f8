//! End-to-end dispatch flow against a stubbed container engine.
//!
//! The docker stub emulates the bind mount by rewriting the guest
//! workdir to the host run directory and executing the tool command
//! locally, so the full lifecycle runs without a container engine.

#![allow(clippy::unwrap_used)]
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use vigil_core::config::{Config, JobsConfig};
use vigil_engine::engine::{Engine, EngineError};
use vigil_engine::jobs::{JobId, LockManager};
use vigil_engine::supervisor::JobState;

fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// Container engine stub: succeeds on image commands, rewrites the
/// guest workdir to the bind-mount host directory and runs the command.
fn stub_docker(dir: &Path) -> PathBuf {
    let bin = dir.join("docker");
    write_script(
        &bin,
        r#"case "$1" in image|pull) exit 0 ;; esac
host=""
prev=""
for a; do
  if [ "$prev" = "-v" ]; then host="${a%%:*}"; fi
  prev="$a"
  last="$a"
done
cmd=$(printf '%s' "$last" | sed "s|/vigil|$host|g")
exec sh -c "$cmd""#,
    );
    bin
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    config: Config,
    engine: Engine,
    locks: LockManager,
    parser_log: PathBuf,
}

fn harness() -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().to_path_buf();

    let jobs_root = root.join("jobs");
    let modules_root = root.join("modules");
    std::fs::create_dir_all(&jobs_root).unwrap();
    std::fs::create_dir_all(modules_root.join("portscan")).unwrap();
    std::fs::write(
        modules_root.join("portscan").join("tool.json"),
        r#"{
            "image": "portscan:latest",
            "command": "printf 'host 10.0.0.1 port 80 open\n' > {report}; echo scan done",
            "parser_kind": "host"
        }"#,
    )
    .unwrap();

    let parser_log = root.join("parser-calls");
    let parser_bin = root.join("parser.sh");
    write_script(&parser_bin, &format!("echo \"$@\" >> {}", parser_log.display()));

    let mut config = Config::default();
    config.jobs = JobsConfig {
        jobs_root: jobs_root.clone(),
        modules_root,
        normalizer_bin: None,
        parser_bin,
    };
    config.backend.docker_bin = stub_docker(&root);
    config.backend.cluster_flag_file = root.join("cluster.flag"); // absent: local backend
    config.backend.kubectl_bin = root.join("missing").join("kubectl");

    let locks = LockManager::new(&jobs_root);
    Harness {
        _dir: dir,
        root: jobs_root,
        config: config.clone(),
        engine: Engine::new(config),
        locks,
        parser_log,
    }
}

fn write_module(h: &Harness, name: &str, spec: &str) {
    let dir = h.config.jobs.modules_root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("tool.json"), spec).unwrap();
}

fn seed_job(h: &Harness, id: &str, input: &str) -> JobId {
    let dir = h.root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("app.input"), input).unwrap();
    id.parse().unwrap()
}

#[tokio::test]
async fn dispatch_runs_job_to_completion() {
    let h = harness();
    let job = seed_job(&h, "42", "10.0.0.1\nscanme.example.com\n");

    h.engine.dispatch(&job, "portscan").await.unwrap();

    // Exactly one retained run directory with staged input and report.
    let runs: Vec<PathBuf> = std::fs::read_dir(h.root.join("42"))
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.parse::<u64>().is_ok())
        })
        .collect();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];

    let staged = std::fs::read_to_string(run.join("app.input")).unwrap();
    assert_eq!(staged, "10.0.0.1\nscanme.example.com\n");
    let report = std::fs::read_to_string(run.join("app.report.txt")).unwrap();
    assert_eq!(report, "host 10.0.0.1 port 80 open\n");
    let log = std::fs::read_to_string(run.join("app.log")).unwrap();
    assert!(log.contains("scan done"));

    // Parser got the artifact addressed to the job.
    let calls = std::fs::read_to_string(&h.parser_log).unwrap();
    assert_eq!(calls.lines().count(), 1);
    assert!(calls.contains("JobID:42"));
    assert!(calls.contains("app.report.txt"));

    // Clean teardown: no pid, no lock, job reads idle.
    assert!(!h.root.join("42").join("pid").exists());
    assert!(!h.locks.is_held(&job));
    let status = h.engine.status(&job).unwrap();
    assert_eq!(status.state, JobState::Idle);
    assert_eq!(status.reports.len(), 1);
}

#[tokio::test]
async fn dispatch_rejects_locked_job_without_side_effects() {
    let h = harness();
    let job = seed_job(&h, "7", "10.0.0.7\n");
    assert!(h.locks.try_acquire(&job).unwrap());

    let err = h.engine.dispatch(&job, "portscan").await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyLocked { .. }));
    assert!(err.is_admission());

    // No run was created and the lock is untouched.
    let runs = std::fs::read_dir(h.root.join("7"))
        .unwrap()
        .flatten()
        .filter(|e| e.path().is_dir())
        .count();
    assert_eq!(runs, 0);
    assert!(h.locks.is_held(&job));
    assert!(!h.parser_log.exists());
}

#[tokio::test]
async fn dispatch_rejects_unknown_job() {
    let h = harness();
    let job: JobId = "ghost".parse().unwrap();
    let err = h.engine.dispatch(&job, "portscan").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownJob { .. }));
}

#[tokio::test]
async fn failing_tool_still_hands_partial_output_to_parser() {
    let h = harness();
    let modules = h.root.parent().unwrap().join("modules");
    std::fs::create_dir_all(modules.join("flaky")).unwrap();
    std::fs::write(
        modules.join("flaky").join("tool.json"),
        r#"{
            "image": "flaky:latest",
            "command": "printf 'partial finding\n' > {report}; exit 9",
            "parser_kind": "host"
        }"#,
    )
    .unwrap();
    let job = seed_job(&h, "42", "10.0.0.1\n");

    // Runtime failure: dispatch itself succeeds, the error is in the log.
    h.engine.dispatch(&job, "flaky").await.unwrap();

    let status = h.engine.status(&job).unwrap();
    assert_eq!(status.state, JobState::Idle);
    assert_eq!(status.reports.len(), 1);
    let report = std::fs::read_to_string(&status.reports[0]).unwrap();
    assert_eq!(report, "partial finding\n");

    let run_dir = status.reports[0].parent().unwrap().to_path_buf();
    let log = std::fs::read_to_string(run_dir.join("app.log")).unwrap();
    assert!(log.contains("tool exited with code Some(9)"), "log: {log}");

    let calls = std::fs::read_to_string(&h.parser_log).unwrap();
    assert!(calls.contains("JobID:42"));
}

#[tokio::test]
async fn crashed_job_is_visible_in_status() {
    let h = harness();
    let job = seed_job(&h, "42", "10.0.0.1\n");

    // Stale lock without a live process behind it.
    assert!(h.locks.try_acquire(&job).unwrap());
    let status = h.engine.status(&job).unwrap();
    assert_eq!(status.state, JobState::Crashed);

    // Operator-driven recovery: cancel clears the markers.
    let outcome = h.engine.cancel(&job).unwrap();
    assert!(!outcome.signalled);
    assert_eq!(h.engine.status(&job).unwrap().state, JobState::Idle);
}

#[tokio::test]
async fn in_flight_fan_out_run_reads_as_running() {
    let h = harness();
    write_module(
        &h,
        "slowscan",
        r#"{
            "image": "slowscan:latest",
            "command": "echo scanned={target}; sleep 3",
            "parser_kind": "host",
            "fan_out": true
        }"#,
    );
    let job = seed_job(&h, "42", "10.0.0.1\n10.0.0.2\n");

    let worker = Engine::new(h.config.clone());
    let task_job = job.clone();
    let task = tokio::spawn(async move { worker.dispatch(&task_job, "slowscan").await });

    // Mid-run: the engine process is the recorded PID, so an observer
    // holding only the job ID sees a live run, not a crash.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let state = h.engine.status(&job).unwrap().state;
    assert!(matches!(state, JobState::Running { .. }), "state: {state}");
    assert!(h.locks.is_held(&job));
    assert!(h.root.join("42").join("pid").exists());

    task.await.unwrap().unwrap();

    // Teardown removed the pid record before the lock marker.
    assert!(!h.root.join("42").join("pid").exists());
    assert!(!h.locks.is_held(&job));
    assert_eq!(h.engine.status(&job).unwrap().state, JobState::Idle);
}

#[tokio::test]
async fn in_flight_rotation_scan_reads_as_running() {
    let h = harness();
    write_module(
        &h,
        "drip",
        r#"{
            "image": "drip:latest",
            "command": "echo cred={token} target={target}; sleep 3",
            "parser_kind": "host"
        }"#,
    );
    let job = seed_job(&h, "9", "10.0.0.9\n");

    let worker = Engine::new(h.config.clone());
    let task_job = job.clone();
    let task = tokio::spawn(async move { worker.rotate_scan(&task_job, "drip").await });

    tokio::time::sleep(Duration::from_millis(800)).await;
    let state = h.engine.status(&job).unwrap().state;
    assert!(matches!(state, JobState::Running { .. }), "state: {state}");

    task.await.unwrap().unwrap();
    assert!(!h.root.join("9").join("pid").exists());
    assert_eq!(h.engine.status(&job).unwrap().state, JobState::Idle);
}

#[tokio::test]
async fn nominated_but_unreachable_cluster_falls_back_to_local() {
    let h = harness();
    // Flag nominates the cluster, but kubectl does not exist: the
    // call-time probe fails and dispatch degrades to the local backend.
    std::fs::write(&h.config.backend.cluster_flag_file, "true\n").unwrap();
    let job = seed_job(&h, "42", "10.0.0.1\n");

    h.engine.dispatch(&job, "portscan").await.unwrap();

    let status = h.engine.status(&job).unwrap();
    assert_eq!(status.state, JobState::Idle);
    assert_eq!(status.reports.len(), 1);
    let report = std::fs::read_to_string(&status.reports[0]).unwrap();
    assert_eq!(report, "host 10.0.0.1 port 80 open\n");
    assert!(!h.locks.is_held(&job));
}

#[tokio::test]
async fn staging_failure_reaches_the_job_log() {
    let h = harness();
    let job = seed_job(&h, "42", "https://example.com/only-urls\n");

    // Host parser admits nothing from the input: staging fails after
    // admission, so dispatch still returns success.
    h.engine.dispatch(&job, "portscan").await.unwrap();

    let log = std::fs::read_to_string(h.root.join("42").join("app.log")).unwrap();
    assert!(log.contains("ERROR:"), "log: {log}");
    assert!(!h.locks.is_held(&job));
    assert!(!h.parser_log.exists());
}
