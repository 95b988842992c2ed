//! End-to-end supervision of real processes.
//!
//! These tests launch `sh` through the completion monitor (the built
//! `jobrunner` binary) and follow the job from launch to a terminal state
//! purely through its artifacts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jobrunner::core::types::{ExecutionMode, GateVerdict, JobState, ReasonCode};
use jobrunner::exit_codes;
use jobrunner::io::artifacts::ArtifactStore;
use jobrunner::io::clock::{Clock, SystemClock};
use jobrunner::io::config::{ProviderConfig, RunnerConfig};
use jobrunner::io::provider::{CommandProvider, ProviderRegistry};
use jobrunner::report::{JobReport, render_json};
use jobrunner::supervisor::{JobStatus, StartRequest, StopOutcome, Supervisor};
use jobrunner::test_support::TestRepo;

const DEADLINE: Duration = Duration::from_secs(20);

fn sh_provider(script: &str) -> ProviderConfig {
    ProviderConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        preferred_model: "default".to_string(),
        preflight_args: Vec::new(),
        ..ProviderConfig::default()
    }
}

fn supervisor(state: &Path, allowed: &Path, script: &str) -> Supervisor {
    let provider = sh_provider(script);
    let config = RunnerConfig {
        allowed_prefixes: vec![allowed.to_path_buf()],
        stop_grace_secs: 5,
        providers: BTreeMap::from([("sh".to_string(), provider.clone())]),
        ..RunnerConfig::default()
    };
    let mut providers = ProviderRegistry::new();
    providers.insert(Box::new(
        CommandProvider::new("sh", provider, state, config.spawn_timeout())
            .expect("provider")
            .with_monitor_program(env!("CARGO_BIN_EXE_jobrunner")),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Supervisor::new(ArtifactStore::new(state), config, providers, clock)
}

fn request(task: &str, worktree: &Path) -> StartRequest {
    StartRequest {
        task: task.to_string(),
        provider: "sh".to_string(),
        worktree: worktree.to_path_buf(),
        prompt_ref: PathBuf::from("prompt.md"),
        prompt: "work\n".to_string(),
        required_baseline: None,
        feature_key: None,
        mode: ExecutionMode::Detached,
    }
}

fn wait_terminal(sup: &Supervisor, task: &str) -> JobStatus {
    let deadline = Instant::now() + DEADLINE;
    loop {
        let status = sup.check(task).expect("check");
        if status.health.state.is_terminal() {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "job {task} still {:?} after {DEADLINE:?}",
            status.health
        );
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn nonzero_exit_is_captured_and_recorded_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let worktree = temp.path().join("worktrees").join("wt");
    fs::create_dir_all(&worktree).expect("worktree");
    let state = temp.path().join("state");
    let sup = supervisor(&state, &temp.path().join("worktrees"), "echo working; exit 3");

    let started = sup.start(&request("T-1", &worktree)).expect("start");
    assert!(started.pid > 0);

    let status = wait_terminal(&sup, "T-1");
    assert_eq!(status.health.state, JobState::ExitedErr);
    assert_eq!(status.health.reason, ReasonCode::ExitNonzero);
    assert_eq!(status.exit_code, Some(3));
    assert_eq!(status.check_exit_code(), exit_codes::EXITED_ERR);

    let paths = sup.store().job("T-1").expect("paths");
    let log = paths.read_log_from(0).expect("log");
    assert!(String::from_utf8_lossy(&log).contains("working"));
    let first = paths.read_outcome().expect("read").expect("outcome");
    sup.check("T-1").expect("check again");
    assert_eq!(paths.read_outcome().expect("read"), Some(first));
}

#[test]
fn duplicate_start_while_running_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let worktree = temp.path().join("worktrees").join("wt");
    fs::create_dir_all(&worktree).expect("worktree");
    let sup = supervisor(
        &temp.path().join("state"),
        &temp.path().join("worktrees"),
        "sleep 30",
    );

    let first = sup.start(&request("T-1", &worktree)).expect("start");
    let err = sup.start(&request("T-1", &worktree)).expect_err("duplicate");
    assert_eq!(exit_codes::exit_code_for(&err), exit_codes::GENERAL_ERROR);

    assert_eq!(
        sup.stop("T-1").expect("stop"),
        StopOutcome::Signalled { pid: first.pid }
    );
    let status = wait_terminal(&sup, "T-1");
    assert_eq!(status.health.reason, ReasonCode::Stopped);
    assert_eq!(sup.stop("T-1").expect("stop again"), StopOutcome::AlreadyStopped);
}

#[test]
fn clean_exit_without_trailer_reports_both_fields() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = TestRepo::new();
    repo.commit("README.md", "hello\n");
    let sup = supervisor(
        &temp.path().join("state"),
        repo.path(),
        "echo 'more' >> README.md && git add README.md && git commit -q -m 'update readme'",
    );

    sup.start(&request("T-2", repo.path())).expect("start");
    let status = wait_terminal(&sup, "T-2");
    assert_eq!(status.health.state, JobState::ExitedOk);

    let report = JobReport::from_status(&status);
    assert_eq!(report.feature_key_gate, Some(GateVerdict::Fail));
    assert_eq!(report.integrity_gate, Some(GateVerdict::Skipped));
    let rendered = render_json(&report).expect("render");
    let value: serde_json::Value = serde_json::from_str(&rendered).expect("json");
    assert_eq!(value["outcome"]["state"], "exited_ok");
    assert_eq!(value["feature_key_gate"], "fail");
}

#[test]
fn fresh_supervisor_recomputes_identical_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let worktrees = temp.path().join("worktrees");
    let worktree = worktrees.join("wt");
    fs::create_dir_all(&worktree).expect("worktree");
    let state = temp.path().join("state");

    let first = supervisor(&state, &worktrees, "exit 0");
    first.start(&request("T-3", &worktree)).expect("start");
    let before = wait_terminal(&first, "T-3");
    drop(first);

    let second = supervisor(&state, &worktrees, "exit 0");
    let after = second.evaluate("T-3").expect("evaluate");
    assert_eq!(after.health, before.health);
    assert_eq!(after.exit_code, before.exit_code);
    assert_eq!(after.outcome, before.outcome);
    assert_eq!(after.meta, before.meta);
}

#[test]
fn restart_rotates_log_and_increments_retries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let worktrees = temp.path().join("worktrees");
    let worktree = worktrees.join("wt");
    fs::create_dir_all(&worktree).expect("worktree");
    let sup = supervisor(&temp.path().join("state"), &worktrees, "echo attempt; exit 1");

    sup.start(&request("T-4", &worktree)).expect("start");
    wait_terminal(&sup, "T-4");
    let restarted = sup.restart("T-4").expect("restart");
    assert_eq!(restarted.retries, 1);

    let status = wait_terminal(&sup, "T-4");
    assert_eq!(status.meta.as_ref().map(|meta| meta.retries), Some(1));
    let paths = sup.store().job("T-4").expect("paths");
    assert_eq!(paths.rotated_logs().expect("rotated").len(), 1);
}
