//! CLI tests for `jobrunner` exit codes.
//!
//! Spawns the binary against a scratch state directory and checks that
//! rejections, health checks and gate commands exit with their documented
//! codes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jobrunner::exit_codes;
use jobrunner::io::artifacts::ArtifactStore;
use jobrunner::io::config::{HostConfig, RunnerConfig, write_config};
use jobrunner::test_support::TestRepo;

struct Scratch {
    _temp: tempfile::TempDir,
    state: PathBuf,
    worktree: PathBuf,
    prompt: PathBuf,
}

impl Scratch {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = temp.path().join("state");
        let worktrees = temp.path().join("worktrees");
        let worktree = worktrees.join("wt");
        fs::create_dir_all(&worktree).expect("worktree");
        let prompt = temp.path().join("prompt.md");
        fs::write(&prompt, "do the work\n").expect("prompt");
        let config = RunnerConfig {
            allowed_prefixes: vec![worktrees],
            ..RunnerConfig::default()
        };
        write_config(&ArtifactStore::new(&state).config_path(), &config).expect("config");
        Self {
            _temp: temp,
            state,
            worktree,
            prompt,
        }
    }

    fn write_config(&self, config: &RunnerConfig) {
        write_config(&ArtifactStore::new(&self.state).config_path(), config).expect("config");
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_jobrunner"))
            .arg("--state-dir")
            .arg(&self.state)
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .expect("run jobrunner")
    }

    fn job_dirs(&self) -> usize {
        match fs::read_dir(self.state.join("jobs")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn start_outside_allowed_prefix_exits_22_without_spawning() {
    let scratch = Scratch::new();
    let output = scratch.run(&[
        "start",
        "--task",
        "T-1",
        "--provider",
        "codex",
        "--prompt",
        path_arg(&scratch.prompt),
        "--worktree",
        "/etc/passwd",
    ]);
    assert_eq!(output.status.code(), Some(exit_codes::PERMISSION_DENIED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("permission_denied"));
    assert_eq!(scratch.job_dirs(), 0);
}

#[test]
fn permission_rejection_is_deterministic() {
    let scratch = Scratch::new();
    let args = [
        "start",
        "--task",
        "T-1",
        "--provider",
        "codex",
        "--prompt",
        path_arg(&scratch.prompt),
        "--worktree",
        "/etc",
    ];
    let first = scratch.run(&args);
    let second = scratch.run(&args);
    assert_eq!(first.status.code(), Some(exit_codes::PERMISSION_DENIED));
    assert_eq!(first.status.code(), second.status.code());
    assert_eq!(first.stderr, second.stderr);
}

#[test]
fn unknown_provider_exits_20() {
    let scratch = Scratch::new();
    let output = scratch.run(&[
        "start",
        "--task",
        "T-1",
        "--provider",
        "no-such-agent",
        "--prompt",
        path_arg(&scratch.prompt),
        "--worktree",
        path_arg(&scratch.worktree),
    ]);
    assert_eq!(output.status.code(), Some(exit_codes::PROVIDER_NOT_FOUND));
    assert_eq!(scratch.job_dirs(), 0);
}

#[test]
fn probe_unknown_provider_exits_20() {
    let scratch = Scratch::new();
    let output = scratch.run(&["probe", "--provider", "no-such-agent", "--model", "m"]);
    assert_eq!(output.status.code(), Some(exit_codes::PROVIDER_NOT_FOUND));
}

#[test]
fn check_unknown_job_is_a_general_error() {
    let scratch = Scratch::new();
    let output = scratch.run(&["check", "--task", "ghost"]);
    assert_eq!(output.status.code(), Some(exit_codes::GENERAL_ERROR));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown_job"));
}

#[test]
fn oversized_stall_override_is_rejected_cleanly() {
    let scratch = Scratch::new();
    let output = scratch.run(&[
        "check",
        "--task",
        "ghost",
        "--stall-minutes",
        "200000000000000",
    ]);
    assert_eq!(output.status.code(), Some(exit_codes::GENERAL_ERROR));
    assert!(String::from_utf8_lossy(&output.stderr).contains("stall_minutes"));
}

#[test]
fn status_with_no_jobs_succeeds() {
    let scratch = Scratch::new();
    let output = scratch.run(&["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("no jobs"));
}

#[test]
fn gate_commands_exit_zero_on_pass_and_one_otherwise() {
    let scratch = Scratch::new();
    let repo = TestRepo::new();
    let base = repo.commit("README.md", "hello\n");
    repo.commit_with_message("src.txt", "feat: add src\n\nFeature-Key: T-9");
    let worktree = path_arg(repo.path());

    let baseline = scratch.run(&[
        "baseline-gate",
        "--worktree",
        worktree,
        "--required-baseline",
        &base,
    ]);
    assert_eq!(baseline.status.code(), Some(exit_codes::OK));

    let integrity = scratch.run(&[
        "integrity-gate",
        "--worktree",
        worktree,
        "--reported-commit",
        "0123456789abcdef0123456789abcdef01234567",
        "--json",
    ]);
    assert_eq!(integrity.status.code(), Some(exit_codes::GENERAL_ERROR));
    let result: serde_json::Value =
        serde_json::from_slice(&integrity.stdout).expect("gate json");
    assert_eq!(result["verdict"], "fail");

    let keyed = scratch.run(&[
        "feature-key-gate",
        "--worktree",
        worktree,
        "--feature-key",
        "T-9",
        "--base",
        &base,
    ]);
    assert_eq!(keyed.status.code(), Some(exit_codes::OK));

    let other_key = scratch.run(&[
        "feature-key-gate",
        "--worktree",
        worktree,
        "--feature-key",
        "T-10",
        "--base",
        &base,
    ]);
    assert_eq!(other_key.status.code(), Some(exit_codes::GENERAL_ERROR));
}

#[test]
fn fanout_to_host_without_auth_mode_fails_preflight() {
    let scratch = Scratch::new();
    scratch.write_config(&RunnerConfig {
        hosts: vec![HostConfig {
            name: "build-1".to_string(),
            hostname: "build-1.invalid".to_string(),
            user: "ci".to_string(),
            auth_mode: None,
            port: 22,
            identity_file: None,
        }],
        ..RunnerConfig::default()
    });
    let output = scratch.run(&["fanout", "--all-hosts", "--json", "--", "status"]);
    assert_eq!(output.status.code(), Some(exit_codes::PREFLIGHT_FAILED));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["results"][0]["outcome"], "PREFLIGHT_FAILED");
    assert_eq!(report["results"][0]["attempts"], 0);

    let ledger = fs::read_to_string(scratch.state.join("fanout").join("attempts.jsonl"))
        .expect("ledger");
    assert_eq!(ledger.lines().count(), 1);
}
