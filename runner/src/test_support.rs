//! Test-only helpers: a scratch git repository, a controllable clock, and
//! fakes for the provider and transport seams.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::core::model::ModelSelection;
use crate::core::types::{ModelAvailability, PreflightStatus};
use crate::error::Rejection;
use crate::io::artifacts::JobPaths;
use crate::io::clock::Clock;
use crate::io::config::HostConfig;
use crate::io::provider::{
    LaunchRequest, Launched, LivenessSignals, PreflightReport, Provider,
};
use crate::io::transport::{RemoteExecution, Transport};

/// Fixed reference instant used across tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
        .single()
        .expect("valid time")
}

/// Throwaway git repository with a deterministic identity.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q"]);
        repo.git(&["config", "user.email", "runner@example.test"]);
        repo.git(&["config", "user.name", "Runner Test"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository and return trimmed stdout; panics on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Write `content` to `file` and commit it with a generic message.
    pub fn commit(&self, file: &str, content: &str) -> String {
        self.write_and_commit(file, content, &format!("update {file}"))
    }

    /// Commit a change to `file` using `message` verbatim.
    pub fn commit_with_message(&self, file: &str, message: &str) -> String {
        self.write_and_commit(file, message, message)
    }

    fn write_and_commit(&self, file: &str, content: &str, message: &str) -> String {
        let path = self.path().join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("write file");
        self.git(&["add", "--", file]);
        self.git(&["commit", "-q", "-m", message]);
        self.git(&["rev-parse", "HEAD"])
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Debug, Default)]
struct FakeState {
    next_pid: u32,
    alive: bool,
    tool_calls: Option<u64>,
    start_failures: VecDeque<Rejection>,
    starts: Vec<String>,
    stops: Vec<u32>,
}

/// Provider that records artifacts without spawning anything.
///
/// Pids handed out are fictitious; liveness is whatever the test says it is.
/// Clones share state, so a test can keep a handle after boxing one into a
/// registry.
#[derive(Debug, Clone)]
pub struct FakeProvider {
    name: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(FakeState {
                next_pid: 900_001,
                ..FakeState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake provider lock")
    }

    pub fn set_alive(&self, alive: bool) {
        self.state().alive = alive;
    }

    pub fn set_tool_calls(&self, calls: Option<u64>) {
        self.state().tool_calls = calls;
    }

    /// Make the next `start` fail with `rejection`.
    pub fn fail_next_start(&self, rejection: Rejection) {
        self.state().start_failures.push_back(rejection);
    }

    /// Task ids of every successful start, in order.
    pub fn starts(&self) -> Vec<String> {
        self.state().starts.clone()
    }

    pub fn stops(&self) -> Vec<u32> {
        self.state().stops.clone()
    }
}

impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, request: &LaunchRequest<'_>) -> Result<Launched> {
        let mut state = self.state();
        if let Some(rejection) = state.start_failures.pop_front() {
            return Err(rejection.into());
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.alive = true;
        state.starts.push(request.task.to_string());
        request.paths.write_pid(pid)?;
        Ok(Launched {
            pid,
            monitor_pid: None,
            selection: ModelSelection {
                selected_model: "fake-model".to_string(),
                fallback_reason: None,
            },
        })
    }

    fn check(&self, paths: &JobPaths) -> Result<LivenessSignals> {
        let state = self.state();
        let pid = paths.read_pid()?;
        Ok(LivenessSignals {
            pid,
            pid_alive: pid.is_some() && state.alive,
            log_bytes: paths.log_bytes()?,
            tool_calls: state.tool_calls,
            tool_scan_offset: 0,
            exit_code: paths.read_exit_code()?,
        })
    }

    fn stop(&self, pid: u32) -> Result<bool> {
        let mut state = self.state();
        state.stops.push(pid);
        let was_alive = state.alive;
        state.alive = false;
        Ok(was_alive)
    }

    fn preflight(&self) -> Result<PreflightReport> {
        Ok(PreflightReport {
            provider: self.name.clone(),
            status: PreflightStatus::Ok,
            checks: Vec::new(),
            selected_model: Some("fake-model".to_string()),
            fallback_reason: None,
        })
    }

    fn probe_model(&self, _model: &str, _timeout: Duration) -> ModelAvailability {
        ModelAvailability::Available
    }
}

/// Scripted behaviour of one host behind a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct HostScript {
    pub resolves: bool,
    /// Reachability checks that fail before the host answers (`u32::MAX`: never).
    pub unreachable_checks: u32,
    pub auth: bool,
    /// Results handed out by successive `execute` calls.
    pub results: Vec<RemoteExecution>,
}

impl HostScript {
    pub fn healthy(results: Vec<RemoteExecution>) -> Self {
        Self {
            resolves: true,
            unreachable_checks: 0,
            auth: true,
            results,
        }
    }
}

/// Remote execution that exited with `code`.
pub fn remote_exit(code: i32, stderr: &str) -> RemoteExecution {
    RemoteExecution {
        exit_code: Some(code),
        signal: None,
        timed_out: false,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

pub fn remote_timeout() -> RemoteExecution {
    RemoteExecution {
        exit_code: None,
        signal: None,
        timed_out: true,
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// Transport whose every answer is scripted per host name.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    hosts: BTreeMap<String, HostScript>,
    pending: Mutex<BTreeMap<String, VecDeque<RemoteExecution>>>,
    reach_checks: Mutex<BTreeMap<String, u32>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, name: &str, script: HostScript) -> Self {
        self.pending
            .get_mut()
            .expect("transport lock")
            .insert(name.to_string(), script.results.iter().cloned().collect());
        self.hosts.insert(name.to_string(), script);
        self
    }

    /// Number of reachability checks made against `name`.
    pub fn reachability_checks(&self, name: &str) -> u32 {
        self.reach_checks
            .lock()
            .expect("transport lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Host names passed to `execute`, one entry per call.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("transport lock").clone()
    }

    fn script(&self, host: &HostConfig) -> Result<&HostScript> {
        self.hosts
            .get(&host.name)
            .ok_or_else(|| anyhow!("no script for host {}", host.name))
    }
}

impl Transport for ScriptedTransport {
    fn resolve(&self, host: &HostConfig) -> Result<Vec<SocketAddr>> {
        if self.script(host)?.resolves {
            Ok(vec![SocketAddr::from((Ipv4Addr::LOCALHOST, host.port))])
        } else {
            Err(anyhow!("{}: name does not resolve", host.hostname))
        }
    }

    fn reachable(
        &self,
        host: &HostConfig,
        _addrs: &[SocketAddr],
        _timeout: Duration,
    ) -> Result<()> {
        let failing = self.script(host)?.unreachable_checks;
        let mut checks = self.reach_checks.lock().expect("transport lock");
        let made = checks.entry(host.name.clone()).or_insert(0);
        *made += 1;
        if *made > failing {
            Ok(())
        } else {
            Err(anyhow!("{}: connection refused", host.hostname))
        }
    }

    fn auth_available(&self, host: &HostConfig) -> Result<()> {
        if self.script(host)?.auth {
            Ok(())
        } else {
            Err(anyhow!("no credentials for {}", host.name))
        }
    }

    fn execute(
        &self,
        host: &HostConfig,
        _remote_args: &[String],
        _timeout: Duration,
    ) -> Result<RemoteExecution> {
        self.executed
            .lock()
            .expect("transport lock")
            .push(host.name.clone());
        self.pending
            .lock()
            .expect("transport lock")
            .get_mut(&host.name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("script for {} exhausted", host.name))
    }
}
