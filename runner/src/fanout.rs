//! Remote fanout: run a `jobrunner` invocation on a set of registered hosts.
//!
//! Every host goes through the same preflight sequence (host mapping, name
//! resolution, reachability, auth availability) before any attempt is made.
//! Attempts follow a bounded policy: at most two, a fixed delay between them,
//! and no retry after an authentication failure. Every attempt, including a
//! failed preflight (attempt 0), is appended to the fanout ledger.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::retry::{AttemptFailure, MAX_DISPATCH_ATTEMPTS, should_retry_attempt};
use crate::core::types::{AuthMode, DispatchOutcome};
use crate::exit_codes;
use crate::io::artifacts::{ArtifactStore, append_json_line};
use crate::io::clock::Clock;
use crate::io::config::{FanoutConfig, HostConfig, RunnerConfig};
use crate::io::transport::{RemoteExecution, SSH_CONNECTION_ERROR, Transport, is_auth_failure};

pub const LEDGER_FILE: &str = "attempts.jsonl";

/// One line of `fanout/attempts.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub at: DateTime<Utc>,
    pub host: String,
    pub user: String,
    pub auth_mode: Option<AuthMode>,
    /// 1-based; 0 for a preflight failure.
    pub attempt: u32,
    pub duration_ms: u64,
    pub outcome: DispatchOutcome,
    pub reason: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Final result for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostResult {
    pub host: String,
    pub outcome: DispatchOutcome,
    /// Attempts actually made (0 when preflight failed or the dispatch was aborted first).
    pub attempts: u32,
    pub reason: String,
    pub auth_failure: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub results: Vec<HostResult>,
}

impl FanoutReport {
    /// 0 when every host succeeded, 21 if any failed preflight, 10 if any
    /// failed authentication, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        if self
            .results
            .iter()
            .all(|result| result.outcome == DispatchOutcome::Success)
        {
            exit_codes::OK
        } else if self
            .results
            .iter()
            .any(|result| result.outcome == DispatchOutcome::PreflightFailed)
        {
            exit_codes::PREFLIGHT_FAILED
        } else if self.results.iter().any(|result| result.auth_failure) {
            exit_codes::AUTH_FAILED
        } else {
            exit_codes::GENERAL_ERROR
        }
    }
}

#[derive(Debug)]
struct PreflightFailure {
    stage: &'static str,
    detail: String,
}

/// Result of the preflight sequence for one host.
enum Preflight<'h> {
    Ready(&'h HostConfig),
    Failed(PreflightFailure),
}

impl PreflightFailure {
    fn new(stage: &'static str, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }

    fn reason(&self) -> String {
        format!("{}: {}", self.stage, self.detail)
    }
}

/// Classified result of one attempt.
struct Classified {
    outcome: DispatchOutcome,
    failure: Option<AttemptFailure>,
    reason: String,
    exit_code: Option<i32>,
}

fn classify(execution: &RemoteExecution) -> Classified {
    let mut classified = Classified {
        outcome: DispatchOutcome::Failure,
        failure: Some(AttemptFailure::Terminal),
        reason: String::new(),
        exit_code: execution.exit_code,
    };
    if execution.timed_out {
        classified.outcome = DispatchOutcome::Timeout;
        classified.reason = "attempt timed out".to_string();
    } else if let Some(signal) = execution.signal {
        classified.outcome = DispatchOutcome::Aborted;
        classified.reason = format!("transport killed by signal {signal}");
    } else {
        match execution.exit_code {
            Some(0) => {
                classified.outcome = DispatchOutcome::Success;
                classified.failure = None;
                classified.reason = "ok".to_string();
            }
            Some(SSH_CONNECTION_ERROR) if is_auth_failure(&execution.stderr) => {
                classified.failure = Some(AttemptFailure::Auth);
                classified.reason = format!("auth_failed: {}", first_line(&execution.stderr));
            }
            Some(SSH_CONNECTION_ERROR) => {
                classified.failure = Some(AttemptFailure::Transient);
                classified.reason = format!("connection_error: {}", first_line(&execution.stderr));
            }
            Some(code) => classified.reason = format!("remote command exited with {code}"),
            None => classified.reason = "no exit status".to_string(),
        }
    }
    classified
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

pub struct Dispatcher<'a> {
    transport: &'a dyn Transport,
    settings: &'a FanoutConfig,
    hosts: &'a [HostConfig],
    clock: &'a dyn Clock,
    ledger: PathBuf,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        config: &'a RunnerConfig,
        store: &ArtifactStore,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            transport,
            settings: &config.fanout,
            hosts: &config.hosts,
            clock,
            ledger: store.fanout_dir().join(LEDGER_FILE),
        }
    }

    pub fn ledger_path(&self) -> &std::path::Path {
        &self.ledger
    }

    /// Dispatch `remote_args` to every named host concurrently.
    ///
    /// With `fail_fast`, the first host to end unsuccessfully aborts attempts
    /// that have not started yet on the other hosts.
    #[instrument(skip_all, fields(hosts = host_names.len()))]
    pub fn dispatch(
        &self,
        host_names: &[String],
        remote_args: &[String],
        fail_fast: bool,
    ) -> Result<FanoutReport> {
        let mut unique: Vec<&String> = Vec::new();
        for name in host_names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        if unique.is_empty() {
            return Err(anyhow!("no hosts selected"));
        }

        let abort = AtomicBool::new(false);
        let abort = &abort;
        let joined: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = unique
                .iter()
                .map(|name| {
                    scope.spawn(move || self.dispatch_host(name, remote_args, abort, fail_fast))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join()).collect()
        });

        let mut results = Vec::with_capacity(joined.len());
        for result in joined {
            results.push(result.map_err(|_| anyhow!("dispatch thread panicked"))??);
        }
        Ok(FanoutReport { results })
    }

    fn dispatch_host(
        &self,
        name: &str,
        remote_args: &[String],
        abort: &AtomicBool,
        fail_fast: bool,
    ) -> Result<HostResult> {
        let result = self.run_host(name, remote_args, abort)?;
        if fail_fast && result.outcome != DispatchOutcome::Success {
            abort.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    fn run_host(&self, name: &str, remote_args: &[String], abort: &AtomicBool) -> Result<HostResult> {
        let known = self.hosts.iter().find(|host| host.name == name);
        if abort.load(Ordering::SeqCst) {
            return self.aborted(name, known, 0);
        }

        let started = Instant::now();
        let host = match self.preflight(name)? {
            Preflight::Ready(host) => host,
            Preflight::Failed(failure) => {
                let reason = failure.reason();
                warn!(host = name, reason = %reason, "preflight failed");
                self.record(AttemptRecord {
                    at: self.clock.now(),
                    host: name.to_string(),
                    user: known.map(|host| host.user.clone()).unwrap_or_default(),
                    auth_mode: known.and_then(|host| host.auth_mode),
                    attempt: 0,
                    duration_ms: elapsed_ms(started),
                    outcome: DispatchOutcome::PreflightFailed,
                    reason: reason.clone(),
                    exit_code: None,
                })?;
                return Ok(HostResult {
                    host: name.to_string(),
                    outcome: DispatchOutcome::PreflightFailed,
                    attempts: 0,
                    reason,
                    auth_failure: false,
                    exit_code: None,
                    stdout: String::new(),
                });
            }
        };

        let max_attempts = self.settings.max_attempts.clamp(1, MAX_DISPATCH_ATTEMPTS);
        let timeout = Duration::from_secs(self.settings.attempt_timeout_secs);
        let mut attempt = 0;
        loop {
            if abort.load(Ordering::SeqCst) {
                return self.aborted(name, Some(host), attempt);
            }
            attempt += 1;
            let started = Instant::now();
            let (classified, stdout) = match self.transport.execute(host, remote_args, timeout) {
                Ok(execution) => (classify(&execution), execution.stdout),
                Err(err) => (
                    Classified {
                        outcome: DispatchOutcome::Failure,
                        failure: Some(AttemptFailure::Terminal),
                        reason: format!("transport error: {err:#}"),
                        exit_code: None,
                    },
                    String::new(),
                ),
            };
            self.record(AttemptRecord {
                at: self.clock.now(),
                host: host.name.clone(),
                user: host.user.clone(),
                auth_mode: host.auth_mode,
                attempt,
                duration_ms: elapsed_ms(started),
                outcome: classified.outcome,
                reason: classified.reason.clone(),
                exit_code: classified.exit_code,
            })?;

            let retry = classified
                .failure
                .is_some_and(|failure| should_retry_attempt(attempt, max_attempts, failure));
            if !retry {
                return Ok(HostResult {
                    host: host.name.clone(),
                    outcome: classified.outcome,
                    attempts: attempt,
                    reason: classified.reason,
                    auth_failure: classified.failure == Some(AttemptFailure::Auth),
                    exit_code: classified.exit_code,
                    stdout,
                });
            }
            info!(host = %host.name, attempt, delay_secs = self.settings.retry_delay_secs, "retrying after transient failure");
            thread::sleep(Duration::from_secs(self.settings.retry_delay_secs));
        }
    }

    /// Host mapping, resolution, reachability, then auth availability.
    ///
    /// Reachability is retried under the attempt policy; a failed check that
    /// is retried is written to the ledger as its own attempt-0 record.
    fn preflight(&self, name: &str) -> Result<Preflight<'a>> {
        let host = match self.mapped_host(name) {
            Ok(host) => host,
            Err(failure) => return Ok(Preflight::Failed(failure)),
        };
        let addrs = match self.transport.resolve(host) {
            Ok(addrs) => addrs,
            Err(err) => {
                return Ok(Preflight::Failed(PreflightFailure::new(
                    "resolve",
                    format!("{err:#}"),
                )));
            }
        };

        let max_checks = self.settings.max_attempts.clamp(1, MAX_DISPATCH_ATTEMPTS);
        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let mut check = 0;
        loop {
            check += 1;
            let started = Instant::now();
            let Err(err) = self.transport.reachable(host, &addrs, timeout) else {
                break;
            };
            let failure = PreflightFailure::new("reachability", format!("{err:#}"));
            if !should_retry_attempt(check, max_checks, AttemptFailure::Transient) {
                return Ok(Preflight::Failed(failure));
            }
            let reason = format!("{} (retrying)", failure.reason());
            warn!(host = %host.name, check, reason = %reason, "reachability check failed");
            self.record(AttemptRecord {
                at: self.clock.now(),
                host: host.name.clone(),
                user: host.user.clone(),
                auth_mode: host.auth_mode,
                attempt: 0,
                duration_ms: elapsed_ms(started),
                outcome: DispatchOutcome::PreflightFailed,
                reason,
                exit_code: None,
            })?;
            thread::sleep(Duration::from_secs(self.settings.retry_delay_secs));
        }

        if let Err(err) = self.transport.auth_available(host) {
            return Ok(Preflight::Failed(PreflightFailure::new(
                "auth",
                format!("{err:#}"),
            )));
        }
        Ok(Preflight::Ready(host))
    }

    /// Static checks on the host registry entry; no network access.
    fn mapped_host(&self, name: &str) -> std::result::Result<&'a HostConfig, PreflightFailure> {
        let host = self
            .hosts
            .iter()
            .find(|host| host.name == name)
            .ok_or_else(|| PreflightFailure::new("host_mapping", "host is not registered"))?;
        if host.user.trim().is_empty() {
            return Err(PreflightFailure::new("host_mapping", "no canonical user"));
        }
        if host.auth_mode.is_none() {
            return Err(PreflightFailure::new("host_mapping", "no auth mode configured"));
        }
        Ok(host)
    }

    fn aborted(&self, name: &str, host: Option<&HostConfig>, attempts: u32) -> Result<HostResult> {
        let reason = "dispatch aborted".to_string();
        self.record(AttemptRecord {
            at: self.clock.now(),
            host: name.to_string(),
            user: host.map(|host| host.user.clone()).unwrap_or_default(),
            auth_mode: host.and_then(|host| host.auth_mode),
            attempt: attempts,
            duration_ms: 0,
            outcome: DispatchOutcome::Aborted,
            reason: reason.clone(),
            exit_code: None,
        })?;
        Ok(HostResult {
            host: name.to_string(),
            outcome: DispatchOutcome::Aborted,
            attempts,
            reason,
            auth_failure: false,
            exit_code: None,
            stdout: String::new(),
        })
    }

    fn record(&self, record: AttemptRecord) -> Result<()> {
        info!(
            host = %record.host,
            user = %record.user,
            auth_mode = record.auth_mode.map_or("none", AuthMode::as_str),
            attempt = record.attempt,
            duration_ms = record.duration_ms,
            outcome = record.outcome.as_str(),
            reason = %record.reason,
            "fanout attempt"
        );
        append_json_line(&self.ledger, &record)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
