//! Job supervisor: admission, launch, observation, stop and restart.
//!
//! The supervisor keeps no state between calls. Every operation re-reads the
//! job's artifacts, so a supervisor started after a crash derives exactly what
//! the previous one would have.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::health::{JobSnapshot, ProcessView, derive_health};
use crate::core::heartbeat::{Heartbeat, Observation, advance};
use crate::core::permission::CODE_UNRESOLVABLE;
use crate::core::types::{
    ExecutionMode, GateKind, GateResult, GateVerdict, Health, JobState, ReasonCode,
};
use crate::error::Rejection;
use crate::exit_codes;
use crate::gates::{
    BaselineGate, GateChain, PermissionGate, PostGateReport, evaluate_post_gates,
    load_post_gates,
};
use crate::io::artifacts::{
    ArtifactStore, JobMeta, JobPaths, TerminalOutcome, read_text, write_text_atomic,
};
use crate::io::clock::Clock;
use crate::io::config::RunnerConfig;
use crate::io::git::Git;
use crate::io::lock::{AdmissionLock, FileLock};
use crate::io::mutation;
use crate::io::process;
use crate::io::provider::{LaunchRequest, Launched, LivenessSignals, Provider, ProviderRegistry};

/// Poll interval while waiting on a foreground job.
pub const FOREGROUND_POLL: Duration = Duration::from_secs(2);

const STOP_POLL: Duration = Duration::from_millis(100);

/// Parameters of `start`.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub task: String,
    pub provider: String,
    /// Absolute worktree path.
    pub worktree: PathBuf,
    /// Prompt reference as given on the command line.
    pub prompt_ref: PathBuf,
    pub prompt: String,
    pub required_baseline: Option<String>,
    /// Trailer value expected on the job's commits; defaults to the task id.
    pub feature_key: Option<String>,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub task: String,
    pub pid: u32,
    pub selected_model: String,
    pub fallback_reason: Option<String>,
    pub execution_mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub task: String,
    pub retries: u32,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The live process was signalled.
    Signalled { pid: u32 },
    /// No pid had been recorded; the job is now cancelled.
    Cancelled,
    AlreadyStopped,
}

/// Current view of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub task: String,
    pub health: Health,
    /// `None` when metadata is absent (missing, or still being created).
    pub meta: Option<JobMeta>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub heartbeat: Option<Heartbeat>,
    pub mutations: u64,
    pub log_bytes: u64,
    pub outcome: Option<TerminalOutcome>,
    pub gates: Option<PostGateReport>,
}

impl JobStatus {
    /// Exit code `check` reports for this status.
    pub fn check_exit_code(&self) -> i32 {
        exit_codes::for_state(self.health.state)
    }

    /// Counts against the admission ceiling.
    pub fn is_live(&self) -> bool {
        !self.health.state.is_terminal() && self.health.state != JobState::Missing
    }
}

pub struct Supervisor {
    store: ArtifactStore,
    config: RunnerConfig,
    providers: ProviderRegistry,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(
        store: ArtifactStore,
        config: RunnerConfig,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            providers,
            clock,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Admit and launch a new job.
    ///
    /// Order: task id, symlink resolution, permission gate, baseline gate,
    /// provider lookup, job lock, duplicate check, admission lock and ceiling,
    /// artifacts, launch. Nothing is spawned unless every step before the
    /// launch succeeds.
    #[instrument(skip_all, fields(task = %request.task, provider = %request.provider))]
    pub fn start(&self, request: &StartRequest) -> Result<StartOutcome> {
        let paths = self.store.job(&request.task)?;
        let request = &StartRequest {
            worktree: resolve_worktree(&request.worktree)?,
            ..request.clone()
        };
        let allowed_prefixes: Vec<PathBuf> = self
            .config
            .allowed_prefixes
            .iter()
            .map(|prefix| fs::canonicalize(prefix).unwrap_or_else(|_| prefix.clone()))
            .collect();
        let admission_gates = GateChain::new()
            .with(PermissionGate {
                allowed_prefixes: &allowed_prefixes,
            })
            .with(BaselineGate {
                required: request.required_baseline.as_deref(),
            });
        for result in admission_gates.run_until_blocked(&request.worktree) {
            enforce(
                result,
                &request.worktree,
                request.required_baseline.as_deref(),
            )?;
        }
        let provider = self.providers.get(&request.provider)?;
        if !request.worktree.is_dir() {
            return Err(anyhow!(
                "worktree {} is not a directory",
                request.worktree.display()
            ));
        }

        let Some(_job_lock) = FileLock::try_acquire(&paths.lock)? else {
            return Err(Rejection::AlreadyRunning {
                task: request.task.clone(),
                pid: paths.read_pid()?,
            }
            .into());
        };
        if paths.read_meta()?.is_some() || paths.read_pid()?.is_some() {
            let signals = provider.check(&paths)?;
            return Err(if signals.pid_alive {
                Rejection::AlreadyRunning {
                    task: request.task.clone(),
                    pid: signals.pid,
                }
            } else {
                Rejection::JobExists {
                    task: request.task.clone(),
                }
            }
            .into());
        }

        let result = self
            .admit(&request.task)
            .and_then(|_admission| self.launch_new(request, provider, &paths));
        if result.is_err()
            && let Err(err) = paths.remove_all()
        {
            warn!(err = %err, "failed to clean up rejected job");
        }
        result
    }

    fn launch_new(
        &self,
        request: &StartRequest,
        provider: &dyn Provider,
        paths: &JobPaths,
    ) -> Result<StartOutcome> {
        let now = self.clock.now();
        paths.create_dir()?;
        write_text_atomic(&paths.prompt, &request.prompt)?;
        mutation::write_baseline(paths, &request.worktree, now)?;
        let mut meta = JobMeta {
            task: request.task.clone(),
            provider: provider.name().to_string(),
            worktree: request.worktree.clone(),
            prompt_path: request.prompt_ref.clone(),
            retries: 0,
            created_at: now,
            started_at: now,
            selected_model: None,
            fallback_reason: None,
            execution_mode: request.mode,
            required_baseline: request.required_baseline.clone(),
            start_commit: head_commit(&request.worktree),
            feature_key: request.feature_key.clone(),
        };
        paths.write_meta(&meta)?;

        let launched = self.launch(provider, paths, &mut meta, &request.prompt)?;
        Ok(StartOutcome {
            task: meta.task,
            pid: launched.pid,
            selected_model: launched.selection.selected_model,
            fallback_reason: launched.selection.fallback_reason,
            execution_mode: meta.execution_mode,
        })
    }

    fn launch(
        &self,
        provider: &dyn Provider,
        paths: &JobPaths,
        meta: &mut JobMeta,
        prompt: &str,
    ) -> Result<Launched> {
        let launched = provider.start(&LaunchRequest {
            paths,
            task: &meta.task,
            worktree: &meta.worktree,
            prompt,
        })?;
        meta.selected_model = Some(launched.selection.selected_model.clone());
        meta.fallback_reason = launched.selection.fallback_reason.clone();
        paths.write_meta(meta)?;
        if paths.stop_requested() {
            warn!(pid = launched.pid, "stop requested during launch");
            provider.stop(launched.pid)?;
        }
        info!(
            pid = launched.pid,
            retries = meta.retries,
            model = %launched.selection.selected_model,
            "job launched"
        );
        Ok(launched)
    }

    /// Take the admission lock and check the concurrency ceiling.
    fn admit(&self, task: &str) -> Result<AdmissionLock> {
        let lock =
            AdmissionLock::acquire(&self.store.dispatch_lock_path(), self.config.admission_wait())?;
        let mut live = 0;
        for other in self.store.list_jobs()? {
            if other == task {
                continue;
            }
            match self.evaluate(&other) {
                Ok(status) if status.is_live() => live += 1,
                Ok(_) => {}
                Err(err) => warn!(task = %other, err = %format!("{err:#}"), "skipping unreadable job"),
            }
        }
        if live >= self.config.max_concurrent_jobs {
            return Err(Rejection::CapacityExceeded {
                live,
                limit: self.config.max_concurrent_jobs,
            }
            .into());
        }
        debug!(live, limit = self.config.max_concurrent_jobs, "admitted");
        Ok(lock)
    }

    /// Observe a job, persist the heartbeat and, on the first terminal
    /// observation, run post-exit gates and record the outcome.
    #[instrument(skip_all, fields(task))]
    pub fn check(&self, task: &str) -> Result<JobStatus> {
        self.observe(task, true)
    }

    /// Derive a job's health without writing anything.
    pub fn evaluate(&self, task: &str) -> Result<JobStatus> {
        self.observe(task, false)
    }

    /// Check every known job. Jobs that cannot be read are logged and skipped.
    pub fn status_all(&self) -> Result<Vec<JobStatus>> {
        let mut statuses = Vec::new();
        for task in self.store.list_jobs()? {
            match self.check(&task) {
                Ok(status) => statuses.push(status),
                Err(err) => warn!(task = %task, err = %format!("{err:#}"), "status failed"),
            }
        }
        Ok(statuses)
    }

    fn observe(&self, task: &str, record: bool) -> Result<JobStatus> {
        let paths = self.existing(task)?;
        let now = self.clock.now();
        let Some(meta) = paths.read_meta()? else {
            return self.metaless_status(&paths);
        };
        if let Some(outcome) = paths.read_outcome()? {
            return self.recorded_status(&paths, meta, outcome);
        }

        let provider = self.providers.get(&meta.provider)?;
        let signals = provider.check(&paths)?;
        let mutations = if record {
            match mutation::observe(&paths, &meta.worktree, now) {
                Ok(count) => count,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "mutation scan failed");
                    mutation::recorded_count(&paths)?
                }
            }
        } else {
            mutation::recorded_count(&paths)?
        };
        let prev = paths.read_heartbeat()?;
        let heartbeat = advance(
            prev.as_ref(),
            Observation {
                log_bytes: signals.log_bytes,
                tool_calls: signals.tool_calls,
                mutations,
                tool_scan_offset: signals.tool_scan_offset,
                pid: signals.pid,
                pid_alive: signals.pid_alive,
            },
            now,
        );
        let artifacts_lost = prev.as_ref().is_some_and(|hb| hb.pid_seen.is_some())
            && signals.pid.is_none()
            && signals.exit_code.is_none();
        let process = match (signals.pid, signals.pid_alive) {
            (None, _) => ProcessView::NotRecorded,
            (Some(_), true) => ProcessView::Alive,
            (Some(_), false) => ProcessView::Gone {
                dead_since: heartbeat.dead_since.unwrap_or(now),
            },
        };
        let snapshot = JobSnapshot {
            started_at: meta.started_at,
            retries: meta.retries,
            process,
            exit_code: signals.exit_code,
            stop_requested: paths.stop_requested(),
            recorded: None,
            heartbeat: Some(heartbeat.clone()),
            artifacts_lost,
        };
        let health = derive_health(&snapshot, &self.config.thresholds(), now);
        debug!(state = health.state.as_str(), reason = health.reason.as_str(), "health derived");

        let mut outcome = None;
        if record {
            paths.write_heartbeat(&heartbeat)?;
            if health.state.is_terminal() {
                outcome = Some(self.finalize(provider, &paths, &meta, health, &signals, now)?);
            }
        }
        Ok(JobStatus {
            task: meta.task.clone(),
            health: outcome.map_or(health, |o: TerminalOutcome| o.health()),
            pid: signals.pid,
            exit_code: signals.exit_code,
            heartbeat: Some(heartbeat),
            mutations,
            log_bytes: signals.log_bytes,
            outcome,
            gates: load_post_gates(&paths)?,
            meta: Some(meta),
        })
    }

    fn finalize(
        &self,
        provider: &dyn Provider,
        paths: &JobPaths,
        meta: &JobMeta,
        health: Health,
        signals: &LivenessSignals,
        now: DateTime<Utc>,
    ) -> Result<TerminalOutcome> {
        if matches!(health.state, JobState::ExitedOk | JobState::ExitedErr)
            && let Err(err) =
                evaluate_post_gates(meta, paths, &self.config.feature_key_trailer, now)
        {
            warn!(err = %format!("{err:#}"), "post-exit gates could not be evaluated");
        }
        if health.state == JobState::Blocked
            && let Some(pid) = signals.pid
            && signals.pid_alive
        {
            warn!(pid, retries = meta.retries, "retries exhausted; stopping blocked job");
            if let Err(err) = provider.stop(pid) {
                warn!(pid, err = %err, "failed to stop blocked job");
            }
        }
        let outcome = TerminalOutcome {
            state: health.state,
            reason: health.reason,
            completed_at: now,
            exit_code: signals.exit_code,
        };
        if paths.record_outcome(&outcome)? {
            info!(
                state = health.state.as_str(),
                reason = health.reason.as_str(),
                exit_code = ?signals.exit_code,
                "job reached terminal state"
            );
            Ok(outcome)
        } else {
            // Another observer recorded first; theirs is authoritative.
            paths
                .read_outcome()?
                .ok_or_else(|| anyhow!("outcome for {} vanished", paths.task))
        }
    }

    fn recorded_status(
        &self,
        paths: &JobPaths,
        meta: JobMeta,
        outcome: TerminalOutcome,
    ) -> Result<JobStatus> {
        let heartbeat = paths.read_heartbeat()?;
        Ok(JobStatus {
            task: meta.task.clone(),
            health: outcome.health(),
            pid: paths.read_pid()?,
            exit_code: outcome.exit_code.or(paths.read_exit_code()?),
            mutations: mutation::recorded_count(paths)?,
            log_bytes: paths.log_bytes()?,
            heartbeat,
            outcome: Some(outcome),
            gates: load_post_gates(paths)?,
            meta: Some(meta),
        })
    }

    /// A job directory without metadata is either mid-creation or lost.
    fn metaless_status(&self, paths: &JobPaths) -> Result<JobStatus> {
        let creating = FileLock::try_acquire(&paths.lock)?.is_none();
        let health = if creating {
            Health::new(JobState::Launching, ReasonCode::Launching)
        } else {
            Health::new(JobState::Missing, ReasonCode::ArtifactsMissing)
        };
        Ok(JobStatus {
            task: paths.task.clone(),
            health,
            meta: None,
            pid: paths.read_pid()?,
            exit_code: paths.read_exit_code()?,
            heartbeat: paths.read_heartbeat()?,
            mutations: mutation::recorded_count(paths)?,
            log_bytes: paths.log_bytes()?,
            outcome: paths.read_outcome()?,
            gates: None,
        })
    }

    /// Stop a job. Idempotent: stopping a stopped job is not an error.
    #[instrument(skip_all, fields(task))]
    pub fn stop(&self, task: &str) -> Result<StopOutcome> {
        let paths = self.existing(task)?;
        if paths.read_outcome()?.is_some() {
            return Ok(StopOutcome::AlreadyStopped);
        }
        let now = self.clock.now();
        if !paths.stop_requested() {
            paths.mark_stop_requested(now)?;
        }

        let Some(pid) = paths.read_pid()? else {
            if paths.read_exit_code()?.is_some() {
                return Ok(StopOutcome::AlreadyStopped);
            }
            let cancelled = TerminalOutcome {
                state: JobState::Cancelled,
                reason: ReasonCode::Cancelled,
                completed_at: now,
                exit_code: None,
            };
            paths.record_outcome(&cancelled)?;
            info!("job cancelled before a pid was recorded");
            return Ok(StopOutcome::Cancelled);
        };

        let Some(meta) = paths.read_meta()? else {
            return Ok(if process::terminate(pid)? {
                StopOutcome::Signalled { pid }
            } else {
                StopOutcome::AlreadyStopped
            });
        };
        let provider = self.providers.get(&meta.provider)?;
        let signals = provider.check(&paths)?;
        if signals.exit_code.is_some() || !signals.pid_alive {
            return Ok(StopOutcome::AlreadyStopped);
        }
        self.terminate(provider, &paths, pid)?;
        Ok(StopOutcome::Signalled { pid })
    }

    /// SIGTERM, wait for the grace period, then SIGKILL.
    fn terminate(&self, provider: &dyn Provider, paths: &JobPaths, pid: u32) -> Result<()> {
        if !provider.stop(pid)? {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.stop_grace();
        while Instant::now() < deadline {
            if !provider.check(paths)?.pid_alive {
                info!(pid, "job stopped");
                return Ok(());
            }
            thread::sleep(STOP_POLL);
        }
        warn!(pid, "job ignored SIGTERM; killing");
        process::force_kill(pid)?;
        Ok(())
    }

    /// Stop (best-effort) and relaunch a job under the same id.
    ///
    /// Rotates the log, clears per-attempt artifacts including the outcome,
    /// and increments `retries` before launching. The original creation time,
    /// start commit and feature key are kept.
    #[instrument(skip_all, fields(task))]
    pub fn restart(&self, task: &str) -> Result<RestartOutcome> {
        let paths = self.existing(task)?;
        let Some(_job_lock) = FileLock::try_acquire(&paths.lock)? else {
            return Err(Rejection::AlreadyRunning {
                task: task.to_string(),
                pid: paths.read_pid()?,
            }
            .into());
        };
        let mut meta = paths
            .read_meta()?
            .ok_or_else(|| anyhow!("job {task} has no metadata and cannot be restarted"))?;
        let provider = self.providers.get(&meta.provider)?;
        let prompt = read_text(&paths.prompt)?
            .ok_or_else(|| anyhow!("job {task} has no stored prompt"))?;
        let _admission = self.admit(task)?;

        if let Some(pid) = paths.read_pid()?
            && provider.check(&paths)?.pid_alive
        {
            self.terminate(provider, &paths, pid)?;
        }
        paths.rotate_log()?;
        paths.clear_attempt()?;

        let now = self.clock.now();
        meta.retries += 1;
        meta.started_at = now;
        meta.selected_model = None;
        meta.fallback_reason = None;
        let marker = mutation::write_baseline(&paths, &meta.worktree, now)?;
        paths.write_heartbeat(&Heartbeat::attempt_start(now, marker.count))?;
        paths.write_meta(&meta)?;
        info!(retries = meta.retries, "restarting job");

        let launched = self.launch(provider, &paths, &mut meta, &prompt)?;
        Ok(RestartOutcome {
            task: meta.task,
            retries: meta.retries,
            pid: launched.pid,
        })
    }

    /// Record a `blocked` outcome for a job whose retries are exhausted and
    /// stop its process best-effort. Returns `false` if an outcome already existed.
    pub fn mark_blocked(&self, task: &str) -> Result<bool> {
        let paths = self.existing(task)?;
        if paths.read_outcome()?.is_some() {
            return Ok(false);
        }
        let exit_code = paths.read_exit_code()?;
        if let Some(meta) = paths.read_meta()?
            && let Some(pid) = paths.read_pid()?
        {
            let provider = self.providers.get(&meta.provider)?;
            if provider.check(&paths)?.pid_alive
                && let Err(err) = provider.stop(pid)
            {
                warn!(pid, err = %err, "failed to stop blocked job");
            }
        }
        let recorded = paths.record_outcome(&TerminalOutcome {
            state: JobState::Blocked,
            reason: ReasonCode::RetriesExhausted,
            completed_at: self.clock.now(),
            exit_code,
        })?;
        if recorded {
            warn!(task, "job blocked after exhausting retries");
        }
        Ok(recorded)
    }

    /// Poll a job until it is terminal, missing, stalled or no-op.
    pub fn wait(&self, task: &str, poll: Duration) -> Result<JobStatus> {
        loop {
            let status = self.check(task)?;
            let state = status.health.state;
            if state.is_terminal() || state.is_retryable() || state == JobState::Missing {
                return Ok(status);
            }
            thread::sleep(poll);
        }
    }

    fn existing(&self, task: &str) -> Result<JobPaths> {
        let paths = self.store.job(task)?;
        if !paths.dir_exists() {
            return Err(Rejection::UnknownJob {
                task: task.to_string(),
            }
            .into());
        }
        Ok(paths)
    }
}

/// Turn a blocking pre-start gate result into its rejection.
fn enforce(result: GateResult, worktree: &Path, baseline: Option<&str>) -> Result<()> {
    if result.passed() || result.verdict == GateVerdict::Skipped {
        return Ok(());
    }
    warn!(gate = result.gate.as_str(), code = ?result.code, "admission gate rejected start");
    Err(match result.gate {
        GateKind::Permission => Rejection::PermissionDenied {
            path: worktree.to_path_buf(),
            code: result.code.unwrap_or_default(),
        },
        _ => Rejection::BaselineNotMet {
            baseline: baseline.unwrap_or_default().to_string(),
            detail: result.detail.unwrap_or_default(),
        },
    }
    .into())
}

/// Follow symlinks so the permission gate judges where the job will really
/// write. Relative paths are left for the gate to reject.
fn resolve_worktree(worktree: &Path) -> Result<PathBuf> {
    if !worktree.is_absolute() {
        return Ok(worktree.to_path_buf());
    }
    fs::canonicalize(worktree).map_err(|err| {
        warn!(worktree = %worktree.display(), err = %err, "cannot resolve worktree");
        anyhow::Error::from(Rejection::PermissionDenied {
            path: worktree.to_path_buf(),
            code: CODE_UNRESOLVABLE.to_string(),
        })
    })
}

fn head_commit(worktree: &Path) -> Option<String> {
    let git = Git::new(worktree);
    if git.is_repo() {
        git.head_sha().ok()
    } else {
        None
    }
}
