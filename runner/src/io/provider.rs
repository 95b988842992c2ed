//! Provider adapters.
//!
//! The [`Provider`] trait is the uniform capability set the supervisor talks
//! to. [`CommandProvider`] implements it for any CLI agent described by a
//! [`ProviderConfig`]; tests use fakes that never spawn an agent.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, UndefinedBehavior, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::model::{ModelSelection, negotiate};
use crate::core::types::{ModelAvailability, PreflightStatus};
use crate::error::Rejection;
use crate::io::artifacts::{JobPaths, RuntimeContract};
use crate::io::config::{PromptVia, ProviderConfig, RunnerConfig};
use crate::io::process::{self, command_on_path, run_command_with_timeout};

const PROBE_OUTPUT_LIMIT: usize = 16 * 1024;

/// Parameters for launching one job attempt.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub paths: &'a JobPaths,
    pub task: &'a str,
    pub worktree: &'a Path,
    pub prompt: &'a str,
}

/// Result of a successful launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    /// Pid of the provider process itself (not of the monitor).
    pub pid: u32,
    pub monitor_pid: Option<u32>,
    pub selection: ModelSelection,
}

/// Raw liveness signals read from a job's artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSignals {
    pub pid: Option<u32>,
    pub pid_alive: bool,
    pub log_bytes: u64,
    /// `None` when the provider exposes no tool-invocation signal.
    pub tool_calls: Option<u64>,
    /// Log offset `tool_calls` was counted up to.
    pub tool_scan_offset: u64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub provider: String,
    pub status: PreflightStatus,
    pub checks: Vec<PreflightCheck>,
    pub selected_model: Option<String>,
    pub fallback_reason: Option<String>,
}

impl PreflightReport {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            status: PreflightStatus::Ok,
            checks: Vec::new(),
            selected_model: None,
            fallback_reason: None,
        }
    }

    fn check(&mut self, name: &str, ok: bool, detail: impl Into<String>) {
        self.checks.push(PreflightCheck {
            name: name.to_string(),
            ok,
            detail: detail.into(),
        });
    }

    fn fail(mut self, name: &str, detail: impl Into<String>) -> Self {
        self.check(name, false, detail);
        self.status = PreflightStatus::Fail;
        self
    }
}

/// Uniform provider capability set.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Launch the provider process for a job and return its pid.
    fn start(&self, request: &LaunchRequest<'_>) -> Result<Launched>;

    /// Read liveness signals for a job.
    fn check(&self, paths: &JobPaths) -> Result<LivenessSignals>;

    /// Signal the job's process. Returns `false` when it was already gone.
    fn stop(&self, pid: u32) -> Result<bool>;

    /// Side-effect-free readiness check.
    fn preflight(&self) -> Result<PreflightReport>;

    fn probe_model(&self, model: &str, timeout: Duration) -> ModelAvailability;
}

/// Provider backed by an external CLI agent.
pub struct CommandProvider {
    name: String,
    config: ProviderConfig,
    state_root: PathBuf,
    spawn_timeout: Duration,
    monitor_program: PathBuf,
    tool_regex: Option<Regex>,
}

impl CommandProvider {
    pub fn new(
        name: &str,
        config: ProviderConfig,
        state_root: &Path,
        spawn_timeout: Duration,
    ) -> Result<Self> {
        let tool_regex = config
            .tool_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("compile tool_pattern for provider '{name}'"))?;
        let monitor_program =
            std::env::current_exe().context("resolve current executable for monitor")?;
        Ok(Self {
            name: name.to_string(),
            config,
            state_root: state_root.to_path_buf(),
            spawn_timeout,
            monitor_program,
            tool_regex,
        })
    }

    /// Override the binary used to run the completion monitor.
    pub fn with_monitor_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.monitor_program = program.into();
        self
    }

    /// Check credential requirements: env var (exit 10), then file (exit 11).
    pub fn check_credentials(&self) -> Result<()> {
        if let Some(var) = &self.config.auth_env {
            let present = std::env::var_os(var).is_some_and(|value| !value.is_empty());
            if !present {
                return Err(Rejection::AuthResolution {
                    provider: self.name.clone(),
                    detail: format!("environment variable {var} is not set"),
                }
                .into());
            }
        }
        if let Some(path) = &self.config.credential_file {
            let path = expand_home(path);
            let detail = match fs::read(&path) {
                Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Some("file is empty"),
                Ok(_) => None,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Some("file not found"),
                Err(_) => Some("file is unreadable"),
            };
            if let Some(detail) = detail {
                return Err(Rejection::CredentialFile {
                    provider: self.name.clone(),
                    path,
                    detail: detail.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn render_args(&self, templates: &[String], vars: &TemplateVars<'_>) -> Result<Vec<String>> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        templates
            .iter()
            .map(|template| {
                env.render_str(
                    template,
                    context! {
                        task => vars.task,
                        worktree => vars.worktree,
                        model => vars.model,
                        prompt_file => vars.prompt_file,
                        prompt_text => vars.prompt_text,
                    },
                )
                .with_context(|| format!("render provider argument '{template}'"))
            })
            .collect()
    }

    fn negotiate_model(&self) -> Result<ModelSelection> {
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        negotiate(
            &self.config.preferred_model,
            &self.config.fallback_models,
            |model| self.probe_model(model, timeout),
        )
        .map_err(|err| {
            Rejection::ModelUnavailable {
                provider: self.name.clone(),
                tried: err.tried,
            }
            .into()
        })
    }

    fn spawn_monitor(&self, paths: &JobPaths) -> Result<Child> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.monitor_log)
            .with_context(|| format!("open {}", paths.monitor_log.display()))?;
        let log_err = log.try_clone().context("clone monitor log handle")?;
        Command::new(&self.monitor_program)
            .arg("--state-dir")
            .arg(&self.state_root)
            .arg("monitor")
            .arg("--task")
            .arg(&paths.task)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .with_context(|| format!("spawn monitor {}", self.monitor_program.display()))
    }

    /// Wait for the monitor to record the provider pid.
    fn await_pid(&self, paths: &JobPaths, monitor: &mut Child) -> Result<u32> {
        let deadline = Instant::now() + self.spawn_timeout;
        loop {
            if let Some(pid) = paths.read_pid()? {
                return Ok(pid);
            }
            if let Some(status) = monitor.try_wait().context("poll monitor")? {
                let code = paths.read_exit_code()?;
                return Err(anyhow!(
                    "monitor exited ({}) before recording a pid (exit_code {:?})",
                    status,
                    code
                ));
            }
            if Instant::now() >= deadline {
                let _ = monitor.kill();
                let _ = monitor.wait();
                return Err(anyhow!(
                    "provider pid not recorded within {}s",
                    self.spawn_timeout.as_secs()
                ));
            }
            thread::sleep(Duration::from_millis(25));
        }
    }
}

struct TemplateVars<'a> {
    task: &'a str,
    worktree: &'a str,
    model: &'a str,
    prompt_file: &'a str,
    prompt_text: &'a str,
}

/// Count tool invocations in `job.log`, resuming from the offset stored in the
/// last heartbeat. Only complete lines are scanned; a log shorter than the
/// stored offset has been rotated and is counted from the start.
fn count_tool_calls(regex: &Regex, paths: &JobPaths, log_bytes: u64) -> Result<(u64, u64)> {
    let (base, offset) = match paths.read_heartbeat()? {
        Some(hb) if hb.tool_scan_offset <= log_bytes => (hb.tool_calls, hb.tool_scan_offset),
        _ => (0, 0),
    };
    let tail = paths.read_log_from(offset)?;
    let complete = tail
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |last| last + 1);
    let found = regex
        .find_iter(&String::from_utf8_lossy(&tail[..complete]))
        .count() as u64;
    Ok((base + found, offset + complete as u64))
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(provider = %self.name, task = request.task))]
    fn start(&self, request: &LaunchRequest<'_>) -> Result<Launched> {
        self.check_credentials()?;
        let selection = self.negotiate_model()?;
        if let Some(reason) = &selection.fallback_reason {
            warn!(model = %selection.selected_model, reason = %reason, "using fallback model");
        }

        let worktree = request.worktree.to_string_lossy();
        let prompt_file = request.paths.prompt.to_string_lossy();
        let vars = TemplateVars {
            task: request.task,
            worktree: &worktree,
            model: &selection.selected_model,
            prompt_file: &prompt_file,
            prompt_text: request.prompt,
        };
        let contract = RuntimeContract {
            program: self.config.command.clone(),
            args: self.render_args(&self.config.args, &vars)?,
            env: self.config.env.clone(),
            cwd: request.worktree.to_path_buf(),
            stdin_path: (self.config.prompt_via == PromptVia::Stdin)
                .then(|| request.paths.prompt.clone()),
            model: selection.selected_model.clone(),
        };
        request.paths.write_contract(&contract)?;

        let mut monitor = self.spawn_monitor(request.paths)?;
        let monitor_pid = monitor.id();
        let pid = self.await_pid(request.paths, &mut monitor)?;
        // The monitor outlives this call; reap it if we are still around when it exits.
        thread::spawn(move || {
            let _ = monitor.wait();
        });

        info!(pid, monitor_pid, model = %selection.selected_model, "provider launched");
        Ok(Launched {
            pid,
            monitor_pid: Some(monitor_pid),
            selection,
        })
    }

    fn check(&self, paths: &JobPaths) -> Result<LivenessSignals> {
        let pid = paths.read_pid()?;
        let pid_alive = pid.is_some_and(process::is_alive);
        let log_bytes = paths.log_bytes()?;
        let (tool_calls, tool_scan_offset) = match &self.tool_regex {
            Some(regex) => {
                let (calls, offset) = count_tool_calls(regex, paths, log_bytes)?;
                (Some(calls), offset)
            }
            None => (None, 0),
        };
        Ok(LivenessSignals {
            pid,
            pid_alive,
            log_bytes,
            tool_calls,
            tool_scan_offset,
            exit_code: paths.read_exit_code()?,
        })
    }

    fn stop(&self, pid: u32) -> Result<bool> {
        process::terminate(pid)
    }

    #[instrument(skip_all, fields(provider = %self.name))]
    fn preflight(&self) -> Result<PreflightReport> {
        let mut report = PreflightReport::new(&self.name);

        let Some(binary) = command_on_path(&self.config.command) else {
            return Ok(report.fail(
                "binary",
                format!("'{}' not found on PATH", self.config.command),
            ));
        };
        report.check("binary", true, binary.display().to_string());

        self.check_credentials()?;
        report.check("credentials", true, "present");

        if !self.config.preflight_args.is_empty() {
            let mut cmd = Command::new(&binary);
            cmd.args(&self.config.preflight_args);
            let timeout = Duration::from_secs(self.config.probe_timeout_secs);
            let output = run_command_with_timeout(cmd, None, timeout, PROBE_OUTPUT_LIMIT)
                .context("run preflight command")?;
            if !output.success() {
                return Ok(report.fail(
                    "invocation",
                    format!(
                        "'{} {}' failed (exit {:?}, timed_out {})",
                        self.config.command,
                        self.config.preflight_args.join(" "),
                        output.status.code(),
                        output.timed_out
                    ),
                ));
            }
            report.check("invocation", true, "ok");
        }

        match self.negotiate_model() {
            Ok(selection) => {
                if selection.fallback_reason.is_some() {
                    report.status = PreflightStatus::Degraded;
                }
                report.check("model", true, selection.selected_model.clone());
                report.selected_model = Some(selection.selected_model);
                report.fallback_reason = selection.fallback_reason;
                Ok(report)
            }
            Err(err) => Ok(report.fail("model", err.to_string())),
        }
    }

    fn probe_model(&self, model: &str, timeout: Duration) -> ModelAvailability {
        let Some(templates) = &self.config.probe_args else {
            return ModelAvailability::Available;
        };
        let vars = TemplateVars {
            task: "probe",
            worktree: ".",
            model,
            prompt_file: "",
            prompt_text: "",
        };
        let args = match self.render_args(templates, &vars) {
            Ok(args) => args,
            Err(err) => {
                warn!(model, err = %err, "probe arguments failed to render");
                return ModelAvailability::Unavailable;
            }
        };
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args).envs(&self.config.env);
        match run_command_with_timeout(cmd, None, timeout, PROBE_OUTPUT_LIMIT) {
            Ok(output) if output.success() => {
                debug!(model, "model available");
                ModelAvailability::Available
            }
            Ok(output) => {
                debug!(model, exit_code = ?output.status.code(), timed_out = output.timed_out, "model unavailable");
                ModelAvailability::Unavailable
            }
            Err(err) => {
                debug!(model, err = %err, "model probe failed to run");
                ModelAvailability::Unavailable
            }
        }
    }
}

/// Providers by name, selected at job-creation time.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command providers for every configured and built-in provider.
    pub fn from_config(config: &RunnerConfig, state_root: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for (name, provider) in config.effective_providers() {
            registry.insert(Box::new(CommandProvider::new(
                &name,
                provider,
                state_root,
                config.spawn_timeout(),
            )?));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, provider: Box<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<&dyn Provider> {
        self.providers
            .get(name)
            .map(|provider| provider.as_ref())
            .ok_or_else(|| {
                Rejection::ProviderNotFound {
                    provider: name.to_string(),
                }
                .into()
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}
