//! `jobrunner` command-line entry point.
//!
//! State lives under `--state-dir`, else `$JOBRUNNER_HOME`, else `.jobrunner`
//! in the current directory. Every command exits with a stable code from
//! [`jobrunner::exit_codes`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;

use jobrunner::core::types::{ExecutionMode, GateResult, ModelAvailability, PreflightStatus};
use jobrunner::error::Rejection;
use jobrunner::exit_codes;
use jobrunner::fanout::Dispatcher;
use jobrunner::gates::{BaselineGate, FeatureKeyGate, Gate, IntegrityGate};
use jobrunner::io::artifacts::ArtifactStore;
use jobrunner::io::clock::{Clock, SystemClock};
use jobrunner::io::config::{RunnerConfig, load_config};
use jobrunner::io::monitor::run_monitor;
use jobrunner::io::provider::ProviderRegistry;
use jobrunner::io::transport::SshTransport;
use jobrunner::logging;
use jobrunner::report::{JobReport, render_json, render_text};
use jobrunner::supervisor::{FOREGROUND_POLL, JobStatus, StartRequest, StopOutcome, Supervisor};
use jobrunner::watchdog::{WatchdogOptions, run_watchdog};

const DEFAULT_STATE_DIR: &str = ".jobrunner";
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;

#[derive(Parser)]
#[command(
    name = "jobrunner",
    version,
    about = "Supervise agent CLI jobs: launch, health, retry, governance gates and remote fanout"
)]
struct Cli {
    /// State directory (defaults to $JOBRUNNER_HOME, then ./.jobrunner).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a new job.
    Start {
        #[arg(long)]
        task: String,
        #[arg(long)]
        provider: String,
        /// File holding the prompt.
        #[arg(long)]
        prompt: PathBuf,
        /// Worktree the job may modify (defaults to the current directory).
        #[arg(long)]
        worktree: Option<PathBuf>,
        /// Commit the worktree HEAD must equal or descend from.
        #[arg(long)]
        required_baseline: Option<String>,
        /// Trailer value expected on the job's commits (defaults to the task id).
        #[arg(long)]
        feature_key: Option<String>,
        /// Wait for the job to finish and exit with its `check` code.
        #[arg(long)]
        foreground: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the health of one job or of every job.
    Status {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate one job and exit with its health code.
    Check {
        #[arg(long)]
        task: String,
        #[arg(long)]
        json: bool,
        /// Override the configured stall window.
        #[arg(long)]
        stall_minutes: Option<u64>,
    },
    /// Terminate a job (idempotent).
    Stop {
        #[arg(long)]
        task: String,
    },
    /// Stop and relaunch a job under the same id.
    Restart {
        #[arg(long)]
        task: String,
    },
    /// Periodically restart stalled and idle jobs.
    Watchdog {
        /// Seconds between passes.
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },
    /// Print the stable job report.
    Report {
        #[arg(long)]
        task: String,
        #[arg(long, value_enum, default_value = "json")]
        format: ReportFormat,
    },
    /// Check that providers are ready to launch jobs.
    Preflight {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Check whether a provider can use a model.
    Probe {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Worktree HEAD must equal or descend from a commit.
    BaselineGate {
        #[arg(long)]
        worktree: PathBuf,
        #[arg(long)]
        required_baseline: String,
        #[arg(long)]
        json: bool,
    },
    /// A reported completion commit must be in the worktree history.
    IntegrityGate {
        #[arg(long)]
        worktree: PathBuf,
        #[arg(long)]
        reported_commit: String,
        #[arg(long)]
        json: bool,
    },
    /// Commits must carry the feature-key trailer.
    FeatureKeyGate {
        #[arg(long)]
        worktree: PathBuf,
        #[arg(long)]
        feature_key: String,
        /// Only check commits after this one.
        #[arg(long)]
        base: Option<String>,
        /// Trailer key (defaults to the configured `feature_key_trailer`).
        #[arg(long)]
        trailer_key: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run a jobrunner command on registered remote hosts.
    Fanout {
        #[arg(long = "host")]
        hosts: Vec<String>,
        #[arg(long, conflicts_with = "hosts")]
        all_hosts: bool,
        #[arg(long)]
        json: bool,
        /// Abort attempts not yet started once any host fails.
        #[arg(long)]
        fail_fast: bool,
        /// Arguments for the remote jobrunner.
        #[arg(last = true, required = true)]
        remote_args: Vec<String>,
    },
    /// Completion monitor for a job (spawned by `start`).
    #[command(hide = true)]
    Monitor {
        #[arg(long)]
        task: String,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            let rejection = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<Rejection>());
            match rejection {
                Some(rejection) => eprintln!("error[{}]: {:#}", rejection.code(), err),
                None => eprintln!("error: {:#}", err),
            }
            exit_codes::exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let store = ArtifactStore::new(state_root(cli.state_dir));
    let config = load_config(&store.config_path())?;

    match cli.command {
        Command::Start {
            task,
            provider,
            prompt,
            worktree,
            required_baseline,
            feature_key,
            foreground,
            json,
        } => {
            let request = StartRequest {
                task,
                provider,
                worktree: absolute(worktree)?,
                prompt: fs::read_to_string(&prompt)
                    .with_context(|| format!("read prompt {}", prompt.display()))?,
                prompt_ref: prompt,
                required_baseline,
                feature_key,
                mode: if foreground {
                    ExecutionMode::Foreground
                } else {
                    ExecutionMode::Detached
                },
            };
            cmd_start(&supervisor(store, config)?, &request, json)
        }
        Command::Status { task, json } => cmd_status(&supervisor(store, config)?, task, json),
        Command::Check {
            task,
            json,
            stall_minutes,
        } => {
            let mut config = config;
            if let Some(minutes) = stall_minutes {
                config.stall_minutes = minutes;
                config.noop_minutes = config.noop_minutes.max(minutes.saturating_add(1));
                config.validate()?;
            }
            let status = supervisor(store, config)?.check(&task)?;
            print_status(&status, json)?;
            Ok(status.check_exit_code())
        }
        Command::Stop { task } => {
            match supervisor(store, config)?.stop(&task)? {
                StopOutcome::Signalled { pid } => println!("{task}: signalled pid {pid}"),
                StopOutcome::Cancelled => println!("{task}: cancelled"),
                StopOutcome::AlreadyStopped => println!("{task}: already stopped"),
            }
            Ok(exit_codes::OK)
        }
        Command::Restart { task } => {
            let outcome = supervisor(store, config)?.restart(&task)?;
            println!(
                "{}: restarted (retries={}, pid={})",
                outcome.task, outcome.retries, outcome.pid
            );
            Ok(exit_codes::OK)
        }
        Command::Watchdog {
            interval,
            max_retries,
            once,
        } => {
            let mut config = config;
            if let Some(interval) = interval {
                config.watchdog_interval_secs = interval;
            }
            if let Some(max_retries) = max_retries {
                config.max_retries = max_retries;
            }
            config.validate()?;
            let options = WatchdogOptions {
                interval: config.watchdog_interval(),
                max_passes: once.then_some(1),
            };
            run_watchdog(&supervisor(store, config)?, options, |summary| {
                println!(
                    "pass: evaluated={} restarted=[{}] blocked=[{}] errors={}",
                    summary.evaluated,
                    summary.restarted.join(","),
                    summary.blocked.join(","),
                    summary.errors.len()
                );
            })?;
            Ok(exit_codes::OK)
        }
        Command::Report { task, format } => {
            let status = supervisor(store, config)?.check(&task)?;
            let report = JobReport::from_status(&status);
            match format {
                ReportFormat::Json => println!("{}", render_json(&report)?),
                ReportFormat::Text => print!("{}", render_text(&report)),
            }
            Ok(exit_codes::OK)
        }
        Command::Preflight { provider, json } => cmd_preflight(&store, &config, provider, json),
        Command::Probe {
            provider,
            model,
            timeout_secs,
        } => {
            let registry = ProviderRegistry::from_config(&config, store.root())?;
            let handle = registry.get(&provider)?;
            let timeout = timeout_secs
                .or_else(|| {
                    config
                        .effective_providers()
                        .get(&provider)
                        .map(|cfg| cfg.probe_timeout_secs)
                })
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS);
            match handle.probe_model(&model, Duration::from_secs(timeout)) {
                ModelAvailability::Available => {
                    println!("{provider}/{model}: available");
                    Ok(exit_codes::OK)
                }
                ModelAvailability::Unavailable => {
                    println!("{provider}/{model}: unavailable");
                    Ok(exit_codes::PREFLIGHT_FAILED)
                }
            }
        }
        Command::BaselineGate {
            worktree,
            required_baseline,
            json,
        } => run_gate(
            &BaselineGate {
                required: Some(required_baseline.as_str()),
            },
            &worktree,
            json,
        ),
        Command::IntegrityGate {
            worktree,
            reported_commit,
            json,
        } => run_gate(
            &IntegrityGate {
                reported_commit: Some(reported_commit.as_str()),
            },
            &worktree,
            json,
        ),
        Command::FeatureKeyGate {
            worktree,
            feature_key,
            base,
            trailer_key,
            json,
        } => {
            let trailer_key = trailer_key.unwrap_or_else(|| config.feature_key_trailer.clone());
            run_gate(
                &FeatureKeyGate {
                    feature_key: &feature_key,
                    trailer_key: &trailer_key,
                    base: base.as_deref(),
                },
                &worktree,
                json,
            )
        }
        Command::Fanout {
            hosts,
            all_hosts,
            json,
            fail_fast,
            remote_args,
        } => {
            let hosts = if all_hosts {
                config.hosts.iter().map(|host| host.name.clone()).collect()
            } else {
                hosts
            };
            let transport = SshTransport {
                connect_timeout: Duration::from_secs(config.fanout.connect_timeout_secs),
                remote_bin: config.fanout.remote_bin.clone(),
            };
            let report = Dispatcher::new(&transport, &config, &store, &SystemClock)
                .dispatch(&hosts, &remote_args, fail_fast)?;
            if json {
                print_json(&report)?;
            } else {
                for result in &report.results {
                    println!(
                        "{:<20} {:<16} attempts={} {}",
                        result.host,
                        result.outcome.as_str(),
                        result.attempts,
                        result.reason
                    );
                }
            }
            Ok(report.exit_code())
        }
        Command::Monitor { task } => {
            run_monitor(&store, &task)?;
            Ok(exit_codes::OK)
        }
    }
}

fn state_root(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| env::var_os("JOBRUNNER_HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

fn absolute(worktree: Option<PathBuf>) -> Result<PathBuf> {
    let cwd = env::current_dir().context("resolve current directory")?;
    Ok(match worktree {
        Some(path) if path.is_absolute() => path,
        Some(path) => cwd.join(path),
        None => cwd,
    })
}

fn supervisor(store: ArtifactStore, config: RunnerConfig) -> Result<Supervisor> {
    let providers = ProviderRegistry::from_config(&config, store.root())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(Supervisor::new(store, config, providers, clock))
}

fn cmd_start(sup: &Supervisor, request: &StartRequest, json: bool) -> Result<i32> {
    let outcome = sup.start(request)?;
    if json {
        print_json(&json!({
            "task": outcome.task,
            "pid": outcome.pid,
            "selected_model": outcome.selected_model,
            "fallback_reason": outcome.fallback_reason,
            "execution_mode": outcome.execution_mode,
        }))?;
    } else {
        println!(
            "{}: started pid {} ({})",
            outcome.task, outcome.pid, outcome.selected_model
        );
    }
    if outcome.execution_mode != ExecutionMode::Foreground {
        return Ok(exit_codes::OK);
    }
    let status = sup.wait(&outcome.task, FOREGROUND_POLL)?;
    print_status(&status, json)?;
    Ok(status.check_exit_code())
}

fn cmd_status(sup: &Supervisor, task: Option<String>, json: bool) -> Result<i32> {
    if let Some(task) = task {
        print_status(&sup.check(&task)?, json)?;
        return Ok(exit_codes::OK);
    }
    let statuses = sup.status_all()?;
    if json {
        let reports: Vec<JobReport> = statuses.iter().map(JobReport::from_status).collect();
        print_json(&reports)?;
    } else if statuses.is_empty() {
        println!("no jobs");
    } else {
        for status in &statuses {
            println!("{}", status_line(status));
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_preflight(
    store: &ArtifactStore,
    config: &RunnerConfig,
    provider: Option<String>,
    json: bool,
) -> Result<i32> {
    let registry = ProviderRegistry::from_config(config, store.root())?;
    let names: Vec<String> = match provider {
        Some(name) => {
            registry.get(&name)?;
            vec![name]
        }
        None => registry.names().into_iter().map(str::to_string).collect(),
    };
    let single = names.len() == 1;
    let mut code = exit_codes::OK;
    let mut reports = Vec::new();
    for name in &names {
        let report = match registry.get(name)?.preflight() {
            Ok(report) => report,
            // A single provider's error is the command's error; across all
            // providers it only sets the exit code.
            Err(err) if single => return Err(err),
            Err(err) => {
                eprintln!("{name}: {err:#}");
                if code == exit_codes::OK {
                    code = exit_codes::exit_code_for(&err);
                }
                continue;
            }
        };
        if report.status == PreflightStatus::Fail && code == exit_codes::OK {
            code = exit_codes::PREFLIGHT_FAILED;
        }
        if !json {
            println!("{}: {}", report.provider, report.status.as_str());
            for check in &report.checks {
                let mark = if check.ok { "ok" } else { "FAIL" };
                println!("  {:<12} {:<4} {}", check.name, mark, check.detail);
            }
        }
        reports.push(report);
    }
    if json {
        print_json(&reports)?;
    }
    Ok(code)
}

fn run_gate(gate: &dyn Gate, worktree: &Path, json: bool) -> Result<i32> {
    let result: GateResult = gate.evaluate(worktree);
    if json {
        print_json(&result)?;
    } else {
        let mut line = format!("{}: {}", result.gate.as_str(), result.verdict.as_str());
        if let Some(code) = &result.code {
            line.push_str(&format!(" [{code}]"));
        }
        if let Some(detail) = &result.detail {
            line.push(' ');
            line.push_str(detail);
        }
        println!("{line}");
    }
    Ok(if result.passed() {
        exit_codes::OK
    } else {
        exit_codes::GENERAL_ERROR
    })
}

fn print_status(status: &JobStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", render_json(&JobReport::from_status(status))?);
    } else {
        println!("{}", status_line(status));
    }
    Ok(())
}

fn status_line(status: &JobStatus) -> String {
    let retries = status.meta.as_ref().map_or(0, |meta| meta.retries);
    let pid = status
        .pid
        .map_or_else(|| "-".to_string(), |pid| pid.to_string());
    format!(
        "{:<24} {:<22} {:<22} retries={} pid={}",
        status.task,
        status.health.state.as_str(),
        status.health.reason.as_str(),
        retries,
        pid
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
