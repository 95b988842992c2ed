//! Runner configuration stored under `<state-root>/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::health::HealthThresholds;
use crate::core::retry::MAX_DISPATCH_ATTEMPTS;
use crate::core::types::AuthMode;

/// Largest accepted value for any time threshold (one year).
pub const MAX_THRESHOLD_SECS: u64 = 366 * 24 * 60 * 60;

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values in [`RunnerConfig::default`]; thresholds are operator-tunable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Minutes without any liveness signal before a job is `stalled`.
    pub stall_minutes: u64,
    /// Minutes without heartbeat or mutation before a job is `no_op`.
    pub noop_minutes: u64,
    /// Seconds a dead process may go without a captured exit code.
    pub exit_grace_secs: u64,
    /// Seconds `start` waits for the provider pid to be recorded.
    pub spawn_timeout_secs: u64,
    /// Seconds `stop`/`restart` wait after SIGTERM before SIGKILL.
    pub stop_grace_secs: u64,
    pub max_retries: u32,
    pub watchdog_interval_secs: u64,
    /// Admission ceiling on concurrently live jobs.
    pub max_concurrent_jobs: usize,
    /// Seconds to wait for the admission lock before giving up.
    pub admission_wait_secs: u64,
    /// Worktrees must live under one of these prefixes.
    pub allowed_prefixes: Vec<PathBuf>,
    /// Trailer key checked by the feature-key gate.
    pub feature_key_trailer: String,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub fanout: FanoutConfig,
    pub hosts: Vec<HostConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stall_minutes: 10,
            noop_minutes: 30,
            exit_grace_secs: 30,
            spawn_timeout_secs: 15,
            stop_grace_secs: 10,
            max_retries: 3,
            watchdog_interval_secs: 60,
            max_concurrent_jobs: 8,
            admission_wait_secs: 30,
            allowed_prefixes: vec![PathBuf::from("/tmp/jobrunner/worktrees")],
            feature_key_trailer: "Feature-Key".to_string(),
            providers: BTreeMap::new(),
            fanout: FanoutConfig::default(),
            hosts: Vec::new(),
        }
    }
}

/// How the prompt reaches the provider process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVia {
    #[default]
    Stdin,
    /// Only through the rendered `args` (e.g. `{{ prompt_text }}`).
    Arg,
}

/// One provider definition.
///
/// `args`, `probe_args` and `preflight_args` are minijinja templates rendered
/// with `task`, `worktree`, `model`, `prompt_file` and `prompt_text`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub prompt_via: PromptVia,
    pub preferred_model: String,
    pub fallback_models: Vec<String>,
    /// Command used to check that a model is usable; `None` assumes available.
    pub probe_args: Option<Vec<String>>,
    pub probe_timeout_secs: u64,
    /// Cheap invocation proving the binary runs (e.g. `--version`).
    pub preflight_args: Vec<String>,
    /// Regex whose matches in the job log count as tool invocations.
    pub tool_pattern: Option<String>,
    /// Environment variable that must be set for authentication.
    pub auth_env: Option<String>,
    /// Credential file that must exist and be non-empty.
    pub credential_file: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            prompt_via: PromptVia::Stdin,
            preferred_model: String::new(),
            fallback_models: Vec::new(),
            probe_args: None,
            probe_timeout_secs: 30,
            preflight_args: vec!["--version".to_string()],
            tool_pattern: None,
            auth_env: None,
            credential_file: None,
            env: BTreeMap::new(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}

/// Provider definitions available without any configuration.
pub fn builtin_providers() -> BTreeMap<String, ProviderConfig> {
    let mut providers = BTreeMap::new();
    providers.insert(
        "codex".to_string(),
        ProviderConfig {
            command: "codex".to_string(),
            args: strings(&["exec", "--model", "{{ model }}", "--full-auto", "--json", "-"]),
            preferred_model: "gpt-5-codex".to_string(),
            fallback_models: strings(&["gpt-5"]),
            tool_pattern: Some(r#""type":"(?:function_call|local_shell_call|exec_command)"#.to_string()),
            ..ProviderConfig::default()
        },
    );
    providers.insert(
        "claude".to_string(),
        ProviderConfig {
            command: "claude".to_string(),
            args: strings(&[
                "-p",
                "--model",
                "{{ model }}",
                "--output-format",
                "stream-json",
                "--verbose",
            ]),
            preferred_model: "opus".to_string(),
            fallback_models: strings(&["sonnet"]),
            tool_pattern: Some(r#""type":"tool_use""#.to_string()),
            ..ProviderConfig::default()
        },
    );
    providers.insert(
        "gemini".to_string(),
        ProviderConfig {
            command: "gemini".to_string(),
            args: strings(&[
                "-m",
                "{{ model }}",
                "-y",
                "-o",
                "stream-json",
                "-p",
                "{{ prompt_text }}",
            ]),
            prompt_via: PromptVia::Arg,
            preferred_model: "gemini-2.5-pro".to_string(),
            fallback_models: strings(&["gemini-2.5-flash"]),
            tool_pattern: Some(r#""type":"tool_use""#.to_string()),
            ..ProviderConfig::default()
        },
    );
    providers
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FanoutConfig {
    pub connect_timeout_secs: u64,
    pub attempt_timeout_secs: u64,
    /// Fixed delay between the first and second attempt.
    pub retry_delay_secs: u64,
    pub max_attempts: u32,
    /// Program invoked on the remote host.
    pub remote_bin: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            attempt_timeout_secs: 600,
            retry_delay_secs: 5,
            max_attempts: MAX_DISPATCH_ATTEMPTS,
            remote_bin: "jobrunner".to_string(),
        }
    }
}

/// Static host registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    pub name: String,
    pub hostname: String,
    /// Canonical user for this host; empty means unmapped.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub auth_mode: Option<AuthMode>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stall_minutes == 0 {
            return Err(anyhow!("stall_minutes must be > 0"));
        }
        if self.noop_minutes <= self.stall_minutes {
            return Err(anyhow!("noop_minutes must be > stall_minutes"));
        }
        within_bounds("stall_minutes", self.stall_minutes.checked_mul(60))?;
        within_bounds("noop_minutes", self.noop_minutes.checked_mul(60))?;
        within_bounds("exit_grace_secs", Some(self.exit_grace_secs))?;
        within_bounds("spawn_timeout_secs", Some(self.spawn_timeout_secs))?;
        if self.spawn_timeout_secs == 0 {
            return Err(anyhow!("spawn_timeout_secs must be > 0"));
        }
        if self.watchdog_interval_secs == 0 {
            return Err(anyhow!("watchdog_interval_secs must be > 0"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow!("max_concurrent_jobs must be > 0"));
        }
        if self.feature_key_trailer.trim().is_empty() {
            return Err(anyhow!("feature_key_trailer must be non-empty"));
        }
        if !(1..=MAX_DISPATCH_ATTEMPTS).contains(&self.fanout.max_attempts) {
            return Err(anyhow!(
                "fanout.max_attempts must be between 1 and {MAX_DISPATCH_ATTEMPTS}"
            ));
        }
        for prefix in &self.allowed_prefixes {
            if !prefix.is_absolute() {
                return Err(anyhow!(
                    "allowed_prefixes entries must be absolute: {}",
                    prefix.display()
                ));
            }
        }
        for (name, provider) in &self.providers {
            if provider.command.trim().is_empty() {
                return Err(anyhow!("providers.{name}.command must be non-empty"));
            }
            if let Some(pattern) = &provider.tool_pattern {
                regex::Regex::new(pattern)
                    .with_context(|| format!("providers.{name}.tool_pattern"))?;
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for host in &self.hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(anyhow!("duplicate host name '{}'", host.name));
            }
        }
        Ok(())
    }

    /// Built-in providers overlaid with configured ones (configured wins).
    pub fn effective_providers(&self) -> BTreeMap<String, ProviderConfig> {
        let mut providers = builtin_providers();
        for (name, provider) in &self.providers {
            providers.insert(name.clone(), provider.clone());
        }
        providers
    }

    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            stall: minutes(self.stall_minutes),
            noop: minutes(self.noop_minutes),
            exit_grace: seconds(self.exit_grace_secs),
            spawn_timeout: seconds(self.spawn_timeout_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn admission_wait(&self) -> Duration {
        Duration::from_secs(self.admission_wait_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

fn within_bounds(name: &str, secs: Option<u64>) -> Result<()> {
    match secs {
        Some(secs) if secs <= MAX_THRESHOLD_SECS => Ok(()),
        _ => Err(anyhow!(
            "{name} exceeds the maximum of {MAX_THRESHOLD_SECS} seconds"
        )),
    }
}

fn minutes(value: u64) -> chrono::Duration {
    seconds(value.saturating_mul(60))
}

/// Clamped to [`MAX_THRESHOLD_SECS`] so unvalidated configs cannot overflow.
fn seconds(value: u64) -> chrono::Duration {
    i64::try_from(value.min(MAX_THRESHOLD_SECS))
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunnerConfig::default();
        cfg.hosts.push(HostConfig {
            name: "build-1".to_string(),
            hostname: "build-1.internal".to_string(),
            user: "ci".to_string(),
            auth_mode: Some(AuthMode::Agent),
            port: 22,
            identity_file: None,
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "stall_minutes = 5\n\n[providers.fake]\ncommand = \"/bin/sh\"\nargs = [\"-c\", \"echo hi\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.stall_minutes, 5);
        assert_eq!(cfg.noop_minutes, 30);
        assert_eq!(cfg.providers["fake"].preflight_args, vec!["--version"]);
        assert_eq!(cfg.providers["fake"].prompt_via, PromptVia::Stdin);
    }

    #[test]
    fn noop_window_must_exceed_stall_window() {
        let cfg = RunnerConfig {
            stall_minutes: 30,
            noop_minutes: 30,
            ..RunnerConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("noop_minutes"));
    }

    #[test]
    fn oversized_thresholds_are_rejected_without_panicking() {
        let cfg = RunnerConfig {
            stall_minutes: 200_000_000_000_000,
            noop_minutes: u64::MAX,
            ..RunnerConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("stall_minutes"));

        let thresholds = cfg.thresholds();
        let cap = chrono::Duration::seconds(MAX_THRESHOLD_SECS as i64);
        assert_eq!(thresholds.stall, cap);
        assert_eq!(thresholds.noop, cap);
    }

    #[test]
    fn exit_grace_is_bounded() {
        let cfg = RunnerConfig {
            exit_grace_secs: MAX_THRESHOLD_SECS + 1,
            ..RunnerConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("exit_grace_secs"));
    }

    #[test]
    fn fanout_attempts_are_capped_at_two() {
        let mut cfg = RunnerConfig::default();
        cfg.fanout.max_attempts = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn configured_provider_overrides_builtin() {
        let mut cfg = RunnerConfig::default();
        cfg.providers.insert(
            "codex".to_string(),
            ProviderConfig {
                command: "/opt/codex".to_string(),
                ..ProviderConfig::default()
            },
        );
        let providers = cfg.effective_providers();
        assert_eq!(providers["codex"].command, "/opt/codex");
        assert_eq!(providers["claude"].command, "claude");
    }

    #[test]
    fn builtin_tool_patterns_compile() {
        for (name, provider) in builtin_providers() {
            if let Some(pattern) = provider.tool_pattern {
                assert!(regex::Regex::new(&pattern).is_ok(), "{name}");
            }
        }
    }
}
