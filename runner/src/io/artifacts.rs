//! File-backed artifact store: the single source of truth for job state.
//!
//! Layout under the state root:
//!
//! ```text
//! <root>/config.toml
//! <root>/dispatch.lock          admission lock holder record
//! <root>/watchdog.lock
//! <root>/fanout/attempts.jsonl
//! <root>/jobs/<task>/...        one directory per job (see JobPaths)
//! ```
//!
//! Every write is either an atomic replace (temp file + rename), an append, or
//! create-once (`outcome.json`). Readers treat missing, empty or unparsable
//! files as "not yet available".

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::core::heartbeat::Heartbeat;
use crate::core::types::{ExecutionMode, Health, JobState, ReasonCode};

/// Reads retry transient I/O errors this many times in total.
const READ_ATTEMPTS: u32 = 3;

/// Validate a task id: non-empty, `[A-Za-z0-9._-]` only.
pub fn validate_task_id(task: &str) -> Result<()> {
    if task.is_empty() {
        return Err(anyhow!("task id must not be empty"));
    }
    if task == "." || task == ".." {
        return Err(anyhow!("task id must not be '{task}'"));
    }
    if task
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("task id must be [A-Za-z0-9._-] only (got '{task}')"));
    }
    Ok(())
}

/// Root of the artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn dispatch_lock_path(&self) -> PathBuf {
        self.root.join("dispatch.lock")
    }

    pub fn watchdog_lock_path(&self) -> PathBuf {
        self.root.join("watchdog.lock")
    }

    pub fn fanout_dir(&self) -> PathBuf {
        self.root.join("fanout")
    }

    /// Paths for one job. Fails on an invalid task id.
    pub fn job(&self, task: &str) -> Result<JobPaths> {
        validate_task_id(task)?;
        Ok(JobPaths::new(task, self.jobs_dir().join(task)))
    }

    /// Task ids of every job directory, sorted.
    pub fn list_jobs(&self) -> Result<Vec<String>> {
        let dir = self.jobs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
        };
        let mut tasks = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_task_id(&name).is_ok() {
                tasks.push(name);
            }
        }
        tasks.sort();
        Ok(tasks)
    }
}

/// Persisted job metadata (`meta.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub task: String,
    pub provider: String,
    pub worktree: PathBuf,
    /// Prompt reference as given to `start`.
    pub prompt_path: PathBuf,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    /// Start of the current attempt; reset on every restart.
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub fallback_reason: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub required_baseline: Option<String>,
    /// HEAD of the worktree when the job was created (feature-key gate base).
    #[serde(default)]
    pub start_commit: Option<String>,
    #[serde(default)]
    pub feature_key: Option<String>,
}

/// Immutable terminal record (`outcome.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutcome {
    pub state: JobState,
    pub reason: ReasonCode,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl TerminalOutcome {
    pub fn health(&self) -> Health {
        Health::new(self.state, self.reason)
    }
}

/// Everything the completion monitor needs to launch the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContract {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    /// File piped to the provider's stdin, if any.
    #[serde(default)]
    pub stdin_path: Option<PathBuf>,
    pub model: String,
}

/// Artifact paths of a single job.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub task: String,
    pub dir: PathBuf,
    pub meta: PathBuf,
    pub prompt: PathBuf,
    pub contract: PathBuf,
    pub pid: PathBuf,
    pub monitor_pid: PathBuf,
    pub log: PathBuf,
    pub heartbeat: PathBuf,
    pub mutation: PathBuf,
    pub exit_code: PathBuf,
    pub outcome: PathBuf,
    pub gates: PathBuf,
    pub reported_commit: PathBuf,
    pub stop_requested: PathBuf,
    pub monitor_log: PathBuf,
    pub lock: PathBuf,
}

impl JobPaths {
    fn new(task: &str, dir: PathBuf) -> Self {
        Self {
            task: task.to_string(),
            meta: dir.join("meta.json"),
            prompt: dir.join("prompt.md"),
            contract: dir.join("contract.json"),
            pid: dir.join("pid"),
            monitor_pid: dir.join("monitor.pid"),
            log: dir.join("job.log"),
            heartbeat: dir.join("heartbeat.json"),
            mutation: dir.join("mutation.json"),
            exit_code: dir.join("exit_code"),
            outcome: dir.join("outcome.json"),
            gates: dir.join("gates.json"),
            reported_commit: dir.join("reported_commit"),
            stop_requested: dir.join("stop_requested"),
            monitor_log: dir.join("monitor.log"),
            lock: dir.join(".lock"),
            dir,
        }
    }

    pub fn dir_exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))
    }

    pub fn read_meta(&self) -> Result<Option<JobMeta>> {
        read_json(&self.meta)
    }

    pub fn write_meta(&self, meta: &JobMeta) -> Result<()> {
        debug!(task = %meta.task, retries = meta.retries, "writing job meta");
        write_json_atomic(&self.meta, meta)
    }

    pub fn read_contract(&self) -> Result<Option<RuntimeContract>> {
        read_json(&self.contract)
    }

    pub fn write_contract(&self, contract: &RuntimeContract) -> Result<()> {
        write_json_atomic(&self.contract, contract)
    }

    pub fn read_pid(&self) -> Result<Option<u32>> {
        read_number(&self.pid)
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        write_text_atomic(&self.pid, &format!("{pid}\n"))
    }

    pub fn read_monitor_pid(&self) -> Result<Option<u32>> {
        read_number(&self.monitor_pid)
    }

    pub fn write_monitor_pid(&self, pid: u32) -> Result<()> {
        write_text_atomic(&self.monitor_pid, &format!("{pid}\n"))
    }

    pub fn read_exit_code(&self) -> Result<Option<i32>> {
        read_number(&self.exit_code)
    }

    pub fn write_exit_code(&self, code: i32) -> Result<()> {
        write_text_atomic(&self.exit_code, &format!("{code}\n"))
    }

    pub fn read_heartbeat(&self) -> Result<Option<Heartbeat>> {
        read_json(&self.heartbeat)
    }

    pub fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        write_json_atomic(&self.heartbeat, heartbeat)
    }

    pub fn read_outcome(&self) -> Result<Option<TerminalOutcome>> {
        read_json(&self.outcome)
    }

    /// Write the terminal outcome once. Returns `false` when one already exists.
    pub fn record_outcome(&self, outcome: &TerminalOutcome) -> Result<bool> {
        let mut buf = serde_json::to_string_pretty(outcome).context("serialize outcome")?;
        buf.push('\n');
        let tmp = self
            .dir
            .join(format!("outcome.json.{}.tmp", std::process::id()));
        fs::write(&tmp, buf).with_context(|| format!("write {}", tmp.display()))?;
        let linked = fs::hard_link(&tmp, &self.outcome);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                debug!(task = %self.task, state = outcome.state.as_str(), "outcome recorded");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("create {}", self.outcome.display()))
            }
        }
    }

    /// Completion commit written by the agent, if any.
    pub fn read_reported_commit(&self) -> Result<Option<String>> {
        Ok(read_text(&self.reported_commit)?
            .map(|text| text.trim().to_string())
            .filter(|sha| !sha.is_empty()))
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.exists()
    }

    pub fn mark_stop_requested(&self, at: DateTime<Utc>) -> Result<()> {
        write_text_atomic(&self.stop_requested, &format!("{}\n", at.to_rfc3339()))
    }

    /// Current size of `job.log` (0 when absent).
    pub fn log_bytes(&self) -> Result<u64> {
        match fs::metadata(&self.log) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err).with_context(|| format!("stat {}", self.log.display())),
        }
    }

    /// Bytes of `job.log` from `offset` to its current end; empty when absent.
    pub fn read_log_from(&self, offset: u64) -> Result<Vec<u8>> {
        let mut file = match fs::File::open(&self.log) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("open {}", self.log.display()));
            }
        };
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek {} to {offset}", self.log.display()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .with_context(|| format!("read {}", self.log.display()))?;
        Ok(bytes)
    }

    /// Move `job.log` to `job.log.<n>` (next free n). Returns the rotated path.
    pub fn rotate_log(&self) -> Result<Option<PathBuf>> {
        if !self.log.exists() {
            return Ok(None);
        }
        let next = self.rotated_logs()?.last().map_or(1, |(n, _)| n + 1);
        let target = self.dir.join(format!("job.log.{next}"));
        fs::rename(&self.log, &target)
            .with_context(|| format!("rotate {} -> {}", self.log.display(), target.display()))?;
        debug!(task = %self.task, rotated = %target.display(), "log rotated");
        Ok(Some(target))
    }

    /// Rotated logs sorted by generation.
    pub fn rotated_logs(&self) -> Result<Vec<(u32, PathBuf)>> {
        let mut logs = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(logs),
            Err(err) => return Err(err).with_context(|| format!("read {}", self.dir.display())),
        };
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", self.dir.display()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(n) = name
                .strip_prefix("job.log.")
                .and_then(|suffix| suffix.parse::<u32>().ok())
            {
                logs.push((n, entry.path()));
            }
        }
        logs.sort();
        Ok(logs)
    }

    /// Remove per-attempt artifacts ahead of a restart.
    ///
    /// Keeps meta, prompt, rotated logs and the mutation marker.
    pub fn clear_attempt(&self) -> Result<()> {
        for path in [
            &self.pid,
            &self.monitor_pid,
            &self.exit_code,
            &self.heartbeat,
            &self.outcome,
            &self.gates,
            &self.stop_requested,
            &self.contract,
        ] {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    /// Remove the whole job directory.
    pub fn remove_all(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.dir.display())),
        }
    }

    /// Append a diagnostic line to `monitor.log`.
    pub fn append_monitor_log(&self, line: &str) -> Result<()> {
        use std::io::Write;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.monitor_log)
            .with_context(|| format!("open {}", self.monitor_log.display()))?;
        writeln!(file, "{} {line}", Utc::now().to_rfc3339())
            .with_context(|| format!("append {}", self.monitor_log.display()))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Read a text artifact, retrying transient errors. `None` when absent.
pub fn read_text(path: &Path) -> Result<Option<String>> {
    let mut attempt = 1;
    loop {
        match fs::read_to_string(path) {
            Ok(contents) => return Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) if attempt < READ_ATTEMPTS => {
                warn!(path = %path.display(), attempt, err = %err, "transient artifact read error");
                thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
                attempt += 1;
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        }
    }
}

/// Read a JSON artifact. Missing, empty or unparsable files yield `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(contents) = read_text(path)? else {
        return Ok(None);
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&contents) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            debug!(path = %path.display(), err = %err, "artifact not yet parseable");
            Ok(None)
        }
    }
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Result<Option<T>> {
    Ok(read_text(path)?.and_then(|text| text.trim().parse().ok()))
}

/// Atomically write a JSON artifact (temp file + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text_atomic(path, &buf)
}

/// Atomically write a text artifact (temp file + rename).
pub fn write_text_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("artifact path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp artifact {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Append one JSON line to a ledger file.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("serialize ledger line")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}
