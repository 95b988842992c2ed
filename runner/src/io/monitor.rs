//! Completion monitor: the detached process that owns a provider child.
//!
//! It launches the command recorded in `contract.json`, records the child's
//! real pid, waits for it, and captures the exit code. Signal deaths are
//! recorded as 128+signal, spawn failures as 127.

use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::artifacts::{ArtifactStore, JobPaths};
use crate::io::process::exit_code_of;

/// Exit code recorded when the provider command cannot be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Run the monitor for `task` to completion and return the captured exit code.
#[instrument(skip_all, fields(task))]
pub fn run_monitor(store: &ArtifactStore, task: &str) -> Result<i32> {
    let paths = store.job(task)?;
    paths.write_monitor_pid(std::process::id())?;
    let contract = paths
        .read_contract()?
        .ok_or_else(|| anyhow!("missing runtime contract {}", paths.contract.display()))?;

    let log = open_log(&paths)?;
    let log_err = log.try_clone().context("clone job log handle")?;
    let stdin = match &contract.stdin_path {
        Some(path) => Stdio::from(
            File::open(path).with_context(|| format!("open stdin file {}", path.display()))?,
        ),
        None => Stdio::null(),
    };

    let mut cmd = Command::new(&contract.program);
    cmd.args(&contract.args)
        .current_dir(&contract.cwd)
        .envs(&contract.env)
        .env("JOBRUNNER_TASK_ID", task)
        .env("JOBRUNNER_JOB_DIR", &paths.dir)
        .env("JOBRUNNER_REPORTED_COMMIT_FILE", &paths.reported_commit)
        .stdin(stdin)
        .stdout(log)
        .stderr(log_err)
        .process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(program = %contract.program, err = %err, "provider spawn failed");
            record(&paths, &format!("spawn {} failed: {err}", contract.program));
            paths.write_exit_code(SPAWN_FAILURE_EXIT_CODE)?;
            return Ok(SPAWN_FAILURE_EXIT_CODE);
        }
    };

    let pid = child.id();
    paths.write_pid(pid)?;
    record(&paths, &format!("spawned {} pid {pid} model {}", contract.program, contract.model));
    info!(pid, "provider running");

    let status = child.wait().context("wait for provider")?;
    let code = exit_code_of(status);
    paths.write_exit_code(code)?;
    record(&paths, &format!("pid {pid} exited with {code}"));
    info!(pid, code, "provider exited");
    Ok(code)
}

fn open_log(paths: &JobPaths) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log)
        .with_context(|| format!("open {}", paths.log.display()))
}

fn record(paths: &JobPaths, line: &str) {
    if let Err(err) = paths.append_monitor_log(line) {
        warn!(err = %err, "failed to append monitor log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::artifacts::RuntimeContract;
    use std::collections::BTreeMap;
    use std::fs;

    fn setup(program: &str, args: &[&str]) -> (tempfile::TempDir, ArtifactStore, JobPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path().join("state"));
        let paths = store.job("t1").expect("job");
        paths.create_dir().expect("dir");
        fs::write(&paths.prompt, "hello from prompt\n").expect("prompt");
        paths
            .write_contract(&RuntimeContract {
                program: program.to_string(),
                args: args.iter().map(|arg| (*arg).to_string()).collect(),
                env: BTreeMap::from([("EXTRA".to_string(), "x1".to_string())]),
                cwd: temp.path().to_path_buf(),
                stdin_path: Some(paths.prompt.clone()),
                model: "m1".to_string(),
            })
            .expect("contract");
        (temp, store, paths)
    }

    #[test]
    fn captures_output_pid_and_exit_code() {
        let (_temp, store, paths) = setup("sh", &["-c", "cat; echo $EXTRA $JOBRUNNER_TASK_ID; exit 4"]);
        let code = run_monitor(&store, "t1").expect("monitor");
        assert_eq!(code, 4);
        assert_eq!(paths.read_exit_code().expect("exit"), Some(4));
        assert!(paths.read_pid().expect("pid").is_some());
        assert_eq!(
            paths.read_monitor_pid().expect("monitor pid"),
            Some(std::process::id())
        );
        let log = paths.read_log_from(0).expect("log");
        assert_eq!(log, b"hello from prompt\nx1 t1\n");
    }

    #[test]
    fn spawn_failure_records_127() {
        let (_temp, store, paths) = setup("/nonexistent/agent-binary", &[]);
        let code = run_monitor(&store, "t1").expect("monitor");
        assert_eq!(code, SPAWN_FAILURE_EXIT_CODE);
        assert_eq!(paths.read_exit_code().expect("exit"), Some(127));
        assert_eq!(paths.read_pid().expect("pid"), None);
    }

    #[test]
    fn missing_contract_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        store.job("t1").expect("job").create_dir().expect("dir");
        assert!(run_monitor(&store, "t1").is_err());
    }
}
