//! Periodic supervisory pass over every known job.
//!
//! A pass checks each job, restarts `stalled` / `no_op` jobs while retries
//! remain and blocks them once retries are exhausted. Passes never overlap:
//! the loop is sequential and holds `watchdog.lock` for its whole lifetime.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::retry::{WatchdogAction, decide};
use crate::core::types::JobState;
use crate::io::lock::FileLock;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogOptions {
    pub interval: Duration,
    /// Stop after this many passes; `None` runs until killed.
    pub max_passes: Option<u32>,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub evaluated: usize,
    pub restarted: Vec<String>,
    /// Jobs in the `blocked` state after this pass.
    pub blocked: Vec<String>,
    /// `(task, error)` for jobs that could not be checked or restarted.
    pub errors: Vec<(String, String)>,
}

/// Run one pass over every job in the store.
#[instrument(skip_all)]
pub fn run_pass(sup: &Supervisor) -> Result<PassSummary> {
    let max_retries = sup.config().max_retries;
    let mut summary = PassSummary::default();
    for task in sup.store().list_jobs()? {
        let status = match sup.check(&task) {
            Ok(status) => status,
            Err(err) => {
                warn!(task = %task, err = %format!("{err:#}"), "watchdog check failed");
                summary.errors.push((task, format!("{err:#}")));
                continue;
            }
        };
        summary.evaluated += 1;
        let retries = status.meta.as_ref().map_or(0, |meta| meta.retries);
        match decide(status.health.state, retries, max_retries) {
            WatchdogAction::Leave => {
                debug!(task = %task, state = status.health.state.as_str(), "left alone");
                if status.health.state == JobState::Blocked {
                    summary.blocked.push(task);
                }
            }
            WatchdogAction::Restart { next_retry } => {
                info!(
                    task = %task,
                    state = status.health.state.as_str(),
                    next_retry,
                    max_retries,
                    "restarting"
                );
                match sup.restart(&task) {
                    Ok(_) => summary.restarted.push(task),
                    Err(err) => {
                        warn!(task = %task, err = %format!("{err:#}"), "restart failed");
                        summary.errors.push((task, format!("{err:#}")));
                    }
                }
            }
            WatchdogAction::Block => match sup.mark_blocked(&task) {
                Ok(_) => summary.blocked.push(task),
                Err(err) => summary.errors.push((task, format!("{err:#}"))),
            },
        }
    }
    info!(
        evaluated = summary.evaluated,
        restarted = summary.restarted.len(),
        blocked = summary.blocked.len(),
        errors = summary.errors.len(),
        "watchdog pass complete"
    );
    Ok(summary)
}

/// Run passes on a fixed interval. Calls `on_pass` after each one.
pub fn run_watchdog<F: FnMut(&PassSummary)>(
    sup: &Supervisor,
    options: WatchdogOptions,
    mut on_pass: F,
) -> Result<u32> {
    let lock_path = sup.store().watchdog_lock_path();
    let Some(_lock) = FileLock::try_acquire(&lock_path)? else {
        return Err(anyhow!(
            "another watchdog holds {}",
            lock_path.display()
        ));
    };
    let mut passes = 0u32;
    loop {
        let summary = run_pass(sup)?;
        passes += 1;
        on_pass(&summary);
        if options.max_passes.is_some_and(|max| passes >= max) {
            return Ok(passes);
        }
        thread::sleep(options.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionMode;
    use crate::io::artifacts::ArtifactStore;
    use crate::io::clock::Clock;
    use crate::io::config::RunnerConfig;
    use crate::io::provider::ProviderRegistry;
    use crate::supervisor::StartRequest;
    use crate::test_support::{FakeProvider, FixedClock, t0};
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn setup(max_retries: u32) -> (tempfile::TempDir, FakeProvider, Arc<FixedClock>, Supervisor) {
        let temp = tempfile::tempdir().expect("tempdir");
        let worktrees = temp.path().join("worktrees");
        fs::create_dir_all(worktrees.join("wt")).expect("worktree");
        let config = RunnerConfig {
            allowed_prefixes: vec![worktrees],
            max_retries,
            stop_grace_secs: 1,
            ..RunnerConfig::default()
        };
        let fake = FakeProvider::new("fake");
        let mut providers = ProviderRegistry::new();
        providers.insert(Box::new(fake.clone()));
        let clock = Arc::new(FixedClock::new(t0()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let sup = Supervisor::new(
            ArtifactStore::new(temp.path().join("state")),
            config,
            providers,
            dyn_clock,
        );
        (temp, fake, clock, sup)
    }

    fn start(sup: &Supervisor, root: &Path, task: &str) {
        sup.start(&StartRequest {
            task: task.to_string(),
            provider: "fake".to_string(),
            worktree: root.join("worktrees").join("wt"),
            prompt_ref: PathBuf::from("prompt.md"),
            prompt: "work".to_string(),
            required_baseline: None,
            feature_key: None,
            mode: ExecutionMode::Detached,
        })
        .expect("start");
    }

    fn emit(sup: &Supervisor, task: &str) {
        let log = sup.store().job(task).expect("paths").log;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .expect("log");
        file.write_all(b"output\n").expect("write");
    }

    #[test]
    fn healthy_jobs_are_not_restarted() {
        let (temp, _fake, _clock, sup) = setup(3);
        start(&sup, temp.path(), "t1");
        emit(&sup, "t1");
        let summary = run_pass(&sup).expect("pass");
        assert_eq!(summary.evaluated, 1);
        assert!(summary.restarted.is_empty());
    }

    #[test]
    fn stalled_job_is_restarted_until_blocked_then_left_alone() {
        let (temp, fake, clock, sup) = setup(3);
        start(&sup, temp.path(), "t1");
        for expected_retries in 1..=3 {
            emit(&sup, "t1");
            run_pass(&sup).expect("pass");
            clock.advance(chrono::Duration::minutes(11));
            let summary = run_pass(&sup).expect("pass");
            assert_eq!(summary.restarted, vec!["t1".to_string()]);
            let meta = sup
                .store()
                .job("t1")
                .expect("paths")
                .read_meta()
                .expect("meta")
                .expect("present");
            assert_eq!(meta.retries, expected_retries);
        }

        emit(&sup, "t1");
        run_pass(&sup).expect("pass");
        clock.advance(chrono::Duration::minutes(11));
        let summary = run_pass(&sup).expect("pass");
        assert!(summary.restarted.is_empty());
        assert_eq!(summary.blocked, vec!["t1".to_string()]);
        assert_eq!(sup.check("t1").expect("check").health.state, JobState::Blocked);

        clock.advance(chrono::Duration::minutes(60));
        let later = run_pass(&sup).expect("pass");
        assert!(later.restarted.is_empty());
        assert_eq!(fake.starts().len(), 4);
    }

    #[test]
    fn dead_stalled_job_past_retries_is_blocked() {
        let (temp, fake, clock, sup) = setup(0);
        start(&sup, temp.path(), "t1");
        emit(&sup, "t1");
        run_pass(&sup).expect("pass");
        fake.set_alive(false);
        clock.advance(chrono::Duration::minutes(11));
        let summary = run_pass(&sup).expect("pass");
        assert_eq!(summary.blocked, vec!["t1".to_string()]);
        let outcome = sup
            .store()
            .job("t1")
            .expect("paths")
            .read_outcome()
            .expect("read")
            .expect("outcome");
        assert_eq!(outcome.state, JobState::Blocked);
    }

    #[test]
    fn second_watchdog_is_refused() {
        let (_temp, _fake, _clock, sup) = setup(3);
        let _held = FileLock::try_acquire(&sup.store().watchdog_lock_path())
            .expect("lock")
            .expect("acquired");
        let options = WatchdogOptions {
            interval: Duration::ZERO,
            max_passes: Some(1),
        };
        assert!(run_watchdog(&sup, options, |_| {}).is_err());
    }

    #[test]
    fn bounded_watchdog_runs_requested_passes() {
        let (_temp, _fake, _clock, sup) = setup(3);
        let mut seen = 0;
        let options = WatchdogOptions {
            interval: Duration::ZERO,
            max_passes: Some(2),
        };
        let passes = run_watchdog(&sup, options, |_| seen += 1).expect("watchdog");
        assert_eq!(passes, 2);
        assert_eq!(seen, 2);
    }
}
