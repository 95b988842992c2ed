//! File locks: per-job and watchdog flocks, and the machine-wide admission lock.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Rejection;
use crate::io::artifacts::read_json;
use crate::io::process;

/// An exclusive advisory lock, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Try to take the lock without blocking. `Ok(None)` when another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "lock acquired");
                Ok(Some(Self { file }))
            }
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err).with_context(|| format!("lock {}", path.display())),
        }
    }

    /// Take the lock, blocking until it is free.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))
}

/// Holder record stored in the admission lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Machine-wide lock guarding the decision to admit a new job.
///
/// The lock is a holder record created with exclusive-create. A record whose
/// holder pid is no longer alive is stale and is replaced. A flock on a
/// sidecar file serializes the inspect-and-replace step so two dispatchers
/// cannot both replace the same stale record.
#[derive(Debug)]
pub struct AdmissionLock {
    path: PathBuf,
    pid: u32,
}

impl AdmissionLock {
    /// Acquire the admission lock, waiting up to `wait` for a live holder.
    pub fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        let pid = std::process::id();
        let deadline = Instant::now() + wait;
        loop {
            let holder = {
                let _guard = FileLock::acquire(&guard_path(path))?;
                match try_claim(path, pid)? {
                    None => {
                        debug!(path = %path.display(), pid, "admission lock acquired");
                        return Ok(Self {
                            path: path.to_path_buf(),
                            pid,
                        });
                    }
                    Some(holder) => holder,
                }
            };
            if Instant::now() >= deadline {
                return Err(Rejection::AdmissionBusy { holder: holder.pid }.into());
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

}

impl Drop for AdmissionLock {
    fn drop(&mut self) {
        let owned = matches!(read_json::<LockHolder>(&self.path), Ok(Some(holder)) if holder.pid == self.pid);
        if owned && let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release admission lock");
        }
    }
}

fn guard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".guard");
    PathBuf::from(name)
}

/// Claim the record or report the live holder. Caller holds the sidecar flock.
fn try_claim(path: &Path, pid: u32) -> Result<Option<LockHolder>> {
    if path.exists() {
        match read_json::<LockHolder>(path)? {
            Some(holder) if process::is_alive(holder.pid) => return Ok(Some(holder)),
            Some(holder) => {
                warn!(stale_pid = holder.pid, "replacing stale admission lock");
            }
            None => warn!(path = %path.display(), "replacing unreadable admission lock"),
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    let record = LockHolder {
        pid,
        acquired_at: Utc::now(),
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    let mut buf = serde_json::to_string(&record).context("serialize lock holder")?;
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(None)
}
