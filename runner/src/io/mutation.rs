//! Worktree mutation detection.
//!
//! A fingerprint of the worktree is taken on every observation; whenever it
//! differs from the last recorded one the cumulative mutation count grows.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::io::artifacts::{JobPaths, read_json, write_json_atomic};
use crate::io::git::Git;

/// Persisted mutation marker (`mutation.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationMarker {
    pub fingerprint: String,
    pub count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Fingerprint the worktree: git status + HEAD for repositories, a
/// path/size/mtime walk otherwise.
pub fn fingerprint(worktree: &Path) -> Result<String> {
    let git = Git::new(worktree);
    let mut hasher = Sha256::new();
    if git.is_repo() {
        hasher.update(b"git\0");
        hasher.update(git.head_sha().unwrap_or_default().as_bytes());
        hasher.update(b"\0");
        hasher.update(git.status_raw()?.as_bytes());
        for entry in git.status_porcelain()? {
            // Status alone misses repeated edits to an already-dirty file.
            if let Ok(meta) = std::fs::metadata(worktree.join(&entry.path)) {
                hash_metadata(&mut hasher, &entry.path, &meta);
            }
        }
    } else {
        hasher.update(b"walk\0");
        let walker = WalkDir::new(worktree)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git");
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let rel = entry
                .path()
                .strip_prefix(worktree)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            hash_metadata(&mut hasher, &rel, &meta);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_metadata(hasher: &mut Sha256, rel: &str, meta: &std::fs::Metadata) {
    hasher.update(rel.as_bytes());
    hasher.update(meta.len().to_le_bytes());
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_nanos());
    hasher.update(modified.to_le_bytes());
    hasher.update(b"\0");
}

/// Record the starting fingerprint of an attempt, keeping the cumulative count.
pub fn write_baseline(paths: &JobPaths, worktree: &Path, now: DateTime<Utc>) -> Result<MutationMarker> {
    let count = read_json::<MutationMarker>(&paths.mutation)?.map_or(0, |m| m.count);
    let marker = MutationMarker {
        fingerprint: fingerprint(worktree)?,
        count,
        updated_at: now,
    };
    write_json_atomic(&paths.mutation, &marker)?;
    Ok(marker)
}

/// Compare the worktree against the marker and return the cumulative count.
pub fn observe(paths: &JobPaths, worktree: &Path, now: DateTime<Utc>) -> Result<u64> {
    let current = fingerprint(worktree)?;
    let Some(mut marker) = read_json::<MutationMarker>(&paths.mutation)? else {
        let marker = MutationMarker {
            fingerprint: current,
            count: 0,
            updated_at: now,
        };
        write_json_atomic(&paths.mutation, &marker)?;
        return Ok(0);
    };
    if marker.fingerprint != current {
        marker.fingerprint = current;
        marker.count += 1;
        marker.updated_at = now;
        debug!(task = %paths.task, count = marker.count, "worktree mutated");
        write_json_atomic(&paths.mutation, &marker)?;
    }
    Ok(marker.count)
}

/// Cumulative mutation count without taking a new fingerprint.
pub fn recorded_count(paths: &JobPaths) -> Result<u64> {
    Ok(read_json::<MutationMarker>(&paths.mutation)?.map_or(0, |m| m.count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::artifacts::ArtifactStore;
    use std::fs;

    #[test]
    fn plain_directory_changes_are_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worktree = temp.path().join("wt");
        fs::create_dir_all(&worktree).expect("mkdir");
        fs::write(worktree.join("a.txt"), "a").expect("write");
        let store = ArtifactStore::new(temp.path().join("state"));
        let job = store.job("t1").expect("job");
        job.create_dir().expect("dir");
        let now = Utc::now();

        write_baseline(&job, &worktree, now).expect("baseline");
        assert_eq!(observe(&job, &worktree, now).expect("observe"), 0);

        fs::write(worktree.join("b.txt"), "bb").expect("write");
        assert_eq!(observe(&job, &worktree, now).expect("observe"), 1);
        assert_eq!(observe(&job, &worktree, now).expect("observe"), 1);

        fs::remove_file(worktree.join("a.txt")).expect("remove");
        assert_eq!(observe(&job, &worktree, now).expect("observe"), 2);
        assert_eq!(recorded_count(&job).expect("count"), 2);
    }

    #[test]
    fn git_worktree_changes_are_counted() {
        let repo = crate::test_support::TestRepo::new();
        repo.commit("seed.txt", "seed");
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let job = store.job("t1").expect("job");
        job.create_dir().expect("dir");
        let now = Utc::now();

        write_baseline(&job, repo.path(), now).expect("baseline");
        fs::write(repo.path().join("new.txt"), "x").expect("write");
        assert_eq!(observe(&job, repo.path(), now).expect("observe"), 1);
        repo.commit("new.txt", "x");
        assert_eq!(observe(&job, repo.path(), now).expect("observe"), 2);
    }

    #[test]
    fn baseline_preserves_cumulative_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worktree = temp.path().join("wt");
        fs::create_dir_all(&worktree).expect("mkdir");
        let store = ArtifactStore::new(temp.path().join("state"));
        let job = store.job("t1").expect("job");
        let now = Utc::now();
        write_baseline(&job, &worktree, now).expect("baseline");
        fs::write(worktree.join("x"), "1").expect("write");
        assert_eq!(observe(&job, &worktree, now).expect("observe"), 1);
        let marker = write_baseline(&job, &worktree, now).expect("rebaseline");
        assert_eq!(marker.count, 1);
    }
}
