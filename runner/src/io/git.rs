//! Git adapter for governance gates and mutation detection.
//!
//! Gates only inspect history, so this is a small, explicit wrapper around
//! read-only `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::trailer::Commit;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the workdir is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Full sha of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// True when `sha` names a commit object in this repository.
    pub fn commit_exists(&self, sha: &str) -> Result<bool> {
        let spec = format!("{sha}^{{commit}}");
        let out = self.run(&["cat-file", "-e", &spec])?;
        Ok(out.status.success())
    }

    /// True when `ancestor` is `descendant` or one of its ancestors.
    #[instrument(skip_all, fields(ancestor, descendant))]
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                Err(anyhow!(
                    "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                    stderr.trim()
                ))
            }
        }
    }

    /// Commits reachable from `head` but not from `base`, oldest first.
    ///
    /// With `base = None` every commit reachable from `head` is returned.
    #[instrument(skip_all)]
    pub fn commits_between(&self, base: Option<&str>, head: &str) -> Result<Vec<Commit>> {
        let range = match base {
            Some(base) => format!("{base}..{head}"),
            None => head.to_string(),
        };
        let out = self.run_capture(&["log", "--reverse", "--format=%H%x00%B%x1e", &range])?;
        let commits = parse_log(&out);
        debug!(range = %range, count = commits.len(), "listed commits");
        Ok(commits)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Raw porcelain status output, used for change fingerprints.
    pub fn status_raw(&self) -> Result<String> {
        self.run_capture(&["status", "--porcelain=v1", "-uall"])
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_log(out: &str) -> Vec<Commit> {
    out.split('\u{1e}')
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            let (sha, message) = record.split_once('\0')?;
            let sha = sha.trim();
            if sha.is_empty() {
                return None;
            }
            Some(Commit {
                sha: sha.to_string(),
                message: message.trim_end().to_string(),
            })
        })
        .collect()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
