//! Governance gate chain.
//!
//! Each gate is an independent predicate over a worktree that returns a
//! structured [`GateResult`]. Gates never raise: a gate that cannot be
//! evaluated yields `verdict = error`, which callers treat as "not passed".

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::permission::check_worktree;
use crate::core::trailer::evaluate_feature_key;
use crate::core::types::{GateKind, GateResult, GateVerdict};
use crate::io::artifacts::{JobMeta, JobPaths, read_json, write_json_atomic};
use crate::io::git::Git;

pub const CODE_BASELINE_UNKNOWN: &str = "baseline_commit_unknown";
pub const CODE_BASELINE_NOT_ANCESTOR: &str = "baseline_not_ancestor";
pub const CODE_REPORTED_MISSING: &str = "reported_commit_missing";
pub const CODE_REPORTED_NOT_IN_HISTORY: &str = "reported_commit_not_in_history";

pub trait Gate {
    fn kind(&self) -> GateKind;
    fn evaluate(&self, worktree: &Path) -> GateResult;
}

/// Worktree must be under an allowed prefix.
pub struct PermissionGate<'a> {
    pub allowed_prefixes: &'a [PathBuf],
}

impl Gate for PermissionGate<'_> {
    fn kind(&self) -> GateKind {
        GateKind::Permission
    }

    fn evaluate(&self, worktree: &Path) -> GateResult {
        check_worktree(worktree, self.allowed_prefixes)
    }
}

/// HEAD must equal or descend from the required baseline.
pub struct BaselineGate<'a> {
    pub required: Option<&'a str>,
}

impl Gate for BaselineGate<'_> {
    fn kind(&self) -> GateKind {
        GateKind::Baseline
    }

    fn evaluate(&self, worktree: &Path) -> GateResult {
        let Some(required) = self.required else {
            return GateResult::skipped(GateKind::Baseline, "no baseline required");
        };
        let git = match open_repo(worktree, GateKind::Baseline) {
            Ok(git) => git,
            Err(result) => return result,
        };
        match git.commit_exists(required) {
            Ok(true) => {}
            Ok(false) => {
                return GateResult::fail(
                    GateKind::Baseline,
                    CODE_BASELINE_UNKNOWN,
                    format!("baseline {required} is not a commit in this repository"),
                );
            }
            Err(err) => return GateResult::error(GateKind::Baseline, format!("{err:#}")),
        }
        match git.is_ancestor(required, "HEAD") {
            Ok(true) => GateResult::pass(GateKind::Baseline),
            Ok(false) => GateResult::fail(
                GateKind::Baseline,
                CODE_BASELINE_NOT_ANCESTOR,
                format!("HEAD does not descend from baseline {required}"),
            ),
            Err(err) => GateResult::error(GateKind::Baseline, format!("{err:#}")),
        }
    }
}

/// The reported completion commit must exist in the worktree's history.
pub struct IntegrityGate<'a> {
    pub reported_commit: Option<&'a str>,
}

impl Gate for IntegrityGate<'_> {
    fn kind(&self) -> GateKind {
        GateKind::Integrity
    }

    fn evaluate(&self, worktree: &Path) -> GateResult {
        let Some(reported) = self.reported_commit else {
            return GateResult::skipped(GateKind::Integrity, "no completion commit reported");
        };
        let git = match open_repo(worktree, GateKind::Integrity) {
            Ok(git) => git,
            Err(result) => return result,
        };
        match git.commit_exists(reported) {
            Ok(true) => {}
            Ok(false) => {
                return GateResult::fail(
                    GateKind::Integrity,
                    CODE_REPORTED_MISSING,
                    format!("reported commit {reported} does not exist"),
                );
            }
            Err(err) => return GateResult::error(GateKind::Integrity, format!("{err:#}")),
        }
        match git.is_ancestor(reported, "HEAD") {
            Ok(true) => GateResult::pass(GateKind::Integrity),
            Ok(false) => GateResult::fail(
                GateKind::Integrity,
                CODE_REPORTED_NOT_IN_HISTORY,
                format!("reported commit {reported} is not reachable from HEAD"),
            ),
            Err(err) => GateResult::error(GateKind::Integrity, format!("{err:#}")),
        }
    }
}

/// Every commit since `base` must carry `trailer_key: feature_key`.
pub struct FeatureKeyGate<'a> {
    pub feature_key: &'a str,
    pub trailer_key: &'a str,
    /// Exclusive lower bound; `None` checks all of HEAD's history.
    pub base: Option<&'a str>,
}

impl Gate for FeatureKeyGate<'_> {
    fn kind(&self) -> GateKind {
        GateKind::FeatureKey
    }

    fn evaluate(&self, worktree: &Path) -> GateResult {
        let git = match open_repo(worktree, GateKind::FeatureKey) {
            Ok(git) => git,
            Err(result) => return result,
        };
        // An unborn HEAD has no commits at all.
        let commits = if git.head_sha().is_err() {
            Vec::new()
        } else {
            match git.commits_between(self.base, "HEAD") {
                Ok(commits) => commits,
                Err(err) => return GateResult::error(GateKind::FeatureKey, format!("{err:#}")),
            }
        };
        evaluate_feature_key(&commits, self.trailer_key, self.feature_key)
    }
}

fn open_repo(worktree: &Path, kind: GateKind) -> std::result::Result<Git, GateResult> {
    let git = Git::new(worktree);
    if git.is_repo() {
        Ok(git)
    } else {
        Err(GateResult::error(
            kind,
            format!("{} is not a git worktree", worktree.display()),
        ))
    }
}

/// Ordered sequence of gates.
#[derive(Default)]
pub struct GateChain<'a> {
    gates: Vec<Box<dyn Gate + 'a>>,
}

impl<'a> GateChain<'a> {
    pub fn new() -> Self {
        Self { gates: Vec::new() }
    }

    pub fn with(mut self, gate: impl Gate + 'a) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    /// Evaluate gates in order, stopping at the first one that neither passes
    /// nor skips. Returns every evaluated result; the last is the blocker, if any.
    #[instrument(skip_all, fields(worktree = %worktree.display()))]
    pub fn run_until_blocked(&self, worktree: &Path) -> Vec<GateResult> {
        let mut results = Vec::new();
        for gate in &self.gates {
            let result = gate.evaluate(worktree);
            debug!(
                gate = gate.kind().as_str(),
                verdict = result.verdict.as_str(),
                "gate evaluated"
            );
            let blocked = !result.passed() && result.verdict != GateVerdict::Skipped;
            results.push(result);
            if blocked {
                break;
            }
        }
        results
    }

    /// Evaluate every gate regardless of earlier results.
    pub fn run_all(&self, worktree: &Path) -> Vec<GateResult> {
        self.gates
            .iter()
            .map(|gate| gate.evaluate(worktree))
            .collect()
    }
}

/// Post-exit gate results stored in `gates.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostGateReport {
    pub evaluated_at: DateTime<Utc>,
    pub integrity: GateResult,
    pub feature_key: GateResult,
}

/// Run the post-exit gates for a job and persist the results.
#[instrument(skip_all, fields(task = %meta.task))]
pub fn evaluate_post_gates(
    meta: &JobMeta,
    paths: &JobPaths,
    trailer_key: &str,
    now: DateTime<Utc>,
) -> Result<PostGateReport> {
    let reported = paths.read_reported_commit()?;
    let feature_key = meta.feature_key.as_deref().unwrap_or(&meta.task);
    let mut results = GateChain::new()
        .with(IntegrityGate {
            reported_commit: reported.as_deref(),
        })
        .with(FeatureKeyGate {
            feature_key,
            trailer_key,
            base: meta.start_commit.as_deref(),
        })
        .run_all(&meta.worktree)
        .into_iter();
    let (Some(integrity), Some(feature_key)) = (results.next(), results.next()) else {
        anyhow::bail!("post-exit gate chain returned too few results");
    };
    if !feature_key.passed() {
        warn!(code = ?feature_key.code, "feature-key gate did not pass");
    }
    let report = PostGateReport {
        evaluated_at: now,
        integrity,
        feature_key,
    };
    write_json_atomic(&paths.gates, &report)?;
    Ok(report)
}

pub fn load_post_gates(paths: &JobPaths) -> Result<Option<PostGateReport>> {
    read_json(&paths.gates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn baseline_gate_passes_for_ancestor_and_head() {
        let repo = TestRepo::new();
        let base = repo.commit("a.txt", "a");
        let gate = BaselineGate {
            required: Some(&base),
        };
        assert!(gate.evaluate(repo.path()).passed());
        repo.commit("b.txt", "b");
        assert!(gate.evaluate(repo.path()).passed());
    }

    #[test]
    fn baseline_gate_fails_for_non_ancestor() {
        let repo = TestRepo::new();
        repo.commit("a.txt", "a");
        repo.git(&["checkout", "-q", "-b", "side"]);
        let side = repo.commit("side.txt", "side");
        repo.git(&["checkout", "-q", "-"]);
        let result = BaselineGate {
            required: Some(&side),
        }
        .evaluate(repo.path());
        assert_eq!(result.code.as_deref(), Some(CODE_BASELINE_NOT_ANCESTOR));
    }

    #[test]
    fn baseline_gate_fails_for_unknown_commit() {
        let repo = TestRepo::new();
        repo.commit("a.txt", "a");
        let result = BaselineGate {
            required: Some("0123456789abcdef0123456789abcdef01234567"),
        }
        .evaluate(repo.path());
        assert_eq!(result.code.as_deref(), Some(CODE_BASELINE_UNKNOWN));
    }

    #[test]
    fn baseline_gate_errors_outside_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = BaselineGate {
            required: Some("abc"),
        }
        .evaluate(temp.path());
        assert_eq!(result.verdict, GateVerdict::Error);
    }

    #[test]
    fn integrity_gate_checks_reported_commit() {
        let repo = TestRepo::new();
        let sha = repo.commit("a.txt", "a");
        assert!(
            IntegrityGate {
                reported_commit: Some(&sha)
            }
            .evaluate(repo.path())
            .passed()
        );
        let missing = IntegrityGate {
            reported_commit: Some("0123456789abcdef0123456789abcdef01234567"),
        }
        .evaluate(repo.path());
        assert_eq!(missing.code.as_deref(), Some(CODE_REPORTED_MISSING));
        let skipped = IntegrityGate {
            reported_commit: None,
        }
        .evaluate(repo.path());
        assert_eq!(skipped.verdict, GateVerdict::Skipped);
    }

    #[test]
    fn feature_key_gate_only_checks_commits_after_base() {
        let repo = TestRepo::new();
        let base = repo.commit("a.txt", "untagged history");
        repo.commit_with_message("b.txt", "feat: b\n\nFeature-Key: K-7");
        let gate = FeatureKeyGate {
            feature_key: "K-7",
            trailer_key: "Feature-Key",
            base: Some(&base),
        };
        assert!(gate.evaluate(repo.path()).passed());
        let all_history = FeatureKeyGate { base: None, ..gate };
        assert!(!all_history.evaluate(repo.path()).passed());
    }

    #[test]
    fn feature_key_gate_fails_without_commits_since_base() {
        let repo = TestRepo::new();
        let base = repo.commit("a.txt", "a");
        let result = FeatureKeyGate {
            feature_key: "K-7",
            trailer_key: "Feature-Key",
            base: Some(&base),
        }
        .evaluate(repo.path());
        assert_eq!(
            result.code.as_deref(),
            Some(crate::core::trailer::CODE_NO_COMMITS)
        );
    }

    #[test]
    fn chain_stops_at_first_blocking_gate() {
        let prefixes = vec![PathBuf::from("/srv/allowed")];
        let results = GateChain::new()
            .with(PermissionGate {
                allowed_prefixes: &prefixes,
            })
            .with(BaselineGate {
                required: Some("abc"),
            })
            .run_until_blocked(Path::new("/etc/passwd"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].gate, GateKind::Permission);
        assert!(!results[0].passed());
    }

    #[test]
    fn chain_continues_past_skipped_gates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let prefixes = vec![temp.path().to_path_buf()];
        let results = GateChain::new()
            .with(BaselineGate { required: None })
            .with(PermissionGate {
                allowed_prefixes: &prefixes,
            })
            .run_until_blocked(temp.path());
        assert_eq!(results.len(), 2);
        assert!(results[1].passed());
    }
}
