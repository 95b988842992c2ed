//! Commit trailer parsing for the feature-key gate.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{GateKind, GateResult};

pub const CODE_NO_COMMITS: &str = "no_commits_in_job_lifetime";
pub const CODE_MISSING_TRAILER: &str = "missing_feature_key_trailer";

static TRAILER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][A-Za-z0-9-]*)\s*:\s*(.*\S)\s*$").unwrap());

/// A commit as seen by the feature-key gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    pub message: String,
}

/// Parse the trailer block (last paragraph) of a commit message.
///
/// A paragraph only counts as a trailer block when every non-empty line in it
/// is a `Key: value` pair.
pub fn parse_trailers(message: &str) -> Vec<(String, String)> {
    let trimmed = message.trim_end();
    // A single-paragraph message is a subject, not a trailer block.
    let Some((_, last_paragraph)) = trimmed.rsplit_once("\n\n") else {
        return Vec::new();
    };

    let mut trailers = Vec::new();
    for line in last_paragraph.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match TRAILER_LINE.captures(line) {
            Some(caps) => trailers.push((caps[1].to_string(), caps[2].to_string())),
            None => return Vec::new(),
        }
    }
    trailers
}

/// True when `message` carries `trailer_key: feature_key` (key is case-insensitive).
pub fn has_feature_key(message: &str, trailer_key: &str, feature_key: &str) -> bool {
    parse_trailers(message)
        .iter()
        .any(|(key, value)| key.eq_ignore_ascii_case(trailer_key) && value == feature_key)
}

/// Every commit made during the job's lifetime must carry the trailer, and at
/// least one such commit must exist.
pub fn evaluate_feature_key(commits: &[Commit], trailer_key: &str, feature_key: &str) -> GateResult {
    if commits.is_empty() {
        return GateResult::fail(
            GateKind::FeatureKey,
            CODE_NO_COMMITS,
            format!("no commits carry '{trailer_key}: {feature_key}'"),
        );
    }
    let missing: Vec<&str> = commits
        .iter()
        .filter(|commit| !has_feature_key(&commit.message, trailer_key, feature_key))
        .map(|commit| short(&commit.sha))
        .collect();
    if missing.is_empty() {
        return GateResult::pass(GateKind::FeatureKey);
    }
    GateResult::fail(
        GateKind::FeatureKey,
        CODE_MISSING_TRAILER,
        format!(
            "{} of {} commits lack '{trailer_key}: {feature_key}': {}",
            missing.len(),
            commits.len(),
            missing.join(", ")
        ),
    )
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GateVerdict;

    fn commit(sha: &str, message: &str) -> Commit {
        Commit {
            sha: sha.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn parses_trailer_block() {
        let trailers = parse_trailers("feat: add x\n\nBody text.\n\nFeature-Key: ABC-12\nSigned-off-by: Dev <d@x>\n");
        assert_eq!(
            trailers,
            vec![
                ("Feature-Key".to_string(), "ABC-12".to_string()),
                ("Signed-off-by".to_string(), "Dev <d@x>".to_string()),
            ]
        );
    }

    #[test]
    fn subject_only_message_has_no_trailers() {
        assert!(parse_trailers("Feature-Key: ABC-12").is_empty());
    }

    #[test]
    fn prose_paragraph_is_not_a_trailer_block() {
        let message = "fix: y\n\nThis mentions Feature-Key: ABC-12 inline\nand continues.";
        assert!(parse_trailers(message).is_empty());
    }

    #[test]
    fn key_match_is_case_insensitive() {
        assert!(has_feature_key("fix: y\n\nfeature-key: ABC-12", "Feature-Key", "ABC-12"));
        assert!(!has_feature_key("fix: y\n\nFeature-Key: ABC-13", "Feature-Key", "ABC-12"));
    }

    #[test]
    fn gate_fails_without_commits() {
        let result = evaluate_feature_key(&[], "Feature-Key", "ABC-12");
        assert_eq!(result.verdict, GateVerdict::Fail);
        assert_eq!(result.code.as_deref(), Some(CODE_NO_COMMITS));
    }

    #[test]
    fn gate_fails_when_any_commit_lacks_trailer() {
        let commits = vec![
            commit("aaaaaaaaaaaaaaaa", "feat: a\n\nFeature-Key: ABC-12"),
            commit("bbbbbbbbbbbbbbbb", "chore: b"),
        ];
        let result = evaluate_feature_key(&commits, "Feature-Key", "ABC-12");
        assert_eq!(result.code.as_deref(), Some(CODE_MISSING_TRAILER));
        assert!(
            result
                .detail
                .as_deref()
                .is_some_and(|d| d.contains("bbbbbbbbbbbb"))
        );
    }

    #[test]
    fn gate_passes_when_all_commits_carry_trailer() {
        let commits = vec![commit("aaaa", "feat: a\n\nFeature-Key: ABC-12")];
        assert!(evaluate_feature_key(&commits, "Feature-Key", "ABC-12").passed());
    }
}
