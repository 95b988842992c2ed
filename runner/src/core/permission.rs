//! Permission gate: worktree paths must live under an allowed prefix.
//!
//! Evaluation is lexical only (no filesystem or process access), so the same
//! input always produces the same verdict and rejection code. Callers resolve
//! symlinks before handing paths in.

use std::path::{Component, Path, PathBuf};

use crate::core::types::{GateKind, GateResult};

pub const CODE_NOT_ABSOLUTE: &str = "worktree_not_absolute";
pub const CODE_OUTSIDE_PREFIXES: &str = "worktree_outside_allowed_prefixes";
pub const CODE_NO_PREFIXES: &str = "no_allowed_prefixes";
/// The worktree could not be resolved on disk (missing, or a dangling link).
pub const CODE_UNRESOLVABLE: &str = "worktree_unresolvable";

/// Check `worktree` against the allowed prefixes.
///
/// Both sides are normalized lexically (`.` dropped, `..` resolved) and
/// compared component-wise, so `/srv/work-evil` does not match `/srv/work`
/// and `/srv/work/../etc` does not match it either.
pub fn check_worktree(worktree: &Path, allowed_prefixes: &[PathBuf]) -> GateResult {
    let Some(normalized) = normalize_absolute(worktree) else {
        return GateResult::fail(
            GateKind::Permission,
            CODE_NOT_ABSOLUTE,
            format!("{} is not an absolute path", worktree.display()),
        );
    };
    if allowed_prefixes.is_empty() {
        return GateResult::fail(
            GateKind::Permission,
            CODE_NO_PREFIXES,
            "no allowed worktree prefixes configured",
        );
    }
    let allowed = allowed_prefixes
        .iter()
        .filter_map(|prefix| normalize_absolute(prefix))
        .any(|prefix| normalized.starts_with(&prefix));
    if allowed {
        GateResult::pass(GateKind::Permission)
    } else {
        GateResult::fail(
            GateKind::Permission,
            CODE_OUTSIDE_PREFIXES,
            format!(
                "{} is outside the allowed prefixes",
                normalized.display()
            ),
        )
    }
}

/// Lexically normalize an absolute path. Returns `None` for relative paths.
pub fn normalize_absolute(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Some(out)
}
