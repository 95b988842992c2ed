//! Stable exit codes for jobrunner CLI commands.

use crate::core::types::JobState;
use crate::error::Rejection;

/// Command succeeded (or the job is healthy / finished cleanly).
pub const OK: i32 = 0;
/// Any failure without a more specific code.
pub const GENERAL_ERROR: i32 = 1;
/// `check`: the job is stalled.
pub const STALLED: i32 = 2;
/// `check`: the job exited with an error, is blocked, cancelled or missing.
pub const EXITED_ERR: i32 = 3;
pub const AUTH_FAILED: i32 = 10;
pub const CREDENTIAL_FILE: i32 = 11;
pub const PROVIDER_NOT_FOUND: i32 = 20;
/// Preflight failed, or no usable model.
pub const PREFLIGHT_FAILED: i32 = 21;
/// Worktree outside the allowed prefixes.
pub const PERMISSION_DENIED: i32 = 22;
/// `check`: the job is running but doing no useful work.
pub const NO_OP: i32 = 23;

/// Exit code `check` returns for a derived state.
pub fn for_state(state: JobState) -> i32 {
    match state {
        JobState::Launching
        | JobState::WaitingFirstOutput
        | JobState::SilentMutation
        | JobState::Healthy
        | JobState::ExitedOk => OK,
        JobState::Stalled => STALLED,
        JobState::NoOp => NO_OP,
        JobState::ExitedErr | JobState::Blocked | JobState::Cancelled | JobState::Missing => {
            EXITED_ERR
        }
    }
}

/// Map a command error to its exit code via the first [`Rejection`] in the chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Rejection>())
        .map_or(GENERAL_ERROR, Rejection::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_codes_match_taxonomy() {
        assert_eq!(for_state(JobState::Healthy), 0);
        assert_eq!(for_state(JobState::ExitedOk), 0);
        assert_eq!(for_state(JobState::Stalled), 2);
        assert_eq!(for_state(JobState::ExitedErr), 3);
        assert_eq!(for_state(JobState::Blocked), 3);
        assert_eq!(for_state(JobState::NoOp), 23);
    }

    #[test]
    fn plain_errors_are_general() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&err), GENERAL_ERROR);
    }

    #[test]
    fn permission_rejection_maps_to_22() {
        let err: anyhow::Error = Rejection::PermissionDenied {
            path: "/etc/passwd".into(),
            code: "worktree_outside_allowed_prefixes".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&err), PERMISSION_DENIED);
    }
}
