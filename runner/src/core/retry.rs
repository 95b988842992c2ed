//! Retry policy for the watchdog and for remote dispatch attempts.

use crate::core::types::JobState;

/// Hard ceiling on remote dispatch attempts per host.
pub const MAX_DISPATCH_ATTEMPTS: u32 = 2;

/// What the watchdog should do with a job in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Leave,
    Restart { next_retry: u32 },
    Block,
}

/// Decide the watchdog action for one job.
///
/// Only `stalled` and `no_op` jobs are touched. A job restarts while
/// `retries < max_retries`, otherwise it is blocked and never restarted again.
pub fn decide(state: JobState, retries: u32, max_retries: u32) -> WatchdogAction {
    if !state.is_retryable() {
        return WatchdogAction::Leave;
    }
    if retries < max_retries {
        WatchdogAction::Restart {
            next_retry: retries + 1,
        }
    } else {
        WatchdogAction::Block
    }
}

/// Classification of a failed remote attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Connection-level failure that may succeed on a second try.
    Transient,
    /// Authentication was rejected; retrying cannot help.
    Auth,
    /// Remote command ran and failed, timed out, or was aborted.
    Terminal,
}

/// True when another attempt should follow a failed `attempt` (1-based).
pub fn should_retry_attempt(attempt: u32, max_attempts: u32, failure: AttemptFailure) -> bool {
    let ceiling = max_attempts.min(MAX_DISPATCH_ATTEMPTS);
    failure == AttemptFailure::Transient && attempt < ceiling
}
