//! Shared deterministic types for runner core logic.
//!
//! These types define stable contracts between core components and the
//! artifacts written to disk. Serialized names are part of the on-disk format
//! and the report schema, so existing variants must never be renamed.

use serde::{Deserialize, Serialize};

/// Health state of a job, derived from its artifacts on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Launching,
    WaitingFirstOutput,
    SilentMutation,
    Healthy,
    Stalled,
    NoOp,
    ExitedOk,
    ExitedErr,
    Blocked,
    Missing,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launching => "launching",
            Self::WaitingFirstOutput => "waiting_first_output",
            Self::SilentMutation => "silent_mutation",
            Self::Healthy => "healthy",
            Self::Stalled => "stalled",
            Self::NoOp => "no_op",
            Self::ExitedOk => "exited_ok",
            Self::ExitedErr => "exited_err",
            Self::Blocked => "blocked",
            Self::Missing => "missing",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further automatic transition happens from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ExitedOk | Self::ExitedErr | Self::Blocked | Self::Cancelled
        )
    }

    /// States the watchdog may restart while retries remain.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Stalled | Self::NoOp)
    }
}

/// Most specific known cause behind a [`JobState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Launching,
    AwaitingOutput,
    SilentMutation,
    Active,
    Stalled,
    NoOp,
    ExitZero,
    ExitNonzero,
    Stopped,
    ExitCodeUnavailable,
    ExitPending,
    SpawnFailed,
    RetriesExhausted,
    ArtifactsMissing,
    Cancelled,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launching => "launching",
            Self::AwaitingOutput => "awaiting_output",
            Self::SilentMutation => "silent_mutation",
            Self::Active => "active",
            Self::Stalled => "stalled",
            Self::NoOp => "no_op",
            Self::ExitZero => "exit_zero",
            Self::ExitNonzero => "exit_nonzero",
            Self::Stopped => "stopped",
            Self::ExitCodeUnavailable => "exit_code_unavailable",
            Self::ExitPending => "exit_pending",
            Self::SpawnFailed => "spawn_failed",
            Self::RetriesExhausted => "retries_exhausted",
            Self::ArtifactsMissing => "artifacts_missing",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Derived health: a state plus the reason that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub state: JobState,
    pub reason: ReasonCode,
}

impl Health {
    pub fn new(state: JobState, reason: ReasonCode) -> Self {
        Self { state, reason }
    }
}

/// How the supervisor ran the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Launched under a detached completion monitor; `start` returns immediately.
    #[default]
    Detached,
    /// Launched detached, but the caller waits for a terminal state.
    Foreground,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Foreground => "foreground",
        }
    }
}

/// Governance gate identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Permission,
    Baseline,
    Integrity,
    FeatureKey,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::Baseline => "baseline",
            Self::Integrity => "integrity",
            Self::FeatureKey => "feature_key",
        }
    }
}

/// Gate verdict.
///
/// `Error` means the gate could not be evaluated (e.g. not a git repository);
/// callers must treat it as "not passed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateVerdict {
    Pass,
    Fail,
    Skipped,
    Error,
}

impl GateVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

/// Structured result of a single gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateKind,
    pub verdict: GateVerdict,
    /// Stable machine-readable rejection code, present unless the gate passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl GateResult {
    pub fn pass(gate: GateKind) -> Self {
        Self {
            gate,
            verdict: GateVerdict::Pass,
            code: None,
            detail: None,
        }
    }

    pub fn fail(gate: GateKind, code: &str, detail: impl Into<String>) -> Self {
        Self {
            gate,
            verdict: GateVerdict::Fail,
            code: Some(code.to_string()),
            detail: Some(detail.into()),
        }
    }

    pub fn skipped(gate: GateKind, detail: impl Into<String>) -> Self {
        Self {
            gate,
            verdict: GateVerdict::Skipped,
            code: None,
            detail: Some(detail.into()),
        }
    }

    pub fn error(gate: GateKind, detail: impl Into<String>) -> Self {
        Self {
            gate,
            verdict: GateVerdict::Error,
            code: Some("evaluation_error".to_string()),
            detail: Some(detail.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == GateVerdict::Pass
    }
}

/// Provider preflight classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreflightStatus {
    Ok,
    Degraded,
    Fail,
}

impl PreflightStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAvailability {
    Available,
    Unavailable,
}

/// Terminal outcome of one remote dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchOutcome {
    Success,
    Failure,
    Timeout,
    Aborted,
    PreflightFailed,
}

impl DispatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Aborted => "ABORTED",
            Self::PreflightFailed => "PREFLIGHT_FAILED",
        }
    }
}

/// Authentication mode required by a remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Private key file (`identity_file`).
    Key,
    /// Running ssh-agent (`SSH_AUTH_SOCK`).
    Agent,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Agent => "agent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_match_serde() {
        for state in [
            JobState::Launching,
            JobState::WaitingFirstOutput,
            JobState::SilentMutation,
            JobState::Healthy,
            JobState::Stalled,
            JobState::NoOp,
            JobState::ExitedOk,
            JobState::ExitedErr,
            JobState::Blocked,
            JobState::Missing,
            JobState::Cancelled,
        ] {
            let json = serde_json::to_string(&state).expect("serialize");
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }

    #[test]
    fn only_exit_blocked_and_cancelled_are_terminal() {
        assert!(JobState::ExitedOk.is_terminal());
        assert!(JobState::ExitedErr.is_terminal());
        assert!(JobState::Blocked.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Missing.is_terminal());
        assert!(!JobState::Stalled.is_terminal());
    }

    #[test]
    fn dispatch_outcome_serializes_upper_case() {
        let json = serde_json::to_string(&DispatchOutcome::PreflightFailed).expect("serialize");
        assert_eq!(json, "\"PREFLIGHT_FAILED\"");
    }
}
