//! Health state machine.
//!
//! The state of a job is never stored authoritatively: it is recomputed from a
//! [`JobSnapshot`] (built purely from artifacts plus a pid liveness probe) on
//! every poll. Two supervisors reading the same artifacts at the same instant
//! always derive the same [`Health`].

use chrono::{DateTime, Duration, Utc};

use crate::core::heartbeat::{ActivityClass, ActivityWindows, Heartbeat, classify_activity};
use crate::core::types::{Health, JobState, ReasonCode};

/// Tunable thresholds for health derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub stall: Duration,
    pub noop: Duration,
    /// How long a dead process may go without a captured exit code.
    pub exit_grace: Duration,
    /// How long a job may sit without a recorded pid.
    pub spawn_timeout: Duration,
    pub max_retries: u32,
}

impl HealthThresholds {
    fn windows(&self) -> ActivityWindows {
        ActivityWindows {
            stall: self.stall,
            noop: self.noop,
        }
    }
}

/// What the artifacts say about the tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessView {
    /// No pid has been recorded yet.
    NotRecorded,
    Alive,
    /// Recorded pid is gone; `dead_since` is the first observation of that.
    Gone { dead_since: DateTime<Utc> },
}

/// Everything health derivation needs, read from the artifact store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    /// Start of the current attempt.
    pub started_at: DateTime<Utc>,
    pub retries: u32,
    pub process: ProcessView,
    pub exit_code: Option<i32>,
    pub stop_requested: bool,
    /// Immutable terminal record, once written.
    pub recorded: Option<Health>,
    pub heartbeat: Option<Heartbeat>,
    /// Artifacts that previously existed have vanished.
    pub artifacts_lost: bool,
}

/// Derive the current health of a job.
pub fn derive_health(
    snapshot: &JobSnapshot,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> Health {
    if snapshot.artifacts_lost {
        return Health::new(JobState::Missing, ReasonCode::ArtifactsMissing);
    }
    if let Some(recorded) = snapshot.recorded {
        return recorded;
    }
    if let Some(code) = snapshot.exit_code {
        return exit_health(code, snapshot.stop_requested);
    }

    match snapshot.process {
        ProcessView::NotRecorded => {
            if snapshot.stop_requested {
                Health::new(JobState::Cancelled, ReasonCode::Cancelled)
            } else if now - snapshot.started_at >= thresholds.spawn_timeout {
                Health::new(JobState::ExitedErr, ReasonCode::SpawnFailed)
            } else {
                Health::new(JobState::Launching, ReasonCode::Launching)
            }
        }
        ProcessView::Gone { dead_since } => {
            if now - dead_since >= thresholds.exit_grace {
                let reason = if snapshot.stop_requested {
                    ReasonCode::Stopped
                } else {
                    ReasonCode::ExitCodeUnavailable
                };
                Health::new(JobState::ExitedErr, reason)
            } else {
                let activity = activity_health(snapshot, thresholds, now);
                Health::new(activity.state, ReasonCode::ExitPending)
            }
        }
        ProcessView::Alive => {
            let activity = activity_health(snapshot, thresholds, now);
            if activity.state.is_retryable() && snapshot.retries >= thresholds.max_retries {
                return Health::new(JobState::Blocked, ReasonCode::RetriesExhausted);
            }
            activity
        }
    }
}

fn exit_health(code: i32, stop_requested: bool) -> Health {
    if code == 0 {
        Health::new(JobState::ExitedOk, ReasonCode::ExitZero)
    } else if stop_requested {
        Health::new(JobState::ExitedErr, ReasonCode::Stopped)
    } else {
        Health::new(JobState::ExitedErr, ReasonCode::ExitNonzero)
    }
}

fn activity_health(
    snapshot: &JobSnapshot,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> Health {
    let class = classify_activity(
        snapshot.heartbeat.as_ref(),
        snapshot.started_at,
        thresholds.windows(),
        now,
    );
    match class {
        ActivityClass::AwaitingOutput => {
            Health::new(JobState::WaitingFirstOutput, ReasonCode::AwaitingOutput)
        }
        ActivityClass::SilentMutation => {
            Health::new(JobState::SilentMutation, ReasonCode::SilentMutation)
        }
        ActivityClass::Active => Health::new(JobState::Healthy, ReasonCode::Active),
        ActivityClass::Stalled => Health::new(JobState::Stalled, ReasonCode::Stalled),
        ActivityClass::NoOp => Health::new(JobState::NoOp, ReasonCode::NoOp),
    }
}
