//! Heartbeat bookkeeping and no-op / stall classification.
//!
//! A heartbeat is a composite liveness signal: tool invocations, worktree
//! mutations and log growth. Raw CPU time is deliberately not an input, so a
//! process spinning without doing useful work is still diagnosed as `no_op`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Counters sampled from a job at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub log_bytes: u64,
    /// Tool invocations counted in the log, `None` when the provider exposes
    /// no tool signal (log growth then doubles as the heartbeat).
    pub tool_calls: Option<u64>,
    /// Cumulative worktree mutation count.
    pub mutations: u64,
    /// Log offset up to which `tool_calls` has been counted.
    pub tool_scan_offset: u64,
    pub pid: Option<u32>,
    pub pid_alive: bool,
}

/// Persisted heartbeat record (`heartbeat.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub observed_at: DateTime<Utc>,
    pub log_bytes: u64,
    pub tool_calls: u64,
    pub mutations: u64,
    #[serde(default)]
    pub tool_scan_offset: u64,
    /// Last pid observed alive; used to detect vanished pid records.
    pub pid_seen: Option<u32>,
    pub last_log_growth_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_mutation_at: Option<DateTime<Utc>>,
    /// First observation at which the recorded pid was no longer alive.
    pub dead_since: Option<DateTime<Utc>>,
}

impl Heartbeat {
    /// Heartbeat of an attempt that has produced nothing yet. `mutations` is
    /// the cumulative count carried over from earlier attempts, so only
    /// changes made after this point register as mutations.
    pub fn attempt_start(now: DateTime<Utc>, mutations: u64) -> Self {
        Self {
            observed_at: now,
            log_bytes: 0,
            tool_calls: 0,
            mutations,
            tool_scan_offset: 0,
            pid_seen: None,
            last_log_growth_at: None,
            last_heartbeat_at: None,
            last_mutation_at: None,
            dead_since: None,
        }
    }
}

/// Fold a new observation into the previous heartbeat record.
pub fn advance(prev: Option<&Heartbeat>, obs: Observation, now: DateTime<Utc>) -> Heartbeat {
    let prev_log = prev.map_or(0, |hb| hb.log_bytes);
    let prev_tools = prev.map_or(0, |hb| hb.tool_calls);
    let prev_mutations = prev.map_or(0, |hb| hb.mutations);

    // A shrinking log means it was rotated; any content counts as growth.
    let log_grew = if obs.log_bytes < prev_log {
        obs.log_bytes > 0
    } else {
        obs.log_bytes > prev_log
    };
    let tool_calls = obs.tool_calls.unwrap_or(0);
    let tools_grew = tool_calls > prev_tools;
    let mutated = obs.mutations > prev_mutations;

    let last_log_growth_at = if log_grew {
        Some(now)
    } else {
        prev.and_then(|hb| hb.last_log_growth_at)
    };
    let heartbeat_signal = match obs.tool_calls {
        Some(_) => tools_grew,
        None => log_grew,
    };
    let last_heartbeat_at = if heartbeat_signal {
        Some(now)
    } else {
        prev.and_then(|hb| hb.last_heartbeat_at)
    };
    let last_mutation_at = if mutated {
        Some(now)
    } else {
        prev.and_then(|hb| hb.last_mutation_at)
    };

    let dead_since = match (obs.pid, obs.pid_alive) {
        (Some(_), false) => Some(prev.and_then(|hb| hb.dead_since).unwrap_or(now)),
        _ => None,
    };
    let pid_seen = if obs.pid_alive {
        obs.pid
    } else {
        prev.and_then(|hb| hb.pid_seen)
    };

    Heartbeat {
        observed_at: now,
        log_bytes: obs.log_bytes,
        tool_calls,
        mutations: obs.mutations,
        tool_scan_offset: obs.tool_scan_offset,
        pid_seen,
        last_log_growth_at,
        last_heartbeat_at,
        last_mutation_at,
        dead_since,
    }
}

/// Windows used to classify inactivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityWindows {
    pub stall: Duration,
    pub noop: Duration,
}

/// Liveness classification of a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityClass {
    AwaitingOutput,
    SilentMutation,
    Active,
    Stalled,
    NoOp,
}

/// Classify a live job from its most recent heartbeat.
///
/// - `NoOp` once neither heartbeat nor mutation has been seen for the no-op
///   window (log growth alone does not count as useful work).
/// - `Stalled` once no signal at all has been seen for the stall window.
/// - Otherwise the job is awaiting output, mutating silently, or active.
pub fn classify_activity(
    heartbeat: Option<&Heartbeat>,
    started_at: DateTime<Utc>,
    windows: ActivityWindows,
    now: DateTime<Utc>,
) -> ActivityClass {
    let last_useful = [
        Some(started_at),
        heartbeat.and_then(|hb| hb.last_heartbeat_at),
        heartbeat.and_then(|hb| hb.last_mutation_at),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(started_at);
    let last_any = heartbeat
        .and_then(|hb| hb.last_log_growth_at)
        .map_or(last_useful, |at| at.max(last_useful));

    if now - last_useful >= windows.noop {
        return ActivityClass::NoOp;
    }
    if now - last_any >= windows.stall {
        return ActivityClass::Stalled;
    }

    match heartbeat {
        None => ActivityClass::AwaitingOutput,
        Some(hb)
            if hb.log_bytes == 0 && hb.last_mutation_at.is_none() && hb.tool_calls == 0 =>
        {
            ActivityClass::AwaitingOutput
        }
        Some(hb) if hb.log_bytes == 0 => ActivityClass::SilentMutation,
        Some(_) => ActivityClass::Active,
    }
}
