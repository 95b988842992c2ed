//! Stable job report: the record `report` and `status --json` print.
//!
//! Field names are part of a versioned, append-only contract described by
//! `schemas/job_report.v1.schema.json`. JSON output is validated against that
//! schema before it is printed.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::Serialize;
use serde_json::Value;

use crate::core::types::{ExecutionMode, GateVerdict, JobState, ReasonCode};
use crate::io::artifacts::TerminalOutcome;
use crate::supervisor::JobStatus;

pub const REPORT_SCHEMA_V1: &str = include_str!("../schemas/job_report.v1.schema.json");
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub schema_version: u32,
    pub task: String,
    pub provider: Option<String>,
    pub state: JobState,
    pub reason_code: ReasonCode,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub exit_code: Option<i32>,
    pub outcome: Option<TerminalOutcome>,
    pub selected_model: Option<String>,
    pub fallback_reason: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
    pub worktree: Option<PathBuf>,
    pub mutations: u64,
    pub log_bytes: u64,
    pub pid: Option<u32>,
    /// Most recent liveness signal of any kind.
    pub heartbeat_last_seen: Option<DateTime<Utc>>,
    pub integrity_gate: Option<GateVerdict>,
    pub feature_key_gate: Option<GateVerdict>,
}

impl JobReport {
    pub fn from_status(status: &JobStatus) -> Self {
        let meta = status.meta.as_ref();
        let heartbeat_last_seen = status.heartbeat.as_ref().and_then(|hb| {
            [
                hb.last_log_growth_at,
                hb.last_heartbeat_at,
                hb.last_mutation_at,
            ]
            .into_iter()
            .flatten()
            .max()
        });
        Self {
            schema_version: SCHEMA_VERSION,
            task: status.task.clone(),
            provider: meta.map(|meta| meta.provider.clone()),
            state: status.health.state,
            reason_code: status.health.reason,
            started_at: meta.map(|meta| meta.started_at),
            completed_at: status.outcome.map(|outcome| outcome.completed_at),
            retries: meta.map_or(0, |meta| meta.retries),
            exit_code: status
                .outcome
                .and_then(|outcome| outcome.exit_code)
                .or(status.exit_code),
            outcome: status.outcome,
            selected_model: meta.and_then(|meta| meta.selected_model.clone()),
            fallback_reason: meta.and_then(|meta| meta.fallback_reason.clone()),
            execution_mode: meta.map(|meta| meta.execution_mode),
            worktree: meta.map(|meta| meta.worktree.clone()),
            mutations: status.mutations,
            log_bytes: status.log_bytes,
            pid: status.pid,
            heartbeat_last_seen,
            integrity_gate: status.gates.as_ref().map(|gates| gates.integrity.verdict),
            feature_key_gate: status.gates.as_ref().map(|gates| gates.feature_key.verdict),
        }
    }
}

/// Pretty JSON for one report, validated against the v1 schema.
pub fn render_json(report: &JobReport) -> Result<String> {
    let value = serde_json::to_value(report).context("serialize report")?;
    validate_report(&value)?;
    serde_json::to_string_pretty(&value).context("render report")
}

/// Validate a report instance against the v1 schema (Draft 2020-12).
pub fn validate_report(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(REPORT_SCHEMA_V1).context("parse report schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile report schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("report schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Human-readable rendering; one `key: value` line per field.
pub fn render_text(report: &JobReport) -> String {
    fn opt<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "-".to_string(), |value| value.to_string())
    }

    let model = match (&report.selected_model, &report.fallback_reason) {
        (Some(model), Some(reason)) => format!("{model} (fallback: {reason})"),
        (Some(model), None) => model.clone(),
        (None, _) => "-".to_string(),
    };
    let rows = [
        ("task", report.task.clone()),
        (
            "state",
            format!("{} ({})", report.state.as_str(), report.reason_code.as_str()),
        ),
        ("provider", opt(report.provider.as_deref())),
        ("model", model),
        ("mode", opt(report.execution_mode.map(ExecutionMode::as_str))),
        (
            "worktree",
            opt(report.worktree.as_ref().map(|path| path.display())),
        ),
        ("started_at", opt(report.started_at.map(|at| at.to_rfc3339()))),
        (
            "completed_at",
            opt(report.completed_at.map(|at| at.to_rfc3339())),
        ),
        ("retries", report.retries.to_string()),
        ("exit_code", opt(report.exit_code)),
        ("pid", opt(report.pid)),
        (
            "last_seen",
            opt(report.heartbeat_last_seen.map(|at| at.to_rfc3339())),
        ),
        ("mutations", report.mutations.to_string()),
        ("log_bytes", report.log_bytes.to_string()),
        (
            "integrity_gate",
            opt(report.integrity_gate.map(GateVerdict::as_str)),
        ),
        (
            "feature_key_gate",
            opt(report.feature_key_gate.map(GateVerdict::as_str)),
        ),
    ];
    let width = rows.iter().map(|(key, _)| key.len()).max().unwrap_or(0) + 1;
    let mut out = String::new();
    for (key, value) in rows {
        out.push_str(&format!("{:<width$} {value}\n", format!("{key}:")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GateKind, GateResult, Health};
    use crate::gates::PostGateReport;
    use crate::io::artifacts::JobMeta;
    use crate::test_support::t0;

    fn meta() -> JobMeta {
        JobMeta {
            task: "T-7".to_string(),
            provider: "codex".to_string(),
            worktree: PathBuf::from("/tmp/jobrunner/worktrees/t7"),
            prompt_path: PathBuf::from("prompt.md"),
            retries: 1,
            created_at: t0(),
            started_at: t0(),
            selected_model: Some("gpt-5-mini".to_string()),
            fallback_reason: Some("gpt-5: unavailable".to_string()),
            execution_mode: ExecutionMode::Detached,
            required_baseline: None,
            start_commit: None,
            feature_key: None,
        }
    }

    fn exited_ok_without_trailer() -> JobStatus {
        let completed = t0() + chrono::Duration::minutes(5);
        JobStatus {
            task: "T-7".to_string(),
            health: Health::new(JobState::ExitedOk, ReasonCode::ExitZero),
            meta: Some(meta()),
            pid: Some(4242),
            exit_code: Some(0),
            heartbeat: None,
            mutations: 3,
            log_bytes: 512,
            outcome: Some(TerminalOutcome {
                state: JobState::ExitedOk,
                reason: ReasonCode::ExitZero,
                completed_at: completed,
                exit_code: Some(0),
            }),
            gates: Some(PostGateReport {
                evaluated_at: completed,
                integrity: GateResult::skipped(GateKind::Integrity, "no reported commit"),
                feature_key: GateResult::fail(
                    GateKind::FeatureKey,
                    crate::core::trailer::CODE_MISSING_TRAILER,
                    "no commit carries Feature-Key: T-7",
                ),
            }),
        }
    }

    #[test]
    fn exit_state_and_gate_verdict_are_independent_fields() {
        let report = JobReport::from_status(&exited_ok_without_trailer());
        let rendered = render_json(&report).expect("render");
        let value: Value = serde_json::from_str(&rendered).expect("json");
        assert_eq!(value["state"], "exited_ok");
        assert_eq!(value["outcome"]["state"], "exited_ok");
        assert_eq!(value["feature_key_gate"], "fail");
        assert_eq!(value["integrity_gate"], "skipped");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["fallback_reason"], "gpt-5: unavailable");
    }

    #[test]
    fn report_for_missing_job_still_matches_schema() {
        let status = JobStatus {
            task: "gone".to_string(),
            health: Health::new(JobState::Missing, ReasonCode::ArtifactsMissing),
            meta: None,
            pid: None,
            exit_code: None,
            heartbeat: None,
            mutations: 0,
            log_bytes: 0,
            outcome: None,
            gates: None,
        };
        let rendered = render_json(&JobReport::from_status(&status)).expect("render");
        let value: Value = serde_json::from_str(&rendered).expect("json");
        assert!(value["provider"].is_null());
        assert_eq!(value["reason_code"], "artifacts_missing");
    }

    #[test]
    fn schema_rejects_report_without_stable_field() {
        let report = JobReport::from_status(&exited_ok_without_trailer());
        let mut value = serde_json::to_value(&report).expect("value");
        value.as_object_mut().expect("object").remove("reason_code");
        let err = validate_report(&value).expect_err("must fail");
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn text_rendering_lists_state_reason_and_gates() {
        let text = render_text(&JobReport::from_status(&exited_ok_without_trailer()));
        assert!(text.contains("exited_ok (exit_zero)"));
        assert!(text.contains("gpt-5-mini (fallback: gpt-5: unavailable)"));
        assert!(text.lines().any(|line| line.starts_with("feature_key_gate:") && line.ends_with("fail")));
        assert!(text.lines().any(|line| line.starts_with("pid:") && line.ends_with("4242")));
    }
}
