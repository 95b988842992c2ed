//! Structured rejections that map to stable exit codes.
//!
//! Commands return `anyhow::Result`; when the failure has a specific exit
//! code it is raised as a [`Rejection`] and recovered in `main` with
//! `downcast_ref`.

use std::fmt;
use std::path::PathBuf;

use crate::exit_codes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Worktree outside the allowed prefixes.
    PermissionDenied { path: PathBuf, code: String },
    /// Worktree HEAD does not descend from the required baseline.
    BaselineNotMet { baseline: String, detail: String },
    ProviderNotFound { provider: String },
    /// No model in the preferred/fallback chain is usable.
    ModelUnavailable { provider: String, tried: Vec<String> },
    PreflightFailed { subject: String, detail: String },
    /// A required auth environment variable is missing.
    AuthResolution { provider: String, detail: String },
    /// A credential file is missing, unreadable or empty.
    CredentialFile {
        provider: String,
        path: PathBuf,
        detail: String,
    },
    /// The job already has a live process (or is being started).
    AlreadyRunning { task: String, pid: Option<u32> },
    /// A record for this task id exists; use `restart` or a new id.
    JobExists { task: String },
    UnknownJob { task: String },
    CapacityExceeded { live: usize, limit: usize },
    AdmissionBusy { holder: u32 },
}

impl Rejection {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PermissionDenied { .. } => exit_codes::PERMISSION_DENIED,
            Self::ProviderNotFound { .. } => exit_codes::PROVIDER_NOT_FOUND,
            Self::ModelUnavailable { .. } | Self::PreflightFailed { .. } => {
                exit_codes::PREFLIGHT_FAILED
            }
            Self::AuthResolution { .. } => exit_codes::AUTH_FAILED,
            Self::CredentialFile { .. } => exit_codes::CREDENTIAL_FILE,
            Self::BaselineNotMet { .. }
            | Self::AlreadyRunning { .. }
            | Self::JobExists { .. }
            | Self::UnknownJob { .. }
            | Self::CapacityExceeded { .. }
            | Self::AdmissionBusy { .. } => exit_codes::GENERAL_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::BaselineNotMet { .. } => "baseline_not_met",
            Self::ProviderNotFound { .. } => "provider_not_found",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::PreflightFailed { .. } => "preflight_failed",
            Self::AuthResolution { .. } => "auth_resolution_failed",
            Self::CredentialFile { .. } => "credential_file_error",
            Self::AlreadyRunning { .. } => "already_running",
            Self::JobExists { .. } => "job_exists",
            Self::UnknownJob { .. } => "unknown_job",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::AdmissionBusy { .. } => "admission_busy",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied { path, code } => {
                write!(f, "permission denied for worktree {} ({code})", path.display())
            }
            Self::BaselineNotMet { baseline, detail } => {
                write!(f, "baseline {baseline} not met: {detail}")
            }
            Self::ProviderNotFound { provider } => write!(f, "provider '{provider}' not found"),
            Self::ModelUnavailable { provider, tried } => write!(
                f,
                "no usable model for provider '{provider}' (tried: {})",
                tried.join(", ")
            ),
            Self::PreflightFailed { subject, detail } => {
                write!(f, "preflight failed for {subject}: {detail}")
            }
            Self::AuthResolution { provider, detail } => {
                write!(f, "auth resolution failed for provider '{provider}': {detail}")
            }
            Self::CredentialFile {
                provider,
                path,
                detail,
            } => write!(
                f,
                "credential file {} for provider '{provider}': {detail}",
                path.display()
            ),
            Self::AlreadyRunning { task, pid } => match pid {
                Some(pid) => write!(f, "job '{task}' is already running (pid {pid})"),
                None => write!(f, "job '{task}' is being started by another process"),
            },
            Self::JobExists { task } => write!(
                f,
                "job '{task}' already exists; use `restart` or a new task id"
            ),
            Self::UnknownJob { task } => write!(f, "no job named '{task}'"),
            Self::CapacityExceeded { live, limit } => {
                write!(f, "admission refused: {live} live jobs (limit {limit})")
            }
            Self::AdmissionBusy { holder } => {
                write!(f, "admission lock held by pid {holder}")
            }
        }
    }
}

impl std::error::Error for Rejection {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn rejection_survives_context_wrapping() {
        let result: anyhow::Result<()> = Err(Rejection::ProviderNotFound {
            provider: "nope".to_string(),
        }
        .into());
        let err = result.context("start job").expect_err("error");
        assert_eq!(exit_codes::exit_code_for(&err), exit_codes::PROVIDER_NOT_FOUND);
    }

    #[test]
    fn credential_errors_have_distinct_codes() {
        let auth = Rejection::AuthResolution {
            provider: "p".to_string(),
            detail: "X unset".to_string(),
        };
        let file = Rejection::CredentialFile {
            provider: "p".to_string(),
            path: PathBuf::from("/nope"),
            detail: "missing".to_string(),
        };
        assert_eq!(auth.exit_code(), 10);
        assert_eq!(file.exit_code(), 11);
    }
}
