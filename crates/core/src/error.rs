//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, invariants,
/// conflicts). Storage and executor failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request failed validation (bad date range, unknown job type, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Another job is already active and not stale.
    #[error("conflict: job {active_job_id} is {status}")]
    Conflict {
        active_job_id: JobId,
        status: JobStatus,
    },

    /// A lifecycle transition not allowed by the job state machine.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested job does not exist.
    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(active_job_id: JobId, status: JobStatus) -> Self {
        Self::Conflict {
            active_job_id,
            status,
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
