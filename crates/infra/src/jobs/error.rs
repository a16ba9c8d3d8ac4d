use thiserror::Error;

use backfill_core::{DomainError, JobId};

use crate::executors::ExecutorError;
use crate::storage::StorageError;

/// Error surfaced by the job manager, recovery and the orchestrator.
#[derive(Debug, Clone, Error)]
pub enum BackfillError {
    /// Validation, conflict, not-found and state-machine errors.
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Startup recovery has not finished; no new jobs are accepted yet.
    #[error("backfill orchestrator is not ready")]
    NotReady,
}

pub type BackfillResult<T> = Result<T, BackfillError>;

impl BackfillError {
    pub fn not_found(job_id: JobId) -> Self {
        BackfillError::Domain(DomainError::NotFound(job_id))
    }

    /// The job blocking creation, if this is a conflict.
    pub fn conflicting_job(&self) -> Option<JobId> {
        match self {
            BackfillError::Domain(DomainError::Conflict { active_job_id, .. }) => {
                Some(*active_job_id)
            }
            _ => None,
        }
    }
}
