use std::sync::Arc;

use thiserror::Error;

use backfill_core::{BackfillJob, JobCheckpoint, JobId, JobStatus, JobUpdate, RateLimitConfig};

use super::query::{JobFilter, JobPage, Pagination};

/// Job storage operation error.
///
/// These are **infrastructure errors** (I/O, database, encoding) as opposed to
/// domain errors (validation, conflicts).
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// A guarded update found the job already finished.
    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Durable persistence of jobs, checkpoints and the rate-limit singleton.
///
/// ## Contract
///
/// Every implementation must:
/// - merge partial fields in `update_job` (callers never re-supply the record)
/// - check `JobUpdate::permits` against the stored status in the same
///   critical section as the write
/// - store a non-empty checkpoint passed to `create_job` along with the job
/// - keep `update_checkpoint` calls for different jobs independent
/// - never drop a unit from a stored checkpoint (writes are unions)
/// - return written values on the next read within the same process
///   (no client-side caching)
/// - list jobs newest-first by `created_at`
///
/// Backends differ only in physical storage and must be indistinguishable to
/// callers; the conformance suite in `storage::conformance` is run against each.
#[async_trait::async_trait]
pub trait JobStorage: Send + Sync {
    /// Persist a new job. Fails with `AlreadyExists` on id reuse.
    async fn create_job(&self, job: &BackfillJob) -> Result<(), StorageError>;

    /// Load a job with its latest checkpoint.
    async fn get_job(&self, job_id: JobId) -> Result<Option<BackfillJob>, StorageError>;

    /// Merge `update` into the stored record and return the result.
    async fn update_job(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<BackfillJob, StorageError>;

    /// Remove a job and its checkpoint. Returns whether it existed.
    async fn delete_job(&self, job_id: JobId) -> Result<bool, StorageError>;

    /// Newest-first page of jobs matching `filter`.
    async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, StorageError>;

    /// The job in `running`/`recovering`, if any.
    ///
    /// Should several exist (prior bugs, manual edits), the most recently
    /// started one is returned.
    async fn get_active_job(&self) -> Result<Option<BackfillJob>, StorageError> {
        let page = self
            .list_jobs(&JobFilter::active(), Pagination::new(Some(1000), None))
            .await?;
        Ok(page
            .jobs
            .into_iter()
            .max_by_key(|j| (j.started_at.unwrap_or(j.created_at), j.created_at)))
    }

    /// Union `checkpoint` into the stored checkpoint of `job_id`.
    async fn update_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &JobCheckpoint,
    ) -> Result<(), StorageError>;

    async fn get_checkpoint(&self, job_id: JobId) -> Result<Option<JobCheckpoint>, StorageError>;

    async fn get_rate_limit_config(&self) -> Result<Option<RateLimitConfig>, StorageError>;

    async fn set_rate_limit_config(&self, config: &RateLimitConfig) -> Result<(), StorageError>;

    /// Delete terminal jobs finished more than `retention_days` ago.
    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<usize, StorageError>;

    /// Health probe. Never fails; reports `false` when storage is unusable.
    async fn is_ready(&self) -> bool;
}

#[async_trait::async_trait]
impl<S> JobStorage for Arc<S>
where
    S: JobStorage + ?Sized,
{
    async fn create_job(&self, job: &BackfillJob) -> Result<(), StorageError> {
        (**self).create_job(job).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<BackfillJob>, StorageError> {
        (**self).get_job(job_id).await
    }

    async fn update_job(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<BackfillJob, StorageError> {
        (**self).update_job(job_id, update).await
    }

    async fn delete_job(&self, job_id: JobId) -> Result<bool, StorageError> {
        (**self).delete_job(job_id).await
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, StorageError> {
        (**self).list_jobs(filter, pagination).await
    }

    async fn get_active_job(&self) -> Result<Option<BackfillJob>, StorageError> {
        (**self).get_active_job().await
    }

    async fn update_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &JobCheckpoint,
    ) -> Result<(), StorageError> {
        (**self).update_checkpoint(job_id, checkpoint).await
    }

    async fn get_checkpoint(&self, job_id: JobId) -> Result<Option<JobCheckpoint>, StorageError> {
        (**self).get_checkpoint(job_id).await
    }

    async fn get_rate_limit_config(&self) -> Result<Option<RateLimitConfig>, StorageError> {
        (**self).get_rate_limit_config().await
    }

    async fn set_rate_limit_config(&self, config: &RateLimitConfig) -> Result<(), StorageError> {
        (**self).set_rate_limit_config(config).await
    }

    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<usize, StorageError> {
        (**self).cleanup_old_jobs(retention_days).await
    }

    async fn is_ready(&self) -> bool {
        (**self).is_ready().await
    }
}
