//! Startup recovery of jobs left non-terminal by a previous process.
//!
//! Runs once before any new job is accepted. Every job found `pending`,
//! `running` or `recovering` ends the pass either `running` (handed back to the
//! job manager, which skips checkpointed units) or `failed`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use backfill_core::{BackfillJob, JobId, JobStatus, JobUpdate};

use crate::storage::{JobFilter, Pagination};

use super::error::BackfillResult;
use super::manager::JobManager;

pub const DUPLICATE_REASON: &str = "duplicate active job at startup";

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Non-terminal jobs found.
    pub examined: usize,
    /// The job handed back to the manager, with its remaining unit count.
    pub resumed: Option<(JobId, usize)>,
    /// Jobs marked failed, with the reason.
    pub failed: Vec<(JobId, String)>,
}

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    manager: Arc<JobManager>,
}

impl RecoveryManager {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    pub async fn recover(&self) -> BackfillResult<RecoveryReport> {
        let storage = self.manager.storage();
        let mut candidates = storage
            .list_jobs(&JobFilter::non_terminal(), Pagination::new(Some(1000), None))
            .await?
            .jobs;

        let mut report = RecoveryReport {
            examined: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            info!("recovery: no interrupted jobs");
            return Ok(report);
        }

        // Most recently started first; never-started jobs rank by creation.
        candidates.sort_by_key(|j| std::cmp::Reverse((j.started_at.unwrap_or(j.created_at), j.created_at)));
        let mut candidates = candidates.into_iter();
        let Some(chosen) = candidates.next() else {
            return Ok(report);
        };

        for duplicate in candidates {
            warn!(job_id = %duplicate.job_id, status = %duplicate.status, "recovery: failing duplicate active job");
            self.manager.fail_job(duplicate.job_id, DUPLICATE_REASON).await?;
            report.failed.push((duplicate.job_id, DUPLICATE_REASON.to_string()));
        }

        match self.resume(chosen).await? {
            Ok(resumed) => report.resumed = Some(resumed),
            Err(failed) => report.failed.push(failed),
        }
        Ok(report)
    }

    /// Move `job` back to `running` and start its worker, or fail it when its
    /// prerequisites are gone. The inner result says which.
    async fn resume(
        &self,
        mut job: BackfillJob,
    ) -> BackfillResult<Result<(JobId, usize), (JobId, String)>> {
        let storage = self.manager.storage();
        let job_id = job.job_id;
        let now = Utc::now();

        match job.status {
            JobStatus::Running => {
                job.transition(JobStatus::Recovering, now)?;
            }
            JobStatus::Recovering => job.resumed_at = Some(now),
            _ => {}
        }
        if job.status == JobStatus::Recovering {
            let update = JobUpdate {
                resumed_at: job.resumed_at,
                ..JobUpdate::status(JobStatus::Recovering)
            };
            storage.update_job(job_id, &update).await?;
            info!(job_id = %job_id, "recovery: job marked recovering");
        }

        let remaining = match self.check_resumable(&job).await {
            Ok(remaining) => remaining,
            Err(reason) => {
                error!(job_id = %job_id, reason = %reason, "recovery: cannot resume job");
                self.manager.fail_job(job_id, &reason).await?;
                return Ok(Err((job_id, reason)));
            }
        };

        job.transition(JobStatus::Running, Utc::now())?;
        let update = JobUpdate {
            started_at: job.started_at,
            ..JobUpdate::status(JobStatus::Running)
        };
        storage.update_job(job_id, &update).await?;
        info!(
            job_id = %job_id,
            remaining,
            completed = job.checkpoint.completed_units.len(),
            "recovery: resuming job"
        );

        self.manager.spawn_worker(job_id);
        Ok(Ok((job_id, remaining)))
    }

    /// Remaining unit count if the job can be resumed, else the failure reason.
    async fn check_resumable(&self, job: &BackfillJob) -> Result<usize, String> {
        let executor = self
            .manager
            .executors()
            .get(job.job_type)
            .map_err(|e| format!("cannot resume: {e}"))?;
        let units = executor
            .enumerate_units(&job.config)
            .await
            .map_err(|e| format!("cannot resume: {e}"))?;
        let remaining = job.remaining_units(&units);
        executor
            .check_prerequisites(job, &remaining)
            .await
            .map_err(|e| format!("cannot resume: {e}"))?;
        Ok(remaining.len())
    }
}
