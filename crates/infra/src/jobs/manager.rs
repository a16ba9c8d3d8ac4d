//! Job lifecycle: creation under the single-active-job rule, the per-unit
//! execution loop, cancellation and finalization.
//!
//! ## Execution loop
//!
//! A job runs on one background worker task. Units are started in their
//! deterministic order; after each unit returns, its checkpoint and the
//! job's progress are written before anything else happens for that unit.
//! Job types that allow parallel units keep up to `max_concurrent` units in
//! flight; every other type runs strictly one unit at a time.
//!
//! Cancellation is cooperative: the job record is re-read before every unit
//! and again once the rate limiter lets it start, and the loop stops once it
//! reads `cancelled` (or any terminal status). Units already in flight are
//! allowed to finish.
//!
//! Every status write made by the manager is guarded with
//! [`JobUpdate::if_not_terminal`], so a worker never turns a job that was
//! cancelled or superseded under it back into `running` or `completed`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use backfill_core::{
    BackfillJob, DomainError, JobCheckpoint, JobConfig, JobError, JobId, JobProgress, JobStatus,
    JobUpdate, RateLimitConfig, WorkUnit,
};

use crate::executors::{ExecutorRegistry, UnitFailure, UnitOutcome, WorkExecutor};
use crate::rate_limiter::RateLimiter;
use crate::storage::{JobStorage, StorageError};

use super::error::{BackfillError, BackfillResult};

/// Reason recorded on a running job displaced by a newer request.
pub const SUPERSEDED_REASON: &str = "superseded by stale-timeout";

/// Job manager configuration.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Age past which an active job's last activity is presumed abandoned.
    pub stale_after: Duration,
    /// Deadline of a single unit execution.
    pub unit_timeout: Duration,
    /// Cap on `progress.errors`.
    pub max_retained_errors: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60 * 60),
            unit_timeout: Duration::from_secs(300),
            max_retained_errors: 100,
        }
    }
}

impl JobManagerConfig {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_unit_timeout(mut self, unit_timeout: Duration) -> Self {
        self.unit_timeout = unit_timeout;
        self
    }

    pub fn with_max_retained_errors(mut self, max: usize) -> Self {
        self.max_retained_errors = max;
        self
    }
}

/// Owns the lifecycle of backfill jobs.
pub struct JobManager {
    storage: Arc<dyn JobStorage>,
    executors: ExecutorRegistry,
    limiter: RateLimiter,
    config: JobManagerConfig,
    /// Serializes check-then-create within this process.
    creation: tokio::sync::Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("executors", &self.executors)
            .field("config", &self.config)
            .finish()
    }
}

/// How one unit ended, before it is folded into progress.
type UnitResult = Result<UnitOutcome, UnitFailure>;

impl JobManager {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        executors: ExecutorRegistry,
        config: JobManagerConfig,
    ) -> Self {
        Self {
            storage,
            executors,
            limiter: RateLimiter::new(),
            config,
            creation: tokio::sync::Mutex::new(()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    /// Validate `config`, enforce the single-active-job rule, persist a new
    /// job, claim it and start its worker.
    ///
    /// A blocking job whose last activity is older than `stale_after` is
    /// marked failed and the request proceeds.
    pub async fn create_job(self: &Arc<Self>, config: JobConfig) -> BackfillResult<BackfillJob> {
        let now = Utc::now();
        let today = now.date_naive();
        config.validate(today)?;
        let config = config.resolved(today);

        let executor = self.executors.get(config.job_type)?;
        let units = executor.enumerate_units(&config).await?;

        let _guard = self.creation.lock().await;

        if let Some(active) = self.storage.get_active_job().await? {
            if !active.is_stale(now, self.config.stale_after) {
                info!(
                    active_job_id = %active.job_id,
                    status = %active.status,
                    "refusing job creation: another job is active"
                );
                return Err(DomainError::conflict(active.job_id, active.status).into());
            }
            warn!(
                stale_job_id = %active.job_id,
                last_activity = %active.last_activity_at(),
                "superseding stale active job"
            );
            let supersede = JobUpdate::status(JobStatus::Failed)
                .with_completed_at(now)
                .with_error(SUPERSEDED_REASON)
                .if_not_terminal();
            match self.storage.update_job(active.job_id, &supersede).await {
                Ok(_) | Err(StorageError::AlreadyTerminal { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut job = BackfillJob::new(config, &units, now);
        self.storage.create_job(&job).await?;

        job.transition(JobStatus::Running, Utc::now())?;
        let job = self
            .storage
            .update_job(job.job_id, &JobUpdate::lifecycle_of(&job))
            .await?;
        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            total_units = job.progress.total_items,
            "backfill job created"
        );

        self.spawn_worker(job.job_id);
        Ok(job)
    }

    /// Request cancellation. Returns `false` if the job already finished.
    pub async fn cancel_job(&self, job_id: JobId) -> BackfillResult<bool> {
        let job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| BackfillError::not_found(job_id))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        let mut cancelled = job;
        cancelled.transition(JobStatus::Cancelled, now)?;
        let update = JobUpdate::status(JobStatus::Cancelled)
            .with_completed_at(now)
            .if_not_terminal();
        match self.storage.update_job(job_id, &update).await {
            Ok(_) => {}
            Err(StorageError::AlreadyTerminal { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        info!(job_id = %job_id, "backfill job cancellation requested");
        Ok(true)
    }

    /// Mark a non-terminal job failed with `reason`. No-op on terminal jobs.
    pub async fn fail_job(&self, job_id: JobId, reason: &str) -> BackfillResult<()> {
        let Some(job) = self.storage.get_job(job_id).await? else {
            return Err(BackfillError::not_found(job_id));
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        let mut progress = job.progress;
        progress.current_unit = None;
        let update = JobUpdate {
            progress: Some(progress),
            ..JobUpdate::status(JobStatus::Failed)
                .with_completed_at(Utc::now())
                .with_error(reason)
                .if_not_terminal()
        };
        match self.storage.update_job(job_id, &update).await {
            Ok(_) => {}
            Err(StorageError::AlreadyTerminal { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        error!(job_id = %job_id, reason, "backfill job failed");
        Ok(())
    }

    /// Run (or resume) `job_id` on a background worker.
    ///
    /// Errors and panics escaping the execution loop are caught here and
    /// recorded as a failed job; they never reach the host process.
    pub fn spawn_worker(self: &Arc<Self>, job_id: JobId) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let inner = tokio::spawn({
                let manager = Arc::clone(&manager);
                async move { manager.run_job(job_id).await }
            });

            let reason = match inner.await {
                Ok(Ok(status)) => {
                    info!(job_id = %job_id, status = %status, "backfill worker finished");
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(join_err) if join_err.is_panic() => {
                    format!("job worker panicked: {}", panic_message(join_err.into_panic()))
                }
                Err(_) => {
                    warn!(job_id = %job_id, "backfill worker aborted");
                    return;
                }
            };

            if let Err(e) = manager.fail_job(job_id, &reason).await {
                error!(job_id = %job_id, error = %e, "failed to record job failure");
            }
        });

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    /// Wait until every worker spawned so far has finished.
    pub async fn wait_for_idle(&self) {
        loop {
            let pending: Vec<_> = {
                let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
                workers.drain(..).collect()
            };
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }
    }

    /// Rate-limit config for the next unit: stored global config with the
    /// job's overrides applied. Falls back to `last_known` if storage fails.
    pub async fn effective_rate_limit(
        &self,
        config: &JobConfig,
        last_known: &RateLimitConfig,
    ) -> RateLimitConfig {
        let global = match self.storage.get_rate_limit_config().await {
            Ok(Some(cfg)) => cfg,
            Ok(None) => RateLimitConfig::default(),
            Err(e) => {
                warn!(error = %e, "failed to read rate-limit config; keeping previous");
                return last_known.clone();
            }
        };
        global.with_overrides(config.rate_limit_overrides.as_ref())
    }

    /// The execution loop. Returns the status the job ended in.
    async fn run_job(&self, job_id: JobId) -> BackfillResult<JobStatus> {
        let mut job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| BackfillError::not_found(job_id))?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }

        let executor = self.executors.get(job.job_type)?;
        let all_units = executor.enumerate_units(&job.config).await?;
        let remaining = job.remaining_units(&all_units);

        job.progress.reset_failures();
        job.progress.rebase_totals(&remaining);
        let update = if job.status == JobStatus::Running {
            JobUpdate::progress(job.progress.clone())
        } else {
            job.transition(JobStatus::Running, Utc::now())?;
            JobUpdate::lifecycle_of(&job)
        };
        // Refused if a cancel landed after the read above.
        match self.storage.update_job(job_id, &update.if_not_terminal()).await {
            Ok(_) => {}
            Err(StorageError::AlreadyTerminal { status, .. }) => {
                info!(job_id = %job_id, status = %status, "job finished before its worker started");
                return Ok(status);
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            job_id = %job_id,
            job_type = %job.job_type,
            remaining = remaining.len(),
            done = job.checkpoint.completed_units.len(),
            "running backfill job"
        );

        let mut run = UnitRun {
            job_id,
            progress: job.progress.clone(),
            checkpoint: job.checkpoint.clone(),
            rate_limit: self
                .effective_rate_limit(&job.config, &RateLimitConfig::default())
                .await,
        };

        let cancelled = self
            .execute_units(&executor, &job, remaining, &mut run)
            .await;

        run.progress.current_unit = None;
        if let Some(status) = cancelled {
            self.persist_progress(&run).await;
            info!(job_id = %job_id, status = %status, "backfill job stopped early");
            return Ok(status);
        }

        self.finalize(job, run).await
    }

    /// Drive units to completion. Returns the terminal status observed if the
    /// loop stopped early.
    async fn execute_units(
        &self,
        executor: &Arc<dyn WorkExecutor>,
        job: &BackfillJob,
        remaining: Vec<WorkUnit>,
        run: &mut UnitRun,
    ) -> Option<JobStatus> {
        let mut queue = remaining.into_iter();
        let mut in_flight: JoinSet<(WorkUnit, UnitResult)> = JoinSet::new();
        let mut stopped: Option<JobStatus> = None;

        loop {
            while stopped.is_none() {
                run.rate_limit = self.effective_rate_limit(&job.config, &run.rate_limit).await;
                let max_in_flight = if job.job_type.allows_parallel_units() {
                    run.rate_limit.max_concurrent.max(1) as usize
                } else {
                    1
                };
                if in_flight.len() >= max_in_flight {
                    break;
                }
                let Some(unit) = queue.next() else {
                    break;
                };
                if let Some(status) = self.stop_requested(run.job_id).await {
                    stopped = Some(status);
                    break;
                }

                self.limiter.acquire(&run.rate_limit).await;
                // The pacing wait can be long; a cancel may have landed during it.
                if let Some(status) = self.stop_requested(run.job_id).await {
                    stopped = Some(status);
                    break;
                }
                run.progress.current_unit = Some(unit.id.clone());
                run.progress.last_activity_at = Some(Utc::now());
                self.persist_progress(run).await;
                debug!(job_id = %run.job_id, unit = %unit.id, "starting unit");

                let executor = Arc::clone(executor);
                let config = job.config.clone();
                let timeout = self.config.unit_timeout;
                in_flight.spawn(async move {
                    let result = execute_with_timeout(executor.as_ref(), &unit, &config, timeout).await;
                    (unit, result)
                });
            }

            match in_flight.join_next().await {
                Some(Ok((unit, result))) => self.record_unit(run, &unit, result).await,
                Some(Err(join_err)) if join_err.is_panic() => {
                    std::panic::resume_unwind(join_err.into_panic())
                }
                Some(Err(_)) => {}
                None => break,
            }
        }
        stopped
    }

    /// Fold one unit's result into progress and checkpoint, then persist both.
    async fn record_unit(&self, run: &mut UnitRun, unit: &WorkUnit, result: UnitResult) {
        let now = Utc::now();
        run.progress.last_activity_at = Some(now);
        match result {
            Ok(UnitOutcome::Completed { artifact_ids }) => {
                run.checkpoint.record(&unit.id, now);
                run.progress.record_processed(unit, &artifact_ids);
                self.limiter.record_success().await;
                debug!(job_id = %run.job_id, unit = %unit.id, artifacts = artifact_ids.len(), "unit completed");
            }
            Ok(UnitOutcome::Skipped { reason }) => {
                run.checkpoint.record(&unit.id, now);
                run.progress.record_skipped(unit);
                debug!(job_id = %run.job_id, unit = %unit.id, reason = %reason, "unit skipped");
            }
            Err(failure) => {
                warn!(
                    job_id = %run.job_id,
                    unit = %unit.id,
                    retryable = failure.retryable,
                    rate_limited = failure.rate_limited,
                    error = %failure.message,
                    "unit failed"
                );
                self.limiter
                    .record_failure(failure.rate_limited, &run.rate_limit)
                    .await;
                run.progress.record_failed(
                    unit,
                    JobError {
                        unit_id: Some(unit.id.clone()),
                        message: failure.message,
                        occurred_at: now,
                        retryable: failure.retryable,
                    },
                    self.config.max_retained_errors,
                );
            }
        }
        if run.progress.current_unit.as_ref() == Some(&unit.id) {
            run.progress.current_unit = None;
        }

        if run.checkpoint.is_done(&unit.id) {
            if let Err(e) = self
                .storage
                .update_checkpoint(run.job_id, &run.checkpoint)
                .await
            {
                error!(job_id = %run.job_id, unit = %unit.id, error = %e, "checkpoint write failed");
            }
        }
        self.persist_progress(run).await;
    }

    async fn persist_progress(&self, run: &UnitRun) {
        if let Err(e) = self
            .storage
            .update_job(run.job_id, &JobUpdate::progress(run.progress.clone()))
            .await
        {
            error!(job_id = %run.job_id, error = %e, "progress write failed");
        }
    }

    /// Terminal status written by someone else (cancel, supersede), if any.
    async fn stop_requested(&self, job_id: JobId) -> Option<JobStatus> {
        match self.storage.get_job(job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => Some(job.status),
            Ok(Some(_)) => None,
            Ok(None) => {
                warn!(job_id = %job_id, "job record disappeared; stopping");
                Some(JobStatus::Cancelled)
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cannot read job status; continuing");
                None
            }
        }
    }

    async fn finalize(&self, mut job: BackfillJob, run: UnitRun) -> BackfillResult<JobStatus> {
        if let Some(status) = self.stop_requested(run.job_id).await {
            self.persist_progress(&run).await;
            return Ok(status);
        }

        let now = Utc::now();
        job.progress = run.progress.clone();
        job.checkpoint = run.checkpoint.clone();

        // Unit failures are partial: a job whose units all ran is completed.
        job.transition(JobStatus::Completed, now)?;
        job.result = Some(job.outcome(now));

        let update = JobUpdate::lifecycle_of(&job).if_not_terminal();
        match self.storage.update_job(job.job_id, &update).await {
            Ok(_) => {}
            Err(StorageError::AlreadyTerminal { status, .. }) => {
                // Cancelled or superseded after the check above; keep the
                // final counters but not the completion.
                self.persist_progress(&run).await;
                info!(job_id = %job.job_id, status = %status, "backfill job stopped before completing");
                return Ok(status);
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            job_id = %job.job_id,
            status = %job.status,
            processed = job.progress.processed_items,
            failed = job.progress.failed_items,
            skipped = job.progress.skipped_items,
            "backfill job finished"
        );
        Ok(job.status)
    }
}

/// Loop-local state of a running job.
struct UnitRun {
    job_id: JobId,
    progress: JobProgress,
    checkpoint: JobCheckpoint,
    rate_limit: RateLimitConfig,
}

async fn execute_with_timeout(
    executor: &dyn WorkExecutor,
    unit: &WorkUnit,
    config: &JobConfig,
    timeout: Duration,
) -> UnitResult {
    match tokio::time::timeout(timeout, executor.execute(unit, config)).await {
        Ok(result) => result,
        Err(_) => Err(UnitFailure::retryable(format!(
            "unit {} timed out after {}s",
            unit.id,
            timeout.as_secs_f64()
        ))),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
