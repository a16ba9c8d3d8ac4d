//! End-to-end scenarios of the job runner over the local storage backend.
//!
//! Tests: Orchestrator → JobManager → WorkExecutor → JobStorage
//!
//! Verifies:
//! - Jobs run every unit and finish with a consistent checkpoint
//! - A crashed job resumes without re-running checkpointed units
//! - The single-active-job rule and stale supersede
//! - Unit failures, timeouts and panics never take the runner down

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use backfill_core::{
    BackfillJob, DateRange, JobCheckpoint, JobConfig, JobId, JobStatus, JobType, JobUpdate,
    RateLimitConfig, RateLimitOverrides, UnitId, WorkUnit,
};

use crate::executors::{
    AnalyticsExecutor, AnalyticsGenerator, DataCollectionExecutor, ExecutorError,
    ExecutorRegistry, SnapshotCollector, UnitFailure,
};
use crate::jobs::{
    BackfillError, BackfillOrchestrator, DUPLICATE_REASON, JobManager, JobManagerConfig,
    RetentionPolicy, SUPERSEDED_REASON,
};
use crate::storage::{JobFilter, JobPage, JobStorage, LocalJobStorage, Pagination, StorageError};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn unpaced() -> RateLimitOverrides {
    RateLimitOverrides {
        max_requests_per_minute: Some(100_000),
        min_delay_ms: Some(0),
        ..Default::default()
    }
}

fn collection(start: NaiveDate, end: NaiveDate) -> JobConfig {
    JobConfig::new(JobType::DataCollection)
        .with_dates(start, end)
        .with_overrides(unpaced())
}

/// Scriptable stand-in for the external snapshot source.
#[derive(Clone, Default)]
struct FakeCollector {
    started: Arc<Mutex<Vec<NaiveDate>>>,
    collected: Arc<Mutex<Vec<NaiveDate>>>,
    failing: Arc<HashSet<NaiveDate>>,
    panic_on: Option<NaiveDate>,
    hang_on: Option<NaiveDate>,
    gate: Option<Arc<Semaphore>>,
    earliest: Option<NaiveDate>,
}

impl FakeCollector {
    fn failing_on(mut self, dates: &[NaiveDate]) -> Self {
        self.failing = Arc::new(dates.iter().copied().collect());
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn collected(&self) -> Vec<NaiveDate> {
        self.collected.lock().unwrap().clone()
    }

    fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl SnapshotCollector for FakeCollector {
    async fn collect(&self, date: NaiveDate) -> Result<Vec<String>, UnitFailure> {
        self.started.lock().unwrap().push(date);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.panic_on == Some(date) {
            panic!("collector exploded on {date}");
        }
        if self.hang_on == Some(date) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.contains(&date) {
            return Err(UnitFailure::fatal(format!("source returned 500 for {date}")));
        }
        self.collected.lock().unwrap().push(date);
        Ok(vec![format!("snapshot-{date}")])
    }

    fn earliest_available(&self, _today: NaiveDate) -> Option<NaiveDate> {
        self.earliest
    }
}

struct Harness {
    _dir: TempDir,
    storage: Arc<dyn JobStorage>,
    manager: Arc<JobManager>,
    orchestrator: BackfillOrchestrator,
}

impl Harness {
    async fn new(collector: FakeCollector) -> Self {
        Self::with_config(collector, JobManagerConfig::default()).await
    }

    async fn with_config(collector: FakeCollector, config: JobManagerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn JobStorage> =
            Arc::new(LocalJobStorage::open(dir.path()).await.unwrap());
        let executors =
            ExecutorRegistry::new().with(Arc::new(DataCollectionExecutor::new(collector)));
        Self::assemble(dir, storage, executors, config)
    }

    fn assemble(
        dir: TempDir,
        storage: Arc<dyn JobStorage>,
        executors: ExecutorRegistry,
        config: JobManagerConfig,
    ) -> Self {
        let manager = Arc::new(JobManager::new(Arc::clone(&storage), executors, config));
        let orchestrator = BackfillOrchestrator::new(
            Arc::clone(&manager),
            RetentionPolicy {
                retention_days: 30,
                interval: Duration::ZERO,
            },
        );
        Self {
            _dir: dir,
            storage,
            manager,
            orchestrator,
        }
    }

    async fn job(&self, job: &BackfillJob) -> BackfillJob {
        self.storage.get_job(job.job_id).await.unwrap().unwrap()
    }

    /// Persist a job that a previous process left `running`, with the given
    /// units already checkpointed.
    async fn seed_running(
        &self,
        config: JobConfig,
        started_hours_ago: i64,
        done: &[NaiveDate],
    ) -> BackfillJob {
        let started = Utc::now() - chrono::Duration::hours(started_hours_ago);
        let units: Vec<WorkUnit> = DateRange::new(config.start_date.unwrap(), config.end_date.unwrap())
            .unwrap()
            .dates()
            .into_iter()
            .map(WorkUnit::for_date)
            .collect();
        let mut job = BackfillJob::new(config, &units, started);
        job.transition(JobStatus::Running, started).unwrap();
        for unit in units.iter().filter(|u| done.contains(&u.date)) {
            job.progress.record_processed(unit, &[format!("snapshot-{}", unit.date)]);
            job.checkpoint.record(&unit.id, started);
        }
        self.storage.create_job(&job).await.unwrap();
        job
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn three_day_collection_runs_to_completion() {
    let collector = FakeCollector::default();
    let h = Harness::new(collector.clone()).await;
    h.orchestrator.start().await.unwrap();

    let config = collection(d(2024, 1, 1), d(2024, 1, 3));
    let preview = h.orchestrator.preview(config.clone()).await.unwrap();
    assert_eq!(preview.total_units, 3);
    assert_eq!(
        preview.date_range,
        Some(DateRange::new(d(2024, 1, 1), d(2024, 1, 3)).unwrap())
    );
    assert!(preview.affected_districts.is_empty());

    let created = h.orchestrator.create_job(config).await.unwrap();
    assert_eq!(created.status, JobStatus::Running);
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.checkpoint.completed_units.len(), 3);
    assert_eq!(job.progress.total_items, 3);
    assert_eq!(job.progress.processed_items, 3);
    assert_eq!(job.progress.current_unit, None);
    assert!(job.completed_at.is_some());
    let result = job.result.expect("completed job carries a result");
    assert_eq!(result.artifact_ids.len(), 3);
    assert_eq!(collector.collected(), vec![d(2024, 1, 1), d(2024, 1, 2), d(2024, 1, 3)]);
}

#[tokio::test]
async fn job_creation_waits_for_recovery() {
    let h = Harness::new(FakeCollector::default()).await;
    let err = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, BackfillError::NotReady));
    assert!(!h.orchestrator.is_ready().await);

    h.orchestrator.start().await.unwrap();
    assert!(h.orchestrator.is_ready().await);
    assert!(h.storage.get_rate_limit_config().await.unwrap().is_some());
}

#[tokio::test]
async fn crashed_job_resumes_from_checkpoint() {
    let collector = FakeCollector::default();
    let h = Harness::new(collector.clone()).await;
    let seeded = h
        .seed_running(
            collection(d(2024, 1, 1), d(2024, 1, 3)),
            0,
            &[d(2024, 1, 1), d(2024, 1, 2)],
        )
        .await;

    let report = h.orchestrator.start().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.resumed, Some((seeded.job_id, 1)));
    h.orchestrator.wait_for_idle().await;

    assert_eq!(collector.collected(), vec![d(2024, 1, 3)]);
    let job = h.job(&seeded).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.checkpoint.completed_units.len(), 3);
    assert_eq!(job.progress.processed_items, 3);
    assert_eq!(job.progress.total_items, 3);
    assert!(job.resumed_at.is_some());
}

#[tokio::test]
async fn second_job_conflicts_with_active_one() {
    let gate = Arc::new(Semaphore::new(0));
    let collector = FakeCollector::default().gated(Arc::clone(&gate));
    let h = Harness::new(collector.clone()).await;
    h.orchestrator.start().await.unwrap();

    let first = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 2)))
        .await
        .unwrap();
    wait_until(|| collector.started_count() == 1).await;

    let err = h
        .orchestrator
        .create_job(collection(d(2024, 2, 1), d(2024, 2, 2)))
        .await
        .unwrap_err();
    assert_eq!(err.conflicting_job(), Some(first.job_id));
    assert!(err.to_string().contains(&first.job_id.to_string()));

    gate.add_permits(10);
    h.orchestrator.wait_for_idle().await;
    let first = h.orchestrator.get_job(first.job_id).await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    // Once nothing is active, creation succeeds again.
    h.orchestrator
        .create_job(collection(d(2024, 2, 1), d(2024, 2, 2)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;
}

#[tokio::test]
async fn stale_running_job_is_superseded() {
    let h = Harness::new(FakeCollector::default()).await;
    h.orchestrator.start().await.unwrap();

    let stale = h
        .seed_running(collection(d(2024, 1, 1), d(2024, 1, 3)), 2, &[d(2024, 1, 1)])
        .await;

    let created = h
        .orchestrator
        .create_job(collection(d(2024, 3, 1), d(2024, 3, 1)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;

    let stale = h.job(&stale).await;
    assert_eq!(stale.status, JobStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some(SUPERSEDED_REASON));
    assert!(stale.completed_at.is_some());

    let created = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(created.status, JobStatus::Completed);
}

#[tokio::test]
async fn job_busy_with_failing_units_is_not_superseded() {
    let h = Harness::new(FakeCollector::default()).await;
    h.orchestrator.start().await.unwrap();
    let active = h
        .seed_running(collection(d(2024, 1, 1), d(2024, 1, 3)), 2, &[])
        .await;
    // Nothing checkpointed for two hours, but the worker just finished a unit.
    let mut progress = active.progress.clone();
    progress.last_activity_at = Some(Utc::now());
    h.storage
        .update_job(active.job_id, &JobUpdate::progress(progress))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .create_job(collection(d(2024, 3, 1), d(2024, 3, 1)))
        .await
        .unwrap_err();
    assert_eq!(err.conflicting_job(), Some(active.job_id));
    assert_eq!(h.job(&active).await.status, JobStatus::Running);
}

#[tokio::test]
async fn fresh_running_job_is_not_superseded() {
    let h = Harness::new(FakeCollector::default()).await;
    h.orchestrator.start().await.unwrap();
    let active = h
        .seed_running(collection(d(2024, 1, 1), d(2024, 1, 3)), 0, &[])
        .await;

    let err = h
        .orchestrator
        .create_job(collection(d(2024, 3, 1), d(2024, 3, 1)))
        .await
        .unwrap_err();
    assert_eq!(err.conflicting_job(), Some(active.job_id));
    assert_eq!(h.job(&active).await.status, JobStatus::Running);
}

#[tokio::test]
async fn unit_failures_do_not_stop_the_job() {
    let collector = FakeCollector::default().failing_on(&[d(2024, 1, 2), d(2024, 1, 4)]);
    let h = Harness::new(collector.clone()).await;
    h.orchestrator.start().await.unwrap();

    let created = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 5)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.failed_items, 2);
    assert_eq!(job.progress.processed_items, 3);
    assert_eq!(job.progress.errors.len(), 2);
    assert_eq!(
        job.progress.errors[0].unit_id,
        Some(UnitId::for_date(d(2024, 1, 2)))
    );
    assert!(!job.checkpoint.is_done(&UnitId::for_date(d(2024, 1, 2))));
    assert_eq!(job.checkpoint.completed_units.len(), 3);
    assert_eq!(collector.collected().len(), 3);
}

#[tokio::test]
async fn job_completes_even_when_every_unit_fails() {
    let collector = FakeCollector::default().failing_on(&[d(2024, 1, 1), d(2024, 1, 2)]);
    let h = Harness::new(collector).await;
    h.orchestrator.start().await.unwrap();

    let created = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 2)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error, None);
    assert!(job.checkpoint.completed_units.is_empty());
    assert!(job.progress.last_activity_at.is_some());
    let result = job.result.unwrap();
    assert_eq!(result.failed_items, 2);
    assert_eq!(result.processed_items, 0);
}

#[tokio::test]
async fn cancel_stops_before_the_next_unit() {
    let gate = Arc::new(Semaphore::new(0));
    let collector = FakeCollector::default().gated(Arc::clone(&gate));
    let h = Harness::new(collector.clone()).await;
    h.orchestrator.start().await.unwrap();

    let created = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 3)))
        .await
        .unwrap();
    wait_until(|| collector.started_count() == 1).await;

    assert!(h.orchestrator.cancel_job(created.job_id).await.unwrap());
    gate.add_permits(10);
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());
    assert_eq!(collector.collected(), vec![d(2024, 1, 1)]);
    assert_eq!(job.checkpoint.completed_units.len(), 1);

    assert!(!h.orchestrator.cancel_job(created.job_id).await.unwrap());
}

#[tokio::test]
async fn cancel_during_pacing_wait_runs_no_further_unit() {
    let collector = FakeCollector::default();
    let h = Harness::new(collector.clone()).await;
    h.orchestrator.start().await.unwrap();

    let config = JobConfig::new(JobType::DataCollection)
        .with_dates(d(2024, 1, 1), d(2024, 1, 3))
        .with_overrides(RateLimitOverrides {
            max_requests_per_minute: Some(100_000),
            min_delay_ms: Some(1_000),
            max_delay_ms: Some(5_000),
            ..Default::default()
        });
    let created = h.orchestrator.create_job(config).await.unwrap();
    wait_until(|| collector.collected().len() == 1).await;

    // The next unit is held back by the 1s spacing while the cancel lands.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.orchestrator.cancel_job(created.job_id).await.unwrap());
    h.orchestrator.wait_for_idle().await;

    assert_eq!(collector.collected(), vec![d(2024, 1, 1)]);
    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.checkpoint.completed_units.len(), 1);
    assert_eq!(job.progress.current_unit, None);
}

/// Storage that cancels a job just before its completion is written, as a
/// concurrent cancel request would.
struct CancelsBeforeCompletion {
    inner: Arc<dyn JobStorage>,
}

#[async_trait::async_trait]
impl JobStorage for CancelsBeforeCompletion {
    async fn create_job(&self, job: &BackfillJob) -> Result<(), StorageError> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<BackfillJob>, StorageError> {
        self.inner.get_job(job_id).await
    }

    async fn update_job(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<BackfillJob, StorageError> {
        if update.status == Some(JobStatus::Completed) {
            self.inner
                .update_job(
                    job_id,
                    &JobUpdate::status(JobStatus::Cancelled).with_completed_at(Utc::now()),
                )
                .await?;
        }
        self.inner.update_job(job_id, update).await
    }

    async fn delete_job(&self, job_id: JobId) -> Result<bool, StorageError> {
        self.inner.delete_job(job_id).await
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, StorageError> {
        self.inner.list_jobs(filter, pagination).await
    }

    async fn update_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &JobCheckpoint,
    ) -> Result<(), StorageError> {
        self.inner.update_checkpoint(job_id, checkpoint).await
    }

    async fn get_checkpoint(&self, job_id: JobId) -> Result<Option<JobCheckpoint>, StorageError> {
        self.inner.get_checkpoint(job_id).await
    }

    async fn get_rate_limit_config(&self) -> Result<Option<RateLimitConfig>, StorageError> {
        self.inner.get_rate_limit_config().await
    }

    async fn set_rate_limit_config(&self, config: &RateLimitConfig) -> Result<(), StorageError> {
        self.inner.set_rate_limit_config(config).await
    }

    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<usize, StorageError> {
        self.inner.cleanup_old_jobs(retention_days).await
    }

    async fn is_ready(&self) -> bool {
        self.inner.is_ready().await
    }
}

#[tokio::test]
async fn cancel_racing_completion_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let inner: Arc<dyn JobStorage> = Arc::new(LocalJobStorage::open(dir.path()).await.unwrap());
    let storage: Arc<dyn JobStorage> = Arc::new(CancelsBeforeCompletion { inner });
    let executors = ExecutorRegistry::new()
        .with(Arc::new(DataCollectionExecutor::new(FakeCollector::default())));
    let h = Harness::assemble(dir, storage, executors, JobManagerConfig::default());
    h.orchestrator.start().await.unwrap();

    let created = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 2)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.result, None);
    assert_eq!(job.checkpoint.completed_units.len(), 2);
    assert_eq!(job.progress.processed_items, 2);
}

#[tokio::test]
async fn cancel_unknown_job_is_not_found() {
    let h = Harness::new(FakeCollector::default()).await;
    let err = h
        .orchestrator
        .cancel_job(backfill_core::JobId::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BackfillError::Domain(backfill_core::DomainError::NotFound(_))
    ));
}

#[tokio::test]
async fn panicking_unit_fails_the_job_and_runner_survives() {
    let collector = FakeCollector {
        panic_on: Some(d(2024, 1, 2)),
        ..Default::default()
    };
    let h = Harness::new(collector).await;
    h.orchestrator.start().await.unwrap();

    let created = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 3)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert!(error.contains("panicked"), "{error}");
    assert!(error.contains("collector exploded"), "{error}");
    assert!(job.checkpoint.is_done(&UnitId::for_date(d(2024, 1, 1))));

    // The slot is free again.
    h.orchestrator
        .create_job(collection(d(2024, 3, 1), d(2024, 3, 1)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;
}

#[tokio::test]
async fn unit_timeout_is_recorded_as_retryable_failure() {
    let collector = FakeCollector {
        hang_on: Some(d(2024, 1, 1)),
        ..Default::default()
    };
    let h = Harness::with_config(
        collector,
        JobManagerConfig::default().with_unit_timeout(Duration::from_millis(50)),
    )
    .await;
    h.orchestrator.start().await.unwrap();

    let created = h
        .orchestrator
        .create_job(collection(d(2024, 1, 1), d(2024, 1, 2)))
        .await
        .unwrap();
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.failed_items, 1);
    assert_eq!(job.progress.processed_items, 1);
    assert!(job.progress.errors[0].retryable);
    assert!(job.progress.errors[0].message.contains("timed out"));
}

#[tokio::test]
async fn recovery_fails_duplicate_active_jobs() {
    let collector = FakeCollector::default();
    let h = Harness::new(collector.clone()).await;
    let older = h
        .seed_running(collection(d(2024, 1, 1), d(2024, 1, 2)), 3, &[])
        .await;
    let newer = h
        .seed_running(collection(d(2024, 2, 1), d(2024, 2, 2)), 1, &[d(2024, 2, 1)])
        .await;

    let report = h.orchestrator.start().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.resumed, Some((newer.job_id, 1)));
    assert_eq!(
        report.failed,
        vec![(older.job_id, DUPLICATE_REASON.to_string())]
    );
    h.orchestrator.wait_for_idle().await;

    let older = h.job(&older).await;
    assert_eq!(older.status, JobStatus::Failed);
    assert_eq!(older.error.as_deref(), Some(DUPLICATE_REASON));
    assert_eq!(h.job(&newer).await.status, JobStatus::Completed);
    assert_eq!(collector.collected(), vec![d(2024, 2, 2)]);
}

#[tokio::test]
async fn recovery_fails_job_whose_source_window_moved() {
    let collector = FakeCollector {
        earliest: Some(d(2024, 6, 1)),
        ..Default::default()
    };
    let h = Harness::new(collector.clone()).await;
    let seeded = h
        .seed_running(collection(d(2024, 1, 1), d(2024, 1, 3)), 0, &[d(2024, 1, 1)])
        .await;

    let report = h.orchestrator.start().await.unwrap();
    assert_eq!(report.resumed, None);
    assert_eq!(report.failed.len(), 1);
    h.orchestrator.wait_for_idle().await;

    let job = h.job(&seeded).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("cannot resume"));
    assert!(job.checkpoint.is_done(&UnitId::for_date(d(2024, 1, 1))));
    assert!(collector.collected().is_empty());
    assert!(h.orchestrator.is_ready().await);
}

#[tokio::test]
async fn recovery_resumes_when_only_finished_dates_left_the_window() {
    let collector = FakeCollector {
        earliest: Some(d(2024, 1, 2)),
        ..Default::default()
    };
    let h = Harness::new(collector.clone()).await;
    let seeded = h
        .seed_running(
            collection(d(2024, 1, 1), d(2024, 1, 3)),
            0,
            &[d(2024, 1, 1), d(2024, 1, 2)],
        )
        .await;

    let report = h.orchestrator.start().await.unwrap();
    assert_eq!(report.resumed, Some((seeded.job_id, 1)));
    assert!(report.failed.is_empty());
    h.orchestrator.wait_for_idle().await;

    assert_eq!(collector.collected(), vec![d(2024, 1, 3)]);
    let job = h.job(&seeded).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.checkpoint.completed_units.len(), 3);
}

/// Analytics generator tracking how many units run at once.
#[derive(Default)]
struct ConcurrencyGauge {
    dates: Vec<NaiveDate>,
    in_flight: Mutex<usize>,
    peak: Mutex<usize>,
}

#[async_trait::async_trait]
impl AnalyticsGenerator for Arc<ConcurrencyGauge> {
    async fn snapshot_dates(&self) -> Result<Vec<NaiveDate>, ExecutorError> {
        Ok(self.dates.clone())
    }

    async fn generate(
        &self,
        date: NaiveDate,
        district: Option<&str>,
    ) -> Result<Vec<String>, UnitFailure> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight += 1;
            let mut peak = self.peak.lock().unwrap();
            *peak = (*peak).max(*in_flight);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        *self.in_flight.lock().unwrap() -= 1;
        Ok(vec![format!("analytics-{date}-{}", district.unwrap_or("all"))])
    }
}

#[tokio::test]
async fn analytics_units_respect_max_concurrent() {
    let gauge = Arc::new(ConcurrencyGauge {
        dates: vec![d(2024, 1, 1), d(2024, 1, 2), d(2024, 1, 3)],
        ..Default::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn JobStorage> = Arc::new(LocalJobStorage::open(dir.path()).await.unwrap());
    let executors =
        ExecutorRegistry::new().with(Arc::new(AnalyticsExecutor::new(Arc::clone(&gauge))));
    let h = Harness::assemble(dir, storage, executors, JobManagerConfig::default());
    h.orchestrator.start().await.unwrap();

    let config = JobConfig::new(JobType::AnalyticsGeneration)
        .with_dates(d(2024, 1, 1), d(2024, 1, 3))
        .with_districts(["north", "south"])
        .with_overrides(RateLimitOverrides {
            max_concurrent: Some(2),
            ..unpaced()
        });

    let preview = h.orchestrator.preview(config.clone()).await.unwrap();
    assert_eq!(preview.total_units, 6);
    assert_eq!(preview.affected_districts, vec!["north", "south"]);

    let created = h.orchestrator.create_job(config).await.unwrap();
    h.orchestrator.wait_for_idle().await;

    let job = h.orchestrator.get_job(created.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.processed_items, 6);
    assert_eq!(job.progress.district_progress["north"].processed_items, 3);
    assert_eq!(job.progress.district_progress["south"].total_items, 3);
    assert!(*gauge.peak.lock().unwrap() <= 2);
    assert!(h.manager.config().unit_timeout > Duration::ZERO);
}
