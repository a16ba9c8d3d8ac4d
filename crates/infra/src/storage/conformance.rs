//! Behavioural suite every `JobStorage` backend must pass.
//!
//! The local backend runs on a temp directory. The Postgres backend runs only
//! when `BACKFILL_TEST_DATABASE_URL` points at a disposable database.

use chrono::{DateTime, NaiveDate, Utc};
use proptest::prelude::*;
use proptest::strategy::ValueTree;
use proptest::test_runner::TestRunner;

use backfill_core::{
    BackfillJob, JobCheckpoint, JobConfig, JobError, JobId, JobStatus, JobType, JobUpdate,
    RateLimitConfig, RateLimitOverrides, UnitId, WorkUnit,
};

use super::query::{JobFilter, Pagination};
use super::r#trait::{JobStorage, StorageError};

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn sample_job(minutes_ago: i64) -> BackfillJob {
    let units: Vec<_> = (1..=3).map(|i| WorkUnit::for_date(d(i))).collect();
    BackfillJob::new(
        JobConfig::new(JobType::DataCollection).with_dates(d(1), d(3)),
        &units,
        Utc::now() - chrono::Duration::minutes(minutes_ago),
    )
}

pub(crate) async fn run_all<S: JobStorage>(storage: &S) {
    create_then_get(storage).await;
    duplicate_create_is_rejected(storage).await;
    update_merges_partial_fields(storage).await;
    update_unknown_job_is_not_found(storage).await;
    checkpoint_writes_are_unions(storage).await;
    checkpoint_for_unknown_job_is_not_found(storage).await;
    get_job_carries_latest_checkpoint(storage).await;
    listing_is_newest_first_and_filtered(storage).await;
    active_job_lookup(storage).await;
    rate_limit_round_trip(storage).await;
    delete_removes_job_and_checkpoint(storage).await;
    cleanup_removes_only_old_terminal_jobs(storage).await;
    guarded_update_refuses_terminal_job(storage).await;
    arbitrary_jobs_round_trip(storage).await;
    assert!(storage.is_ready().await);
}

fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (1_600_000_000i64..1_900_000_000, 0u32..1_000_000_000)
        .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).unwrap())
}

fn arb_unit() -> impl Strategy<Value = WorkUnit> {
    (
        1u32..=28,
        prop::option::of(prop::sample::select(vec!["north", "south", "east"])),
    )
        .prop_map(|(day, district)| match district {
            Some(name) => WorkUnit::for_district(d(day), name),
            None => WorkUnit::for_date(d(day)),
        })
}

/// Jobs in any status, with progress, unit errors and a checkpoint.
fn arb_job() -> impl Strategy<Value = BackfillJob> {
    (
        prop::sample::select(JobType::ALL.to_vec()),
        prop::sample::select(JobStatus::ALL.to_vec()),
        prop::collection::vec(arb_unit(), 0..8),
        prop::collection::vec((arb_unit(), any::<bool>(), arb_timestamp()), 0..4),
        arb_timestamp(),
        prop::option::of(arb_timestamp()),
        prop::option::of(arb_timestamp()),
        prop::option::of(10u32..40),
    )
        .prop_map(
            |(job_type, status, units, failures, created_at, started_at, resumed_at, backoff)| {
                let mut config = JobConfig::new(job_type).with_dates(d(1), d(28));
                if let Some(tenths) = backoff {
                    config = config.with_overrides(RateLimitOverrides {
                        max_concurrent: Some(2),
                        backoff_multiplier: Some(f64::from(tenths) / 10.0),
                        ..Default::default()
                    });
                }
                let mut job = BackfillJob::new(config, &units, created_at);
                job.status = status;
                job.started_at = started_at;
                job.resumed_at = resumed_at;

                let (done, rest) = units.split_at(units.len() / 2);
                for unit in done {
                    job.progress
                        .record_processed(unit, &[format!("artifact-{}", unit.id)]);
                    job.checkpoint.record(&unit.id, created_at);
                }
                for (unit, retryable, at) in failures {
                    let error = JobError {
                        unit_id: Some(unit.id.clone()),
                        message: format!("unit {} failed", unit.id),
                        occurred_at: at,
                        retryable,
                    };
                    job.progress.record_failed(&unit, error, 100);
                    job.progress.last_activity_at = Some(at);
                }
                job.progress.current_unit = rest.first().map(|u| u.id.clone());

                if status.is_terminal() {
                    job.completed_at = Some(created_at + chrono::Duration::minutes(5));
                }
                match status {
                    JobStatus::Completed => {
                        job.result = Some(job.outcome(created_at + chrono::Duration::minutes(5)))
                    }
                    JobStatus::Failed => job.error = Some("worker panicked".to_string()),
                    _ => {}
                }
                job
            },
        )
}

async fn arbitrary_jobs_round_trip<S: JobStorage>(storage: &S) {
    let strategy = arb_job();
    let mut runner = TestRunner::deterministic();
    for _ in 0..32 {
        let job = strategy.new_tree(&mut runner).unwrap().current();
        storage.create_job(&job).await.unwrap();
        let loaded = storage.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(storage.delete_job(job.job_id).await.unwrap());
    }
}

async fn guarded_update_refuses_terminal_job<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();

    let guarded = JobUpdate::status(JobStatus::Running).if_not_terminal();
    let running = storage.update_job(job.job_id, &guarded).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);

    storage
        .update_job(job.job_id, &JobUpdate::status(JobStatus::Cancelled))
        .await
        .unwrap();
    let err = storage
        .update_job(
            job.job_id,
            &JobUpdate::status(JobStatus::Completed)
                .with_completed_at(Utc::now())
                .if_not_terminal(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::AlreadyTerminal { job_id, status: JobStatus::Cancelled } if job_id == job.job_id
    ));
    let stored = storage.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(stored.completed_at, None);
}

async fn create_then_get<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();
    let loaded = storage.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(loaded, job);

    // A job created mid-flight keeps the checkpoint it was created with.
    let mut resumed = sample_job(0);
    resumed.status = JobStatus::Running;
    resumed.started_at = Some(Utc::now());
    resumed.progress.record_processed(&WorkUnit::for_date(d(1)), &[]);
    resumed.checkpoint.record(&UnitId::for_date(d(1)), Utc::now());
    storage.create_job(&resumed).await.unwrap();
    let loaded = storage.get_job(resumed.job_id).await.unwrap().unwrap();
    assert_eq!(loaded, resumed);
    assert!(loaded.checkpoint.is_done(&UnitId::for_date(d(1))));
    assert!(storage.delete_job(resumed.job_id).await.unwrap());

    assert!(storage.get_job(JobId::new()).await.unwrap().is_none());
}

async fn duplicate_create_is_rejected<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();
    let err = storage.create_job(&job).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists(id) if id == job.job_id));
}

async fn update_merges_partial_fields<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();

    let started = Utc::now();
    let mut update = JobUpdate::status(JobStatus::Running);
    update.started_at = Some(started);
    let updated = storage.update_job(job.job_id, &update).await.unwrap();
    assert_eq!(updated.status, JobStatus::Running);
    assert_eq!(updated.config, job.config);

    let mut progress = updated.progress.clone();
    progress.processed_items = 2;
    let updated = storage
        .update_job(job.job_id, &JobUpdate::progress(progress))
        .await
        .unwrap();
    assert_eq!(updated.status, JobStatus::Running, "status untouched");
    assert_eq!(updated.progress.processed_items, 2);
    assert!(updated.started_at.is_some());

    let reloaded = storage.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(reloaded.progress.processed_items, 2);
    assert_eq!(reloaded.status, JobStatus::Running);
}

async fn update_unknown_job_is_not_found<S: JobStorage>(storage: &S) {
    let id = JobId::new();
    let err = storage
        .update_job(id, &JobUpdate::status(JobStatus::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(got) if got == id));
}

async fn checkpoint_writes_are_unions<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();

    let mut first = JobCheckpoint::default();
    first.record(&UnitId::for_date(d(1)), Utc::now());
    first.record(&UnitId::for_date(d(2)), Utc::now());
    storage.update_checkpoint(job.job_id, &first).await.unwrap();

    // A stale writer that only knows about day 3 must not erase days 1-2.
    let mut stale = JobCheckpoint::default();
    stale.record(&UnitId::for_date(d(3)), Utc::now());
    storage.update_checkpoint(job.job_id, &stale).await.unwrap();

    let stored = storage.get_checkpoint(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.completed_units.len(), 3);
    assert_eq!(stored.last_processed_unit, Some(UnitId::for_date(d(3))));
}

async fn checkpoint_for_unknown_job_is_not_found<S: JobStorage>(storage: &S) {
    let id = JobId::new();
    let err = storage
        .update_checkpoint(id, &JobCheckpoint::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(got) if got == id));
    assert!(storage.get_checkpoint(id).await.unwrap().is_none());
}

async fn get_job_carries_latest_checkpoint<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();
    let mut cp = JobCheckpoint::default();
    cp.record(&UnitId::for_date(d(1)), Utc::now());
    storage.update_checkpoint(job.job_id, &cp).await.unwrap();

    let loaded = storage.get_job(job.job_id).await.unwrap().unwrap();
    assert!(loaded.checkpoint.is_done(&UnitId::for_date(d(1))));

    let updated = storage
        .update_job(job.job_id, &JobUpdate::status(JobStatus::Running))
        .await
        .unwrap();
    assert!(updated.checkpoint.is_done(&UnitId::for_date(d(1))));
}

async fn listing_is_newest_first_and_filtered<S: JobStorage>(storage: &S) {
    let since = Utc::now() - chrono::Duration::days(500);
    let older = sample_job(600_000);
    let newer = sample_job(599_990);
    storage.create_job(&older).await.unwrap();
    storage.create_job(&newer).await.unwrap();
    storage
        .update_job(older.job_id, &JobUpdate::status(JobStatus::Failed))
        .await
        .unwrap();

    let window = JobFilter {
        created_after: Some(since),
        created_before: Some(Utc::now() - chrono::Duration::days(300)),
        ..Default::default()
    };
    let page = storage
        .list_jobs(&window, Pagination::default())
        .await
        .unwrap();
    let ids: Vec<_> = page.jobs.iter().map(|j| j.job_id).collect();
    assert_eq!(ids, vec![newer.job_id, older.job_id]);
    assert_eq!(page.total, 2);
    assert!(!page.has_more);

    let failed_only = JobFilter {
        statuses: vec![JobStatus::Failed],
        ..window.clone()
    };
    let page = storage
        .list_jobs(&failed_only, Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.jobs[0].job_id, older.job_id);

    let first = storage
        .list_jobs(&window, Pagination::new(Some(1), None))
        .await
        .unwrap();
    assert_eq!(first.jobs[0].job_id, newer.job_id);
    assert!(first.has_more);
}

async fn active_job_lookup<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();
    let mut update = JobUpdate::status(JobStatus::Running);
    update.started_at = Some(Utc::now() + chrono::Duration::days(3650));
    storage.update_job(job.job_id, &update).await.unwrap();

    let active = storage.get_active_job().await.unwrap().unwrap();
    assert_eq!(active.job_id, job.job_id);

    storage
        .update_job(job.job_id, &JobUpdate::status(JobStatus::Cancelled))
        .await
        .unwrap();
    if let Some(other) = storage.get_active_job().await.unwrap() {
        assert_ne!(other.job_id, job.job_id);
    }
}

async fn rate_limit_round_trip<S: JobStorage>(storage: &S) {
    let cfg = RateLimitConfig {
        max_requests_per_minute: 42,
        max_concurrent: 3,
        min_delay_ms: 250,
        max_delay_ms: 9_000,
        backoff_multiplier: 1.5,
    };
    storage.set_rate_limit_config(&cfg).await.unwrap();
    assert_eq!(storage.get_rate_limit_config().await.unwrap(), Some(cfg.clone()));

    let replaced = RateLimitConfig::default();
    storage.set_rate_limit_config(&replaced).await.unwrap();
    assert_eq!(storage.get_rate_limit_config().await.unwrap(), Some(replaced));
}

async fn delete_removes_job_and_checkpoint<S: JobStorage>(storage: &S) {
    let job = sample_job(0);
    storage.create_job(&job).await.unwrap();
    let mut cp = JobCheckpoint::default();
    cp.record(&UnitId::for_date(d(1)), Utc::now());
    storage.update_checkpoint(job.job_id, &cp).await.unwrap();

    assert!(storage.delete_job(job.job_id).await.unwrap());
    assert!(storage.get_job(job.job_id).await.unwrap().is_none());
    assert!(storage.get_checkpoint(job.job_id).await.unwrap().is_none());
    assert!(!storage.delete_job(job.job_id).await.unwrap());
}

async fn cleanup_removes_only_old_terminal_jobs<S: JobStorage>(storage: &S) {
    let long_ago = Utc::now() - chrono::Duration::days(90);

    let old_done = sample_job(0);
    storage.create_job(&old_done).await.unwrap();
    storage
        .update_job(
            old_done.job_id,
            &JobUpdate::status(JobStatus::Completed).with_completed_at(long_ago),
        )
        .await
        .unwrap();

    let recent_done = sample_job(0);
    storage.create_job(&recent_done).await.unwrap();
    storage
        .update_job(
            recent_done.job_id,
            &JobUpdate::status(JobStatus::Completed).with_completed_at(Utc::now()),
        )
        .await
        .unwrap();

    let old_pending = sample_job(90 * 24 * 60);
    storage.create_job(&old_pending).await.unwrap();

    let removed = storage.cleanup_old_jobs(30).await.unwrap();
    assert!(removed >= 1);
    assert!(storage.get_job(old_done.job_id).await.unwrap().is_none());
    assert!(storage.get_job(recent_done.job_id).await.unwrap().is_some());
    assert!(storage.get_job(old_pending.job_id).await.unwrap().is_some());
}

mod local_backend {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::storage::LocalJobStorage;

    #[tokio::test]
    async fn local_storage_conforms() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalJobStorage::open(dir.path()).await.unwrap();
        run_all(&storage).await;
    }

    #[tokio::test]
    async fn arc_wrapped_storage_conforms() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalJobStorage::open(dir.path()).await.unwrap());
        run_all(&storage).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checkpoint_writes_for_different_jobs_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalJobStorage::open(dir.path()).await.unwrap());

        let jobs: Vec<_> = (0..4).map(|_| sample_job(0)).collect();
        for job in &jobs {
            storage.create_job(job).await.unwrap();
        }

        let mut handles = Vec::new();
        for job in &jobs {
            let storage = storage.clone();
            let id = job.job_id;
            handles.push(tokio::spawn(async move {
                for day in 1..=10 {
                    let mut cp = JobCheckpoint::default();
                    cp.record(&UnitId::for_date(d(day)), Utc::now());
                    storage.update_checkpoint(id, &cp).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for job in &jobs {
            let cp = storage.get_checkpoint(job.job_id).await.unwrap().unwrap();
            assert_eq!(cp.completed_units.len(), 10);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 24,
            ..ProptestConfig::default()
        })]

        /// Property: whatever order checkpoint fragments are written in, the
        /// stored set is the union of every fragment.
        #[test]
        fn stored_checkpoint_is_union_of_writes(
            fragments in prop::collection::vec(
                prop::collection::btree_set(1u32..=28, 0..6),
                1..8,
            )
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let storage = LocalJobStorage::open(dir.path()).await.unwrap();
                let job = sample_job(0);
                storage.create_job(&job).await.unwrap();

                let mut expected = std::collections::BTreeSet::new();
                for fragment in &fragments {
                    let mut cp = JobCheckpoint::default();
                    for day in fragment {
                        cp.record(&UnitId::for_date(d(*day)), Utc::now());
                        expected.insert(UnitId::for_date(d(*day)));
                    }
                    storage.update_checkpoint(job.job_id, &cp).await.unwrap();
                }

                let stored = storage
                    .get_checkpoint(job.job_id)
                    .await
                    .unwrap()
                    .unwrap_or_default();
                assert_eq!(stored.completed_units, expected);
            });
        }

        /// Property: listings are newest-first whatever the insertion order,
        /// and a status filter only ever returns jobs in the requested set.
        #[test]
        fn listing_order_and_status_filter_hold(
            offsets in prop::collection::btree_set(1i64..10_000, 1..12),
            statuses in prop::collection::vec(0usize..JobStatus::ALL.len(), 12),
            wanted in prop::collection::btree_set(0usize..JobStatus::ALL.len(), 1..4),
            shift in 0usize..12,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let storage = LocalJobStorage::open(dir.path()).await.unwrap();

                let mut jobs: Vec<BackfillJob> = offsets
                    .iter()
                    .zip(&statuses)
                    .map(|(minutes_ago, status)| {
                        let mut job = sample_job(*minutes_ago);
                        job.status = JobStatus::ALL[*status];
                        job
                    })
                    .collect();
                let len = jobs.len();
                jobs.rotate_left(shift % len);
                for job in &jobs {
                    storage.create_job(job).await.unwrap();
                }

                let all = storage
                    .list_jobs(&JobFilter::default(), Pagination::new(Some(100), None))
                    .await
                    .unwrap();
                assert_eq!(all.jobs.len(), len);
                assert!(all.jobs.windows(2).all(|w| w[0].created_at > w[1].created_at));

                let wanted: Vec<JobStatus> = wanted.iter().map(|i| JobStatus::ALL[*i]).collect();
                let filtered = storage
                    .list_jobs(
                        &JobFilter::with_statuses(wanted.iter().copied()),
                        Pagination::new(Some(100), None),
                    )
                    .await
                    .unwrap();
                assert!(filtered.jobs.iter().all(|j| wanted.contains(&j.status)));
                let expected = jobs.iter().filter(|j| wanted.contains(&j.status)).count();
                assert_eq!(filtered.total, expected as u64);
            });
        }

        /// Property: the stored rate-limit config reads back unchanged.
        #[test]
        fn rate_limit_config_reads_back_unchanged(
            rpm in 1u32..10_000,
            concurrent in 1u32..64,
            min_delay in 0u64..60_000,
            extra_delay in 0u64..600_000,
            multiplier_tenths in 10u32..100,
        ) {
            let config = RateLimitConfig {
                max_requests_per_minute: rpm,
                max_concurrent: concurrent,
                min_delay_ms: min_delay,
                max_delay_ms: min_delay + extra_delay,
                backoff_multiplier: f64::from(multiplier_tenths) / 10.0,
            };
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let stored = rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let storage = LocalJobStorage::open(dir.path()).await.unwrap();
                storage.set_rate_limit_config(&config).await.unwrap();
                storage.get_rate_limit_config().await.unwrap()
            });
            prop_assert_eq!(stored, Some(config));
        }
    }
}

mod postgres_backend {
    use super::*;
    use crate::storage::PostgresJobStorage;

    #[tokio::test]
    async fn postgres_storage_conforms() {
        let Ok(url) = std::env::var("BACKFILL_TEST_DATABASE_URL") else {
            eprintln!("BACKFILL_TEST_DATABASE_URL not set; skipping postgres conformance");
            return;
        };
        let storage = PostgresJobStorage::connect(&url).await.unwrap();
        run_all(&storage).await;
    }
}
