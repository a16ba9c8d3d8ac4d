//! Top-level façade over the backfill subsystem.
//!
//! The orchestrator is the only component the API layer talks to. It refuses
//! new jobs until its startup recovery pass has finished.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use backfill_core::{
    BackfillJob, DateRange, JobConfig, JobId, JobStatus, RateLimitConfig,
};

use crate::storage::{JobFilter, JobPage, JobStorage, Pagination};

use super::error::{BackfillError, BackfillResult};
use super::manager::JobManager;
use super::recovery::{RecoveryManager, RecoveryReport};
use super::retention::spawn_retention_sweep;

/// Acknowledgement of a created job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// Dry-run view of a job request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPreview {
    pub total_units: usize,
    /// Dates spanned by the units; `None` when there are no units.
    pub date_range: Option<DateRange>,
    pub affected_districts: Vec<String>,
    /// Lower bound given the current pacing configuration.
    pub estimated_duration: Duration,
}

/// Retention settings of the background sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    /// Zero disables the sweep.
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug)]
pub struct BackfillOrchestrator {
    manager: Arc<JobManager>,
    retention: RetentionPolicy,
    ready: AtomicBool,
}

impl BackfillOrchestrator {
    pub fn new(manager: Arc<JobManager>, retention: RetentionPolicy) -> Self {
        Self {
            manager,
            retention,
            ready: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    fn storage(&self) -> &Arc<dyn JobStorage> {
        self.manager.storage()
    }

    /// Seed the rate-limit config if absent, run recovery, then accept jobs.
    pub async fn start(&self) -> BackfillResult<RecoveryReport> {
        if self.storage().get_rate_limit_config().await?.is_none() {
            self.storage()
                .set_rate_limit_config(&RateLimitConfig::default())
                .await?;
            info!("initialised default rate-limit config");
        }

        let report = RecoveryManager::new(Arc::clone(&self.manager))
            .recover()
            .await?;
        self.ready.store(true, Ordering::SeqCst);
        info!(
            examined = report.examined,
            resumed = report.resumed.is_some(),
            failed = report.failed.len(),
            "backfill orchestrator ready"
        );
        Ok(report)
    }

    /// Start the retention sweep task, if enabled.
    pub fn spawn_retention(&self) -> Option<JoinHandle<()>> {
        spawn_retention_sweep(
            Arc::clone(self.storage()),
            self.retention.retention_days,
            self.retention.interval,
        )
    }

    /// Recovery finished and storage answers.
    pub async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.storage().is_ready().await
    }

    pub async fn create_job(&self, config: JobConfig) -> BackfillResult<CreatedJob> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(BackfillError::NotReady);
        }
        let job = self.manager.create_job(config).await?;
        Ok(CreatedJob {
            job_id: job.job_id,
            status: job.status,
            created_at: job.created_at,
        })
    }

    pub async fn get_job(&self, job_id: JobId) -> BackfillResult<BackfillJob> {
        self.storage()
            .get_job(job_id)
            .await?
            .ok_or_else(|| BackfillError::not_found(job_id))
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> BackfillResult<JobPage> {
        Ok(self.storage().list_jobs(filter, pagination).await?)
    }

    pub async fn cancel_job(&self, job_id: JobId) -> BackfillResult<bool> {
        self.manager.cancel_job(job_id).await
    }

    /// Validate and enumerate a request without creating a job.
    pub async fn preview(&self, config: JobConfig) -> BackfillResult<JobPreview> {
        let today = Utc::now().date_naive();
        config.validate(today)?;
        let config = config.resolved(today);

        let executor = self.manager.executors().get(config.job_type)?;
        let units = executor.enumerate_units(&config).await?;

        let dates = units.iter().map(|u| u.date);
        let date_range = match (dates.clone().min(), dates.max()) {
            (Some(start), Some(end)) => Some(DateRange::new(start, end)?),
            _ => None,
        };
        let affected_districts: Vec<String> = units
            .iter()
            .filter_map(|u| u.district.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let rate_limit = self
            .rate_limit_config()
            .await?
            .with_overrides(config.rate_limit_overrides.as_ref());
        let estimated_duration = estimate_duration(
            units.len(),
            &rate_limit,
            config.job_type.allows_parallel_units(),
        );

        Ok(JobPreview {
            total_units: units.len(),
            date_range,
            affected_districts,
            estimated_duration,
        })
    }

    /// Stored rate-limit config, or the defaults if none was ever stored.
    pub async fn rate_limit_config(&self) -> BackfillResult<RateLimitConfig> {
        Ok(self
            .storage()
            .get_rate_limit_config()
            .await?
            .unwrap_or_default())
    }

    /// Validate and persist; applies from the next unit on.
    pub async fn set_rate_limit_config(&self, config: RateLimitConfig) -> BackfillResult<RateLimitConfig> {
        config.validate()?;
        self.storage().set_rate_limit_config(&config).await?;
        info!(?config, "rate-limit config updated");
        Ok(config)
    }

    /// Wait for running workers to finish.
    pub async fn wait_for_idle(&self) {
        self.manager.wait_for_idle().await;
    }
}

/// `units` × steady pacing interval, spread over `max_concurrent` lanes when
/// the job type runs units in parallel.
pub fn estimate_duration(units: usize, rate_limit: &RateLimitConfig, parallel: bool) -> Duration {
    let lanes = if parallel {
        rate_limit.max_concurrent.max(1)
    } else {
        1
    };
    let units = u32::try_from(units).unwrap_or(u32::MAX);
    rate_limit.steady_interval().saturating_mul(units) / lanes
}
