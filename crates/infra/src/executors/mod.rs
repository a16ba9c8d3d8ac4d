//! Work executors: the per-job-type strategies that enumerate and perform units.
//!
//! Each [`JobType`] maps to exactly one [`WorkExecutor`] in an
//! [`ExecutorRegistry`]. Adding a job type means adding a variant and
//! registering an executor for it.

pub mod analytics;
pub mod command;
pub mod data_collection;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use backfill_core::{BackfillJob, JobConfig, JobType, WorkUnit};

pub use analytics::{AnalyticsExecutor, AnalyticsGenerator};
pub use command::{CommandAnalytics, CommandCollector, CommandTemplate};
pub use data_collection::{DataCollectionExecutor, SnapshotCollector};

/// Successful result of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Work was performed; ids of what it produced.
    Completed { artifact_ids: Vec<String> },
    /// Nothing to do (e.g. the artifact already exists and `skip_existing` is set).
    Skipped { reason: String },
}

impl UnitOutcome {
    pub fn completed(artifact_ids: Vec<String>) -> Self {
        UnitOutcome::Completed { artifact_ids }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        UnitOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Failed unit as reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UnitFailure {
    pub message: String,
    /// Running the unit again later may succeed.
    pub retryable: bool,
    /// The external source signalled throttling; the rate limiter backs off.
    pub rate_limited: bool,
}

impl UnitFailure {
    /// Permanent failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            rate_limited: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            rate_limited: false,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            rate_limited: true,
        }
    }
}

/// Job-level executor errors (as opposed to per-unit failures).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("no executor registered for job type {0}")]
    Unregistered(JobType),

    #[error("unit enumeration failed: {0}")]
    Enumeration(String),

    #[error("prerequisite missing: {0}")]
    Prerequisite(String),
}

/// Strategy performing the units of one job type.
#[async_trait::async_trait]
pub trait WorkExecutor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Full unit set of a job, in execution order. Must be deterministic for a
    /// given config so resumes see the same units.
    async fn enumerate_units(&self, config: &JobConfig) -> Result<Vec<WorkUnit>, ExecutorError>;

    /// Perform one unit.
    async fn execute(&self, unit: &WorkUnit, config: &JobConfig) -> Result<UnitOutcome, UnitFailure>;

    /// Whether the external state the `remaining` units of `job` need is
    /// still reachable. Checked before a crashed job is resumed; units already
    /// in the checkpoint are never re-run and are not checked.
    async fn check_prerequisites(
        &self,
        _job: &BackfillJob,
        _remaining: &[WorkUnit],
    ) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Executors keyed by job type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn WorkExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` under its own job type, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn WorkExecutor>) {
        self.executors.insert(executor.job_type(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn WorkExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn WorkExecutor>, ExecutorError> {
        self.executors
            .get(&job_type)
            .cloned()
            .ok_or(ExecutorError::Unregistered(job_type))
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.executors.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
