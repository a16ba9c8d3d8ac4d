//! Data-collection jobs: one unit per calendar date, fetch-and-store a snapshot.

use chrono::{NaiveDate, Utc};

use backfill_core::{
    BackfillJob, DateRange, JobConfig, JobType, WorkUnit, latest_backfillable,
};

use super::{ExecutorError, UnitFailure, UnitOutcome, WorkExecutor};

/// External collaborator that fetches and stores one dated snapshot.
#[async_trait::async_trait]
pub trait SnapshotCollector: Send + Sync {
    /// Fetch and persist the snapshot of `date`; returns produced artifact ids.
    async fn collect(&self, date: NaiveDate) -> Result<Vec<String>, UnitFailure>;

    /// Whether a snapshot for `date` is already stored.
    async fn snapshot_exists(&self, _date: NaiveDate) -> Result<bool, UnitFailure> {
        Ok(false)
    }

    /// Oldest date the external source still serves, if it is bounded.
    fn earliest_available(&self, _today: NaiveDate) -> Option<NaiveDate> {
        None
    }
}

/// [`WorkExecutor`] for [`JobType::DataCollection`] over a [`SnapshotCollector`].
#[derive(Debug)]
pub struct DataCollectionExecutor<C> {
    collector: C,
}

impl<C> DataCollectionExecutor<C> {
    pub fn new(collector: C) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl<C> WorkExecutor for DataCollectionExecutor<C>
where
    C: SnapshotCollector,
{
    fn job_type(&self) -> JobType {
        JobType::DataCollection
    }

    async fn enumerate_units(&self, config: &JobConfig) -> Result<Vec<WorkUnit>, ExecutorError> {
        let start = config.start_date.ok_or_else(|| {
            ExecutorError::Enumeration("data-collection jobs require a start_date".to_string())
        })?;
        let end = config
            .end_date
            .unwrap_or_else(|| latest_backfillable(Utc::now().date_naive()));
        let range = DateRange::new(start, end)
            .map_err(|e| ExecutorError::Enumeration(e.to_string()))?;
        Ok(range.dates().into_iter().map(WorkUnit::for_date).collect())
    }

    async fn execute(&self, unit: &WorkUnit, config: &JobConfig) -> Result<UnitOutcome, UnitFailure> {
        if config.skip_existing && self.collector.snapshot_exists(unit.date).await? {
            return Ok(UnitOutcome::skipped(format!("snapshot {} already exists", unit.date)));
        }
        let artifact_ids = self.collector.collect(unit.date).await?;
        Ok(UnitOutcome::completed(artifact_ids))
    }

    async fn check_prerequisites(
        &self,
        _job: &BackfillJob,
        remaining: &[WorkUnit],
    ) -> Result<(), ExecutorError> {
        let today = Utc::now().date_naive();
        let oldest = remaining.iter().map(|u| u.date).min();
        match (self.collector.earliest_available(today), oldest) {
            (Some(earliest), Some(oldest)) if oldest < earliest => {
                Err(ExecutorError::Prerequisite(format!(
                    "source no longer serves {oldest}; earliest available date is {earliest}"
                )))
            }
            _ => Ok(()),
        }
    }
}
