//! Analytics-generation jobs: one unit per stored snapshot, or per
//! (snapshot, district) pair when the job targets districts.

use std::collections::BTreeSet;

use chrono::NaiveDate;

use backfill_core::{BackfillJob, JobConfig, JobType, WorkUnit, sort_units};

use super::{ExecutorError, UnitFailure, UnitOutcome, WorkExecutor};

/// External collaborator that computes and stores analytics for a snapshot.
#[async_trait::async_trait]
pub trait AnalyticsGenerator: Send + Sync {
    /// Dates of every snapshot available locally.
    async fn snapshot_dates(&self) -> Result<Vec<NaiveDate>, ExecutorError>;

    /// Compute analytics for `date` (narrowed to `district` if given).
    async fn generate(
        &self,
        date: NaiveDate,
        district: Option<&str>,
    ) -> Result<Vec<String>, UnitFailure>;

    async fn analytics_exist(
        &self,
        _date: NaiveDate,
        _district: Option<&str>,
    ) -> Result<bool, UnitFailure> {
        Ok(false)
    }
}

/// [`WorkExecutor`] for [`JobType::AnalyticsGeneration`] over an [`AnalyticsGenerator`].
#[derive(Debug)]
pub struct AnalyticsExecutor<G> {
    generator: G,
}

impl<G> AnalyticsExecutor<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }
}

#[async_trait::async_trait]
impl<G> WorkExecutor for AnalyticsExecutor<G>
where
    G: AnalyticsGenerator,
{
    fn job_type(&self) -> JobType {
        JobType::AnalyticsGeneration
    }

    async fn enumerate_units(&self, config: &JobConfig) -> Result<Vec<WorkUnit>, ExecutorError> {
        let dates: BTreeSet<NaiveDate> = self
            .generator
            .snapshot_dates()
            .await?
            .into_iter()
            .filter(|d| config.start_date.is_none_or(|s| *d >= s))
            .filter(|d| config.end_date.is_none_or(|e| *d <= e))
            .collect();

        let mut units: Vec<WorkUnit> = if config.target_districts.is_empty() {
            dates.into_iter().map(WorkUnit::for_date).collect()
        } else {
            dates
                .into_iter()
                .flat_map(|date| {
                    config
                        .target_districts
                        .iter()
                        .map(move |district| WorkUnit::for_district(date, district.clone()))
                })
                .collect()
        };
        sort_units(&mut units);
        Ok(units)
    }

    async fn execute(&self, unit: &WorkUnit, config: &JobConfig) -> Result<UnitOutcome, UnitFailure> {
        let district = unit.district.as_deref();
        if config.skip_existing && self.generator.analytics_exist(unit.date, district).await? {
            return Ok(UnitOutcome::skipped(format!(
                "analytics for {} already exist",
                unit.id
            )));
        }
        let artifact_ids = self.generator.generate(unit.date, district).await?;
        Ok(UnitOutcome::completed(artifact_ids))
    }

    async fn check_prerequisites(
        &self,
        _job: &BackfillJob,
        _remaining: &[WorkUnit],
    ) -> Result<(), ExecutorError> {
        self.generator
            .snapshot_dates()
            .await
            .map(|_| ())
            .map_err(|e| ExecutorError::Prerequisite(format!("snapshot store unreachable: {e}")))
    }
}
