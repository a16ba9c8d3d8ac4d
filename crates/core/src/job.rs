//! Backfill job record, lifecycle state machine, progress and checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dates::{latest_backfillable, validate_range};
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::rate_limit::RateLimitOverrides;
use crate::unit::{UnitId, WorkUnit};

/// Kind of work a job performs; selects the work executor and unit enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Fetch-and-store one dated snapshot per unit.
    DataCollection,
    /// Compute-and-store analytics for one snapshot (or snapshot/district pair).
    AnalyticsGeneration,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::DataCollection, JobType::AnalyticsGeneration];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DataCollection => "data-collection",
            JobType::AnalyticsGeneration => "analytics-generation",
        }
    }

    /// Whether units of this type may run with bounded parallelism.
    ///
    /// Analytics units work against already-local data; collection units hit
    /// the external source and always run one at a time.
    pub fn allows_parallel_units(&self) -> bool {
        matches!(self, JobType::AnalyticsGeneration)
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data-collection" => Ok(JobType::DataCollection),
            "analytics-generation" => Ok(JobType::AnalyticsGeneration),
            other => Err(DomainError::validation(format!(
                "unknown job type: {other} (expected data-collection or analytics-generation)"
            ))),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet claimed by the manager
    Pending,
    /// Units are being executed
    Running,
    /// Picked up after a crash, about to resume
    Recovering,
    /// All units accounted for
    Completed,
    /// Terminated by an unrecoverable error
    Failed,
    /// Terminated early by an operator
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Recovering,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Recovering => "recovering",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses that occupy the single active-job slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Recovering)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Failed | Cancelled)
                | (Running, Completed | Failed | Cancelled | Recovering)
                | (Recovering, Running | Failed | Cancelled)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Immutable snapshot of the request that created a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_type: JobType,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub target_districts: Vec<String>,
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub rate_limit_overrides: Option<RateLimitOverrides>,
}

impl JobConfig {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            start_date: None,
            end_date: None,
            target_districts: Vec::new(),
            skip_existing: false,
            rate_limit_overrides: None,
        }
    }

    pub fn with_dates(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn with_districts<I, S>(mut self, districts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_districts = districts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_overrides(mut self, overrides: RateLimitOverrides) -> Self {
        self.rate_limit_overrides = Some(overrides);
        self
    }

    /// Reject malformed requests before any job is persisted.
    pub fn validate(&self, today: NaiveDate) -> DomainResult<()> {
        validate_range(self.start_date, self.end_date, today)?;

        if self.job_type == JobType::DataCollection && self.start_date.is_none() {
            return Err(DomainError::validation(
                "data-collection jobs require a start_date",
            ));
        }
        if let Some(start) = self.start_date {
            if self.end_date.is_none() && start > latest_backfillable(today) {
                return Err(DomainError::validation(format!(
                    "start_date {start} must be before {today}"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for d in &self.target_districts {
            if d.trim().is_empty() || d.contains('/') {
                return Err(DomainError::validation(format!(
                    "invalid district identifier: {d:?}"
                )));
            }
            if !seen.insert(d.as_str()) {
                return Err(DomainError::validation(format!("duplicate district: {d}")));
            }
        }

        if let Some(o) = &self.rate_limit_overrides {
            o.validate()?;
        }
        Ok(())
    }

    /// Pin defaults that depend on the current date so the stored config
    /// enumerates the same units on every resume.
    pub fn resolved(mut self, today: NaiveDate) -> Self {
        if self.end_date.is_none() {
            self.end_date = Some(latest_backfillable(today));
        }
        self
    }
}

/// A unit-level error kept on the job for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub unit_id: Option<UnitId>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retryable: bool,
}

/// Progress of one target district.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistrictProgress {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
}

/// Mutable progress counters of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub current_unit: Option<UnitId>,
    #[serde(default)]
    pub district_progress: BTreeMap<String, DistrictProgress>,
    /// Most recent unit errors, oldest dropped first once the cap is hit.
    #[serde(default)]
    pub errors: Vec<JobError>,
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    /// When the worker last started or finished a unit, failures included.
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    pub fn for_units(units: &[WorkUnit]) -> Self {
        let mut district_progress: BTreeMap<String, DistrictProgress> = BTreeMap::new();
        for u in units {
            if let Some(d) = &u.district {
                district_progress.entry(d.clone()).or_default().total_items += 1;
            }
        }
        Self {
            total_items: units.len() as u64,
            district_progress,
            ..Default::default()
        }
    }

    /// Units with a recorded outcome.
    pub fn accounted(&self) -> u64 {
        self.processed_items + self.failed_items + self.skipped_items
    }

    pub fn record_processed(&mut self, unit: &WorkUnit, artifact_ids: &[String]) {
        self.processed_items += 1;
        self.artifact_ids.extend(artifact_ids.iter().cloned());
        if let Some(d) = self.district_mut(unit) {
            d.processed_items += 1;
        }
    }

    pub fn record_skipped(&mut self, unit: &WorkUnit) {
        self.skipped_items += 1;
        if let Some(d) = self.district_mut(unit) {
            d.skipped_items += 1;
        }
    }

    pub fn record_failed(&mut self, unit: &WorkUnit, error: JobError, max_errors: usize) {
        self.failed_items += 1;
        if let Some(d) = self.district_mut(unit) {
            d.failed_items += 1;
        }
        self.push_error(error, max_errors);
    }

    pub fn push_error(&mut self, error: JobError, max_errors: usize) {
        self.errors.push(error);
        if self.errors.len() > max_errors {
            let overflow = self.errors.len() - max_errors;
            self.errors.drain(..overflow);
        }
    }

    /// Forget failure counts ahead of a resume: failed units are not in the
    /// checkpoint and will be attempted again.
    pub fn reset_failures(&mut self) {
        self.failed_items = 0;
        for d in self.district_progress.values_mut() {
            d.failed_items = 0;
        }
        self.current_unit = None;
    }

    /// Re-derive totals as "already accounted + still remaining" so the unit
    /// counters add up to the total once the remaining units are done, even if
    /// unit enumeration changed since the job was created.
    pub fn rebase_totals(&mut self, remaining: &[WorkUnit]) {
        self.total_items = self.accounted() + remaining.len() as u64;
        for d in self.district_progress.values_mut() {
            d.total_items = d.processed_items + d.failed_items + d.skipped_items;
        }
        for u in remaining {
            if let Some(d) = self.district_mut(u) {
                d.total_items += 1;
            }
        }
    }

    fn district_mut(&mut self, unit: &WorkUnit) -> Option<&mut DistrictProgress> {
        unit.district
            .as_ref()
            .map(|d| self.district_progress.entry(d.clone()).or_default())
    }
}

/// Persisted resume point of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    pub last_processed_unit: Option<UnitId>,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Only ever grows over the lifetime of a job.
    #[serde(default)]
    pub completed_units: BTreeSet<UnitId>,
}

impl JobCheckpoint {
    /// Mark a unit done. Returns `false` if it already was.
    pub fn record(&mut self, unit: &UnitId, at: DateTime<Utc>) -> bool {
        self.last_processed_unit = Some(unit.clone());
        self.last_processed_at = Some(at);
        self.completed_units.insert(unit.clone())
    }

    pub fn is_done(&self, unit: &UnitId) -> bool {
        self.completed_units.contains(unit)
    }

    /// Combine with another view of the same job's checkpoint, never dropping units.
    pub fn merge(&mut self, other: &JobCheckpoint) {
        self.completed_units
            .extend(other.completed_units.iter().cloned());
        if other.last_processed_at > self.last_processed_at {
            self.last_processed_at = other.last_processed_at;
            self.last_processed_unit = other.last_processed_unit.clone();
        }
    }
}

/// Aggregate result of a successfully finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub artifact_ids: Vec<String>,
    pub duration_ms: u64,
}

/// The unit of orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub config: JobConfig,
    pub progress: JobProgress,
    pub checkpoint: JobCheckpoint,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub result: Option<JobOutcome>,
    pub error: Option<String>,
}

impl BackfillJob {
    /// Create a pending job over the given unit set.
    pub fn new(config: JobConfig, units: &[WorkUnit], now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::new(),
            job_type: config.job_type,
            status: JobStatus::Pending,
            config,
            progress: JobProgress::for_units(units),
            checkpoint: JobCheckpoint::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            resumed_at: None,
            result: None,
            error: None,
        }
    }

    /// Move to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            JobStatus::Running => {
                self.started_at.get_or_insert(at);
            }
            JobStatus::Recovering => self.resumed_at = Some(at),
            s if s.is_terminal() => self.completed_at = Some(at),
            _ => {}
        }
        Ok(())
    }

    /// Last moment the job showed signs of life.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        [
            self.checkpoint.last_processed_at,
            self.progress.last_activity_at,
            self.resumed_at,
            self.started_at,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(self.created_at)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => now - self.last_activity_at() > threshold,
            Err(_) => false,
        }
    }

    /// Units of `all` not yet in the checkpoint, preserving order.
    pub fn remaining_units(&self, all: &[WorkUnit]) -> Vec<WorkUnit> {
        all.iter()
            .filter(|u| !self.checkpoint.is_done(&u.id))
            .cloned()
            .collect()
    }

    pub fn outcome(&self, now: DateTime<Utc>) -> JobOutcome {
        let started = self.started_at.unwrap_or(self.created_at);
        JobOutcome {
            total_items: self.progress.total_items,
            processed_items: self.progress.processed_items,
            failed_items: self.progress.failed_items,
            skipped_items: self.progress.skipped_items,
            artifact_ids: self.progress.artifact_ids.clone(),
            duration_ms: (now - started).num_milliseconds().max(0) as u64,
        }
    }
}

/// Partial update of a job record; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub progress: Option<JobProgress>,
    pub result: Option<JobOutcome>,
    pub error: Option<String>,
    /// Refuse the write when the stored job is already terminal.
    #[serde(default)]
    pub if_not_terminal: bool,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: JobProgress) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    /// Everything the lifecycle methods may have changed on `job`.
    pub fn lifecycle_of(job: &BackfillJob) -> Self {
        Self {
            status: Some(job.status),
            started_at: job.started_at,
            completed_at: job.completed_at,
            resumed_at: job.resumed_at,
            progress: Some(job.progress.clone()),
            result: job.result.clone(),
            error: job.error.clone(),
            if_not_terminal: false,
        }
    }

    /// Only apply this update to a job that has not finished yet.
    pub fn if_not_terminal(mut self) -> Self {
        self.if_not_terminal = true;
        self
    }

    /// Whether this update may be applied to a job currently in `current`.
    pub fn permits(&self, current: JobStatus) -> bool {
        !(self.if_not_terminal && current.is_terminal())
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn apply_to(&self, job: &mut BackfillJob) {
        if let Some(s) = self.status {
            job.status = s;
        }
        if let Some(t) = self.started_at {
            job.started_at = Some(t);
        }
        if let Some(t) = self.completed_at {
            job.completed_at = Some(t);
        }
        if let Some(t) = self.resumed_at {
            job.resumed_at = Some(t);
        }
        if let Some(p) = &self.progress {
            job.progress = p.clone();
        }
        if let Some(r) = &self.result {
            job.result = Some(r.clone());
        }
        if let Some(e) = &self.error {
            job.error = Some(e.clone());
        }
    }
}
