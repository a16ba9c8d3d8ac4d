use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use backfill_core::{
    BackfillJob, DistrictProgress, DomainError, JobCheckpoint, JobConfig, JobError, JobId,
    JobOutcome, JobProgress, JobStatus, JobType, RateLimitConfig, RateLimitOverrides,
};
use backfill_infra::jobs::{CreatedJob, JobPreview};
use backfill_infra::storage::{JobFilter, JobPage, Pagination};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateJobRequest {
    pub job_type: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub target_districts: Vec<String>,
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub rate_limit_overrides: Option<RateLimitOverridesDto>,
}

impl CreateJobRequest {
    pub fn into_config(self) -> Result<JobConfig, DomainError> {
        Ok(JobConfig {
            job_type: JobType::from_str(&self.job_type)?,
            start_date: self.start_date,
            end_date: self.end_date,
            target_districts: self.target_districts,
            skip_existing: self.skip_existing,
            rate_limit_overrides: self.rate_limit_overrides.map(Into::into),
        })
    }
}

/// Partial rate-limit settings: per-job overrides, and the body of
/// `PUT /backfill/rate-limit` (merged onto the current config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitOverridesDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl From<RateLimitOverridesDto> for RateLimitOverrides {
    fn from(o: RateLimitOverridesDto) -> Self {
        Self {
            max_requests_per_minute: o.max_requests_per_minute,
            max_concurrent: o.max_concurrent,
            min_delay_ms: o.min_delay_ms,
            max_delay_ms: o.max_delay_ms,
            backoff_multiplier: o.backoff_multiplier,
        }
    }
}

impl From<RateLimitOverrides> for RateLimitOverridesDto {
    fn from(o: RateLimitOverrides) -> Self {
        Self {
            max_requests_per_minute: o.max_requests_per_minute,
            max_concurrent: o.max_concurrent,
            min_delay_ms: o.min_delay_ms,
            max_delay_ms: o.max_delay_ms,
            backoff_multiplier: o.backoff_multiplier,
        }
    }
}

/// Query string of `GET /backfill/jobs`. `status` and `jobType` take
/// comma-separated lists.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListJobsQuery {
    pub fn filter(&self) -> Result<JobFilter, DomainError> {
        Ok(JobFilter {
            statuses: parse_list(self.status.as_deref())?,
            job_types: parse_list(self.job_type.as_deref())?,
            created_after: self.created_after,
            created_before: self.created_before,
        })
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

fn parse_list<T>(raw: Option<&str>) -> Result<Vec<T>, DomainError>
where
    T: FromStr<Err = DomainError>,
{
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(T::from_str)
            .collect()
    })
    .unwrap_or_else(|| Ok(Vec::new()))
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl From<CreatedJob> for CreatedJobResponse {
    fn from(c: CreatedJob) -> Self {
        Self {
            job_id: c.job_id,
            status: c.status,
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfigResponse {
    pub job_type: JobType,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub target_districts: Vec<String>,
    pub skip_existing: bool,
    pub rate_limit_overrides: Option<RateLimitOverridesDto>,
}

impl From<JobConfig> for JobConfigResponse {
    fn from(c: JobConfig) -> Self {
        Self {
            job_type: c.job_type,
            start_date: c.start_date,
            end_date: c.end_date,
            target_districts: c.target_districts,
            skip_existing: c.skip_existing,
            rate_limit_overrides: c.rate_limit_overrides.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistrictProgressResponse {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
}

impl From<DistrictProgress> for DistrictProgressResponse {
    fn from(d: DistrictProgress) -> Self {
        Self {
            total_items: d.total_items,
            processed_items: d.processed_items,
            failed_items: d.failed_items,
            skipped_items: d.skipped_items,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorResponse {
    pub unit_id: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retryable: bool,
}

impl From<JobError> for JobErrorResponse {
    fn from(e: JobError) -> Self {
        Self {
            unit_id: e.unit_id.map(|u| u.to_string()),
            message: e.message,
            occurred_at: e.occurred_at,
            retryable: e.retryable,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub current_unit: Option<String>,
    pub district_progress: BTreeMap<String, DistrictProgressResponse>,
    pub errors: Vec<JobErrorResponse>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl From<JobProgress> for ProgressResponse {
    fn from(p: JobProgress) -> Self {
        Self {
            total_items: p.total_items,
            processed_items: p.processed_items,
            failed_items: p.failed_items,
            skipped_items: p.skipped_items,
            current_unit: p.current_unit.map(|u| u.to_string()),
            district_progress: p
                .district_progress
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect(),
            errors: p.errors.into_iter().map(Into::into).collect(),
            last_activity_at: p.last_activity_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub last_processed_unit: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub completed_units: Vec<String>,
}

impl From<JobCheckpoint> for CheckpointResponse {
    fn from(c: JobCheckpoint) -> Self {
        Self {
            last_processed_unit: c.last_processed_unit.map(|u| u.to_string()),
            last_processed_at: c.last_processed_at,
            completed_units: c.completed_units.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeResponse {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub artifact_ids: Vec<String>,
    pub duration_ms: u64,
}

impl From<JobOutcome> for OutcomeResponse {
    fn from(o: JobOutcome) -> Self {
        Self {
            total_items: o.total_items,
            processed_items: o.processed_items,
            failed_items: o.failed_items,
            skipped_items: o.skipped_items,
            artifact_ids: o.artifact_ids,
            duration_ms: o.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub config: JobConfigResponse,
    pub progress: ProgressResponse,
    pub checkpoint: CheckpointResponse,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub result: Option<OutcomeResponse>,
    pub error: Option<String>,
}

impl From<BackfillJob> for JobResponse {
    fn from(j: BackfillJob) -> Self {
        Self {
            job_id: j.job_id,
            job_type: j.job_type,
            status: j.status,
            config: j.config.into(),
            progress: j.progress.into(),
            checkpoint: j.checkpoint.into(),
            created_at: j.created_at,
            started_at: j.started_at,
            completed_at: j.completed_at,
            resumed_at: j.resumed_at,
            result: j.result.map(Into::into),
            error: j.error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

impl From<JobPage> for JobListResponse {
    fn from(page: JobPage) -> Self {
        Self {
            jobs: page.jobs.into_iter().map(Into::into).collect(),
            total: page.total,
            limit: page.pagination.limit,
            offset: page.pagination.offset,
            has_more: page.has_more,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRangeResponse {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub total_units: usize,
    pub date_range: Option<DateRangeResponse>,
    pub affected_districts: Vec<String>,
    pub estimated_duration_ms: u64,
}

impl From<JobPreview> for PreviewResponse {
    fn from(p: JobPreview) -> Self {
        Self {
            total_units: p.total_units,
            date_range: p.date_range.map(|r| DateRangeResponse {
                start_date: r.start,
                end_date: r.end,
            }),
            affected_districts: p.affected_districts,
            estimated_duration_ms: u64::try_from(p.estimated_duration.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResponse {
    pub max_requests_per_minute: u32,
    pub max_concurrent: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl From<RateLimitConfig> for RateLimitResponse {
    fn from(c: RateLimitConfig) -> Self {
        Self {
            max_requests_per_minute: c.max_requests_per_minute,
            max_concurrent: c.max_concurrent,
            min_delay_ms: c.min_delay_ms,
            max_delay_ms: c.max_delay_ms,
            backoff_multiplier: c.backoff_multiplier,
        }
    }
}
