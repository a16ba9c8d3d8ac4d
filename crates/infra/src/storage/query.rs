//! Job listing filters and pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backfill_core::{BackfillJob, JobStatus, JobType};

/// Pagination parameters for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of jobs to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50, // Safe default
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, 1000), // Cap at 1000 for safety
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for job listings. Empty sets match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    #[serde(default)]
    pub job_types: Vec<JobType>,
    /// Jobs created at or after this instant.
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    /// Jobs created strictly before this instant.
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn with_statuses(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Jobs occupying the single active slot.
    pub fn active() -> Self {
        Self::with_statuses([JobStatus::Running, JobStatus::Recovering])
    }

    /// Jobs a crashed process may have left behind.
    pub fn non_terminal() -> Self {
        Self::with_statuses([JobStatus::Pending, JobStatus::Running, JobStatus::Recovering])
    }

    pub fn matches(&self, job: &BackfillJob) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.job_types.is_empty() || self.job_types.contains(&job.job_type))
            && self.created_after.is_none_or(|t| job.created_at >= t)
            && self.created_before.is_none_or(|t| job.created_at < t)
    }
}

/// One page of a newest-first job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<BackfillJob>,
    /// Total number of jobs matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl JobPage {
    /// Sort `jobs` newest-first and cut out the requested page.
    pub fn from_matching(mut jobs: Vec<BackfillJob>, pagination: Pagination) -> Self {
        sort_newest_first(&mut jobs);
        let total = jobs.len() as u64;
        let page: Vec<_> = jobs
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        let has_more = (pagination.offset as u64 + page.len() as u64) < total;
        Self {
            jobs: page,
            total,
            pagination,
            has_more,
        }
    }
}

/// Newest `created_at` first; ties broken by job id so pages are stable.
pub fn sort_newest_first(jobs: &mut [BackfillJob]) {
    jobs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.job_id.cmp(&a.job_id))
    });
}
