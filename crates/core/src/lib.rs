//! `backfill-core`: domain building blocks of the backfill job runner.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! the job record and its lifecycle state machine, progress/checkpoint
//! bookkeeping, rate-limit configuration, and date-range handling.

pub mod dates;
pub mod error;
pub mod id;
pub mod job;
pub mod rate_limit;
pub mod unit;

pub use dates::{DateRange, latest_backfillable, validate_range};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{
    BackfillJob, DistrictProgress, JobCheckpoint, JobConfig, JobError, JobOutcome, JobProgress,
    JobStatus, JobType, JobUpdate,
};
pub use rate_limit::{RateLimitConfig, RateLimitOverrides};
pub use unit::{UnitId, WorkUnit, sort_units};
