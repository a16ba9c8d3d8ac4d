//! Date-range validation and expansion.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Build a range, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> DomainResult<Self> {
        if start > end {
            return Err(DomainError::validation(format!(
                "start_date {start} is after end_date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of calendar days covered (inclusive).
    pub fn day_count(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every date in the range, ascending.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut out = Vec::with_capacity(self.day_count() as usize);
        let mut cur = self.start;
        while cur <= self.end {
            out.push(cur);
            match cur.checked_add_days(Days::new(1)) {
                Some(next) => cur = next,
                None => break,
            }
        }
        out
    }
}

/// The most recent date a backfill may target: strictly before `today`.
pub fn latest_backfillable(today: NaiveDate) -> NaiveDate {
    today.pred_opt().unwrap_or(today)
}

/// Validate an optional start/end pair against `today`.
///
/// Rejected iff `start > end` or `end` is not strictly before `today`.
pub fn validate_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> DomainResult<()> {
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(DomainError::validation(format!(
                "start_date {s} is after end_date {e}"
            )));
        }
    }
    if let Some(e) = end {
        if e >= today {
            return Err(DomainError::validation(format!(
                "end_date {e} must be before {today}"
            )));
        }
    }
    Ok(())
}
