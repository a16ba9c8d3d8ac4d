//! Units of backfill work.
//!
//! A unit is the smallest piece of job work: one date's collection, or one
//! snapshot's analytics computation (optionally narrowed to one district).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identifier of a unit within a job: `YYYY-MM-DD` or `YYYY-MM-DD/<district>`.
///
/// Ordering is lexical, which for this format is date ascending then district.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m-%d").to_string())
    }

    pub fn for_district(date: NaiveDate, district: &str) -> Self {
        Self(format!("{}/{}", date.format("%Y-%m-%d"), district))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for UnitId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit as handed to a work executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub date: NaiveDate,
    pub district: Option<String>,
}

impl WorkUnit {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            id: UnitId::for_date(date),
            date,
            district: None,
        }
    }

    pub fn for_district(date: NaiveDate, district: impl Into<String>) -> Self {
        let district = district.into();
        Self {
            id: UnitId::for_district(date, &district),
            date,
            district: Some(district),
        }
    }
}

/// Sort units into the deterministic execution order (date, then district).
pub fn sort_units(units: &mut [WorkUnit]) {
    units.sort_by(|a, b| (a.date, &a.district).cmp(&(b.date, &b.district)));
}
