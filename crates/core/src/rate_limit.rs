//! Process-wide pacing configuration for outbound unit work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Persisted, operator-mutable rate-limit configuration.
///
/// Read before every unit; an update takes effect on the next unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Upper bound on unit executions started per sliding minute.
    pub max_requests_per_minute: u32,
    /// Units allowed in flight at once (only for parallel-capable job types).
    pub max_concurrent: u32,
    /// Baseline delay between consecutive requests.
    pub min_delay_ms: u64,
    /// Cap applied to backoff growth.
    pub max_delay_ms: u64,
    /// Factor applied to the delay after a rate-limited failure.
    pub backoff_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 10,
            max_concurrent: 1,
            min_delay_ms: 2_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> DomainResult<()> {
        if self.max_requests_per_minute == 0 {
            return Err(DomainError::validation(
                "max_requests_per_minute must be at least 1",
            ));
        }
        if self.max_concurrent == 0 {
            return Err(DomainError::validation("max_concurrent must be at least 1"));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(DomainError::validation(
                "min_delay_ms must not exceed max_delay_ms",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(DomainError::validation(
                "backoff_multiplier must be a finite number >= 1.0",
            ));
        }
        Ok(())
    }

    /// Apply per-job overrides field by field.
    pub fn with_overrides(&self, overrides: Option<&RateLimitOverrides>) -> Self {
        let Some(o) = overrides else {
            return self.clone();
        };
        Self {
            max_requests_per_minute: o
                .max_requests_per_minute
                .unwrap_or(self.max_requests_per_minute),
            max_concurrent: o.max_concurrent.unwrap_or(self.max_concurrent),
            min_delay_ms: o.min_delay_ms.unwrap_or(self.min_delay_ms),
            max_delay_ms: o.max_delay_ms.unwrap_or(self.max_delay_ms),
            backoff_multiplier: o.backoff_multiplier.unwrap_or(self.backoff_multiplier),
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Steady-state spacing between unit starts: the larger of `min_delay`
    /// and the interval implied by `max_requests_per_minute`.
    pub fn steady_interval(&self) -> Duration {
        let per_minute = Duration::from_secs(60) / self.max_requests_per_minute.max(1);
        per_minute.max(self.min_delay())
    }
}

/// Optional per-job overrides of [`RateLimitConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitOverrides {
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

impl RateLimitOverrides {
    pub fn validate(&self) -> DomainResult<()> {
        let invalid = |msg: &str| Err(DomainError::validation(format!("rate_limit_overrides: {msg}")));
        if self.max_requests_per_minute == Some(0) {
            return invalid("max_requests_per_minute must be at least 1");
        }
        if self.max_concurrent == Some(0) {
            return invalid("max_concurrent must be at least 1");
        }
        if let (Some(min), Some(max)) = (self.min_delay_ms, self.max_delay_ms) {
            if min > max {
                return invalid("min_delay_ms must not exceed max_delay_ms");
            }
        }
        if let Some(m) = self.backoff_multiplier {
            if !m.is_finite() || m < 1.0 {
                return invalid("backoff_multiplier must be a finite number >= 1.0");
            }
        }
        Ok(())
    }
}
