//! Pacing of unit executions against the external source.
//!
//! The limiter keeps a sliding one-minute window of unit start times plus the
//! current backoff delay. Everything it decides is a function of that state and
//! the [`RateLimitConfig`] passed in on each call, so a config change takes
//! effect on the very next unit.
//!
//! `max_concurrent` is not enforced here; the job manager bounds the number of
//! in-flight units itself and only for job types that allow parallel units.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use backfill_core::RateLimitConfig;

const WINDOW: Duration = Duration::from_secs(60);

/// Smallest delay a rate-limited failure backs off to when `min_delay_ms` is 0.
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Sliding-window and backoff state, independent of any clock.
#[derive(Debug, Default)]
pub struct LimiterState {
    recent: VecDeque<Instant>,
    last_start: Option<Instant>,
    backoff: Option<Duration>,
}

impl LimiterState {
    /// Delay to wait at `now` before the next unit may start.
    pub fn delay_needed(&mut self, now: Instant, config: &RateLimitConfig) -> Duration {
        self.prune(now);

        let spacing = self.current_delay(config);
        let mut wait = self
            .last_start
            .map(|last| (last + spacing).saturating_duration_since(now))
            .unwrap_or_default();

        let max = config.max_requests_per_minute.max(1) as usize;
        if self.recent.len() >= max {
            // The window frees up once the max-th most recent start ages out.
            if let Some(oldest) = self.recent.get(self.recent.len() - max) {
                wait = wait.max((*oldest + WINDOW).saturating_duration_since(now));
            }
        }
        wait
    }

    /// Spacing enforced between consecutive starts: the backoff delay while
    /// backing off, `min_delay` otherwise.
    pub fn current_delay(&self, config: &RateLimitConfig) -> Duration {
        self.backoff
            .unwrap_or_else(|| config.min_delay())
            .min(config.max_delay())
    }

    pub fn record_start(&mut self, now: Instant) {
        self.recent.push_back(now);
        self.last_start = Some(now);
    }

    pub fn record_success(&mut self) {
        self.backoff = None;
    }

    /// Grow the delay after a throttling signal. Other failures leave it alone.
    pub fn record_failure(&mut self, rate_limited: bool, config: &RateLimitConfig) {
        if !rate_limited {
            return;
        }
        let base = self.current_delay(config).max(BACKOFF_FLOOR);
        let next = base
            .mul_f64(config.backoff_multiplier.max(1.0))
            .min(config.max_delay());
        self.backoff = Some(next);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) >= WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Async rate limiter shared by every unit of the active job.
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a unit may start under `config`, then claim the slot.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, config: &RateLimitConfig) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let delay = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let delay = state.delay_needed(now, config);
                if delay.is_zero() {
                    state.record_start(now);
                    return waited;
                }
                delay
            };
            debug!(delay_ms = delay.as_millis() as u64, "rate limiter delaying unit");
            tokio::time::sleep(delay).await;
            waited += delay;
        }
    }

    pub async fn record_success(&self) {
        self.state.lock().await.record_success();
    }

    pub async fn record_failure(&self, rate_limited: bool, config: &RateLimitConfig) {
        let mut state = self.state.lock().await;
        state.record_failure(rate_limited, config);
        if rate_limited {
            debug!(
                delay_ms = state.current_delay(config).as_millis() as u64,
                "rate limiter backing off"
            );
        }
    }

    pub async fn current_delay(&self, config: &RateLimitConfig) -> Duration {
        self.state.lock().await.current_delay(config)
    }
}
