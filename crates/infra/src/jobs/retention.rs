//! Periodic removal of old terminal jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::storage::{JobStorage, StorageError};

/// Run one sweep. Only terminal jobs are ever removed.
pub async fn sweep_once(storage: &dyn JobStorage, retention_days: u32) -> Result<usize, StorageError> {
    let removed = storage.cleanup_old_jobs(retention_days).await?;
    if removed > 0 {
        info!(removed, retention_days, "retention sweep removed old jobs");
    }
    Ok(removed)
}

/// Sweep every `interval`, first one `interval` after start.
///
/// Returns `None` when `interval` is zero (sweeping disabled).
pub fn spawn_retention_sweep(
    storage: Arc<dyn JobStorage>,
    retention_days: u32,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_once(storage.as_ref(), retention_days).await {
                warn!(error = %e, "retention sweep failed");
            }
        }
    }))
}
