//! Wiring of storage, executors and the orchestrator from settings.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use backfill_infra::config::BackfillSettings;
use backfill_infra::executors::{
    AnalyticsExecutor, CommandAnalytics, CommandCollector, CommandTemplate,
    DataCollectionExecutor, ExecutorRegistry,
};
use backfill_infra::jobs::{BackfillOrchestrator, JobManager};

/// Command-backed executors for every job type whose command is configured.
pub fn build_executors(settings: &BackfillSettings) -> anyhow::Result<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();

    match &settings.collect_command {
        Some(template) => {
            let template =
                CommandTemplate::parse(template).context("invalid BACKFILL_COLLECT_CMD")?;
            let collector = CommandCollector::new(template, &settings.snapshot_dir)
                .with_history_days(settings.history_days);
            registry.register(Arc::new(DataCollectionExecutor::new(collector)));
        }
        None => warn!("BACKFILL_COLLECT_CMD not set; data-collection jobs are disabled"),
    }

    match &settings.analytics_command {
        Some(template) => {
            let template =
                CommandTemplate::parse(template).context("invalid BACKFILL_ANALYTICS_CMD")?;
            let generator = CommandAnalytics::new(template, &settings.snapshot_dir);
            registry.register(Arc::new(AnalyticsExecutor::new(generator)));
        }
        None => warn!("BACKFILL_ANALYTICS_CMD not set; analytics-generation jobs are disabled"),
    }

    info!(job_types = ?registry.job_types(), "executors registered");
    Ok(registry)
}

/// Open storage and assemble the orchestrator. Recovery is not run here.
pub async fn build_orchestrator(
    settings: &BackfillSettings,
) -> anyhow::Result<Arc<BackfillOrchestrator>> {
    let storage = settings.storage.open().await?;
    let executors = build_executors(settings)?;
    let manager = Arc::new(JobManager::new(
        storage,
        executors,
        settings.manager_config(),
    ));
    Ok(Arc::new(BackfillOrchestrator::new(
        manager,
        settings.retention_policy(),
    )))
}
