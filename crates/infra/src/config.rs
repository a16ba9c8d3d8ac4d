//! Process configuration read from the environment.
//!
//! | variable | default |
//! |---|---|
//! | `BACKFILL_STORAGE` | `local` (`local` or `postgres`) |
//! | `BACKFILL_DATA_DIR` | `./data/backfill` |
//! | `DATABASE_URL` | required for `postgres` |
//! | `BACKFILL_STALE_AFTER_SECS` | `3600` |
//! | `BACKFILL_UNIT_TIMEOUT_SECS` | `300` |
//! | `BACKFILL_RETENTION_DAYS` | `30` |
//! | `BACKFILL_RETENTION_INTERVAL_SECS` | `86400` (0 disables) |
//! | `BACKFILL_MAX_RETAINED_ERRORS` | `100` |
//! | `BACKFILL_BIND_ADDR` | `0.0.0.0:8080` |
//! | `BACKFILL_COLLECT_CMD` | unset |
//! | `BACKFILL_ANALYTICS_CMD` | unset |
//! | `BACKFILL_SNAPSHOT_DIR` | `./data/snapshots` |
//! | `BACKFILL_HISTORY_DAYS` | unset |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::info;

use crate::jobs::{JobManagerConfig, RetentionPolicy};
use crate::storage::{JobStorage, LocalJobStorage, PostgresJobStorage};

/// Where job documents live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local { root: PathBuf },
    Postgres { database_url: String },
}

impl StorageBackend {
    /// Open the configured backend.
    pub async fn open(&self) -> anyhow::Result<Arc<dyn JobStorage>> {
        match self {
            StorageBackend::Local { root } => {
                let storage = LocalJobStorage::open(root.clone())
                    .await
                    .with_context(|| format!("opening local job storage at {}", root.display()))?;
                info!(root = %root.display(), "using local job storage");
                Ok(Arc::new(storage))
            }
            StorageBackend::Postgres { database_url } => {
                let storage = PostgresJobStorage::connect(database_url)
                    .await
                    .context("connecting to postgres job storage")?;
                info!("using postgres job storage");
                Ok(Arc::new(storage))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillSettings {
    pub storage: StorageBackend,
    pub stale_after: Duration,
    pub unit_timeout: Duration,
    pub retention_days: u32,
    pub retention_interval: Duration,
    pub max_retained_errors: usize,
    pub bind_addr: SocketAddr,
    pub collect_command: Option<String>,
    pub analytics_command: Option<String>,
    pub snapshot_dir: PathBuf,
    pub history_days: Option<u32>,
}

impl BackfillSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage = match var("BACKFILL_STORAGE").as_deref().unwrap_or("local") {
            "local" => StorageBackend::Local {
                root: var("BACKFILL_DATA_DIR")
                    .unwrap_or_else(|| "./data/backfill".to_string())
                    .into(),
            },
            "postgres" => StorageBackend::Postgres {
                database_url: var("DATABASE_URL")
                    .context("DATABASE_URL must be set when BACKFILL_STORAGE=postgres")?,
            },
            other => bail!("BACKFILL_STORAGE must be `local` or `postgres`, got `{other}`"),
        };

        Ok(Self {
            storage,
            stale_after: Duration::from_secs(parse_or(&var, "BACKFILL_STALE_AFTER_SECS", 3600)?),
            unit_timeout: Duration::from_secs(parse_or(&var, "BACKFILL_UNIT_TIMEOUT_SECS", 300)?),
            retention_days: parse_or(&var, "BACKFILL_RETENTION_DAYS", 30)?,
            retention_interval: Duration::from_secs(parse_or(
                &var,
                "BACKFILL_RETENTION_INTERVAL_SECS",
                86_400,
            )?),
            max_retained_errors: parse_or(&var, "BACKFILL_MAX_RETAINED_ERRORS", 100)?,
            bind_addr: parse_or(&var, "BACKFILL_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            collect_command: var("BACKFILL_COLLECT_CMD"),
            analytics_command: var("BACKFILL_ANALYTICS_CMD"),
            snapshot_dir: var("BACKFILL_SNAPSHOT_DIR")
                .unwrap_or_else(|| "./data/snapshots".to_string())
                .into(),
            history_days: parse_opt(&var, "BACKFILL_HISTORY_DAYS")?,
        })
    }

    pub fn manager_config(&self) -> JobManagerConfig {
        JobManagerConfig::default()
            .with_stale_after(self.stale_after)
            .with_unit_timeout(self.unit_timeout)
            .with_max_retained_errors(self.max_retained_errors)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention_days: self.retention_days,
            interval: self.retention_interval,
        }
    }
}

fn parse_opt<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {key}: `{raw}`"))
        })
        .transpose()
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(var, key)?.unwrap_or(default))
}
