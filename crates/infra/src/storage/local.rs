//! Filesystem-backed job storage.
//!
//! Layout under the configured root:
//!
//! ```text
//! jobs/<job_id>.json          job record (checkpoint field ignored on read)
//! checkpoints/<job_id>.json   latest checkpoint of the job
//! settings/rate_limit.json    rate-limit singleton
//! ```
//!
//! Every write goes to a temporary sibling file and is renamed into place, so
//! a crash mid-write leaves the previous version intact. Read-modify-write
//! cycles are serialized per process by async mutexes, always taken in the
//! order jobs then checkpoints; a second process pointing at the same root is
//! not supported.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use backfill_core::{BackfillJob, JobCheckpoint, JobId, JobUpdate, RateLimitConfig};

use super::query::{JobFilter, JobPage, Pagination};
use super::r#trait::{JobStorage, StorageError};

const JOBS_DIR: &str = "jobs";
const CHECKPOINTS_DIR: &str = "checkpoints";
const SETTINGS_DIR: &str = "settings";
const RATE_LIMIT_FILE: &str = "rate_limit.json";

/// JSON-file job storage rooted at a local directory.
#[derive(Debug)]
pub struct LocalJobStorage {
    root: PathBuf,
    jobs_lock: Mutex<()>,
    checkpoints_lock: Mutex<()>,
}

impl LocalJobStorage {
    /// Open (and create if needed) a storage root.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [JOBS_DIR, CHECKPOINTS_DIR, SETTINGS_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), "opened local job storage");
        Ok(Self {
            root,
            jobs_lock: Mutex::new(()),
            checkpoints_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_path(&self, job_id: JobId) -> PathBuf {
        self.root.join(JOBS_DIR).join(format!("{job_id}.json"))
    }

    fn checkpoint_path(&self, job_id: JobId) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR).join(format!("{job_id}.json"))
    }

    fn rate_limit_path(&self) -> PathBuf {
        self.root.join(SETTINGS_DIR).join(RATE_LIMIT_FILE)
    }

    /// Job record without its checkpoint attached.
    async fn read_job_record(&self, job_id: JobId) -> Result<Option<BackfillJob>, StorageError> {
        read_json(&self.job_path(job_id)).await
    }

    async fn attach_checkpoint(&self, mut job: BackfillJob) -> Result<BackfillJob, StorageError> {
        job.checkpoint = read_json(&self.checkpoint_path(job.job_id))
            .await?
            .unwrap_or_default();
        Ok(job)
    }

    /// Every parseable job record. Unreadable files are logged and skipped.
    async fn read_all_jobs(&self) -> Result<Vec<BackfillJob>, StorageError> {
        let mut entries = tokio::fs::read_dir(self.root.join(JOBS_DIR)).await?;
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<BackfillJob>(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        Ok(jobs)
    }
}

#[async_trait::async_trait]
impl JobStorage for LocalJobStorage {
    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn create_job(&self, job: &BackfillJob) -> Result<(), StorageError> {
        let _guard = self.jobs_lock.lock().await;
        let path = self.job_path(job.job_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(StorageError::AlreadyExists(job.job_id));
        }
        let _cp_guard = self.checkpoints_lock.lock().await;
        write_json_atomic(&path, job).await?;
        if job.checkpoint != JobCheckpoint::default() {
            let written =
                write_json_atomic(&self.checkpoint_path(job.job_id), &job.checkpoint).await;
            if let Err(e) = written {
                remove_if_exists(&path).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<BackfillJob>, StorageError> {
        match self.read_job_record(job_id).await? {
            Some(job) => Ok(Some(self.attach_checkpoint(job).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, status = ?update.status), err)]
    async fn update_job(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<BackfillJob, StorageError> {
        let _guard = self.jobs_lock.lock().await;
        let mut job = self
            .read_job_record(job_id)
            .await?
            .ok_or(StorageError::NotFound(job_id))?;
        if !update.permits(job.status) {
            return Err(StorageError::AlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        update.apply_to(&mut job);
        write_json_atomic(&self.job_path(job_id), &job).await?;
        self.attach_checkpoint(job).await
    }

    #[instrument(skip(self), err)]
    async fn delete_job(&self, job_id: JobId) -> Result<bool, StorageError> {
        let _guard = self.jobs_lock.lock().await;
        let _cp_guard = self.checkpoints_lock.lock().await;
        let existed = remove_if_exists(&self.job_path(job_id)).await?;
        remove_if_exists(&self.checkpoint_path(job_id)).await?;
        Ok(existed)
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, StorageError> {
        let matching: Vec<_> = self
            .read_all_jobs()
            .await?
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();
        let mut page = JobPage::from_matching(matching, pagination);
        let mut jobs = Vec::with_capacity(page.jobs.len());
        for job in page.jobs {
            jobs.push(self.attach_checkpoint(job).await?);
        }
        page.jobs = jobs;
        Ok(page)
    }

    #[instrument(
        skip(self, checkpoint),
        fields(job_id = %job_id, completed = checkpoint.completed_units.len()),
        err
    )]
    async fn update_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &JobCheckpoint,
    ) -> Result<(), StorageError> {
        // Checked under the checkpoint lock: deletions remove the job file
        // while holding it, so no checkpoint outlives its job.
        let _guard = self.checkpoints_lock.lock().await;
        if !tokio::fs::try_exists(self.job_path(job_id)).await? {
            return Err(StorageError::NotFound(job_id));
        }
        let path = self.checkpoint_path(job_id);
        let mut stored: JobCheckpoint = read_json(&path).await?.unwrap_or_default();
        stored.merge(checkpoint);
        write_json_atomic(&path, &stored).await
    }

    async fn get_checkpoint(&self, job_id: JobId) -> Result<Option<JobCheckpoint>, StorageError> {
        read_json(&self.checkpoint_path(job_id)).await
    }

    async fn get_rate_limit_config(&self) -> Result<Option<RateLimitConfig>, StorageError> {
        read_json(&self.rate_limit_path()).await
    }

    #[instrument(skip(self), err)]
    async fn set_rate_limit_config(&self, config: &RateLimitConfig) -> Result<(), StorageError> {
        write_json_atomic(&self.rate_limit_path(), config).await
    }

    #[instrument(skip(self), err)]
    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let _guard = self.jobs_lock.lock().await;
        let _cp_guard = self.checkpoints_lock.lock().await;
        let mut removed = 0;
        for job in self.read_all_jobs().await? {
            let finished_at = job.completed_at.unwrap_or(job.created_at);
            if job.status.is_terminal() && finished_at < cutoff {
                remove_if_exists(&self.job_path(job.job_id)).await?;
                remove_if_exists(&self.checkpoint_path(job.job_id)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn is_ready(&self) -> bool {
        let probe = self.root.join(SETTINGS_DIR).join(".ready-probe");
        match write_atomic(&probe, b"ok").await {
            Ok(()) => true,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "local storage is not writable");
                false
            }
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Io(format!("no parent directory for {}", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp_path = dir.join(format!(".{file_name}.tmp-{}", Uuid::now_v7()));

    let write = async {
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(contents).await?;
        tmp.sync_all().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, path).await
    };
    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(StorageError::Io(format!(
            "failed to write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
