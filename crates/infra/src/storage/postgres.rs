//! Postgres-backed job storage.
//!
//! Jobs, checkpoints and settings are stored as JSONB documents, one row per
//! document. A handful of columns (`status`, `job_type`, timestamps) are
//! duplicated out of the document so listings and retention can filter and
//! sort in SQL.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError | Scenario |
//! |------------|----------------------|--------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | `create_job` with a reused id |
//! | Database (foreign key violation) | `23503` | `NotFound` | checkpoint written for an unknown job |
//! | Database (other) | Any other | `Database` | Other database errors |
//! | PoolClosed | N/A | `Database` | Connection pool was closed |
//! | Other | N/A | `Database` | Network errors, connection failures, etc. |
//!
//! ## Concurrency
//!
//! Read-modify-write operations (`update_job`, `update_checkpoint`) lock the
//! row with `SELECT ... FOR UPDATE` inside a transaction, so concurrent
//! writers from several processes serialize per document. A guarded
//! `update_job` checks the locked row's status before writing.

use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{Span, instrument};

use backfill_core::{BackfillJob, JobCheckpoint, JobId, JobStatus, JobUpdate, RateLimitConfig};

use super::query::{JobFilter, JobPage, Pagination};
use super::r#trait::{JobStorage, StorageError};

const RATE_LIMIT_KEY: &str = "rate_limit";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS backfill_jobs (
        job_id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        document JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS backfill_jobs_status_created_idx
        ON backfill_jobs (status, created_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS backfill_jobs_created_idx
        ON backfill_jobs (created_at DESC, job_id DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backfill_checkpoints (
        job_id UUID PRIMARY KEY REFERENCES backfill_jobs (job_id) ON DELETE CASCADE,
        document JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backfill_settings (
        key TEXT PRIMARY KEY,
        document JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

/// Document-store job storage on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresJobStorage {
    pool: Arc<PgPool>,
}

impl PostgresJobStorage {
    /// Create a new storage handle over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let storage = Self::new(pool);
        storage.ensure_schema().await?;
        Ok(storage)
    }

    /// Idempotently create tables and indexes.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn load_checkpoint(&self, job_id: JobId) -> Result<Option<JobCheckpoint>, StorageError> {
        let row = sqlx::query("SELECT document FROM backfill_checkpoints WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_checkpoint", e))?;
        row.map(|r| decode_document::<JobCheckpoint>(&r, "document"))
            .transpose()
    }
}

#[async_trait::async_trait]
impl JobStorage for PostgresJobStorage {
    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn create_job(&self, job: &BackfillJob) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO backfill_jobs (
                job_id,
                job_type,
                status,
                created_at,
                started_at,
                completed_at,
                document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(Json(job))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::AlreadyExists(job.job_id)
            } else {
                map_sqlx_error("create_job", e)
            }
        })?;

        if job.checkpoint != JobCheckpoint::default() {
            sqlx::query("INSERT INTO backfill_checkpoints (job_id, document) VALUES ($1, $2)")
                .bind(job.job_id.as_uuid())
                .bind(Json(&job.checkpoint))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_job", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<BackfillJob>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT j.document, c.document AS checkpoint
            FROM backfill_jobs j
            LEFT JOIN backfill_checkpoints c ON c.job_id = j.job_id
            WHERE j.job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| decode_job_row(&r)).transpose()
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, status = ?update.status), err)]
    async fn update_job(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<BackfillJob, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("SELECT document FROM backfill_jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?
            .ok_or(StorageError::NotFound(job_id))?;

        let mut job: BackfillJob = decode_document(&row, "document")?;
        if !update.permits(job.status) {
            return Err(StorageError::AlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        update.apply_to(&mut job);

        sqlx::query(
            r#"
            UPDATE backfill_jobs
            SET status = $2,
                started_at = $3,
                completed_at = $4,
                document = $5
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(Json(&job))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        job.checkpoint = self.load_checkpoint(job_id).await?.unwrap_or_default();
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn delete_job(&self, job_id: JobId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM backfill_jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(
        skip(self, filter),
        fields(
            limit = pagination.limit,
            offset = pagination.offset,
            job_count = tracing::field::Empty
        ),
        err
    )]
    async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, StorageError> {
        let span = Span::current();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM backfill_jobs j");
        push_filter(&mut count, filter);
        let total: i64 = count
            .build()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?
            .try_get("total")
            .map_err(|e| StorageError::Database(format!("failed to read total: {e}")))?;

        let mut select = QueryBuilder::<Postgres>::new(
            r#"
            SELECT j.document, c.document AS checkpoint
            FROM backfill_jobs j
            LEFT JOIN backfill_checkpoints c ON c.job_id = j.job_id
            "#,
        );
        push_filter(&mut select, filter);
        select.push(" ORDER BY j.created_at DESC, j.job_id DESC LIMIT ");
        select.push_bind(i64::from(pagination.limit));
        select.push(" OFFSET ");
        select.push_bind(i64::from(pagination.offset));

        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let jobs = rows
            .iter()
            .map(decode_job_row)
            .collect::<Result<Vec<_>, _>>()?;

        let total = total.max(0) as u64;
        let has_more = (u64::from(pagination.offset) + jobs.len() as u64) < total;
        span.record("job_count", jobs.len());
        Ok(JobPage {
            jobs,
            total,
            pagination,
            has_more,
        })
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO backfill_checkpoints (job_id, document)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(Json(JobCheckpoint::default()))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StorageError::NotFound(job_id)
            } else {
                map_sqlx_error("update_checkpoint", e)
            }
        })?;

        let row = sqlx::query(
            "SELECT document FROM backfill_checkpoints WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_checkpoint", e))?;

        let mut stored: JobCheckpoint = decode_document(&row, "document")?;
        stored.merge(checkpoint);

        sqlx::query(
            "UPDATE backfill_checkpoints SET document = $2, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id.as_uuid())
        .bind(Json(&stored))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_checkpoint", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_checkpoint(&self, job_id: JobId) -> Result<Option<JobCheckpoint>, StorageError> {
        self.load_checkpoint(job_id).await
    }

    #[instrument(skip(self), err)]
    async fn get_rate_limit_config(&self) -> Result<Option<RateLimitConfig>, StorageError> {
        let row = sqlx::query("SELECT document FROM backfill_settings WHERE key = $1")
            .bind(RATE_LIMIT_KEY)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_rate_limit_config", e))?;
        row.map(|r| decode_document(&r, "document")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn set_rate_limit_config(&self, config: &RateLimitConfig) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO backfill_settings (key, document)
            VALUES ($1, $2)
            ON CONFLICT (key)
            DO UPDATE SET
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(RATE_LIMIT_KEY)
        .bind(Json(config))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_rate_limit_config", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let terminal: Vec<String> = JobStatus::ALL
            .into_iter()
            .filter(JobStatus::is_terminal)
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            DELETE FROM backfill_jobs
            WHERE status = ANY($1)
              AND COALESCE(completed_at, created_at) < $2
            "#,
        )
        .bind(&terminal)
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cleanup_old_jobs", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn is_ready(&self) -> bool {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .is_ok()
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    qb.push(" WHERE TRUE");
    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND j.status = ANY(");
        qb.push_bind(statuses);
        qb.push(")");
    }
    if !filter.job_types.is_empty() {
        let types: Vec<String> = filter.job_types.iter().map(|t| t.as_str().to_string()).collect();
        qb.push(" AND j.job_type = ANY(");
        qb.push_bind(types);
        qb.push(")");
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND j.created_at >= ");
        qb.push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND j.created_at < ");
        qb.push_bind(before);
    }
}

fn decode_document<T>(row: &sqlx::postgres::PgRow, column: &str) -> Result<T, StorageError>
where
    T: serde::de::DeserializeOwned,
{
    let Json(value) = row
        .try_get::<Json<T>, _>(column)
        .map_err(|e| StorageError::Serialization(format!("failed to decode {column}: {e}")))?;
    Ok(value)
}

fn decode_job_row(row: &sqlx::postgres::PgRow) -> Result<BackfillJob, StorageError> {
    let mut job: BackfillJob = decode_document(row, "document")?;
    let checkpoint = row
        .try_get::<Option<Json<JobCheckpoint>>, _>("checkpoint")
        .map_err(|e| StorageError::Serialization(format!("failed to decode checkpoint: {e}")))?;
    job.checkpoint = checkpoint.map(|Json(cp)| cp).unwrap_or_default();
    Ok(job)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23503")
}

fn has_code(err: &sqlx::Error, expected: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|c| c.as_ref() == expected),
        _ => false,
    }
}

/// Map SQLx errors to StorageError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            StorageError::Database(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StorageError::Database(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StorageError::Database(format!("unexpected row not found in {}", operation))
        }
        _ => StorageError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
