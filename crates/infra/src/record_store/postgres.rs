//! Postgres-backed record store.
//!
//! One row per job in `annotation_jobs`, keyed by `job_id`, with a secondary
//! index on `(user_id, submit_time)` for listing.
//!
//! ## Conditional updates
//!
//! A guarded transition is a single statement:
//!
//! ```text
//! UPDATE annotation_jobs SET <patch>, version = version + 1
//! WHERE job_id = $1 AND <expected-state predicates>
//! RETURNING *
//! ```
//!
//! Completion columns use `COALESCE(column, $n)` so they are only ever set if
//! absent. When no row comes back the record is re-read to tell `NotFound`
//! from `Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RecordStoreError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on insert) |
//! | Database (other) | any | `Storage` |
//! | Io / PoolTimedOut / PoolClosed | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |
//!
//! ## Sync bridge
//!
//! [`JobRecordStore`] is synchronous (stage workers run on plain threads). The
//! store keeps a handle to the tokio runtime that owns the pool and blocks on
//! it. Callers already inside an async task must go through
//! `tokio::task::spawn_blocking`.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use annoflow_core::{
    ArchiveExpectation, ArchiveId, ExpectedState, ExpectedVersion, FieldUpdate, Job, JobId,
    JobPatch, JobStatus, ObjectLocation, RetrievalExpectation, RetrievalTier, UserId,
};

use super::{ArchiveFilter, JobRecordStore, RecordStoreError, ScanFilter};

const COLUMNS: &str = "job_id, user_id, input_file_name, input_bucket, input_key, submit_time, \
     status, complete_time, result_bucket, result_key, log_bucket, log_key, archive_id, \
     retrieval, version";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the table and index if they do not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS annotation_jobs (
                job_id          TEXT PRIMARY KEY,
                user_id         TEXT NOT NULL,
                input_file_name TEXT NOT NULL,
                input_bucket    TEXT NOT NULL,
                input_key       TEXT NOT NULL,
                submit_time     BIGINT NOT NULL,
                status          TEXT NOT NULL,
                complete_time   BIGINT NULL,
                result_bucket   TEXT NULL,
                result_key      TEXT NULL,
                log_bucket      TEXT NULL,
                log_key         TEXT NULL,
                archive_id      TEXT NULL,
                retrieval       TEXT NULL,
                version         BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .context("failed to create annotation_jobs table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS annotation_jobs_user_idx \
             ON annotation_jobs (user_id, submit_time DESC)",
        )
        .execute(&*self.pool)
        .await
        .context("failed to create annotation_jobs user index")?;

        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, job_id), fields(job_id = %job_id), err)]
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, RecordStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM annotation_jobs WHERE job_id = $1"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, user_id = %job.user_id), err)]
    pub async fn insert_job(&self, job: &Job) -> Result<(), RecordStoreError> {
        job.check_invariants()
            .map_err(|e| RecordStoreError::Invariant(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO annotation_jobs (
                job_id, user_id, input_file_name, input_bucket, input_key, submit_time,
                status, complete_time, result_bucket, result_key, log_bucket, log_key,
                archive_id, retrieval, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.job_id.as_str())
        .bind(job.user_id.as_str())
        .bind(&job.input_file_name)
        .bind(&job.input_location.bucket)
        .bind(&job.input_location.key)
        .bind(job.submit_time)
        .bind(job.status.as_str())
        .bind(job.complete_time)
        .bind(job.result_location.as_ref().map(|l| l.bucket.as_str()))
        .bind(job.result_location.as_ref().map(|l| l.key.as_str()))
        .bind(job.log_location.as_ref().map(|l| l.bucket.as_str()))
        .bind(job.log_location.as_ref().map(|l| l.key.as_str()))
        .bind(job.archive_id.as_ref().map(|a| a.as_str()))
        .bind(job.retrieval.map(|r| r.as_str()))
        .bind(job.version as i64)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(RecordStoreError::AlreadyExists(job.job_id.clone()))
            }
            Err(e) => Err(map_sqlx_error("put", e)),
        }
    }

    #[instrument(skip(self, expected, patch), fields(job_id = %job_id, expected = ?expected.statuses), err)]
    pub async fn update_job(
        &self,
        job_id: &JobId,
        expected: &ExpectedState,
        patch: &JobPatch,
    ) -> Result<Job, RecordStoreError> {
        let (archive_mode, archive_value) = field_update(&patch.archive_id, |a| a.to_string());
        let (retrieval_mode, retrieval_value) =
            field_update(&patch.retrieval, |r| r.as_str().to_string());
        let completion = patch.completion.as_ref();

        let (expect_archive_mode, expect_archive_value) = match &expected.archive_id {
            ArchiveExpectation::Any => ("any", None),
            ArchiveExpectation::Absent => ("absent", None),
            ArchiveExpectation::Equals(id) => ("equals", Some(id.as_str())),
        };
        let expect_retrieval_absent = expected.retrieval == RetrievalExpectation::Absent;
        let expect_version = match expected.version {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        let statuses: Vec<String> = expected.statuses.iter().map(|s| s.as_str().to_string()).collect();

        let sql = format!(
            r#"
            UPDATE annotation_jobs SET
                status        = COALESCE($2, status),
                complete_time = COALESCE(complete_time, $3),
                result_bucket = COALESCE(result_bucket, $4),
                result_key    = COALESCE(result_key, $5),
                log_bucket    = COALESCE(log_bucket, $6),
                log_key       = COALESCE(log_key, $7),
                archive_id    = CASE $8::TEXT WHEN 'keep' THEN archive_id WHEN 'set' THEN $9 ELSE NULL END,
                retrieval     = CASE $10::TEXT WHEN 'keep' THEN retrieval WHEN 'set' THEN $11 ELSE NULL END,
                version       = version + 1
            WHERE job_id = $1
              AND status = ANY($12)
              AND ($13::TEXT = 'any'
                   OR ($13::TEXT = 'absent' AND archive_id IS NULL)
                   OR ($13::TEXT = 'equals' AND archive_id = $14))
              AND (NOT $15::BOOLEAN OR retrieval IS NULL)
              AND ($16::BIGINT IS NULL OR version = $16)
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(job_id.as_str())
            .bind(patch.status.map(|s| s.as_str()))
            .bind(completion.map(|c| c.complete_time))
            .bind(completion.map(|c| c.result_location.bucket.as_str()))
            .bind(completion.map(|c| c.result_location.key.as_str()))
            .bind(completion.map(|c| c.log_location.bucket.as_str()))
            .bind(completion.map(|c| c.log_location.key.as_str()))
            .bind(archive_mode)
            .bind(archive_value)
            .bind(retrieval_mode)
            .bind(retrieval_value)
            .bind(&statuses)
            .bind(expect_archive_mode)
            .bind(expect_archive_value)
            .bind(expect_retrieval_absent)
            .bind(expect_version)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("conditional_update", e))?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        match self.get_job(job_id).await? {
            None => Err(RecordStoreError::NotFound(job_id.clone())),
            Some(current) => Err(RecordStoreError::Conflict(
                expected
                    .mismatch(&current)
                    .unwrap_or_else(|| "record changed concurrently".to_string()),
            )),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn scan_jobs(&self, filter: &ScanFilter) -> Result<Vec<Job>, RecordStoreError> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        let (archive_mode, archive_value) = match &filter.archive {
            ArchiveFilter::Any => ("any", None),
            ArchiveFilter::Present => ("present", None),
            ArchiveFilter::Equals(id) => ("equals", Some(id.as_str())),
        };

        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM annotation_jobs
            WHERE ($1::TEXT IS NULL OR user_id = $1)
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
              AND ($3::TEXT = 'any'
                   OR ($3::TEXT = 'present' AND archive_id IS NOT NULL)
                   OR ($3::TEXT = 'equals' AND archive_id = $4))
              AND (NOT $5::BOOLEAN OR retrieval IS NULL)
            ORDER BY submit_time DESC, job_id ASC
            "#
        ))
        .bind(filter.user_id.as_ref().map(|u| u.as_str()))
        .bind(&statuses)
        .bind(archive_mode)
        .bind(archive_value)
        .bind(filter.retrieval_absent)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("scan", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

impl JobRecordStore for PostgresJobStore {
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, RecordStoreError> {
        self.block_on(self.get_job(job_id))
    }

    fn put(&self, job: &Job) -> Result<(), RecordStoreError> {
        self.block_on(self.insert_job(job))
    }

    fn conditional_update(
        &self,
        job_id: &JobId,
        expected: &ExpectedState,
        patch: &JobPatch,
    ) -> Result<Job, RecordStoreError> {
        self.block_on(self.update_job(job_id, expected, patch))
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<Job>, RecordStoreError> {
        self.block_on(self.scan_jobs(&ScanFilter::new().user(user_id.clone())))
    }

    fn scan(&self, filter: &ScanFilter) -> Result<Vec<Job>, RecordStoreError> {
        self.block_on(self.scan_jobs(filter))
    }
}

fn field_update<T>(update: &FieldUpdate<T>, render: impl Fn(&T) -> String) -> (&'static str, Option<String>) {
    match update {
        FieldUpdate::Keep => ("keep", None),
        FieldUpdate::Set(v) => ("set", Some(render(v))),
        FieldUpdate::Clear => ("clear", None),
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, RecordStoreError> {
    let corrupt = |e: String| RecordStoreError::Storage(format!("failed to decode job row: {e}"));
    let text = |col: &str| row.try_get::<String, _>(col).map_err(|e| corrupt(e.to_string()));
    let opt_text =
        |col: &str| row.try_get::<Option<String>, _>(col).map_err(|e| corrupt(e.to_string()));
    let location = |bucket: Option<String>, key: Option<String>| match (bucket, key) {
        (Some(b), Some(k)) => ObjectLocation::new(b, k).map(Some).map_err(|e| corrupt(e.to_string())),
        _ => Ok(None),
    };

    Ok(Job {
        job_id: JobId::new(text("job_id")?).map_err(|e| corrupt(e.to_string()))?,
        user_id: UserId::new(text("user_id")?).map_err(|e| corrupt(e.to_string()))?,
        input_file_name: text("input_file_name")?,
        input_location: ObjectLocation::new(text("input_bucket")?, text("input_key")?)
            .map_err(|e| corrupt(e.to_string()))?,
        submit_time: row.try_get("submit_time").map_err(|e| corrupt(e.to_string()))?,
        status: JobStatus::parse(&text("status")?).map_err(|e| corrupt(e.to_string()))?,
        complete_time: row.try_get("complete_time").map_err(|e| corrupt(e.to_string()))?,
        result_location: location(opt_text("result_bucket")?, opt_text("result_key")?)?,
        log_location: location(opt_text("log_bucket")?, opt_text("log_key")?)?,
        archive_id: opt_text("archive_id")?
            .map(ArchiveId::new)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?,
        retrieval: opt_text("retrieval")?
            .map(|r| RetrievalTier::parse(&r))
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?,
        version: row
            .try_get::<i64, _>("version")
            .map_err(|e| corrupt(e.to_string()))? as u64,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RecordStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            RecordStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::Io(e) => RecordStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            RecordStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            RecordStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => RecordStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_update_modes() {
        let set = FieldUpdate::Set(ArchiveId::new("A1").unwrap());
        assert_eq!(field_update(&set, |a| a.to_string()), ("set", Some("A1".to_string())));
        assert_eq!(field_update::<ArchiveId>(&FieldUpdate::Keep, |a| a.to_string()), ("keep", None));
        assert_eq!(field_update::<ArchiveId>(&FieldUpdate::Clear, |a| a.to_string()), ("clear", None));
    }

    #[test]
    fn pool_errors_are_retryable() {
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolTimedOut),
            RecordStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::RowNotFound),
            RecordStoreError::Storage(_)
        ));
    }
}
