//! Postgres-backed job store.
//!
//! One row per job key in `queue_jobs`. Status changes are single conditional
//! `UPDATE .. RETURNING` statements, so two racing claims (or a claim racing a
//! cancel) resolve inside the database: exactly one statement matches the row.
//!
//! ## Error Mapping
//!
//! | Situation | JobStoreError |
//! |-----------|---------------|
//! | conditional `UPDATE` matched no row, key absent | `NotFound` |
//! | conditional `UPDATE` matched no row, status guard failed | `InvalidTransition` |
//! | readiness guard failed | `NotReady` |
//! | any `sqlx` error or undecodable row | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::store::{JobFilter, JobPage, JobPatch, JobStore, JobStoreError, page_offset};
use super::types::{Job, JobKey, JobStatus, NewJob, QueueName, QueueStats, after};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    job_key      TEXT PRIMARY KEY,
    queue        TEXT NOT NULL,
    payload      JSONB NOT NULL,
    status       TEXT NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
    ready_at     TIMESTAMPTZ NOT NULL,
    last_error   TEXT,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    CHECK (attempts <= max_attempts)
);
CREATE INDEX IF NOT EXISTS queue_jobs_due_idx ON queue_jobs (queue, status, ready_at);
CREATE INDEX IF NOT EXISTS queue_jobs_created_idx ON queue_jobs (created_at DESC, job_key);
"#;

const COLUMNS: &str = "job_key, queue, payload, status, attempts, max_attempts, ready_at, \
                       last_error, created_at, updated_at, completed_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create `queue_jobs` and its indexes if they do not exist.
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA).execute(pool).await?;
        Ok(())
    }

    async fn fetch(&self, key: &JobKey) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM queue_jobs WHERE job_key = $1"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch", e))?;

        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_key = %job.key, queue = %job.queue), err)]
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let key = job.key.clone();
        let ready_at = after(now, job.delay);

        sqlx::query(
            r#"
            INSERT INTO queue_jobs
                (job_key, queue, payload, status, attempts, max_attempts, ready_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'waiting', 0, $4, $5, $6, $6)
            ON CONFLICT (job_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(job.queue.as_str())
        .bind(&job.payload)
        .bind(to_i32(job.max_attempts))
        .bind(ready_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e))?;

        self.fetch(&key)
            .await?
            .ok_or(JobStoreError::NotFound(key))
    }

    #[instrument(skip(self, patch), fields(job_key = %key, to = %patch.status), err)]
    async fn transition(
        &self,
        key: &JobKey,
        expected: &[JobStatus],
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        let expected_names: Vec<&str> = expected
            .iter()
            .filter(|s| !s.is_terminal())
            .map(JobStatus::as_str)
            .collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE queue_jobs SET
                status = $3,
                updated_at = $4,
                attempts = attempts + CASE WHEN $5 THEN 1 ELSE 0 END,
                ready_at = COALESCE($6, ready_at),
                last_error = COALESCE($7, last_error),
                completed_at = COALESCE($8, completed_at)
            WHERE job_key = $1
              AND status = ANY($2)
              AND ($9::timestamptz IS NULL OR ready_at <= $9)
              AND (NOT $5 OR attempts < max_attempts)
              AND NOT ($3 = 'active' AND $6::timestamptz IS NOT NULL)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(key.as_str())
        .bind(&expected_names)
        .bind(patch.status.as_str())
        .bind(patch.at)
        .bind(patch.bump_attempts)
        .bind(patch.ready_at)
        .bind(patch.last_error.as_deref())
        .bind(patch.completed_at)
        .bind(patch.due_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        // The guard refused the update; classify against the current record.
        let current = self
            .fetch(key)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(key.clone()))?;
        patch.check(&current, expected)?;
        Err(JobStoreError::InvalidTransition {
            key: key.clone(),
            from: current.status,
        })
    }

    #[instrument(skip(self), fields(job_key = %key), err)]
    async fn get(&self, key: &JobKey) -> Result<Job, JobStoreError> {
        self.fetch(key)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(key.clone()))
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &JobFilter,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage, JobStoreError> {
        let queue = filter.queue.map(|q| q.as_str());
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queue_jobs
            WHERE ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(queue)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_count", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM queue_jobs
            WHERE ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, job_key ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(queue)
        .bind(status)
        .bind(i64::from(page_size))
        .bind(page_offset(page, page_size) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage {
            jobs,
            total: total as u64,
        })
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn due(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM queue_jobs
            WHERE queue = $1 AND status = 'waiting' AND ready_at <= $2
            ORDER BY ready_at ASC, job_key ASC
            LIMIT $3
            "#
        ))
        .bind(queue.as_str())
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("due", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn counts(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<QueueStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'waiting' AND ready_at <= $2) AS waiting,
                COUNT(*) FILTER (WHERE status = 'waiting' AND ready_at > $2)  AS delayed,
                COUNT(*) FILTER (WHERE status = 'active')    AS active,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed')    AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled
            FROM queue_jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("counts", e))?;

        let count = |column: &str| -> Result<u64, JobStoreError> {
            row.try_get::<i64, _>(column)
                .map(|n| n as u64)
                .map_err(|e| map_sqlx_error("counts", e))
        };

        Ok(QueueStats {
            waiting: count("waiting")?,
            active: count("active")?,
            completed: count("completed")?,
            failed: count("failed")?,
            cancelled: count("cancelled")?,
            delayed: count("delayed")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn delete_by_status(
        &self,
        queue: Option<QueueName>,
        status: JobStatus,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs WHERE status = $1 AND ($2::text IS NULL OR queue = $2)",
        )
        .bind(status.as_str())
        .bind(queue.map(|q| q.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_by_status", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_key = %key), err)]
    async fn delete(&self, key: &JobKey) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE job_key = $1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn stuck_active(
        &self,
        queue: QueueName,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM queue_jobs
            WHERE queue = $1 AND status = 'active' AND updated_at <= $2
            ORDER BY updated_at ASC
            "#
        ))
        .bind(queue.as_str())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stuck_active", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode", e);

    let key: String = row.try_get("job_key").map_err(decode)?;
    let queue: String = row.try_get("queue").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(decode)?;

    Ok(Job {
        key: JobKey::new(key),
        queue: queue
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("bad queue column: {e}")))?,
        payload: row.try_get("payload").map_err(decode)?,
        status: status
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("bad status column: {e}")))?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        ready_at: row.try_get("ready_at").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed during {operation}"))
        }
        other => JobStoreError::Storage(format!("{operation} failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_and_migrate;

    /// `None` when `DATABASE_URL` is unset, so the ignored tests stay runnable anywhere.
    async fn store() -> Option<PostgresJobStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = connect_and_migrate(&url).await.unwrap();
        Some(PostgresJobStore::new(pool))
    }

    fn fresh_key() -> JobKey {
        JobKey::new(format!("notify:{}", uuid::Uuid::now_v7()))
    }

    fn notify(key: &JobKey) -> NewJob {
        NewJob::new(QueueName::Notify, key.clone(), serde_json::json!({})).with_max_attempts(2)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn claim_is_conditional_on_status_and_readiness() {
        let Some(store) = store().await else { return };
        let now = Utc::now();
        let key = fresh_key();
        store
            .create(notify(&key).delayed(std::time::Duration::from_secs(10)), now)
            .await
            .unwrap();

        let early = store
            .transition(&key, &[JobStatus::Waiting], JobPatch::claim(now))
            .await;
        assert!(matches!(early, Err(JobStoreError::NotReady { .. })));

        let later = now + chrono::Duration::seconds(10);
        let claimed = store
            .transition(&key, &[JobStatus::Waiting], JobPatch::claim(later))
            .await
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);

        let again = store
            .transition(&key, &[JobStatus::Waiting], JobPatch::claim(later))
            .await;
        assert!(matches!(
            again,
            Err(JobStoreError::InvalidTransition { from: JobStatus::Active, .. })
        ));

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn racing_claims_have_exactly_one_winner() {
        let Some(store) = store().await else { return };
        let now = Utc::now();
        let key = fresh_key();
        store.create(notify(&key), now).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    store
                        .transition(&key, &[JobStatus::Waiting], JobPatch::claim(now))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => winners += 1,
                Err(err) => assert!(err.is_lost_race(), "unexpected error: {err}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get(&key).await.unwrap().attempts, 1);

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn terminal_and_missing_records_refuse_transitions() {
        let Some(store) = store().await else { return };
        let now = Utc::now();
        let key = fresh_key();
        store.create(notify(&key), now).await.unwrap();
        store
            .transition(&key, &[JobStatus::Waiting], JobPatch::cancel(now))
            .await
            .unwrap();

        let err = store
            .transition(&key, &JobStatus::ALL, JobPatch::claim(now))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::InvalidTransition { from: JobStatus::Cancelled, .. }
        ));
        assert_eq!(store.get(&key).await.unwrap().status, JobStatus::Cancelled);

        store.delete(&key).await.unwrap();
        let missing = store
            .transition(&key, &[JobStatus::Waiting], JobPatch::claim(now))
            .await;
        assert!(matches!(missing, Err(JobStoreError::NotFound(_))));
    }
}
