//! `PostgreSQL`-backed task queue.
//!
//! Jobs live in `task_job`. Reservation uses `FOR UPDATE SKIP LOCKED`, so
//! any number of workers can poll the same table. A job stuck in `active`
//! for longer than its timeout (its worker died) becomes reservable again
//! while it has deliveries left; otherwise `reap_expired` marks it dead.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

use novel_engine_core::error::DomainError;
use novel_engine_core::queue::{Job, JobDisposition, JobHandle, JobSource, TaskQueue};

use crate::db_error;

/// Redelivery policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Deliveries after which a failing job is dead.
    pub max_deliveries: u32,
    /// Delay before the next delivery, multiplied by the deliveries so far.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: 3,
            backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, FromRow)]
struct ReservedRow {
    id: Uuid,
    task_id: Uuid,
    deliveries: i32,
    timeout_ms: i64,
}

/// PostgreSQL-backed durable queue.
#[derive(Debug, Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgTaskQueue {
    /// Creates a new `PgTaskQueue`.
    #[must_use]
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    fn max_deliveries(&self) -> i32 {
        i32::try_from(self.policy.max_deliveries).unwrap_or(i32::MAX)
    }

    /// Number of jobs waiting to be delivered, due or not.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the query fails.
    pub async fn ready_count(&self) -> Result<i64, DomainError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM task_job WHERE status = 'ready'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("count ready jobs"))?;
        Ok(count)
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task_id: Uuid, timeout: Duration) -> Result<JobHandle, DomainError> {
        let job_id = Uuid::now_v7();
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX).max(1);
        sqlx::query(
            "INSERT INTO task_job (id, task_id, status, timeout_ms, run_at)
             VALUES ($1, $2, 'ready', $3, NOW())",
        )
        .bind(job_id)
        .bind(task_id)
        .bind(timeout_ms)
        .execute(&self.pool)
        .await
        .map_err(db_error("enqueue job"))?;
        debug!(%job_id, %task_id, "job enqueued");
        Ok(JobHandle { job_id, task_id })
    }
}

#[async_trait]
impl JobSource for PgTaskQueue {
    async fn reserve(&self) -> Result<Option<Job>, DomainError> {
        let row: Option<ReservedRow> = sqlx::query_as(
            "UPDATE task_job
             SET status = 'active', deliveries = deliveries + 1,
                 reserved_at = NOW(), updated_at = NOW()
             WHERE id = (
                 SELECT id FROM task_job
                 WHERE (status = 'ready' AND run_at <= NOW())
                    OR (status = 'active' AND deliveries < $1
                        AND reserved_at + timeout_ms * INTERVAL '1 millisecond' < NOW())
                 ORDER BY run_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, task_id, deliveries, timeout_ms",
        )
        .bind(self.max_deliveries())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("reserve job"))?;

        Ok(row.map(|row| Job {
            handle: JobHandle {
                job_id: row.id,
                task_id: row.task_id,
            },
            delivery: u32::try_from(row.deliveries).unwrap_or_default(),
            timeout: Duration::from_millis(u64::try_from(row.timeout_ms).unwrap_or(1)),
        }))
    }

    async fn complete(&self, job: &Job) -> Result<(), DomainError> {
        sqlx::query(
            "UPDATE task_job SET status = 'done', reserved_at = NULL, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job.handle.job_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("complete job"))?;
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<JobDisposition, DomainError> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "UPDATE task_job
             SET status = CASE WHEN deliveries >= $2 THEN 'dead' ELSE 'ready' END,
                 run_at = CASE WHEN deliveries >= $2 THEN run_at
                               ELSE NOW() + make_interval(secs => $3::float8 * deliveries) END,
                 last_error = $4, reserved_at = NULL, updated_at = NOW()
             WHERE id = $1
             RETURNING status, run_at",
        )
        .bind(job.handle.job_id)
        .bind(self.max_deliveries())
        .bind(self.policy.backoff.as_secs_f64())
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("fail job"))?;

        match row {
            Some((status, _)) if status == "dead" => {
                warn!(job_id = %job.handle.job_id, error, "job is dead");
                Ok(JobDisposition::Dead)
            }
            Some((_, retry_at)) => Ok(JobDisposition::Retrying { retry_at }),
            None => Err(DomainError::not_found("job", job.handle.job_id)),
        }
    }

    async fn bury(&self, job: &Job, error: &str) -> Result<(), DomainError> {
        sqlx::query(
            "UPDATE task_job
             SET status = 'dead', last_error = $2, reserved_at = NULL, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job.handle.job_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error("bury job"))?;
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<JobHandle>, DomainError> {
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "UPDATE task_job
             SET status = 'dead', last_error = 'reservation expired on the last delivery',
                 reserved_at = NULL, updated_at = NOW()
             WHERE status = 'active' AND deliveries >= $1
               AND reserved_at + timeout_ms * INTERVAL '1 millisecond' < NOW()
             RETURNING id, task_id",
        )
        .bind(self.max_deliveries())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("reap expired jobs"))?;

        for (job_id, task_id) in &rows {
            warn!(%job_id, %task_id, "job expired with no deliveries left");
        }
        Ok(rows
            .into_iter()
            .map(|(job_id, task_id)| JobHandle { job_id, task_id })
            .collect())
    }
}
