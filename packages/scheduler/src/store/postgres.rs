//! PostgreSQL-backed `JobStore`.
//!
//! Every mutation is a single conditional UPDATE or one short transaction;
//! the scheduler's at-most-one guarantee rests on the lease-token CAS here.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::execution::{ExecutionId, JobExecution};
use crate::job::{ControlAction, Job, JobId};

use super::{
    CompletionUpdate, ExecutionClose, JobFilter, JobStore, JobUpdate, Page, SchedulerTotals,
    SlotJob, SLOT_COUNT,
};

const JOB_COLUMNS: &str = "id, source_id, url, status, is_paused, interval_minutes, interval_type, \
     next_run_at, last_run_at, adaptive_scheduling, max_retries, retry_backoff_seconds, \
     current_retry_count, lease_token, lease_acquired_at, time_slot, last_slot_moved_at, \
     metadata, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, job_id, execution_number, status, started_at, completed_at, \
     duration_ms, items_crawled, items_indexed, error_message, retry_attempt, metadata";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve a failed control CAS into NotFound or InvalidTransition.
    async fn control_error(&self, id: JobId, action: ControlAction) -> SchedulerError {
        match self.get_job(id).await {
            Ok(Some(job)) => SchedulerError::InvalidTransition {
                from: job.status,
                action: action.as_str(),
            },
            Ok(None) => SchedulerError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job: Job) -> Result<Job> {
        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(job.id)
        .bind(job.source_id)
        .bind(&job.url)
        .bind(job.status)
        .bind(job.is_paused)
        .bind(job.interval_minutes)
        .bind(job.interval_type)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.adaptive_scheduling)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .bind(job.current_retry_count)
        .bind(job.lease_token)
        .bind(job.lease_acquired_at)
        .bind(job.time_slot)
        .bind(job.last_slot_moved_at)
        .bind(&job.metadata)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list_jobs(&self, filter: &JobFilter, page: Page) -> Result<(Vec<Job>, i64)> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR source_id = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        ))
        .bind(filter.status)
        .bind(filter.source_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR source_id = $2)
            "#,
        )
        .bind(filter.status)
        .bind(filter.source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((jobs, total))
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        // Read-modify-write on mutable fields; concurrent control actions
        // only touch status/lease columns, so last-writer-wins is fine here.
        let mut job = self
            .get_job(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;
        if let Some(url) = update.url {
            job.url = url;
        }
        if let Some(interval) = update.interval_minutes {
            job.interval_minutes = interval;
        }
        if let Some(unit) = update.interval_type {
            job.interval_type = unit;
        }
        if let Some(adaptive) = update.adaptive_scheduling {
            job.adaptive_scheduling = adaptive;
        }
        if let Some(max_retries) = update.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(backoff) = update.retry_backoff_seconds {
            job.retry_backoff_seconds = backoff;
        }
        if let Some(metadata) = update.metadata {
            job.metadata = metadata;
        }

        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET url = $2,
                interval_minutes = $3,
                interval_type = $4,
                adaptive_scheduling = $5,
                max_retries = $6,
                retry_backoff_seconds = $7,
                metadata = $8,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(&job.url)
        .bind(job.interval_minutes)
        .bind(job.interval_type)
        .bind(job.adaptive_scheduling)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .bind(&job.metadata)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SchedulerError::NotFound(id))?;
        Ok(updated)
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id = $1
              AND (status IN ('completed', 'failed', 'cancelled') OR status = 'paused')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_job(id).await? {
            Some(_) => Ok(false),
            None => Err(SchedulerError::NotFound(id)),
        }
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status IN ('pending', 'scheduled')
              AND is_paused = false
              AND next_run_at IS NOT NULL
              AND next_run_at <= $1
              AND lease_token IS NULL
            ORDER BY next_run_at ASC
            LIMIT $2
            "#,
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn acquire_lease(&self, id: JobId, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_token = $2, lease_acquired_at = $3, updated_at = $3
            WHERE id = $1 AND lease_token IS NULL
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, id: JobId, token: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_token = NULL, lease_acquired_at = NULL
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reap_stale_leases(
        &self,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<Vec<JobId>> {
        let cutoff = now - older_than;
        let mut tx = self.pool.begin().await?;

        // Crashed executions: the attempt counts as failed and the job goes
        // straight back to the due set.
        let recovered: Vec<JobId> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET lease_token = NULL,
                lease_acquired_at = NULL,
                status = 'pending',
                next_run_at = $1,
                current_retry_count = current_retry_count + 1,
                updated_at = $1
            WHERE lease_acquired_at < $2 AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let cleared: Vec<JobId> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET lease_token = NULL, lease_acquired_at = NULL, updated_at = $1
            WHERE lease_acquired_at < $2 AND lease_token IS NOT NULL
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut all = recovered;
        all.extend(cleared);
        Ok(all)
    }

    async fn mark_running(&self, id: JobId, token: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', last_run_at = $3, updated_at = $3
            WHERE id = $1
              AND lease_token = $2
              AND status IN ('pending', 'scheduled')
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        job.ok_or_else(|| {
            SchedulerError::Conflict(format!("job {id} no longer dispatchable"))
        })
    }

    async fn pause_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET is_paused = true, status = 'paused', updated_at = $2
            WHERE id = $1 AND status = 'scheduled'
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match job {
            Some(job) => Ok(job),
            None => Err(self.control_error(id, ControlAction::Pause).await),
        }
    }

    async fn resume_job(
        &self,
        id: JobId,
        next_run_at: Option<DateTime<Utc>>,
        time_slot: i16,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET is_paused = false,
                status = 'scheduled',
                next_run_at = $2,
                time_slot = $3,
                updated_at = $4
            WHERE id = $1 AND status = 'paused'
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(next_run_at)
        .bind(time_slot)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match job {
            Some(job) => Ok(job),
            None => Err(self.control_error(id, ControlAction::Resume).await),
        }
    }

    async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled', is_paused = false, next_run_at = NULL, updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'scheduled', 'running', 'paused')
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match job {
            Some(job) => Ok(job),
            None => Err(self.control_error(id, ControlAction::Cancel).await),
        }
    }

    async fn retry_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending', current_retry_count = 0, next_run_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match job {
            Some(job) => Ok(job),
            None => Err(self.control_error(id, ControlAction::Retry).await),
        }
    }

    async fn force_run(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET next_run_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'scheduled' AND is_paused = false
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match job {
            Some(job) => Ok(job),
            None => Err(self.control_error(id, ControlAction::ForceRun).await),
        }
    }

    async fn open_execution(
        &self,
        job_id: JobId,
        retry_attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        let execution = sqlx::query_as::<_, JobExecution>(&format!(
            r#"
            INSERT INTO job_executions
                (id, job_id, execution_number, status, started_at, items_crawled,
                 items_indexed, retry_attempt, metadata)
            SELECT $1, $2,
                   COALESCE(MAX(execution_number), 0) + 1,
                   'running', $3, 0, 0, $4, 'null'::jsonb
            FROM job_executions WHERE job_id = $2
            RETURNING {EXECUTION_COLUMNS}
            "#,
        ))
        .bind(ExecutionId::new())
        .bind(job_id)
        .bind(now)
        .bind(retry_attempt)
        .fetch_one(&self.pool)
        .await?;
        Ok(execution)
    }

    async fn finish_execution(
        &self,
        job_id: JobId,
        token: Uuid,
        execution_id: ExecutionId,
        close: ExecutionClose,
        update: CompletionUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2,
                completed_at = $3,
                duration_ms = $4,
                items_crawled = $5,
                items_indexed = $6,
                error_message = $7,
                metadata = $8
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(close.status)
        .bind(close.completed_at)
        .bind(close.duration_ms)
        .bind(close.items_crawled)
        .bind(close.items_indexed)
        .bind(&close.error_message)
        .bind(&close.metadata)
        .execute(&mut *tx)
        .await?;

        // Token guard: if the reaper got here first, its decision stands.
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                next_run_at = $4,
                current_retry_count = $5,
                lease_token = NULL,
                lease_acquired_at = NULL,
                updated_at = $6
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token)
        .bind(update.status)
        .bind(update.next_run_at)
        .bind(update.current_retry_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_completion(
        &self,
        job_id: JobId,
        token: Uuid,
        update: CompletionUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                next_run_at = $4,
                current_retry_count = $5,
                lease_token = NULL,
                lease_acquired_at = NULL,
                updated_at = $6
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token)
        .bind(update.status)
        .bind(update.next_run_at)
        .bind(update.current_retry_count)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>> {
        let execution = sqlx::query_as::<_, JobExecution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    async fn list_executions(
        &self,
        job_id: JobId,
        page: Page,
    ) -> Result<(Vec<JobExecution>, i64)> {
        let executions = sqlx::query_as::<_, JobExecution>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM job_executions
            WHERE job_id = $1
            ORDER BY execution_number DESC
            LIMIT $2 OFFSET $3
            "#,
        ))
        .bind(job_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        let total =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM job_executions WHERE job_id = $1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;

        Ok((executions, total))
    }

    async fn prune_executions(
        &self,
        job_id: JobId,
        keep: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_executions
            WHERE job_id = $1
              AND (started_at < $2
                   OR id IN (
                       SELECT id FROM job_executions
                       WHERE job_id = $1
                       ORDER BY started_at DESC
                       OFFSET $3
                   ))
            "#,
        )
        .bind(job_id)
        .bind(cutoff)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn slot_loads(&self) -> Result<[i64; SLOT_COUNT]> {
        let rows = sqlx::query(
            r#"
            SELECT time_slot, COUNT(*) AS load
            FROM jobs
            WHERE status = 'scheduled' AND interval_minutes > 0
            GROUP BY time_slot
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut loads = [0i64; SLOT_COUNT];
        for row in rows {
            let slot: i16 = row.get("time_slot");
            let load: i64 = row.get("load");
            if (0..SLOT_COUNT as i16).contains(&slot) {
                loads[slot as usize] = load;
            }
        }
        Ok(loads)
    }

    async fn jobs_for_rebalance(&self) -> Result<Vec<SlotJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, time_slot, next_run_at, last_slot_moved_at
            FROM jobs
            WHERE status = 'scheduled' AND interval_minutes > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| SlotJob {
                id: row.get("id"),
                time_slot: row.get("time_slot"),
                next_run_at: row.get("next_run_at"),
                last_slot_moved_at: row.get("last_slot_moved_at"),
            })
            .collect())
    }

    async fn move_slot(
        &self,
        id: JobId,
        from: i16,
        to: i16,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET time_slot = $3, next_run_at = $4, last_slot_moved_at = $5, updated_at = $5
            WHERE id = $1 AND time_slot = $2 AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn totals(&self, now: DateTime<Utc>) -> Result<SchedulerTotals> {
        let job_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE status = 'scheduled') AS scheduled,
                   COUNT(*) FILTER (WHERE status = 'running') AS running,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'paused') AS paused,
                   COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let execution_row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM job_executions
            WHERE started_at >= $1
            "#,
        )
        .bind(now - Duration::hours(24))
        .fetch_one(&self.pool)
        .await?;

        let completed_24h: i64 = execution_row.get("completed");
        let failed_24h: i64 = execution_row.get("failed");
        let finished = completed_24h + failed_24h;

        Ok(SchedulerTotals {
            total_jobs: job_row.get("total"),
            pending: job_row.get("pending"),
            scheduled: job_row.get("scheduled"),
            running: job_row.get("running"),
            completed: job_row.get("completed"),
            failed: job_row.get("failed"),
            paused: job_row.get("paused"),
            cancelled: job_row.get("cancelled"),
            executions_completed_24h: completed_24h,
            executions_failed_24h: failed_24h,
            success_rate: if finished == 0 {
                1.0
            } else {
                completed_24h as f64 / finished as f64
            },
        })
    }
}
