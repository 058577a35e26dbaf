//! Durable job store: jobs, executions, and the transactional primitives
//! the scheduler builds on.
//!
//! The trait keeps every mutation either a single-statement conditional
//! update or one short transaction; nothing holds a transaction open across
//! I/O. `PostgresJobStore` is the production implementation;
//! `MemoryJobStore` backs unit tests and local development.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::execution::{ExecutionId, ExecutionStatus, JobExecution};
use crate::job::{Job, JobId, JobStatus, SourceId};

/// Pagination window for list operations.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub source_id: Option<SourceId>,
}

/// Mutable-field patch for `update_job`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobUpdate {
    pub url: Option<String>,
    pub interval_minutes: Option<Option<i32>>,
    pub interval_type: Option<crate::job::IntervalType>,
    pub adaptive_scheduling: Option<bool>,
    pub max_retries: Option<i32>,
    pub retry_backoff_seconds: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

/// Job-side state written when an execution closes (one transaction with
/// the execution finalize and the lease release).
#[derive(Debug, Clone)]
pub struct CompletionUpdate {
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub current_retry_count: i32,
}

/// Final state written to the execution row when it closes.
#[derive(Debug, Clone)]
pub struct ExecutionClose {
    pub status: ExecutionStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub items_crawled: i64,
    pub items_indexed: i64,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

/// Minimal job view the bucket map rebalances over.
#[derive(Debug, Clone)]
pub struct SlotJob {
    pub id: JobId,
    pub time_slot: i16,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_slot_moved_at: Option<DateTime<Utc>>,
}

/// Aggregate counters for `GET /scheduler/metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerTotals {
    pub total_jobs: i64,
    pub pending: i64,
    pub scheduled: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub paused: i64,
    pub cancelled: i64,
    pub executions_completed_24h: i64,
    pub executions_failed_24h: i64,
    /// Completed / (completed + failed) over the last 24 h; 1.0 when idle.
    pub success_rate: f64,
}

/// Number of 15-minute slots in a day.
pub const SLOT_COUNT: usize = 96;

#[async_trait]
pub trait JobStore: Send + Sync {
    // -- jobs ------------------------------------------------------------

    async fn create_job(&self, job: Job) -> Result<Job>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn list_jobs(&self, filter: &JobFilter, page: Page) -> Result<(Vec<Job>, i64)>;

    /// Patch mutable fields. Fails with `NotFound` for unknown ids.
    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job>;

    /// Delete, permitted only from terminal states or `paused`.
    /// Returns false when the job exists but is in a live state.
    async fn delete_job(&self, id: JobId) -> Result<bool>;

    /// Jobs matching the due predicate, ordered by `next_run_at` ascending.
    /// Runs outside any transaction; callers lease per candidate.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    // -- leasing ---------------------------------------------------------

    /// CAS: set the lease token where none is held. True iff we won.
    async fn acquire_lease(&self, id: JobId, token: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Conditional clear on token match. True iff the token was still held.
    async fn release_lease(&self, id: JobId, token: Uuid) -> Result<bool>;

    /// Clear all leases older than `older_than`. Running jobs recover to
    /// `pending` with `next_run_at = now` and the crashed attempt counted.
    async fn reap_stale_leases(
        &self,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<Vec<JobId>>;

    /// Transition a leased job to `running` (records `last_run_at`).
    /// Conflict if the job moved out of a dispatchable state since leasing.
    async fn mark_running(&self, id: JobId, token: Uuid, now: DateTime<Utc>) -> Result<Job>;

    // -- control actions (status CAS, never touch the lease) -------------

    async fn pause_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job>;

    async fn resume_job(
        &self,
        id: JobId,
        next_run_at: Option<DateTime<Utc>>,
        time_slot: i16,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job>;

    async fn retry_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job>;

    async fn force_run(&self, id: JobId, now: DateTime<Utc>) -> Result<Job>;

    // -- executions ------------------------------------------------------

    /// Insert a `running` execution row with the next per-job
    /// `execution_number`.
    async fn open_execution(
        &self,
        job_id: JobId,
        retry_attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<JobExecution>;

    /// One transaction: finalize the execution row, apply the job-side
    /// completion update, and release the lease.
    async fn finish_execution(
        &self,
        job_id: JobId,
        token: Uuid,
        execution_id: ExecutionId,
        close: ExecutionClose,
        update: CompletionUpdate,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Completion path for dispatches that died before an execution row
    /// existed: apply the job update and release the lease atomically.
    async fn apply_completion(
        &self,
        job_id: JobId,
        token: Uuid,
        update: CompletionUpdate,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>>;

    /// Execution history for a job, newest first, with the total count.
    async fn list_executions(&self, job_id: JobId, page: Page)
        -> Result<(Vec<JobExecution>, i64)>;

    /// Enforce the retention rule: keep at most `keep` rows and nothing
    /// started before `cutoff`. Returns rows removed.
    async fn prune_executions(
        &self,
        job_id: JobId,
        keep: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    // -- time slots ------------------------------------------------------

    /// Load (count of scheduled recurring jobs) per 15-minute slot.
    async fn slot_loads(&self) -> Result<[i64; SLOT_COUNT]>;

    /// Scheduled recurring jobs eligible for rebalancing consideration.
    async fn jobs_for_rebalance(&self) -> Result<Vec<SlotJob>>;

    /// CAS slot move; false when the job changed slot or state since the
    /// preview. Updates `last_slot_moved_at` and the aligned `next_run_at`.
    async fn move_slot(
        &self,
        id: JobId,
        from: i16,
        to: i16,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // -- metrics ---------------------------------------------------------

    async fn totals(&self, now: DateTime<Utc>) -> Result<SchedulerTotals>;
}
