//! In-memory `JobStore` used by unit tests and local development.
//!
//! Mirrors the Postgres implementation's CAS semantics under one mutex so
//! scheduler behavior can be exercised without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::execution::{ExecutionId, ExecutionStatus, JobExecution};
use crate::job::{ControlAction, Job, JobId, JobStatus};

use super::{
    CompletionUpdate, ExecutionClose, JobFilter, JobStore, JobUpdate, Page, SchedulerTotals,
    SlotJob, SLOT_COUNT,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    executions: HashMap<ExecutionId, JobExecution>,
}

/// Mutexed-map implementation of [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn control_error(job: Option<&Job>, id: JobId, action: ControlAction) -> SchedulerError {
        match job {
            None => SchedulerError::NotFound(id),
            Some(job) => SchedulerError::InvalidTransition {
                from: job.status,
                action: action.as_str(),
            },
        }
    }

    fn apply_job_update(job: &mut Job, update: &CompletionUpdate, token: Uuid) {
        if job.lease_token == Some(token) {
            job.status = update.status;
            job.next_run_at = update.next_run_at;
            job.current_retry_count = update.current_retry_count;
            job.lease_token = None;
            job.lease_acquired_at = None;
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: Job) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.contains_key(&job.id) {
            return Err(SchedulerError::Conflict(format!(
                "job {} already exists",
                job.id
            )));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter, page: Page) -> Result<(Vec<Job>, i64)> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.status.map(|s| j.status == s).unwrap_or(true))
            .filter(|j| filter.source_id.map(|s| j.source_id == s).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = jobs.len() as i64;
        let jobs = jobs
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect();
        Ok((jobs, total))
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
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
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get(&id) else {
            return Err(SchedulerError::NotFound(id));
        };
        if !(job.status.is_terminal() || job.status == JobStatus::Paused) {
            return Ok(false);
        }
        inner.jobs.remove(&id);
        inner.executions.retain(|_, e| e.job_id != id);
        Ok(true)
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn acquire_lease(&self, id: JobId, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.lease_token.is_none() => {
                job.lease_token = Some(token);
                job.lease_acquired_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, id: JobId, token: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.lease_token == Some(token) => {
                job.lease_token = None;
                job.lease_acquired_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_stale_leases(
        &self,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<Vec<JobId>> {
        let cutoff = now - older_than;
        let mut inner = self.inner.lock().unwrap();
        let mut reaped = Vec::new();
        for job in inner.jobs.values_mut() {
            let stale = job
                .lease_acquired_at
                .map(|at| at < cutoff)
                .unwrap_or(false);
            if !stale {
                continue;
            }
            job.lease_token = None;
            job.lease_acquired_at = None;
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.next_run_at = Some(now);
                job.current_retry_count += 1;
            }
            job.updated_at = now;
            reaped.push(job.id);
        }
        Ok(reaped)
    }

    async fn mark_running(&self, id: JobId, token: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound(id))?;
        let dispatchable = matches!(job.status, JobStatus::Pending | JobStatus::Scheduled)
            && job.lease_token == Some(token);
        if !dispatchable {
            return Err(SchedulerError::Conflict(format!(
                "job {id} no longer dispatchable (status {})",
                job.status
            )));
        }
        job.status = JobStatus::Running;
        job.last_run_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn pause_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Scheduled => {
                job.is_paused = true;
                job.status = JobStatus::Paused;
                job.updated_at = now;
                Ok(job.clone())
            }
            other => Err(Self::control_error(
                other.as_deref(),
                id,
                ControlAction::Pause,
            )),
        }
    }

    async fn resume_job(
        &self,
        id: JobId,
        next_run_at: Option<DateTime<Utc>>,
        time_slot: i16,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Paused => {
                job.is_paused = false;
                job.status = JobStatus::Scheduled;
                job.next_run_at = next_run_at;
                job.time_slot = time_slot;
                job.updated_at = now;
                Ok(job.clone())
            }
            other => Err(Self::control_error(
                other.as_deref(),
                id,
                ControlAction::Resume,
            )),
        }
    }

    async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if ControlAction::Cancel.allowed_from(job.status) => {
                job.status = JobStatus::Cancelled;
                job.is_paused = false;
                job.next_run_at = None;
                job.updated_at = now;
                Ok(job.clone())
            }
            other => Err(Self::control_error(
                other.as_deref(),
                id,
                ControlAction::Cancel,
            )),
        }
    }

    async fn retry_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Failed => {
                job.status = JobStatus::Pending;
                job.current_retry_count = 0;
                job.next_run_at = Some(now);
                job.updated_at = now;
                Ok(job.clone())
            }
            other => Err(Self::control_error(
                other.as_deref(),
                id,
                ControlAction::Retry,
            )),
        }
    }

    async fn force_run(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Scheduled && !job.is_paused => {
                job.next_run_at = Some(now);
                job.updated_at = now;
                Ok(job.clone())
            }
            other => Err(Self::control_error(
                other.as_deref(),
                id,
                ControlAction::ForceRun,
            )),
        }
    }

    async fn open_execution(
        &self,
        job_id: JobId,
        retry_attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.jobs.contains_key(&job_id) {
            return Err(SchedulerError::NotFound(job_id));
        }
        let next_number = inner
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.execution_number)
            .max()
            .unwrap_or(0)
            + 1;
        let execution = JobExecution {
            id: ExecutionId::new(),
            job_id,
            execution_number: next_number,
            status: ExecutionStatus::Running,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            items_crawled: 0,
            items_indexed: 0,
            error_message: None,
            retry_attempt,
            metadata: serde_json::Value::Null,
        };
        inner.executions.insert(execution.id, execution.clone());
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
        let mut inner = self.inner.lock().unwrap();
        if let Some(execution) = inner.executions.get_mut(&execution_id) {
            execution.status = close.status;
            execution.completed_at = Some(close.completed_at);
            execution.duration_ms = Some(close.duration_ms);
            execution.items_crawled = close.items_crawled;
            execution.items_indexed = close.items_indexed;
            execution.error_message = close.error_message;
            execution.metadata = close.metadata;
        }
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            Self::apply_job_update(job, &update, token);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn apply_completion(
        &self,
        job_id: JobId,
        token: Uuid,
        update: CompletionUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            Self::apply_job_update(job, &update, token);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>> {
        Ok(self.inner.lock().unwrap().executions.get(&id).cloned())
    }

    async fn list_executions(
        &self,
        job_id: JobId,
        page: Page,
    ) -> Result<(Vec<JobExecution>, i64)> {
        let inner = self.inner.lock().unwrap();
        let mut executions: Vec<JobExecution> = inner
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.execution_number.cmp(&a.execution_number));
        let total = executions.len() as i64;
        let executions = executions
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect();
        Ok((executions, total))
    }

    async fn prune_executions(
        &self,
        job_id: JobId,
        keep: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut for_job: Vec<(ExecutionId, DateTime<Utc>)> = inner
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .map(|e| (e.id, e.started_at))
            .collect();
        for_job.sort_by(|a, b| b.1.cmp(&a.1));
        let doomed: Vec<ExecutionId> = for_job
            .iter()
            .enumerate()
            .filter(|(i, (_, started))| *i >= keep.max(0) as usize || *started < cutoff)
            .map(|(_, (id, _))| *id)
            .collect();
        for id in &doomed {
            inner.executions.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn slot_loads(&self) -> Result<[i64; SLOT_COUNT]> {
        let inner = self.inner.lock().unwrap();
        let mut loads = [0i64; SLOT_COUNT];
        for job in inner.jobs.values() {
            if job.status == JobStatus::Scheduled && job.is_recurring() {
                let slot = job.time_slot.clamp(0, SLOT_COUNT as i16 - 1) as usize;
                loads[slot] += 1;
            }
        }
        Ok(loads)
    }

    async fn jobs_for_rebalance(&self) -> Result<Vec<SlotJob>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Scheduled && j.is_recurring())
            .map(|j| SlotJob {
                id: j.id,
                time_slot: j.time_slot,
                next_run_at: j.next_run_at,
                last_slot_moved_at: j.last_slot_moved_at,
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
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Scheduled && job.time_slot == from => {
                job.time_slot = to;
                job.next_run_at = Some(next_run_at);
                job.last_slot_moved_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn totals(&self, now: DateTime<Utc>) -> Result<SchedulerTotals> {
        let inner = self.inner.lock().unwrap();
        let mut totals = SchedulerTotals::default();
        for job in inner.jobs.values() {
            totals.total_jobs += 1;
            match job.status {
                JobStatus::Pending => totals.pending += 1,
                JobStatus::Scheduled => totals.scheduled += 1,
                JobStatus::Running => totals.running += 1,
                JobStatus::Completed => totals.completed += 1,
                JobStatus::Failed => totals.failed += 1,
                JobStatus::Paused => totals.paused += 1,
                JobStatus::Cancelled => totals.cancelled += 1,
            }
        }
        let day_ago = now - Duration::hours(24);
        for execution in inner.executions.values() {
            if execution.started_at < day_ago {
                continue;
            }
            match execution.status {
                ExecutionStatus::Completed => totals.executions_completed_24h += 1,
                ExecutionStatus::Failed => totals.executions_failed_24h += 1,
                _ => {}
            }
        }
        let finished = totals.executions_completed_24h + totals.executions_failed_24h;
        totals.success_rate = if finished == 0 {
            1.0
        } else {
            totals.executions_completed_24h as f64 / finished as f64
        };
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SourceId;

    fn new_job(status: JobStatus, next_run_at: Option<DateTime<Utc>>) -> Job {
        Job::builder()
            .source_id(SourceId(Uuid::now_v7()))
            .url("https://example.test/")
            .status(status)
            .interval_minutes(30)
            .next_run_at(next_run_at.unwrap_or_else(Utc::now))
            .build()
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = store
            .create_job(new_job(JobStatus::Scheduled, Some(now)))
            .await
            .unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store.acquire_lease(job.id, a, now).await.unwrap());
        assert!(!store.acquire_lease(job.id, b, now).await.unwrap());

        // Releasing with the wrong token is a no-op.
        assert!(!store.release_lease(job.id, b).await.unwrap());
        assert!(store.release_lease(job.id, a).await.unwrap());
        assert!(store.acquire_lease(job.id, b, now).await.unwrap());
    }

    #[tokio::test]
    async fn reaper_recovers_running_jobs_with_stale_leases() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = store
            .create_job(new_job(JobStatus::Scheduled, Some(now)))
            .await
            .unwrap();
        let token = Uuid::new_v4();
        assert!(store
            .acquire_lease(job.id, token, now - Duration::minutes(6))
            .await
            .unwrap());
        store
            .mark_running(job.id, token, now - Duration::minutes(6))
            .await
            .unwrap();

        let reaped = store
            .reap_stale_leases(now, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(reaped, vec![job.id]);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_retry_count, 1);
        assert_eq!(job.next_run_at, Some(now));
        assert!(job.lease_token.is_none());
    }

    #[tokio::test]
    async fn late_completion_after_reap_does_not_clobber_job() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = store
            .create_job(new_job(JobStatus::Scheduled, Some(now)))
            .await
            .unwrap();
        let token = Uuid::new_v4();
        store
            .acquire_lease(job.id, token, now - Duration::minutes(10))
            .await
            .unwrap();
        store
            .mark_running(job.id, token, now - Duration::minutes(10))
            .await
            .unwrap();
        let execution = store
            .open_execution(job.id, 0, now - Duration::minutes(10))
            .await
            .unwrap();

        store
            .reap_stale_leases(now, Duration::minutes(5))
            .await
            .unwrap();

        // The original holder finally reports in; its token is dead.
        store
            .finish_execution(
                job.id,
                token,
                execution.id,
                ExecutionClose {
                    status: ExecutionStatus::Completed,
                    completed_at: now,
                    duration_ms: 1,
                    items_crawled: 0,
                    items_indexed: 0,
                    error_message: None,
                    metadata: serde_json::Value::Null,
                },
                CompletionUpdate {
                    status: JobStatus::Scheduled,
                    next_run_at: Some(now + Duration::minutes(30)),
                    current_retry_count: 0,
                },
                now,
            )
            .await
            .unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        // Reaper's decision stands.
        assert_eq!(job.status, JobStatus::Pending);
        // But the execution row itself is closed.
        let execution = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn execution_numbers_are_monotonic_per_job() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = store
            .create_job(new_job(JobStatus::Scheduled, Some(now)))
            .await
            .unwrap();
        let e1 = store.open_execution(job.id, 0, now).await.unwrap();
        let e2 = store.open_execution(job.id, 0, now).await.unwrap();
        assert_eq!(e1.execution_number, 1);
        assert_eq!(e2.execution_number, 2);
    }

    #[tokio::test]
    async fn pruning_enforces_count_and_age() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = store
            .create_job(new_job(JobStatus::Scheduled, Some(now)))
            .await
            .unwrap();

        // 5 executions, two of them ancient.
        for age_days in [40, 35, 2, 1, 0] {
            store
                .open_execution(job.id, 0, now - Duration::days(age_days))
                .await
                .unwrap();
        }

        let removed = store
            .prune_executions(job.id, 100, now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let removed = store
            .prune_executions(job.id, 2, now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let (left, total) = store
            .list_executions(job.id, Page::default())
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert!(left
            .iter()
            .all(|e| e.started_at >= now - Duration::days(30)));
    }

    #[tokio::test]
    async fn delete_refuses_live_jobs() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = store
            .create_job(new_job(JobStatus::Scheduled, Some(now)))
            .await
            .unwrap();
        assert!(!store.delete_job(job.id).await.unwrap());

        store.pause_job(job.id, now).await.unwrap();
        assert!(store.delete_job(job.id).await.unwrap());
        assert!(store.get_job(job.id).await.unwrap().is_none());
    }
}
