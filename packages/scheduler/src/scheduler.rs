//! The scheduler loop: poll due jobs, lease, dispatch, complete.
//!
//! Safe to run from any number of instances concurrently; exclusivity per
//! job comes from the lease CAS, never from coordination between loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::events::{execution_events, ExecutionEvent};
use crate::execution::{ExecutionId, ExecutionStatus};
use crate::hash_store::ContentHashStore;
use crate::interval::{effective_interval, retry_backoff};
use crate::job::{IntervalType, Job, JobId, JobStatus, SourceId};
use crate::lease::LeaseManager;
use crate::slots::{align_into_slot, assign_slot, slot_of, snap_into_slot, ASSIGN_TOLERANCE};
use crate::store::{CompletionUpdate, ExecutionClose, JobStore, SchedulerTotals};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Nominal poll cadence.
    pub tick_interval: StdDuration,
    /// Max due jobs fetched per tick.
    pub dispatch_batch: i64,
    /// Lease age after which the holder is assumed crashed.
    pub stale_threshold: Duration,
    /// Stale-lease reaper cadence.
    pub reaper_cadence: StdDuration,
    /// Execution history retention: row count.
    pub execution_history_keep: i64,
    /// Execution history retention: age in days.
    pub execution_history_days: i64,
    /// How long shutdown waits for in-flight executions.
    pub drain_timeout: StdDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(10),
            dispatch_batch: 16,
            stale_threshold: Duration::minutes(5),
            reaper_cadence: StdDuration::from_secs(60),
            execution_history_keep: 100,
            execution_history_days: 30,
            drain_timeout: StdDuration::from_secs(30),
        }
    }
}

/// Terminal outcome of one execution attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success,
    Failed { error: String },
    Cancelled,
}

/// What the execution runtime hands back to the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// None when the runtime died before opening the execution row.
    pub execution_id: Option<ExecutionId>,
    pub outcome: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    pub items_crawled: i64,
    pub items_indexed: i64,
    pub metadata: serde_json::Value,
}

impl ExecutionReport {
    /// Report for a dispatch that could not even open its execution row.
    pub fn aborted(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            execution_id: None,
            outcome: ExecutionOutcome::Failed {
                error: error.into(),
            },
            started_at,
            items_crawled: 0,
            items_indexed: 0,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Seam between the scheduler and the crawl runtime.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionReport;
}

/// Payload for job creation (the control API body).
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub source_id: SourceId,
    pub url: String,
    pub interval_minutes: Option<i32>,
    #[serde(default)]
    pub interval_type: IntervalType,
    #[serde(default = "default_true")]
    pub schedule_enabled: bool,
    #[serde(default = "default_true")]
    pub adaptive_scheduling: bool,
    pub max_retries: Option<i32>,
    pub retry_backoff_seconds: Option<i32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// Aggregates for `GET /scheduler/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    #[serde(flatten)]
    pub totals: SchedulerTotals,
    pub stale_leases_cleared: u64,
}

pub struct Scheduler<S> {
    store: Arc<S>,
    hash_store: Arc<dyn ContentHashStore>,
    handler: Arc<dyn ExecutionHandler>,
    lease: Arc<LeaseManager<S>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    events: broadcast::Sender<ExecutionEvent>,
    /// Cancellation roots for executions running on THIS instance.
    running: Mutex<HashMap<JobId, CancellationToken>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl<S: JobStore + 'static> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        hash_store: Arc<dyn ContentHashStore>,
        handler: Arc<dyn ExecutionHandler>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let lease = Arc::new(LeaseManager::new(
            store.clone(),
            clock.clone(),
            config.stale_threshold,
        ));
        Self {
            store,
            hash_store,
            handler,
            lease,
            clock,
            config,
            events: execution_events(256),
            running: Mutex::new(HashMap::new()),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager<S>> {
        &self.lease
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    // -- job creation ----------------------------------------------------

    /// Create a job, assigning it to the least-loaded time slot near its
    /// first run.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        if new.url.trim().is_empty() {
            return Err(SchedulerError::InvalidInput("url must not be empty".into()));
        }
        if let Some(interval) = new.interval_minutes {
            if interval <= 0 {
                return Err(SchedulerError::InvalidInput(
                    "interval_minutes must be positive when present".into(),
                ));
            }
        }

        let now = self.clock.now();
        let interval = new
            .interval_minutes
            .map(|m| new.interval_type.to_duration(m));

        let (status, next_run_at, time_slot) = match interval {
            Some(interval) => {
                let naive = now + interval;
                let loads = self.store.slot_loads().await?;
                let slot = assign_slot(&loads, naive, ASSIGN_TOLERANCE);
                (
                    JobStatus::Scheduled,
                    Some(align_into_slot(naive, slot)),
                    slot,
                )
            }
            // One-shot jobs run as soon as a loop picks them up.
            None => (JobStatus::Pending, Some(now), slot_of(now)),
        };

        let mut builder_status = status;
        let mut is_paused = false;
        if !new.schedule_enabled {
            builder_status = JobStatus::Paused;
            is_paused = true;
        }

        let job = Job::builder()
            .source_id(new.source_id)
            .url(new.url)
            .status(builder_status)
            .is_paused(is_paused)
            .interval_minutes(new.interval_minutes.unwrap_or(0))
            .interval_type(new.interval_type)
            .adaptive_scheduling(new.adaptive_scheduling)
            .max_retries(new.max_retries.unwrap_or(3))
            .retry_backoff_seconds(new.retry_backoff_seconds.unwrap_or(60))
            .time_slot(time_slot)
            .metadata(new.metadata.unwrap_or(serde_json::Value::Null))
            .created_at(now)
            .updated_at(now)
            .build();
        // The builder's strip_option forces a value; restore None for
        // one-shot jobs and carry next_run_at through.
        let mut job = job;
        job.interval_minutes = new.interval_minutes;
        job.next_run_at = next_run_at;

        self.store.create_job(job).await
    }

    // -- control actions -------------------------------------------------

    pub async fn pause(&self, id: JobId) -> Result<Job> {
        let job = self.store.pause_job(id, self.clock.now()).await?;
        info!(job_id = %id, "job paused");
        Ok(job)
    }

    /// Resume: recompute the next run and re-assign the slot like a new job.
    pub async fn resume(&self, id: JobId) -> Result<Job> {
        let now = self.clock.now();
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;

        let (next_run_at, slot) = match job.interval() {
            Some(base) => {
                let unchanged = self.unchanged_count(job.source_id).await;
                let naive = now + effective_interval(base, job.adaptive_scheduling, unchanged);
                let loads = self.store.slot_loads().await?;
                let slot = assign_slot(&loads, naive, ASSIGN_TOLERANCE);
                (Some(align_into_slot(naive, slot)), slot)
            }
            None => (Some(now), job.time_slot),
        };

        let job = self.store.resume_job(id, next_run_at, slot, now).await?;
        info!(job_id = %id, next_run_at = ?job.next_run_at, "job resumed");
        Ok(job)
    }

    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let job = self.store.cancel_job(id, self.clock.now()).await?;
        // Signal the execution if it runs on this instance; elsewhere the
        // runtime observes the cancelled status at its next checkpoint.
        if let Some(token) = self.running.lock().unwrap().get(&id) {
            token.cancel();
        }
        info!(job_id = %id, "job cancelled");
        Ok(job)
    }

    pub async fn retry(&self, id: JobId) -> Result<Job> {
        let job = self.store.retry_job(id, self.clock.now()).await?;
        info!(job_id = %id, "job queued for manual retry");
        Ok(job)
    }

    pub async fn force_run(&self, id: JobId) -> Result<Job> {
        let job = self.store.force_run(id, self.clock.now()).await?;
        info!(job_id = %id, "job forced to run now");
        Ok(job)
    }

    // -- the loop --------------------------------------------------------

    /// One scheduling pass. Idempotent and safe under concurrent callers
    /// across instances; returns the number of executions dispatched.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let now = self.clock.now();
        let due = self
            .store
            .due_jobs(now, self.config.dispatch_batch)
            .await?;

        let mut dispatched = 0;
        for job in due {
            let Some(token) = self.lease.acquire(job.id).await? else {
                // Another instance won the race; nothing to do.
                continue;
            };
            let job = match self.store.mark_running(job.id, token, now).await {
                Ok(job) => job,
                Err(SchedulerError::Conflict(_)) => {
                    // State changed between due-select and lease (e.g. a
                    // concurrent cancel); hand the lease back quietly.
                    let _ = self.lease.release(job.id, token).await;
                    continue;
                }
                Err(e) => {
                    let _ = self.lease.release(job.id, token).await;
                    return Err(e);
                }
            };

            debug!(job_id = %job.id, "dispatching execution");
            let this = self.clone();
            self.tasks
                .lock()
                .await
                .spawn(async move { this.dispatch(job, token).await });
            dispatched += 1;
        }

        // Reap finished dispatch tasks without blocking.
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "execution task panicked");
                }
            }
        }

        Ok(dispatched)
    }

    /// Run ticks until cancelled, then drain in-flight executions.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            batch = self.config.dispatch_batch,
            "scheduler loop starting"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(count) if count > 0 => {
                            debug!(dispatched = count, "tick complete");
                        }
                        Ok(_) => {}
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "store unavailable, backing off this tick");
                        }
                        Err(e) => {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
        }

        // Cooperative shutdown: signal running executions, then wait.
        for token in self.running.lock().unwrap().values() {
            token.cancel();
        }
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut tasks = self.tasks.lock().await;
        while !tasks.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = tasks.len(), "drain timeout, aborting executions");
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    /// Wait for all in-flight dispatch tasks (used by tests).
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }

    pub async fn metrics(&self) -> Result<SchedulerMetrics> {
        let totals = self.store.totals(self.clock.now()).await?;
        Ok(SchedulerMetrics {
            totals,
            stale_leases_cleared: self.lease.reaped_total(),
        })
    }

    // -- completion ------------------------------------------------------

    async fn unchanged_count(&self, source_id: SourceId) -> u32 {
        match self.hash_store.get(source_id).await {
            Ok(Some(hash)) => hash.unchanged_count.max(0) as u32,
            Ok(None) => 0,
            Err(e) => {
                warn!(source_id = %source_id, error = %e, "content hash lookup failed, using base interval");
                0
            }
        }
    }

    async fn dispatch(self: Arc<Self>, job: Job, token: Uuid) {
        let cancel = CancellationToken::new();
        self.running.lock().unwrap().insert(job.id, cancel.clone());
        let _ = self.events.send(ExecutionEvent::Started { job_id: job.id });

        let report = self.handler.execute(&job, cancel.clone()).await;
        self.complete(&job, token, report).await;

        self.running.lock().unwrap().remove(&job.id);
    }

    async fn complete(&self, job: &Job, token: Uuid, report: ExecutionReport) {
        let now = self.clock.now();
        let duration_ms = (now - report.started_at).num_milliseconds().max(0);

        let (execution_status, update, error_message) = match &report.outcome {
            ExecutionOutcome::Success => {
                let update = match job.interval() {
                    Some(base) => {
                        let unchanged = self.unchanged_count(job.source_id).await;
                        let effective =
                            effective_interval(base, job.adaptive_scheduling, unchanged);
                        // Rhythm preservation: land in the job's own slot.
                        let next = snap_into_slot(now + effective, job.time_slot);
                        CompletionUpdate {
                            status: JobStatus::Scheduled,
                            next_run_at: Some(next),
                            current_retry_count: 0,
                        }
                    }
                    None => CompletionUpdate {
                        status: JobStatus::Completed,
                        next_run_at: None,
                        current_retry_count: 0,
                    },
                };
                (ExecutionStatus::Completed, update, None)
            }
            ExecutionOutcome::Failed { error } => {
                let update = if job.current_retry_count < job.max_retries {
                    let attempt = job.current_retry_count + 1;
                    let backoff = retry_backoff(job.retry_backoff_seconds, attempt);
                    CompletionUpdate {
                        status: JobStatus::Pending,
                        next_run_at: Some(now + backoff),
                        current_retry_count: attempt,
                    }
                } else {
                    CompletionUpdate {
                        status: JobStatus::Failed,
                        next_run_at: None,
                        current_retry_count: job.current_retry_count,
                    }
                };
                (ExecutionStatus::Failed, update, Some(error.clone()))
            }
            ExecutionOutcome::Cancelled => (
                ExecutionStatus::Cancelled,
                CompletionUpdate {
                    status: JobStatus::Cancelled,
                    next_run_at: None,
                    current_retry_count: job.current_retry_count,
                },
                None,
            ),
        };

        let result = match report.execution_id {
            Some(execution_id) => {
                let close = ExecutionClose {
                    status: execution_status,
                    completed_at: now,
                    duration_ms,
                    items_crawled: report.items_crawled,
                    items_indexed: report.items_indexed,
                    error_message: error_message.clone(),
                    metadata: report.metadata.clone(),
                };
                self.store
                    .finish_execution(job.id, token, execution_id, close, update, now)
                    .await
            }
            None => {
                self.store
                    .apply_completion(job.id, token, update, now)
                    .await
            }
        };
        if let Err(e) = result {
            // Leave the lease in place; the reaper will recover the job.
            error!(job_id = %job.id, error = %e, "failed to record execution completion");
            return;
        }

        if let Err(e) = self
            .store
            .prune_executions(
                job.id,
                self.config.execution_history_keep,
                now - Duration::days(self.config.execution_history_days),
            )
            .await
        {
            warn!(job_id = %job.id, error = %e, "execution pruning failed");
        }

        let event = match &report.outcome {
            ExecutionOutcome::Success => ExecutionEvent::Completed {
                job_id: job.id,
                execution_id: report.execution_id.unwrap_or_default(),
                items_indexed: report.items_indexed,
            },
            ExecutionOutcome::Failed { error } => ExecutionEvent::Failed {
                job_id: job.id,
                execution_id: report.execution_id,
                error: error.clone(),
            },
            ExecutionOutcome::Cancelled => ExecutionEvent::Cancelled {
                job_id: job.id,
                execution_id: report.execution_id,
            },
        };
        let _ = self.events.send(event);
    }
}
