//! Per-job mutual exclusion across instances.
//!
//! A lease is a token stored in the job row; acquisition is a conditional
//! single-statement update. The stale-lease reaper recovers jobs whose
//! holder crashed; it is safe to run from every instance concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::job::JobId;
use crate::store::JobStore;

/// Default threshold after which a lease is assumed abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::minutes(5);

/// Default reaper cadence.
pub const DEFAULT_REAPER_CADENCE: StdDuration = StdDuration::from_secs(60);

pub struct LeaseManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    stale_threshold: Duration,
    /// Total leases cleared by this instance's reaper (for metrics).
    reaped_total: AtomicU64,
}

impl<S: JobStore> LeaseManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, stale_threshold: Duration) -> Self {
        Self {
            store,
            clock,
            stale_threshold,
            reaped_total: AtomicU64::new(0),
        }
    }

    /// Try to take the job's lease. Returns the token iff we won the race.
    pub async fn acquire(&self, job_id: JobId) -> Result<Option<Uuid>> {
        let token = Uuid::new_v4();
        let won = self
            .store
            .acquire_lease(job_id, token, self.clock.now())
            .await?;
        Ok(won.then_some(token))
    }

    /// Release, a no-op if the token is no longer held (already reaped).
    pub async fn release(&self, job_id: JobId, token: Uuid) -> Result<bool> {
        self.store.release_lease(job_id, token).await
    }

    /// One reaper pass. Returns the jobs whose leases were cleared.
    pub async fn reap(&self) -> Result<Vec<JobId>> {
        let reaped = self
            .store
            .reap_stale_leases(self.clock.now(), self.stale_threshold)
            .await?;
        if !reaped.is_empty() {
            self.reaped_total
                .fetch_add(reaped.len() as u64, Ordering::Relaxed);
            info!(count = reaped.len(), "cleared stale job leases");
        }
        Ok(reaped)
    }

    pub fn reaped_total(&self) -> u64 {
        self.reaped_total.load(Ordering::Relaxed)
    }

    /// Periodic reaper; runs until cancelled. Store errors are logged and
    /// retried on the next tick.
    pub async fn run_reaper(self: Arc<Self>, cadence: StdDuration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reap().await {
                        warn!(error = %e, "stale-lease reaper pass failed");
                    }
                }
            }
        }
        info!("stale-lease reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::job::{Job, JobStatus, SourceId};
    use crate::store::MemoryJobStore;
    use chrono::Utc;

    fn scheduled_job() -> Job {
        Job::builder()
            .source_id(SourceId(Uuid::now_v7()))
            .url("https://example.test/")
            .status(JobStatus::Scheduled)
            .interval_minutes(30)
            .next_run_at(Utc::now())
            .build()
    }

    #[tokio::test]
    async fn only_one_acquire_wins() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create_job(scheduled_job()).await.unwrap();
        let manager = LeaseManager::new(
            store.clone(),
            Arc::new(SystemClock),
            DEFAULT_STALE_THRESHOLD,
        );

        let first = manager.acquire(job.id).await.unwrap();
        assert!(first.is_some());
        let second = manager.acquire(job.id).await.unwrap();
        assert!(second.is_none());

        assert!(manager.release(job.id, first.unwrap()).await.unwrap());
        assert!(manager.acquire(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reap_counts_cleared_leases() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create_job(scheduled_job()).await.unwrap();
        let token = Uuid::new_v4();
        store
            .acquire_lease(job.id, token, Utc::now() - Duration::minutes(6))
            .await
            .unwrap();

        let manager = LeaseManager::new(
            store.clone(),
            Arc::new(SystemClock),
            DEFAULT_STALE_THRESHOLD,
        );
        let reaped = manager.reap().await.unwrap();
        assert_eq!(reaped, vec![job.id]);
        assert_eq!(manager.reaped_total(), 1);
    }
}
