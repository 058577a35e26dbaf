//! Source lifecycle events: NATS subscription and reconciliation.
//!
//! `source.enabled` creates the corresponding job, `source.disabled`
//! cancels it; `reconcile_sources` does a full sweep for missed events.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crawler::{SourceConfig, SourceProvider};
use scheduler::{
    EventSubscriber, IntervalType, JobFilter, JobStore, NewJob, Page, Scheduler, SchedulerError,
    SourceEvent, SourceId,
};

use crate::error::ApiResult;

/// Interval used when a source config does not carry one.
const DEFAULT_REFRESH_MINUTES: i32 = 60;

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub cancelled: usize,
    pub unchanged: usize,
}

fn job_from_source(source: &SourceConfig) -> NewJob {
    NewJob {
        source_id: source.id,
        url: source.url.clone(),
        interval_minutes: Some(
            source
                .refresh_interval_minutes
                .filter(|m| *m > 0)
                .unwrap_or(DEFAULT_REFRESH_MINUTES),
        ),
        interval_type: IntervalType::Minutes,
        schedule_enabled: true,
        adaptive_scheduling: true,
        max_retries: None,
        retry_backoff_seconds: None,
        metadata: None,
    }
}

async fn active_jobs<S: JobStore>(
    store: &S,
) -> Result<Vec<scheduler::Job>, SchedulerError> {
    let (jobs, _) = store
        .list_jobs(
            &JobFilter::default(),
            Page {
                limit: 10_000,
                offset: 0,
            },
        )
        .await?;
    Ok(jobs
        .into_iter()
        .filter(|j| !j.status.is_terminal())
        .collect())
}

/// Create a job for `source` unless one is already live.
async fn ensure_job<S: JobStore + 'static>(
    scheduler: &Scheduler<S>,
    store: &S,
    source: &SourceConfig,
) -> Result<bool, SchedulerError> {
    let live = active_jobs(store)
        .await?
        .into_iter()
        .any(|j| j.source_id == source.id);
    if live {
        return Ok(false);
    }
    let job = scheduler.create_job(job_from_source(source)).await?;
    info!(source_id = %source.id, job_id = %job.id, "created job for enabled source");
    Ok(true)
}

/// Cancel every live job of a source. Races with completions are fine;
/// a job that just went terminal is simply skipped.
async fn cancel_jobs_for_source<S: JobStore + 'static>(
    scheduler: &Scheduler<S>,
    store: &S,
    source_id: SourceId,
) -> Result<usize, SchedulerError> {
    let mut cancelled = 0;
    for job in active_jobs(store).await? {
        if job.source_id != source_id {
            continue;
        }
        match scheduler.cancel(job.id).await {
            Ok(_) => cancelled += 1,
            Err(SchedulerError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(cancelled)
}

/// Full reconciliation: jobs exist exactly for the enabled sources.
pub async fn reconcile_sources<S: JobStore + 'static>(
    scheduler: &Scheduler<S>,
    store: &S,
    sources: &dyn SourceProvider,
) -> ApiResult<ReconcileReport> {
    let enabled = sources.list_enabled().await?;
    let enabled_ids: HashSet<SourceId> = enabled.iter().map(|s| s.id).collect();

    let mut report = ReconcileReport::default();
    for source in &enabled {
        if ensure_job(scheduler, store, source).await? {
            report.created += 1;
        } else {
            report.unchanged += 1;
        }
    }

    for job in active_jobs(store).await? {
        if !enabled_ids.contains(&job.source_id) {
            match scheduler.cancel(job.id).await {
                Ok(_) => report.cancelled += 1,
                Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!(
        created = report.created,
        cancelled = report.cancelled,
        unchanged = report.unchanged,
        "source reconciliation complete"
    );
    Ok(report)
}

/// Consume source events until the stream closes or shutdown is signalled.
pub async fn run_event_loop<S: JobStore + 'static>(
    mut subscriber: impl EventSubscriber,
    scheduler: Arc<Scheduler<S>>,
    store: Arc<S>,
    sources: Arc<dyn SourceProvider>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = subscriber.next_event() => event,
        };
        match event {
            Ok(Some(SourceEvent::SourceEnabled { source_id })) => {
                match sources.get_source(source_id).await {
                    Ok(Some(source)) => {
                        if let Err(e) = ensure_job(&scheduler, &store, &source).await {
                            warn!(source_id = %source_id, error = %e, "failed to create job for enabled source");
                        }
                    }
                    Ok(None) => {
                        warn!(source_id = %source_id, "enabled event for unknown source");
                    }
                    Err(e) => {
                        warn!(source_id = %source_id, error = %e, "source lookup failed");
                    }
                }
            }
            Ok(Some(SourceEvent::SourceDisabled { source_id })) => {
                match cancel_jobs_for_source(&scheduler, &store, source_id).await {
                    Ok(count) if count > 0 => {
                        info!(source_id = %source_id, cancelled = count, "cancelled jobs for disabled source");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(source_id = %source_id, error = %e, "failed to cancel jobs for disabled source");
                    }
                }
            }
            Ok(None) => {
                warn!("source event stream closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "source event stream error");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
    info!("source event loop stopped");
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    source_id: Uuid,
}

/// NATS-backed source event stream on `source.enabled` / `source.disabled`.
pub struct NatsEventSubscriber {
    // Keeps the connection alive for the subscriber's lifetime.
    _client: async_nats::Client,
    subscriber: async_nats::Subscriber,
}

impl NatsEventSubscriber {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(url).await?;
        let subscriber = client.subscribe("source.*").await?;
        info!(url = %url, "subscribed to source lifecycle events");
        Ok(Self {
            _client: client,
            subscriber,
        })
    }
}

#[async_trait]
impl EventSubscriber for NatsEventSubscriber {
    async fn next_event(&mut self) -> scheduler::Result<Option<SourceEvent>> {
        loop {
            let Some(message) = self.subscriber.next().await else {
                return Ok(None);
            };
            let payload: EventPayload = match serde_json::from_slice(&message.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(subject = %message.subject, error = %e, "undecodable source event");
                    continue;
                }
            };
            let source_id = SourceId(payload.source_id);
            match message.subject.as_str() {
                "source.enabled" => return Ok(Some(SourceEvent::SourceEnabled { source_id })),
                "source.disabled" => return Ok(Some(SourceEvent::SourceDisabled { source_id })),
                other => {
                    warn!(subject = %other, "ignoring unexpected source event subject");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawler::{SelectorSet, StaticSourceProvider};
    use scheduler::testing::{ManualClock, StubHandler};
    use scheduler::{
        Clock, ContentHashStore, JobStatus, MemoryContentHashStore, MemoryJobStore,
        SchedulerConfig,
    };

    fn source(id: SourceId, enabled: bool) -> SourceConfig {
        SourceConfig {
            id,
            name: "A Source".into(),
            url: "https://x.test/".into(),
            rate_limit_ms: 0,
            max_depth: 3,
            enabled,
            refresh_interval_minutes: Some(30),
            selectors: SelectorSet::default(),
        }
    }

    fn scheduler_over(store: Arc<MemoryJobStore>) -> Arc<Scheduler<MemoryJobStore>> {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let hash_store = Arc::new(MemoryContentHashStore::new());
        let handler = Arc::new(StubHandler::new(
            store.clone(),
            hash_store.clone() as Arc<dyn ContentHashStore>,
            clock.clone() as Arc<dyn Clock>,
        ));
        Arc::new(Scheduler::new(
            store,
            hash_store,
            handler,
            clock,
            SchedulerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn reconciliation_creates_and_cancels() {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = scheduler_over(store.clone());
        let enabled_id = SourceId(Uuid::now_v7());
        let provider = StaticSourceProvider::new().with_source(source(enabled_id, true));

        // First sweep creates the job.
        let report = reconcile_sources(&scheduler, store.as_ref(), &provider)
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.cancelled, 0);

        // Second sweep is a no-op.
        let report = reconcile_sources(&scheduler, store.as_ref(), &provider)
            .await
            .unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.unchanged, 1);

        // A job whose source disappeared from the enabled set is cancelled.
        let empty_provider = StaticSourceProvider::new();
        let report = reconcile_sources(&scheduler, store.as_ref(), &empty_provider)
            .await
            .unwrap();
        assert_eq!(report.cancelled, 1);

        let (jobs, _) = store
            .list_jobs(&JobFilter::default(), Page::default())
            .await
            .unwrap();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled));
    }
}
