//! Test doubles shared across the workspace's test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::hash_store::ContentHashStore;
use crate::job::Job;
use crate::scheduler::{ExecutionHandler, ExecutionOutcome, ExecutionReport};
use crate::store::JobStore;

/// Settable clock for deterministic scheduling tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Scripted outcome for one `StubHandler` execution.
#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Succeed; when `content` is set, record its hash for the source the
    /// way the real runtime does for the seed URL.
    Success { content: Option<String> },
    Failure { error: String },
    Cancelled,
}

/// ExecutionHandler double: opens a real execution row, then reports a
/// scripted outcome. Defaults to success when the script runs dry.
pub struct StubHandler<S> {
    store: Arc<S>,
    hash_store: Arc<dyn ContentHashStore>,
    clock: Arc<dyn Clock>,
    script: Mutex<VecDeque<StubOutcome>>,
    executed: AtomicUsize,
}

impl<S: JobStore> StubHandler<S> {
    pub fn new(
        store: Arc<S>,
        hash_store: Arc<dyn ContentHashStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            hash_store,
            clock,
            script: Mutex::new(VecDeque::new()),
            executed: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, outcome: StubOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: JobStore> ExecutionHandler for StubHandler<S> {
    async fn execute(&self, job: &Job, _cancel: CancellationToken) -> ExecutionReport {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let started_at = self.clock.now();

        let execution = match self
            .store
            .open_execution(job.id, job.current_retry_count, started_at)
            .await
        {
            Ok(execution) => execution,
            Err(e) => return ExecutionReport::aborted(started_at, e.to_string()),
        };

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StubOutcome::Success { content: None });

        match outcome {
            StubOutcome::Success { content } => {
                if let Some(content) = content {
                    let hash = format!("{:x}", fnv1a(&content));
                    let _ = self
                        .hash_store
                        .record(job.source_id, &hash, started_at)
                        .await;
                }
                ExecutionReport {
                    execution_id: Some(execution.id),
                    outcome: ExecutionOutcome::Success,
                    started_at,
                    items_crawled: 1,
                    items_indexed: 1,
                    metadata: serde_json::Value::Null,
                }
            }
            StubOutcome::Failure { error } => ExecutionReport {
                execution_id: Some(execution.id),
                outcome: ExecutionOutcome::Failed { error },
                started_at,
                items_crawled: 0,
                items_indexed: 0,
                metadata: serde_json::Value::Null,
            },
            StubOutcome::Cancelled => ExecutionReport {
                execution_id: Some(execution.id),
                outcome: ExecutionOutcome::Cancelled,
                started_at,
                items_crawled: 0,
                items_indexed: 0,
                metadata: serde_json::Value::Null,
            },
        }
    }
}

// A tiny stable hash so stub content maps to a deterministic fingerprint
// without pulling crypto into this package.
fn fnv1a(content: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in content.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
