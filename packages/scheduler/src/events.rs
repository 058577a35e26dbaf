//! Event types: external source lifecycle in, execution lifecycle out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::execution::ExecutionId;
use crate::job::{JobId, SourceId};

/// External source lifecycle events the core reconciles against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceEvent {
    SourceEnabled { source_id: SourceId },
    SourceDisabled { source_id: SourceId },
}

/// Stream of source lifecycle events (NATS in production, a channel in
/// tests). `None` means the stream closed.
#[async_trait]
pub trait EventSubscriber: Send {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>>;
}

/// Execution lifecycle notifications published in-process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        job_id: JobId,
    },
    Completed {
        job_id: JobId,
        execution_id: ExecutionId,
        items_indexed: i64,
    },
    Failed {
        job_id: JobId,
        execution_id: Option<ExecutionId>,
        error: String,
    },
    Cancelled {
        job_id: JobId,
        execution_id: Option<ExecutionId>,
    },
}

/// Broadcast channel for execution events; receivers that lag simply drop
/// old notifications.
pub fn execution_events(capacity: usize) -> broadcast::Sender<ExecutionEvent> {
    broadcast::channel(capacity).0
}
