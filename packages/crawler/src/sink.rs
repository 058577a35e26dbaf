//! Output interfaces: the indexing sink for canonical records and the
//! optional raw-HTML blob store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use scheduler::SourceId;

use crate::extract::CanonicalRecord;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unreachable: {0}")]
    Transport(String),

    #[error("sink rejected record: {0}")]
    Rejected(String),
}

/// Destination for canonical records. Duplicate emissions for the same
/// (source_id, canonical_url) MUST be tolerated by implementations.
#[async_trait]
pub trait ContentSink: Send + Sync {
    async fn publish(&self, record: &CanonicalRecord) -> Result<(), SinkError>;
}

/// Optional raw-HTML archive keyed by (source_id, content_hash); returns an
/// opaque reference embedded in the record.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        source_id: SourceId,
        content_hash: &str,
        html: &str,
    ) -> Result<String, SinkError>;
}

#[derive(Serialize)]
struct IndexDocument<'a> {
    #[serde(flatten)]
    record: &'a CanonicalRecord,
    classification_status: &'static str,
}

/// HTTP push to the external indexing service.
pub struct HttpContentSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpContentSink {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ContentSink for HttpContentSink {
    async fn publish(&self, record: &CanonicalRecord) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&IndexDocument {
                record,
                classification_status: "pending",
            })
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(SinkError::Transport(format!("sink returned {status}")))
        } else {
            Err(SinkError::Rejected(format!("sink returned {status}")))
        }
    }
}

/// In-memory sink for tests: records are kept in emission order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<CanonicalRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CanonicalRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentSink for MemorySink {
    async fn publish(&self, record: &CanonicalRecord) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<(SourceId, String), String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        source_id: SourceId,
        content_hash: &str,
        html: &str,
    ) -> Result<String, SinkError> {
        let reference = format!("blob://{source_id}/{content_hash}");
        self.blobs
            .lock()
            .unwrap()
            .insert((source_id, content_hash.to_string()), html.to_string());
        Ok(reference)
    }
}
