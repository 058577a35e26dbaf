//! Execution records: one row per attempt, with typed metadata views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::job::JobId;

/// Unique identifier for a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// One attempt by one instance to run one job.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    /// Monotonic per job.
    pub execution_number: i32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub items_crawled: i64,
    pub items_indexed: i64,
    pub error_message: Option<String>,
    pub retry_attempt: i32,
    /// Stored opaque; parse with [`ExecutionMetadata::from_value`].
    pub metadata: serde_json::Value,
}

/// Crawl counters recorded on an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlMetrics {
    pub pages_fetched: u32,
    pub pages_failed: u32,
    pub links_discovered: u32,
    pub max_depth_seen: u32,
}

/// Selector-drift signals recorded on an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionQuality {
    pub empty_title: u32,
    pub empty_body: u32,
    pub used_readability_fallback: u32,
}

/// Typed view over the opaque execution metadata bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub crawl: CrawlMetrics,
    #[serde(default)]
    pub quality: ExtractionQuality,
}

impl ExecutionMetadata {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_through_json() {
        let meta = ExecutionMetadata {
            crawl: CrawlMetrics {
                pages_fetched: 12,
                pages_failed: 1,
                links_discovered: 40,
                max_depth_seen: 2,
            },
            quality: ExtractionQuality {
                empty_title: 1,
                empty_body: 0,
                used_readability_fallback: 1,
            },
        };
        let value = meta.to_value();
        assert_eq!(ExecutionMetadata::from_value(&value), meta);
    }

    #[test]
    fn metadata_tolerates_foreign_bags() {
        let parsed = ExecutionMetadata::from_value(&serde_json::json!({"legacy": true}));
        assert_eq!(parsed, ExecutionMetadata::default());
        assert_eq!(
            ExecutionMetadata::from_value(&serde_json::Value::Null),
            ExecutionMetadata::default()
        );
    }
}
