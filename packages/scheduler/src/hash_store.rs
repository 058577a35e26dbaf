//! Per-source content fingerprint store, the adaptive-scheduling input.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::error::Result;
use crate::job::SourceId;

/// Last successful seed-URL fingerprint for a source.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct SourceContentHash {
    pub source_id: SourceId,
    pub content_hash: String,
    pub unchanged_count: i32,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of recording an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedChange {
    /// True when the content differs from the previous observation
    /// (or no previous observation existed).
    pub changed: bool,
    /// The unchanged streak after this observation.
    pub unchanged_count: i32,
}

/// Storage for seed-content fingerprints. Split from the event subscriber
/// so either backend can be swapped independently.
#[async_trait]
pub trait ContentHashStore: Send + Sync {
    async fn get(&self, source_id: SourceId) -> Result<Option<SourceContentHash>>;

    /// Record an observation: same hash increments the unchanged streak,
    /// a different hash resets it to zero. One read-modify-write
    /// transaction, last-writer-wins per source.
    async fn record(
        &self,
        source_id: SourceId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ObservedChange>;
}

pub struct PostgresContentHashStore {
    pool: PgPool,
}

impl PostgresContentHashStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentHashStore for PostgresContentHashStore {
    async fn get(&self, source_id: SourceId) -> Result<Option<SourceContentHash>> {
        let row = sqlx::query_as::<_, SourceContentHash>(
            r#"
            SELECT source_id, content_hash, unchanged_count, updated_at
            FROM source_content_hashes
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn record(
        &self,
        source_id: SourceId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ObservedChange> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, SourceContentHash>(
            r#"
            SELECT source_id, content_hash, unchanged_count, updated_at
            FROM source_content_hashes
            WHERE source_id = $1
            FOR UPDATE
            "#,
        )
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (changed, unchanged_count) = match &existing {
            Some(prev) if prev.content_hash == content_hash => (false, prev.unchanged_count + 1),
            Some(_) => (true, 0),
            None => (true, 0),
        };

        sqlx::query(
            r#"
            INSERT INTO source_content_hashes (source_id, content_hash, unchanged_count, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id) DO UPDATE SET
                content_hash = EXCLUDED.content_hash,
                unchanged_count = EXCLUDED.unchanged_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(source_id)
        .bind(content_hash)
        .bind(unchanged_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ObservedChange {
            changed,
            unchanged_count,
        })
    }
}

/// In-memory implementation for tests and local development.
#[derive(Default)]
pub struct MemoryContentHashStore {
    inner: Mutex<HashMap<SourceId, SourceContentHash>>,
}

impl MemoryContentHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentHashStore for MemoryContentHashStore {
    async fn get(&self, source_id: SourceId) -> Result<Option<SourceContentHash>> {
        Ok(self.inner.lock().unwrap().get(&source_id).cloned())
    }

    async fn record(
        &self,
        source_id: SourceId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ObservedChange> {
        let mut inner = self.inner.lock().unwrap();
        let (changed, unchanged_count) = match inner.get(&source_id) {
            Some(prev) if prev.content_hash == content_hash => (false, prev.unchanged_count + 1),
            _ => (true, 0),
        };
        inner.insert(
            source_id,
            SourceContentHash {
                source_id,
                content_hash: content_hash.to_string(),
                unchanged_count,
                updated_at: now,
            },
        );
        Ok(ObservedChange {
            changed,
            unchanged_count,
        })
    }
}
