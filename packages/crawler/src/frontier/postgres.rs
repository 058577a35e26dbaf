//! PostgreSQL-backed `FrontierStore`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

use super::{DiscoveredLink, FrontierEntry, FrontierEntryId, FrontierStatus, FrontierStore, Submitted};

const ENTRY_COLUMNS: &str = "id, url, url_hash, host, origin, parent_url, depth, priority, status, \
     next_fetch_at, fetch_count, last_fetched_at, content_hash, retry_count, last_error, \
     lease_expires_at, created_at";

pub struct PostgresFrontierStore {
    pool: PgPool,
}

impl PostgresFrontierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FrontierStore for PostgresFrontierStore {
    async fn insert_pending(&self, entry: FrontierEntry) -> Result<Submitted> {
        // ON CONFLICT DO NOTHING + a second lookup keeps the insert a
        // single race-free statement on the (origin, url_hash) unique index.
        let inserted = sqlx::query_scalar::<_, FrontierEntryId>(&format!(
            r#"
            INSERT INTO frontier_entries ({ENTRY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (origin, url_hash) DO NOTHING
            RETURNING id
            "#,
        ))
        .bind(entry.id)
        .bind(&entry.url)
        .bind(&entry.url_hash)
        .bind(&entry.host)
        .bind(entry.origin)
        .bind(&entry.parent_url)
        .bind(entry.depth)
        .bind(entry.priority)
        .bind(entry.status)
        .bind(entry.next_fetch_at)
        .bind(entry.fetch_count)
        .bind(entry.last_fetched_at)
        .bind(&entry.content_hash)
        .bind(entry.retry_count)
        .bind(&entry.last_error)
        .bind(entry.lease_expires_at)
        .bind(entry.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(Submitted::Created(id));
        }

        let existing = sqlx::query_scalar::<_, FrontierEntryId>(
            "SELECT id FROM frontier_entries WHERE origin = $1 AND url_hash = $2",
        )
        .bind(entry.origin)
        .bind(&entry.url_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(Submitted::Duplicate(existing))
    }

    async fn get(&self, id: FrontierEntryId) -> Result<Option<FrontierEntry>> {
        let entry = sqlx::query_as::<_, FrontierEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM frontier_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn lease(
        &self,
        origin: Uuid,
        n: i64,
        host_limit: i64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<FrontierEntry>> {
        let entries = sqlx::query_as::<_, FrontierEntry>(&format!(
            r#"
            WITH ranked AS (
                SELECT id,
                       ROW_NUMBER() OVER (
                           PARTITION BY host
                           ORDER BY priority DESC, next_fetch_at ASC, id ASC
                       ) AS host_rank
                FROM frontier_entries
                WHERE origin = $1 AND status = 'pending' AND next_fetch_at <= $2
            ),
            picked AS (
                SELECT fe.id
                FROM frontier_entries fe
                JOIN ranked r ON r.id = fe.id
                WHERE r.host_rank <= $3
                ORDER BY fe.priority DESC, fe.next_fetch_at ASC
                LIMIT $4
                FOR UPDATE OF fe SKIP LOCKED
            )
            UPDATE frontier_entries
            SET status = 'fetching', lease_expires_at = $5
            WHERE id IN (SELECT id FROM picked)
            RETURNING {ENTRY_COLUMNS}
            "#,
        ))
        .bind(origin)
        .bind(now)
        .bind(host_limit)
        .bind(n)
        .bind(now + ttl)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn complete_success(
        &self,
        id: FrontierEntryId,
        canonical_url: &str,
        canonical_hash: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Absorb any other row already holding the canonical identity, so
        // the UPDATE below cannot trip the (origin, url_hash) unique index.
        sqlx::query(
            r#"
            DELETE FROM frontier_entries
            WHERE origin = (SELECT origin FROM frontier_entries WHERE id = $1)
              AND url_hash = $2
              AND id <> $1
            "#,
        )
        .bind(id)
        .bind(canonical_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE frontier_entries
            SET url = $2,
                url_hash = $3,
                status = 'fetched',
                fetch_count = fetch_count + 1,
                last_fetched_at = $4,
                content_hash = $5,
                last_error = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(canonical_url)
        .bind(canonical_hash)
        .bind(now)
        .bind(content_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete_failure(
        &self,
        id: FrontierEntryId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        terminal: FrontierStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match retry_at {
            Some(at) => {
                sqlx::query(
                    r#"
                    UPDATE frontier_entries
                    SET status = 'pending',
                        retry_count = retry_count + 1,
                        next_fetch_at = $2,
                        fetch_count = fetch_count + 1,
                        last_fetched_at = $3,
                        last_error = $4,
                        lease_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(at)
                .bind(now)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE frontier_entries
                    SET status = $2,
                        fetch_count = fetch_count + 1,
                        last_fetched_at = $3,
                        last_error = $4,
                        lease_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(terminal)
                .bind(now)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn release(&self, id: FrontierEntryId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE frontier_entries
            SET status = 'pending', lease_expires_at = NULL
            WHERE id = $1 AND status = 'fetching'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delay_host(&self, host: &str, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE frontier_entries
            SET next_fetch_at = $2
            WHERE host = $1 AND status = 'pending' AND next_fetch_at < $2
            "#,
        )
        .bind(host)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE frontier_entries
            SET status = 'pending', lease_expires_at = NULL
            WHERE status = 'fetching'
              AND (lease_expires_at IS NULL OR lease_expires_at < $1)
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn open_count(&self, origin: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM frontier_entries
            WHERE origin = $1 AND status IN ('pending', 'fetching')
            "#,
        )
        .bind(origin)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn terminal_failure_count(&self, origin: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM frontier_entries
            WHERE origin = $1 AND status IN ('failed', 'dead')
            "#,
        )
        .bind(origin)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn save_discovered_links(&self, links: Vec<DiscoveredLink>) -> Result<()> {
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO discovered_links
                    (id, source_id, parent_url, url, depth, discovered_at, status, priority)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(link.id)
            .bind(link.source_id)
            .bind(&link.parent_url)
            .bind(&link.url)
            .bind(link.depth)
            .bind(link.discovered_at)
            .bind(&link.status)
            .bind(link.priority)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
