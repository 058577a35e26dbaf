//! The URL frontier: a deduplicated, politeness-aware work pool.
//!
//! State lives in the store; fetched bodies never do. Within an origin the
//! `url_hash` is unique, so submitting the same URL twice is a no-op, and
//! redirect canonicalization folds duplicate spellings onto one row.

mod memory;
mod postgres;

pub use memory::MemoryFrontierStore;
pub use postgres::PostgresFrontierStore;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use scheduler::interval::retry_backoff;
use scheduler::{Clock, SourceId};

use crate::error::{FetchError, Result};
use crate::urlnorm::{canonicalize, url_hash, ContentHash};

/// Unique identifier for a frontier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct FrontierEntryId(pub Uuid);

impl FrontierEntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for FrontierEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FrontierEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "frontier_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FrontierStatus {
    #[default]
    Pending,
    Fetching,
    Fetched,
    /// Terminal, distinguishable from `dead`: the redirect chain blew up.
    Failed,
    /// Terminal: retries exhausted or the failure is not retryable.
    Dead,
}

/// A pending URL within an execution (or on-demand submission) origin.
#[derive(sqlx::FromRow, Debug, Clone, Serialize)]
pub struct FrontierEntry {
    pub id: FrontierEntryId,
    pub url: String,
    pub url_hash: String,
    pub host: String,
    /// Owning origin: a job id for executions, a source id for on-demand
    /// submissions. Opaque here.
    pub origin: Uuid,
    pub parent_url: Option<String>,
    pub depth: i32,
    pub priority: i32,
    pub status: FrontierStatus,
    pub next_fetch_at: DateTime<Utc>,
    pub fetch_count: i32,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    /// Set while `fetching`; the frontier reaper returns expired leases to
    /// `pending`.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Submit result, idempotent on `(origin, url_hash)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Created(FrontierEntryId),
    Duplicate(FrontierEntryId),
}

impl Submitted {
    pub fn entry_id(&self) -> FrontierEntryId {
        match self {
            Submitted::Created(id) | Submitted::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Submitted::Created(_))
    }
}

/// A link seen past `max_depth`, kept for operator review instead of being
/// promoted to the frontier.
#[derive(sqlx::FromRow, Debug, Clone, Serialize)]
pub struct DiscoveredLink {
    pub id: Uuid,
    pub source_id: SourceId,
    pub parent_url: String,
    pub url: String,
    pub depth: i32,
    pub discovered_at: DateTime<Utc>,
    pub status: String,
    pub priority: i32,
}

/// Storage operations behind the frontier. All mutations are atomic.
#[async_trait]
pub trait FrontierStore: Send + Sync {
    /// Insert unless `(origin, url_hash)` exists; returns the winning row.
    async fn insert_pending(&self, entry: FrontierEntry) -> Result<Submitted>;

    async fn get(&self, id: FrontierEntryId) -> Result<Option<FrontierEntry>>;

    /// Atomically move up to `n` due entries of `origin` from `pending` to
    /// `fetching`, at most `host_limit` per host, leased until `now + ttl`.
    async fn lease(
        &self,
        origin: Uuid,
        n: i64,
        host_limit: i64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<FrontierEntry>>;

    /// Success path; `canonical_url`/`canonical_hash` may differ from the
    /// stored ones after redirects, in which case this row absorbs the
    /// canonical identity (and any other row already holding it is dropped).
    async fn complete_success(
        &self,
        id: FrontierEntryId,
        canonical_url: &str,
        canonical_hash: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Failure path: with `retry_at` the entry returns to `pending`;
    /// without it the entry lands in `terminal` (failed or dead).
    async fn complete_failure(
        &self,
        id: FrontierEntryId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        terminal: FrontierStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Return a leased entry to `pending` untouched (cancellation path).
    async fn release(&self, id: FrontierEntryId) -> Result<()>;

    /// Politeness: push `next_fetch_at` of pending same-host entries to at
    /// least `until`.
    async fn delay_host(&self, host: &str, until: DateTime<Utc>) -> Result<()>;

    /// Expired `fetching` leases go back to `pending`, retry state intact.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Entries still pending or fetching for an origin.
    async fn open_count(&self, origin: Uuid) -> Result<i64>;

    /// Entries that ended in `failed` or `dead` for an origin.
    async fn terminal_failure_count(&self, origin: Uuid) -> Result<i64>;

    async fn save_discovered_links(&self, links: Vec<DiscoveredLink>) -> Result<()>;
}

/// Frontier tuning knobs.
#[derive(Debug, Clone)]
pub struct FrontierConfig {
    /// Per-entry fetch retry budget.
    pub max_retries: i32,
    /// Base for the per-entry retry backoff.
    pub retry_backoff_seconds: i32,
    /// How long a fetch lease lasts before the reaper reclaims it.
    pub fetch_lease_ttl: Duration,
    /// Reaper cadence.
    pub reaper_cadence: StdDuration,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_seconds: 30,
            fetch_lease_ttl: Duration::minutes(2),
            reaper_cadence: StdDuration::from_secs(30),
        }
    }
}

/// The frontier proper: dedup, leasing, politeness and retry policy over a
/// [`FrontierStore`].
pub struct Frontier<F> {
    store: Arc<F>,
    clock: Arc<dyn Clock>,
    config: FrontierConfig,
}

impl<F: FrontierStore> Frontier<F> {
    pub fn new(store: Arc<F>, clock: Arc<dyn Clock>, config: FrontierConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<F> {
        &self.store
    }

    /// Submit a URL; idempotent within the origin.
    pub async fn submit(
        &self,
        origin: Uuid,
        raw_url: &str,
        parent_url: Option<&str>,
        depth: i32,
        priority: i32,
    ) -> Result<Submitted> {
        let url = canonicalize(raw_url)?;
        let now = self.clock.now();
        let entry = FrontierEntry {
            id: FrontierEntryId::new(),
            url_hash: url_hash(&url),
            host: url.host_str().unwrap_or_default().to_string(),
            url: url.into(),
            origin,
            parent_url: parent_url.map(str::to_string),
            depth,
            priority,
            status: FrontierStatus::Pending,
            next_fetch_at: now,
            fetch_count: 0,
            last_fetched_at: None,
            content_hash: None,
            retry_count: 0,
            last_error: None,
            lease_expires_at: None,
            created_at: now,
        };
        let submitted = self.store.insert_pending(entry).await?;
        if submitted.is_created() {
            debug!(url = %raw_url, origin = %origin, depth, "frontier accepted url");
        }
        Ok(submitted)
    }

    /// Lease up to `n` due entries, at most `host_limit` per host.
    pub async fn lease(
        &self,
        origin: Uuid,
        n: i64,
        host_limit: i64,
    ) -> Result<Vec<FrontierEntry>> {
        self.store
            .lease(
                origin,
                n,
                host_limit,
                self.clock.now(),
                self.config.fetch_lease_ttl,
            )
            .await
    }

    /// Record a successful fetch. Redirects make `final_url` the canonical
    /// identity; the politeness delay pushes back the host's other entries.
    pub async fn complete_success(
        &self,
        entry: &FrontierEntry,
        final_url: &Url,
        content_hash: &ContentHash,
        per_host_delay: Duration,
    ) -> Result<()> {
        let now = self.clock.now();
        let canonical_hash = url_hash(final_url);
        self.store
            .complete_success(
                entry.id,
                final_url.as_str(),
                &canonical_hash,
                content_hash.as_hex(),
                now,
            )
            .await?;
        self.store
            .delay_host(&entry.host, now + per_host_delay)
            .await?;
        Ok(())
    }

    /// Record a failed fetch, applying the retry budget and the failure
    /// taxonomy. Redirect-chain blowups land in `failed`, everything else
    /// exhausted lands in `dead`.
    pub async fn complete_failure(
        &self,
        entry: &FrontierEntry,
        error: &FetchError,
        per_host_delay: Duration,
    ) -> Result<()> {
        let now = self.clock.now();
        let retryable = error.is_retryable() && entry.retry_count < self.config.max_retries;
        let (retry_at, terminal) = if retryable {
            let backoff = retry_backoff(self.config.retry_backoff_seconds, entry.retry_count + 1);
            (Some(now + backoff), FrontierStatus::Pending)
        } else if matches!(error, FetchError::TooManyRedirects { .. }) {
            (None, FrontierStatus::Failed)
        } else {
            (None, FrontierStatus::Dead)
        };

        // last_error leads with the failure bucket.
        let last_error = format!("{}: {}", error.bucket().as_str(), error);
        self.store
            .complete_failure(entry.id, &last_error, retry_at, terminal, now)
            .await?;
        self.store
            .delay_host(&entry.host, now + per_host_delay)
            .await?;

        if terminal != FrontierStatus::Pending {
            warn!(
                url = %entry.url,
                bucket = error.bucket().as_str(),
                status = ?terminal,
                "frontier entry terminal"
            );
        }
        Ok(())
    }

    /// Return a leased-but-unfetched entry to `pending` (cancellation).
    pub async fn release(&self, entry: &FrontierEntry) -> Result<()> {
        self.store.release(entry.id).await
    }

    pub async fn open_count(&self, origin: Uuid) -> Result<i64> {
        self.store.open_count(origin).await
    }

    pub async fn terminal_failure_count(&self, origin: Uuid) -> Result<i64> {
        self.store.terminal_failure_count(origin).await
    }

    pub async fn get(&self, id: FrontierEntryId) -> Result<Option<FrontierEntry>> {
        self.store.get(id).await
    }

    pub async fn save_discovered_links(&self, links: Vec<DiscoveredLink>) -> Result<()> {
        self.store.save_discovered_links(links).await
    }

    /// One reaper pass over expired fetch leases.
    pub async fn reap_expired(&self) -> Result<u64> {
        let reclaimed = self.store.reap_expired(self.clock.now()).await?;
        if reclaimed > 0 {
            info!(count = reclaimed, "returned expired fetch leases to pending");
        }
        Ok(reclaimed)
    }

    /// Periodic lease reaper; runs until cancelled.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reaper_cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reap_expired().await {
                        warn!(error = %e, "frontier lease reaper pass failed");
                    }
                }
            }
        }
    }
}
