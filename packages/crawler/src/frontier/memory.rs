//! In-memory `FrontierStore` for tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;

use super::{DiscoveredLink, FrontierEntry, FrontierEntryId, FrontierStatus, FrontierStore, Submitted};

#[derive(Default)]
struct Inner {
    entries: HashMap<FrontierEntryId, FrontierEntry>,
    discovered: Vec<DiscoveredLink>,
}

#[derive(Default)]
pub struct MemoryFrontierStore {
    inner: Mutex<Inner>,
}

impl MemoryFrontierStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovered_links(&self) -> Vec<DiscoveredLink> {
        self.inner.lock().unwrap().discovered.clone()
    }
}

#[async_trait]
impl FrontierStore for MemoryFrontierStore {
    async fn insert_pending(&self, entry: FrontierEntry) -> Result<Submitted> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .entries
            .values()
            .find(|e| e.origin == entry.origin && e.url_hash == entry.url_hash)
        {
            return Ok(Submitted::Duplicate(existing.id));
        }
        let id = entry.id;
        inner.entries.insert(id, entry);
        Ok(Submitted::Created(id))
    }

    async fn get(&self, id: FrontierEntryId) -> Result<Option<FrontierEntry>> {
        Ok(self.inner.lock().unwrap().entries.get(&id).cloned())
    }

    async fn lease(
        &self,
        origin: Uuid,
        n: i64,
        host_limit: i64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<FrontierEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let mut due: Vec<FrontierEntryId> = inner
            .entries
            .values()
            .filter(|e| {
                e.origin == origin
                    && e.status == FrontierStatus::Pending
                    && e.next_fetch_at <= now
            })
            .map(|e| e.id)
            .collect();
        due.sort_by_key(|id| {
            let e = &inner.entries[id];
            (std::cmp::Reverse(e.priority), e.next_fetch_at, e.id.0)
        });

        let mut per_host: HashMap<String, i64> = HashMap::new();
        let mut leased = Vec::new();
        for id in due {
            if leased.len() as i64 >= n {
                break;
            }
            let host = inner.entries[&id].host.clone();
            let count = per_host.entry(host).or_insert(0);
            if *count >= host_limit {
                continue;
            }
            *count += 1;
            let entry = inner.entries.get_mut(&id).unwrap();
            entry.status = FrontierStatus::Fetching;
            entry.lease_expires_at = Some(now + ttl);
            leased.push(entry.clone());
        }
        Ok(leased)
    }

    async fn complete_success(
        &self,
        id: FrontierEntryId,
        canonical_url: &str,
        canonical_hash: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get(&id) else {
            return Ok(());
        };
        let origin = entry.origin;

        // Redirect canonicalization: this row takes the canonical identity;
        // any other row already holding it is absorbed.
        if entry.url_hash != canonical_hash {
            let duplicate: Option<FrontierEntryId> = inner
                .entries
                .values()
                .find(|e| e.id != id && e.origin == origin && e.url_hash == canonical_hash)
                .map(|e| e.id);
            if let Some(dup) = duplicate {
                inner.entries.remove(&dup);
            }
        }

        let entry = inner.entries.get_mut(&id).unwrap();
        entry.url = canonical_url.to_string();
        entry.url_hash = canonical_hash.to_string();
        entry.status = FrontierStatus::Fetched;
        entry.fetch_count += 1;
        entry.last_fetched_at = Some(now);
        entry.content_hash = Some(content_hash.to_string());
        entry.last_error = None;
        entry.lease_expires_at = None;
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
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return Ok(());
        };
        entry.fetch_count += 1;
        entry.last_fetched_at = Some(now);
        entry.last_error = Some(error.to_string());
        entry.lease_expires_at = None;
        match retry_at {
            Some(at) => {
                entry.status = FrontierStatus::Pending;
                entry.retry_count += 1;
                entry.next_fetch_at = at;
            }
            None => {
                entry.status = terminal;
            }
        }
        Ok(())
    }

    async fn release(&self, id: FrontierEntryId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&id) {
            if entry.status == FrontierStatus::Fetching {
                entry.status = FrontierStatus::Pending;
                entry.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn delay_host(&self, host: &str, until: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.values_mut() {
            if entry.host == host
                && entry.status == FrontierStatus::Pending
                && entry.next_fetch_at < until
            {
                entry.next_fetch_at = until;
            }
        }
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut reclaimed = 0;
        for entry in inner.entries.values_mut() {
            if entry.status == FrontierStatus::Fetching
                && entry.lease_expires_at.map(|t| t < now).unwrap_or(true)
            {
                entry.status = FrontierStatus::Pending;
                entry.lease_expires_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn open_count(&self, origin: Uuid) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .values()
            .filter(|e| {
                e.origin == origin
                    && matches!(e.status, FrontierStatus::Pending | FrontierStatus::Fetching)
            })
            .count() as i64)
    }

    async fn terminal_failure_count(&self, origin: Uuid) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .values()
            .filter(|e| {
                e.origin == origin
                    && matches!(e.status, FrontierStatus::Failed | FrontierStatus::Dead)
            })
            .count() as i64)
    }

    async fn save_discovered_links(&self, links: Vec<DiscoveredLink>) -> Result<()> {
        self.inner.lock().unwrap().discovered.extend(links);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Frontier, FrontierConfig};
    use super::*;
    use crate::error::FetchError;
    use crate::urlnorm::{canonicalize, ContentHash};
    use scheduler::testing::ManualClock;
    use scheduler::Clock;
    use std::sync::Arc;

    fn frontier() -> (Arc<Frontier<MemoryFrontierStore>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let frontier = Arc::new(Frontier::new(
            Arc::new(MemoryFrontierStore::new()),
            clock.clone() as Arc<dyn Clock>,
            FrontierConfig::default(),
        ));
        (frontier, clock)
    }

    #[tokio::test]
    async fn submit_is_idempotent_within_origin() {
        let (frontier, _) = frontier();
        let origin = Uuid::now_v7();

        let first = frontier
            .submit(origin, "https://x.test/a", None, 0, 100)
            .await
            .unwrap();
        assert!(first.is_created());

        // Same URL, different spelling: same row.
        let second = frontier
            .submit(origin, "https://x.test/a#frag", None, 0, 100)
            .await
            .unwrap();
        assert_eq!(second, Submitted::Duplicate(first.entry_id()));

        // A different origin gets its own row.
        let other = frontier
            .submit(Uuid::now_v7(), "https://x.test/a", None, 0, 100)
            .await
            .unwrap();
        assert!(other.is_created());
    }

    #[tokio::test]
    async fn redirect_canonicalization_absorbs_and_dedups() {
        let (frontier, _) = frontier();
        let origin = Uuid::now_v7();

        // http://x.test/a 301s to https://x.test/a.
        let submitted = frontier
            .submit(origin, "http://x.test/a", None, 0, 100)
            .await
            .unwrap();
        let entry = frontier.get(submitted.entry_id()).await.unwrap().unwrap();
        let leased = frontier.lease(origin, 1, 1).await.unwrap();
        assert_eq!(leased.len(), 1);

        let final_url = canonicalize("https://x.test/a").unwrap();
        frontier
            .complete_success(
                &entry,
                &final_url,
                &ContentHash::from_content("body"),
                Duration::seconds(1),
            )
            .await
            .unwrap();

        // The row's url now reads the canonical form.
        let entry = frontier.get(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.url, "https://x.test/a");
        assert_eq!(entry.status, FrontierStatus::Fetched);

        // A later submit of the canonical URL is deduplicated.
        let again = frontier
            .submit(origin, "https://x.test/a", None, 0, 100)
            .await
            .unwrap();
        assert_eq!(again, Submitted::Duplicate(entry.id));
    }

    #[tokio::test]
    async fn redirect_target_already_submitted_is_absorbed() {
        let (frontier, _) = frontier();
        let origin = Uuid::now_v7();

        let original = frontier
            .submit(origin, "http://x.test/a", None, 0, 100)
            .await
            .unwrap();
        let target = frontier
            .submit(origin, "https://x.test/a", None, 1, 50)
            .await
            .unwrap();
        assert_ne!(original.entry_id(), target.entry_id());

        let entry = frontier.get(original.entry_id()).await.unwrap().unwrap();
        let final_url = canonicalize("https://x.test/a").unwrap();
        frontier
            .complete_success(
                &entry,
                &final_url,
                &ContentHash::from_content("body"),
                Duration::seconds(1),
            )
            .await
            .unwrap();

        // One row remains for the canonical URL: the fetched one.
        assert!(frontier.get(target.entry_id()).await.unwrap().is_none());
        let survivor = frontier.get(original.entry_id()).await.unwrap().unwrap();
        assert_eq!(survivor.url, "https://x.test/a");
        assert_eq!(survivor.fetch_count, 1);
    }

    #[tokio::test]
    async fn lease_honors_host_limit_and_politeness() {
        let (frontier, clock) = frontier();
        let origin = Uuid::now_v7();
        for path in ["a", "b", "c"] {
            frontier
                .submit(origin, &format!("https://x.test/{path}"), None, 1, 50)
                .await
                .unwrap();
        }
        frontier
            .submit(origin, "https://y.test/only", None, 1, 50)
            .await
            .unwrap();

        // host_limit 1: one x.test entry plus the y.test entry.
        let leased = frontier.lease(origin, 10, 1).await.unwrap();
        assert_eq!(leased.len(), 2);
        let hosts: Vec<&str> = leased.iter().map(|e| e.host.as_str()).collect();
        assert!(hosts.contains(&"x.test"));
        assert!(hosts.contains(&"y.test"));

        // Completing the x.test fetch delays its siblings.
        let x_entry = leased.iter().find(|e| e.host == "x.test").unwrap();
        frontier
            .complete_success(
                x_entry,
                &canonicalize(&x_entry.url).unwrap(),
                &ContentHash::from_content("body"),
                Duration::seconds(30),
            )
            .await
            .unwrap();

        let nothing_due = frontier.lease(origin, 10, 10).await.unwrap();
        assert!(nothing_due.is_empty());

        clock.advance(Duration::seconds(31));
        let due_again = frontier.lease(origin, 10, 10).await.unwrap();
        assert_eq!(due_again.len(), 2);
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_die() {
        let (frontier, clock) = frontier();
        let origin = Uuid::now_v7();
        frontier
            .submit(origin, "https://x.test/flaky", None, 0, 100)
            .await
            .unwrap();

        let timeout = FetchError::Timeout {
            url: "https://x.test/flaky".into(),
        };
        for attempt in 1..=3 {
            let leased = frontier.lease(origin, 1, 1).await.unwrap();
            assert_eq!(leased.len(), 1, "attempt {attempt} should lease");
            frontier
                .complete_failure(&leased[0], &timeout, Duration::zero())
                .await
                .unwrap();
            let entry = frontier.get(leased[0].id).await.unwrap().unwrap();
            assert_eq!(entry.status, FrontierStatus::Pending);
            assert_eq!(entry.retry_count, attempt);
            clock.advance(Duration::seconds(3600));
        }

        // Fourth failure exhausts the budget.
        let leased = frontier.lease(origin, 1, 1).await.unwrap();
        frontier
            .complete_failure(&leased[0], &timeout, Duration::zero())
            .await
            .unwrap();
        let entry = frontier.get(leased[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, FrontierStatus::Dead);
        assert_eq!(frontier.open_count(origin).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_retryable_failures_die_immediately() {
        let (frontier, _) = frontier();
        let origin = Uuid::now_v7();
        frontier
            .submit(origin, "https://x.test/gone", None, 0, 100)
            .await
            .unwrap();
        let leased = frontier.lease(origin, 1, 1).await.unwrap();

        frontier
            .complete_failure(
                &leased[0],
                &FetchError::HttpStatus {
                    status: 404,
                    url: "https://x.test/gone".into(),
                },
                Duration::zero(),
            )
            .await
            .unwrap();
        let entry = frontier.get(leased[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, FrontierStatus::Dead);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn redirect_blowup_is_failed_not_dead() {
        let (frontier, _) = frontier();
        let origin = Uuid::now_v7();
        frontier
            .submit(origin, "https://x.test/loop", None, 0, 100)
            .await
            .unwrap();
        let leased = frontier.lease(origin, 1, 1).await.unwrap();

        frontier
            .complete_failure(
                &leased[0],
                &FetchError::TooManyRedirects { max: 5 },
                Duration::zero(),
            )
            .await
            .unwrap();
        let entry = frontier.get(leased[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, FrontierStatus::Failed);
        let last_error = entry.last_error.unwrap();
        assert!(last_error.starts_with("too_many_redirects:"), "{last_error}");
    }

    #[tokio::test]
    async fn expired_fetch_leases_return_to_pending() {
        let (frontier, clock) = frontier();
        let origin = Uuid::now_v7();
        frontier
            .submit(origin, "https://x.test/slow", None, 0, 100)
            .await
            .unwrap();
        let leased = frontier.lease(origin, 1, 1).await.unwrap();
        assert_eq!(leased.len(), 1);

        // Within the TTL nothing is reclaimed.
        assert_eq!(frontier.reap_expired().await.unwrap(), 0);

        clock.advance(Duration::minutes(3));
        assert_eq!(frontier.reap_expired().await.unwrap(), 1);
        let entry = frontier.get(leased[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, FrontierStatus::Pending);
        assert!(entry.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn release_preserves_retry_state() {
        let (frontier, _) = frontier();
        let origin = Uuid::now_v7();
        frontier
            .submit(origin, "https://x.test/cancelme", None, 0, 100)
            .await
            .unwrap();
        let leased = frontier.lease(origin, 1, 1).await.unwrap();

        frontier.release(&leased[0]).await.unwrap();
        let entry = frontier.get(leased[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, FrontierStatus::Pending);
        assert_eq!(entry.fetch_count, 0);
        assert_eq!(entry.retry_count, 0);
    }
}
