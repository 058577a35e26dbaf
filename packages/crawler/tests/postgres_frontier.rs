//! Integration tests for the Postgres frontier store.
//!
//! Gated on `DATABASE_URL` pointing at a disposable Postgres; run with
//! `cargo test -p crawler -- --ignored`. Each test pins its own schema so
//! concurrent runs do not collide.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crawler::{
    canonicalize, url_hash, DiscoveredLink, FrontierEntry, FrontierEntryId, FrontierStatus,
    FrontierStore, PostgresFrontierStore, Submitted,
};
use scheduler::SourceId;

mod harness {
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use sqlx::PgPool;
    use std::str::FromStr;

    const CORE_SCHEMA: &str = include_str!("../../server/migrations/0001_intake_core.sql");

    /// Connect to `DATABASE_URL`, pinned to a fresh schema, with the core
    /// schema applied.
    pub async fn pool(schema: &str) -> PgPool {
        let url = std::env::var("DATABASE_URL")
            .expect("set DATABASE_URL to a disposable Postgres to run the gated tests");
        let options = PgConnectOptions::from_str(&url)
            .expect("DATABASE_URL must be a valid Postgres URL")
            .options([("search_path", schema)]);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .expect("postgres connection");
        sqlx::raw_sql(&format!(
            "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema};"
        ))
        .execute(&pool)
        .await
        .expect("schema reset");
        sqlx::raw_sql(CORE_SCHEMA)
            .execute(&pool)
            .await
            .expect("core schema");
        pool
    }
}

const LEASE_TTL: Duration = Duration::minutes(2);

/// Wall clock truncated to Postgres timestamp precision, so stored values
/// round-trip exactly.
fn micro_now() -> DateTime<Utc> {
    use chrono::SubsecRound;
    Utc::now().trunc_subsecs(6)
}

fn entry(origin: Uuid, raw_url: &str, now: DateTime<Utc>) -> FrontierEntry {
    let url = canonicalize(raw_url).expect("test url must canonicalize");
    FrontierEntry {
        id: FrontierEntryId::new(),
        url_hash: url_hash(&url),
        host: url.host_str().unwrap().to_string(),
        url: url.into(),
        origin,
        parent_url: None,
        depth: 0,
        priority: 50,
        status: FrontierStatus::Pending,
        next_fetch_at: now,
        fetch_count: 0,
        last_fetched_at: None,
        content_hash: None,
        retry_count: 0,
        last_error: None,
        lease_expires_at: None,
        created_at: now,
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn insert_is_idempotent_within_origin() {
    let store = PostgresFrontierStore::new(harness::pool("frontier_it_dedup").await);
    let origin = Uuid::now_v7();
    let now = micro_now();

    let first = store.insert_pending(entry(origin, "https://x.test/a", now)).await.unwrap();
    assert!(first.is_created());

    // Same canonical URL, second insert hits the unique index.
    let second = store.insert_pending(entry(origin, "https://x.test/a#frag", now)).await.unwrap();
    assert_eq!(second, Submitted::Duplicate(first.entry_id()));

    // A different origin gets its own row.
    let other = store
        .insert_pending(entry(Uuid::now_v7(), "https://x.test/a", now))
        .await
        .unwrap();
    assert!(other.is_created());

    assert_eq!(store.open_count(origin).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn lease_is_host_capped_and_marks_fetching() {
    let store = PostgresFrontierStore::new(harness::pool("frontier_it_lease").await);
    let origin = Uuid::now_v7();
    let now = micro_now();

    for path in ["a", "b", "c"] {
        store
            .insert_pending(entry(origin, &format!("https://x.test/{path}"), now))
            .await
            .unwrap();
    }
    store
        .insert_pending(entry(origin, "https://y.test/only", now))
        .await
        .unwrap();

    // host cap 1 per call: one x.test entry plus the y.test one.
    let leased = store.lease(origin, 10, 1, now, LEASE_TTL).await.unwrap();
    assert_eq!(leased.len(), 2);
    let mut hosts: Vec<&str> = leased.iter().map(|e| e.host.as_str()).collect();
    hosts.sort();
    assert_eq!(hosts, vec!["x.test", "y.test"]);
    assert!(leased.iter().all(|e| e.status == FrontierStatus::Fetching));
    assert!(leased
        .iter()
        .all(|e| e.lease_expires_at == Some(now + LEASE_TTL)));

    // Leased rows are gone from the due set; the next call takes one more.
    let leased = store.lease(origin, 10, 1, now, LEASE_TTL).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].host, "x.test");

    // Politeness: delayed entries stop being due until the delay passes.
    store
        .delay_host("x.test", now + Duration::seconds(30))
        .await
        .unwrap();
    assert!(store.lease(origin, 10, 10, now, LEASE_TTL).await.unwrap().is_empty());
    let after_delay = store
        .lease(origin, 10, 10, now + Duration::seconds(31), LEASE_TTL)
        .await
        .unwrap();
    assert_eq!(after_delay.len(), 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn redirect_canonicalization_absorbs_the_target_row() {
    let store = PostgresFrontierStore::new(harness::pool("frontier_it_redirect").await);
    let origin = Uuid::now_v7();
    let now = micro_now();

    let original = store
        .insert_pending(entry(origin, "http://x.test/a", now))
        .await
        .unwrap()
        .entry_id();
    let target = store
        .insert_pending(entry(origin, "https://x.test/a", now))
        .await
        .unwrap()
        .entry_id();
    assert_ne!(original, target);

    let canonical = canonicalize("https://x.test/a").unwrap();
    let canonical_hash = url_hash(&canonical);
    store
        .complete_success(original, canonical.as_str(), &canonical_hash, "cafebabe", now)
        .await
        .unwrap();

    // The fetched row took the canonical identity; the pre-existing target
    // row was absorbed.
    assert!(store.get(target).await.unwrap().is_none());
    let survivor = store.get(original).await.unwrap().unwrap();
    assert_eq!(survivor.url, "https://x.test/a");
    assert_eq!(survivor.url_hash, canonical_hash);
    assert_eq!(survivor.status, FrontierStatus::Fetched);
    assert_eq!(survivor.fetch_count, 1);
    assert_eq!(survivor.content_hash.as_deref(), Some("cafebabe"));

    // A later submit of the canonical URL dedups against the survivor.
    let again = store
        .insert_pending(entry(origin, "https://x.test/a", now))
        .await
        .unwrap();
    assert_eq!(again, Submitted::Duplicate(original));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn failure_paths_retry_then_go_terminal() {
    let store = PostgresFrontierStore::new(harness::pool("frontier_it_failure").await);
    let origin = Uuid::now_v7();
    let now = micro_now();

    let flaky = store
        .insert_pending(entry(origin, "https://x.test/flaky", now))
        .await
        .unwrap()
        .entry_id();
    let gone = store
        .insert_pending(entry(origin, "https://x.test/gone", now))
        .await
        .unwrap()
        .entry_id();
    let looping = store
        .insert_pending(entry(origin, "https://x.test/loop", now))
        .await
        .unwrap()
        .entry_id();

    // Retryable: back to pending with the backoff and the retry counted.
    store
        .complete_failure(
            flaky,
            "timeout: timed out",
            Some(now + Duration::seconds(30)),
            FrontierStatus::Pending,
            now,
        )
        .await
        .unwrap();
    let entry_after = store.get(flaky).await.unwrap().unwrap();
    assert_eq!(entry_after.status, FrontierStatus::Pending);
    assert_eq!(entry_after.retry_count, 1);
    assert_eq!(entry_after.fetch_count, 1);
    assert_eq!(entry_after.next_fetch_at, now + Duration::seconds(30));

    // Non-retryable: dead. Redirect blowup: failed, distinguishable.
    store
        .complete_failure(gone, "http_4xx: http 404", None, FrontierStatus::Dead, now)
        .await
        .unwrap();
    store
        .complete_failure(
            looping,
            "too_many_redirects: redirect chain exceeded 5 hops",
            None,
            FrontierStatus::Failed,
            now,
        )
        .await
        .unwrap();
    assert_eq!(store.get(gone).await.unwrap().unwrap().status, FrontierStatus::Dead);
    assert_eq!(
        store.get(looping).await.unwrap().unwrap().status,
        FrontierStatus::Failed
    );
    assert_eq!(store.terminal_failure_count(origin).await.unwrap(), 2);
    assert_eq!(store.open_count(origin).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn expired_leases_reap_and_release_preserves_state() {
    let store = PostgresFrontierStore::new(harness::pool("frontier_it_reap").await);
    let origin = Uuid::now_v7();
    let now = micro_now();

    store
        .insert_pending(entry(origin, "https://x.test/slow", now))
        .await
        .unwrap();
    store
        .insert_pending(entry(origin, "https://y.test/cancelme", now))
        .await
        .unwrap();
    let leased = store.lease(origin, 10, 10, now, LEASE_TTL).await.unwrap();
    assert_eq!(leased.len(), 2);

    // Cancellation path: a leased-but-unfetched entry goes straight back.
    let released = leased.iter().find(|e| e.host == "y.test").unwrap();
    store.release(released.id).await.unwrap();
    let back = store.get(released.id).await.unwrap().unwrap();
    assert_eq!(back.status, FrontierStatus::Pending);
    assert_eq!(back.fetch_count, 0);

    // Within the TTL nothing is reclaimed; past it the lease is reaped.
    assert_eq!(store.reap_expired(now + Duration::minutes(1)).await.unwrap(), 0);
    assert_eq!(store.reap_expired(now + Duration::minutes(3)).await.unwrap(), 1);
    assert_eq!(store.open_count(origin).await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn discovered_links_tolerate_duplicate_saves() {
    let store = PostgresFrontierStore::new(harness::pool("frontier_it_links").await);
    let source_id = SourceId(Uuid::now_v7());
    let now = micro_now();

    let link = DiscoveredLink {
        id: Uuid::now_v7(),
        source_id,
        parent_url: "https://x.test/a".to_string(),
        url: "https://x.test/deep".to_string(),
        depth: 4,
        discovered_at: now,
        status: "pending".to_string(),
        priority: 50,
    };
    let duplicate = DiscoveredLink {
        id: Uuid::now_v7(),
        ..link.clone()
    };

    store.save_discovered_links(vec![link]).await.unwrap();
    // Second crawl finds the same URL; the unique index swallows it.
    store.save_discovered_links(vec![duplicate]).await.unwrap();
}
