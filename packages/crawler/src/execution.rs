//! The crawl execution runtime: opens the execution record, seeds the
//! frontier, drives the fetch pool, extracts, emits, and reports back to
//! the scheduler (which finalizes the record atomically).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use scheduler::{
    Clock, ContentHashStore, CrawlMetrics, ExecutionHandler, ExecutionMetadata, ExecutionOutcome,
    ExecutionReport, ExtractionQuality, Job, JobId, JobStatus, JobStore,
};

use crate::error::Result;
use crate::extract::{extract_links, CanonicalRecord, Extractor, RecordQuality};
use crate::fetcher::{FetchConfig, FetchPool, FetchedPage, PageFetcher};
use crate::frontier::{
    DiscoveredLink, Frontier, FrontierEntry, FrontierEntryId, FrontierStatus, FrontierStore,
};
use crate::robots::RobotsCache;
use crate::sink::{BlobStore, ContentSink, SinkError};
use crate::source::{SourceConfig, SourceProvider};

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub fetch: FetchConfig,
    /// Archive raw HTML to the blob store when one is wired in.
    pub archive_html: bool,
    pub seed_priority: i32,
    pub link_priority: i32,
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            archive_html: false,
            seed_priority: 100,
            link_priority: 50,
            channel_capacity: 64,
        }
    }
}

#[derive(Default)]
struct CrawlState {
    crawl: CrawlMetrics,
    quality: ExtractionQuality,
    items_crawled: i64,
    items_indexed: i64,
}

/// One runtime serves all executions on an instance; per-execution state
/// lives on the stack of `run`.
pub struct ExecutionRuntime<S, F> {
    job_store: Arc<S>,
    frontier: Arc<Frontier<F>>,
    pool: Arc<FetchPool<F>>,
    extractor: Extractor,
    sources: Arc<dyn SourceProvider>,
    sink: Arc<dyn ContentSink>,
    blobs: Option<Arc<dyn BlobStore>>,
    hash_store: Arc<dyn ContentHashStore>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
}

impl<S, F> ExecutionRuntime<S, F>
where
    S: JobStore + 'static,
    F: FrontierStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_store: Arc<S>,
        frontier: Arc<Frontier<F>>,
        fetcher: Arc<dyn PageFetcher>,
        robots: Arc<RobotsCache>,
        sources: Arc<dyn SourceProvider>,
        sink: Arc<dyn ContentSink>,
        blobs: Option<Arc<dyn BlobStore>>,
        hash_store: Arc<dyn ContentHashStore>,
        clock: Arc<dyn Clock>,
        extractor: Extractor,
        config: RuntimeConfig,
    ) -> Self {
        let pool = Arc::new(FetchPool::new(
            frontier.clone(),
            fetcher,
            robots,
            &config.fetch,
        ));
        Self {
            job_store,
            frontier,
            pool,
            extractor,
            sources,
            sink,
            blobs,
            hash_store,
            clock,
            config,
        }
    }

    fn idle_poll(&self) -> StdDuration {
        self.config.fetch.idle_poll
    }

    async fn job_cancelled(&self, job_id: JobId) -> bool {
        match self.job_store.get_job(job_id).await {
            Ok(Some(job)) => job.status == JobStatus::Cancelled,
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "job status poll failed");
                false
            }
        }
    }

    async fn run(&self, job: &Job, cancel: CancellationToken) -> ExecutionReport {
        let started = self.clock.now();
        let execution = match self
            .job_store
            .open_execution(job.id, job.current_retry_count, started)
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not open execution record");
                return ExecutionReport::aborted(started, e.to_string());
            }
        };
        info!(
            job_id = %job.id,
            execution_number = execution.execution_number,
            url = %job.url,
            "execution started"
        );

        let failed = |error: String| ExecutionReport {
            execution_id: Some(execution.id),
            outcome: ExecutionOutcome::Failed { error },
            started_at: started,
            items_crawled: 0,
            items_indexed: 0,
            metadata: serde_json::Value::Null,
        };

        let source = match self.sources.get_source(job.source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => return failed(format!("source config {} not found", job.source_id)),
            Err(e) => return failed(e.to_string()),
        };

        let origin = job.id.0;
        let seed = match self
            .frontier
            .submit(origin, &job.url, None, 0, self.config.seed_priority)
            .await
        {
            Ok(submitted) => submitted.entry_id(),
            Err(e) => return failed(format!("seed submission failed: {e}")),
        };

        let per_host_delay = Duration::milliseconds(source.rate_limit_ms)
            .max(self.config.fetch.global_min_delay);

        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity);
        let pool_cancel = cancel.child_token();
        let pool_task = {
            let pool = self.pool.clone();
            let pool_cancel = pool_cancel.clone();
            tokio::spawn(async move { pool.run(origin, per_host_delay, tx, pool_cancel).await })
        };

        let mut state = CrawlState::default();
        let mut cancelled = false;
        let mut fatal: Option<String> = None;

        loop {
            match tokio::time::timeout(self.idle_poll(), rx.recv()).await {
                Ok(Some((entry, page))) => {
                    if let Err(stop) = self
                        .process_page(origin, &source, &entry, &page, &mut state)
                        .await
                    {
                        fatal = Some(stop);
                        pool_cancel.cancel();
                        break;
                    }
                    // Checkpoint after each emit; also observes cancels
                    // issued through another instance's API.
                    if cancel.is_cancelled() || self.job_cancelled(job.id).await {
                        cancelled = true;
                        pool_cancel.cancel();
                        break;
                    }
                }
                // Workers exited and dropped their senders.
                Ok(None) => break,
                Err(_idle) => {
                    if cancel.is_cancelled() || self.job_cancelled(job.id).await {
                        cancelled = true;
                        pool_cancel.cancel();
                        break;
                    }
                    // The channel sat idle: every received page has been
                    // processed and its links submitted, so an empty
                    // frontier means the crawl is complete.
                    match self.frontier.open_count(origin).await {
                        Ok(0) => pool_cancel.cancel(),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "frontier count failed"),
                    }
                }
            }
        }

        pool_cancel.cancel();
        let _ = pool_task.await;

        if let Ok(count) = self.frontier.terminal_failure_count(origin).await {
            state.crawl.pages_failed = count.max(0) as u32;
        }

        let outcome = if cancelled || cancel.is_cancelled() {
            ExecutionOutcome::Cancelled
        } else if let Some(error) = fatal {
            ExecutionOutcome::Failed { error }
        } else {
            self.seed_outcome(seed).await
        };

        let metadata = ExecutionMetadata {
            crawl: state.crawl,
            quality: state.quality,
        }
        .to_value();

        ExecutionReport {
            execution_id: Some(execution.id),
            outcome,
            started_at: started,
            items_crawled: state.items_crawled,
            items_indexed: state.items_indexed,
            metadata,
        }
    }

    /// A crawl without a fetched seed is a failed attempt, whatever else
    /// happened along the way.
    async fn seed_outcome(&self, seed: FrontierEntryId) -> ExecutionOutcome {
        match self.frontier.get(seed).await {
            Ok(Some(entry))
                if matches!(entry.status, FrontierStatus::Failed | FrontierStatus::Dead) =>
            {
                ExecutionOutcome::Failed {
                    error: entry
                        .last_error
                        .unwrap_or_else(|| "seed fetch failed".to_string()),
                }
            }
            _ => ExecutionOutcome::Success,
        }
    }

    async fn process_page(
        &self,
        origin: Uuid,
        source: &SourceConfig,
        entry: &FrontierEntry,
        page: &FetchedPage,
        state: &mut CrawlState,
    ) -> std::result::Result<(), String> {
        let extracted = self.extractor.extract(&page.html, &source.selectors);
        let links = extract_links(&page.html, &page.final_url);

        state.crawl.pages_fetched += 1;
        state.crawl.max_depth_seen = state.crawl.max_depth_seen.max(entry.depth.max(0) as u32);
        let empty_title = extracted.title_is_empty();
        let empty_body = extracted.body_is_empty();
        if empty_title {
            state.quality.empty_title += 1;
        }
        if empty_body {
            state.quality.empty_body += 1;
        }
        if extracted.used_readability_fallback {
            state.quality.used_readability_fallback += 1;
        }
        state.items_crawled += 1;

        let content_hash = extracted.content_hash();

        // Seed-URL change detection feeds adaptive scheduling.
        if entry.depth == 0 {
            if let Err(e) = self
                .hash_store
                .record(source.id, content_hash.as_hex(), self.clock.now())
                .await
            {
                warn!(source_id = %source.id, error = %e, "content hash update failed");
            }
        }

        self.promote_links(origin, source, entry, page, links, state)
            .await;

        let raw_blob_ref = match (&self.blobs, self.config.archive_html) {
            (Some(blobs), true) => {
                match blobs.put(source.id, content_hash.as_hex(), &page.html).await {
                    Ok(reference) => Some(reference),
                    Err(e) => {
                        // Archival is opportunistic; the record still ships.
                        warn!(error = %e, "raw html archival failed");
                        None
                    }
                }
            }
            _ => None,
        };

        let record = CanonicalRecord {
            url: entry.url.clone(),
            final_url: page.final_url.to_string(),
            source_id: source.id,
            source_name: source.sink_name(),
            title: extracted.title,
            body: extracted.body,
            published_date: extracted.published_date,
            author: extracted.author,
            image: extracted.image,
            canonical_url: extracted.canonical_url,
            fetched_at: self.clock.now(),
            content_hash: content_hash.as_hex().to_string(),
            extraction_quality: RecordQuality {
                empty_title,
                empty_body,
                used_readability_fallback: extracted.used_readability_fallback,
            },
            raw_blob_ref,
        };

        match self.sink.publish(&record).await {
            Ok(()) => state.items_indexed += 1,
            Err(SinkError::Rejected(reason)) => {
                // Recorded, not fatal: the sink dedupes by canonical URL.
                warn!(url = %record.final_url, reason = %reason, "sink rejected record");
            }
            Err(SinkError::Transport(reason)) => {
                return Err(format!("content sink unreachable: {reason}"));
            }
        }
        Ok(())
    }

    async fn promote_links(
        &self,
        origin: Uuid,
        source: &SourceConfig,
        entry: &FrontierEntry,
        page: &FetchedPage,
        links: Vec<url::Url>,
        state: &mut CrawlState,
    ) {
        let host = page.final_url.host_str().unwrap_or_default().to_string();
        let depth = entry.depth + 1;
        let mut beyond_depth = Vec::new();

        for link in links {
            if link.host_str() != Some(host.as_str()) {
                continue;
            }
            state.crawl.links_discovered += 1;
            if depth <= source.max_depth {
                if let Err(e) = self
                    .frontier
                    .submit(
                        origin,
                        link.as_str(),
                        Some(page.final_url.as_str()),
                        depth,
                        self.config.link_priority,
                    )
                    .await
                {
                    warn!(url = %link, error = %e, "link submission failed");
                }
            } else {
                // Kept for operator review rather than dropped.
                beyond_depth.push(DiscoveredLink {
                    id: Uuid::now_v7(),
                    source_id: source.id,
                    parent_url: page.final_url.to_string(),
                    url: link.to_string(),
                    depth,
                    discovered_at: self.clock.now(),
                    status: "pending".to_string(),
                    priority: self.config.link_priority,
                });
            }
        }

        if !beyond_depth.is_empty() {
            if let Err(e) = self.frontier.save_discovered_links(beyond_depth).await {
                warn!(error = %e, "saving discovered links failed");
            }
        }
    }
}

#[async_trait]
impl<S, F> ExecutionHandler for ExecutionRuntime<S, F>
where
    S: JobStore + 'static,
    F: FrontierStore + 'static,
{
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionReport {
        self.run(job, cancel).await
    }
}

/// One-off preview: fetch and extract a source's seed URL without touching
/// the frontier, the hash store, or the sink (backs the test-crawl API).
pub async fn preview_crawl(
    fetcher: &dyn PageFetcher,
    extractor: &Extractor,
    source: &SourceConfig,
    clock: &dyn Clock,
) -> Result<CanonicalRecord> {
    let url = crate::urlnorm::canonicalize(&source.url)?;
    let page = fetcher.fetch(&url).await.map_err(crate::error::CrawlError::Fetch)?;
    let extracted = extractor.extract(&page.html, &source.selectors);
    let content_hash = extracted.content_hash();
    Ok(CanonicalRecord {
        url: url.to_string(),
        final_url: page.final_url.to_string(),
        source_id: source.id,
        source_name: source.sink_name(),
        extraction_quality: RecordQuality {
            empty_title: extracted.title_is_empty(),
            empty_body: extracted.body_is_empty(),
            used_readability_fallback: extracted.used_readability_fallback,
        },
        title: extracted.title,
        body: extracted.body,
        published_date: extracted.published_date,
        author: extracted.author,
        image: extracted.image,
        canonical_url: extracted.canonical_url,
        fetched_at: clock.now(),
        content_hash: content_hash.as_hex().to_string(),
        raw_blob_ref: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::SelectorSet;
    use crate::frontier::{FrontierConfig, MemoryFrontierStore};
    use crate::sink::{MemoryBlobStore, MemorySink};
    use crate::source::StaticSourceProvider;
    use crate::testing::MockFetcher;
    use chrono::Utc;
    use scheduler::{MemoryContentHashStore, MemoryJobStore, SourceId, SystemClock};

    const SEED_HTML: &str = r#"
        <html><head><title>Seed</title></head><body>
          <h1 class="headline">Front page</h1>
          <article><p>Seed body text.</p></article>
          <a href="/a">a</a>
          <a href="/b">b</a>
          <a href="https://elsewhere.test/x">offsite</a>
        </body></html>
    "#;

    const LEAF_HTML: &str = r#"
        <html><head><title>Leaf</title></head><body>
          <h1 class="headline">Leaf page</h1>
          <article><p>Leaf body text.</p></article>
          <a href="/c">deeper</a>
        </body></html>
    "#;

    struct Fixture {
        runtime: ExecutionRuntime<MemoryJobStore, MemoryFrontierStore>,
        job_store: Arc<MemoryJobStore>,
        frontier_store: Arc<MemoryFrontierStore>,
        sink: Arc<MemorySink>,
        hash_store: Arc<MemoryContentHashStore>,
        blobs: Arc<MemoryBlobStore>,
        source_id: SourceId,
    }

    fn fixture(fetcher: MockFetcher, archive_html: bool) -> Fixture {
        let clock = Arc::new(SystemClock);
        let job_store = Arc::new(MemoryJobStore::new());
        let frontier_store = Arc::new(MemoryFrontierStore::new());
        let sink = Arc::new(MemorySink::new());
        let hash_store = Arc::new(MemoryContentHashStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let source_id = SourceId(Uuid::now_v7());

        let sources = StaticSourceProvider::new().with_source(SourceConfig {
            id: source_id,
            name: "Example Site".into(),
            url: "https://x.test/".into(),
            rate_limit_ms: 0,
            max_depth: 1,
            enabled: true,
            refresh_interval_minutes: None,
            selectors: SelectorSet {
                title: Some("h1.headline".into()),
                body: Some("article".into()),
                ..Default::default()
            },
        });

        let mut fetch = FetchConfig::default();
        fetch.workers = 2;
        fetch.idle_poll = StdDuration::from_millis(20);
        fetch.global_min_delay = Duration::zero();
        fetch.floor_requests_per_second = 1000;

        let frontier = Arc::new(Frontier::new(
            frontier_store.clone(),
            clock.clone() as Arc<dyn Clock>,
            FrontierConfig::default(),
        ));

        let runtime = ExecutionRuntime::new(
            job_store.clone(),
            frontier,
            Arc::new(fetcher),
            Arc::new(RobotsCache::new(reqwest::Client::new(), "TestBot", false)),
            Arc::new(sources),
            sink.clone(),
            Some(blobs.clone() as Arc<dyn BlobStore>),
            hash_store.clone() as Arc<dyn ContentHashStore>,
            clock,
            Extractor::default(),
            RuntimeConfig {
                fetch,
                archive_html,
                ..Default::default()
            },
        );

        Fixture {
            runtime,
            job_store,
            frontier_store,
            sink,
            hash_store,
            blobs,
            source_id,
        }
    }

    fn job(source_id: SourceId) -> Job {
        Job::builder()
            .source_id(source_id)
            .url("https://x.test/")
            .status(JobStatus::Running)
            .interval_minutes(30)
            .next_run_at(Utc::now())
            .build()
    }

    #[tokio::test]
    async fn crawl_extracts_emits_and_respects_max_depth() {
        let fetcher = MockFetcher::new()
            .with_page("https://x.test/", SEED_HTML)
            .with_page("https://x.test/a", LEAF_HTML)
            .with_page("https://x.test/b", LEAF_HTML);
        let f = fixture(fetcher, false);
        let job = f.job_store.create_job(job(f.source_id)).await.unwrap();

        let report = f
            .runtime
            .execute(&job, CancellationToken::new())
            .await;

        assert!(matches!(report.outcome, ExecutionOutcome::Success));
        assert_eq!(report.items_crawled, 3);
        assert_eq!(report.items_indexed, 3);
        assert!(report.execution_id.is_some());

        let records = f.sink.records();
        assert_eq!(records.len(), 3);
        let seed_record = records
            .iter()
            .find(|r| r.final_url == "https://x.test/")
            .unwrap();
        assert_eq!(seed_record.title, "Front page");
        assert_eq!(seed_record.source_name, "example_site");

        // Seed hash recorded for adaptive scheduling.
        assert!(f.hash_store.get(f.source_id).await.unwrap().is_some());

        // /c is beyond max_depth: persisted for review, never fetched.
        let discovered = f.frontier_store.discovered_links();
        assert!(!discovered.is_empty());
        assert!(discovered.iter().all(|l| l.url == "https://x.test/c"));
        assert!(discovered.iter().all(|l| l.depth == 2));

        let metadata = ExecutionMetadata::from_value(&report.metadata);
        assert_eq!(metadata.crawl.pages_fetched, 3);
        assert_eq!(metadata.crawl.max_depth_seen, 1);
        // seed -> a, b and each leaf -> c (offsite link is ignored).
        assert_eq!(metadata.crawl.links_discovered, 4);
        assert_eq!(metadata.quality.empty_title, 0);
    }

    #[tokio::test]
    async fn seed_fetch_failure_fails_the_execution() {
        let fetcher = MockFetcher::new(); // everything 404s
        let f = fixture(fetcher, false);
        let job = f.job_store.create_job(job(f.source_id)).await.unwrap();

        let report = f
            .runtime
            .execute(&job, CancellationToken::new())
            .await;

        match &report.outcome {
            ExecutionOutcome::Failed { error } => {
                assert!(error.contains("404"), "unexpected error: {error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(report.items_indexed, 0);
        let metadata = ExecutionMetadata::from_value(&report.metadata);
        assert_eq!(metadata.crawl.pages_failed, 1);
    }

    #[tokio::test]
    async fn cancellation_closes_as_cancelled() {
        let fetcher = MockFetcher::new().with_page("https://x.test/", SEED_HTML);
        let f = fixture(fetcher, false);
        let job = f.job_store.create_job(job(f.source_id)).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = f.runtime.execute(&job, cancel).await;
        assert!(matches!(report.outcome, ExecutionOutcome::Cancelled));
    }

    #[tokio::test]
    async fn archival_embeds_blob_reference() {
        // Only the seed resolves; the discovered leaf pages 404 and die.
        let fetcher = MockFetcher::new().with_page("https://x.test/", SEED_HTML);
        let f = fixture(fetcher, true);
        let job = f.job_store.create_job(job(f.source_id)).await.unwrap();

        let report = f
            .runtime
            .execute(&job, CancellationToken::new())
            .await;
        assert!(matches!(report.outcome, ExecutionOutcome::Success));

        let records = f.sink.records();
        let seed_record = records
            .iter()
            .find(|r| r.final_url == "https://x.test/")
            .unwrap();
        let reference = seed_record.raw_blob_ref.as_ref().unwrap();
        assert!(reference.starts_with("blob://"));
        assert_eq!(f.blobs.len(), 1);
    }
}
