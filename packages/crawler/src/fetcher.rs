//! HTTP fetching: a single-request fetcher with UA/proxy rotation and the
//! bounded worker pool that drives the frontier.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use governor::{Quota, RateLimiter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{FetchError, Result};
use crate::frontier::{Frontier, FrontierEntry, FrontierStore};
use crate::robots::RobotsCache;
use crate::urlnorm::{canonicalize, ContentHash};

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Fetch-side configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Round-robin User-Agent pool.
    pub user_agents: Vec<String>,
    /// Optional round-robin proxy pool.
    pub proxies: Vec<String>,
    pub max_redirects: usize,
    pub connect_timeout: StdDuration,
    pub total_timeout: StdDuration,
    pub max_body_bytes: u64,
    pub respect_robots: bool,
    /// Parallel fetch workers per execution.
    pub workers: usize,
    /// Floor for the per-host politeness delay.
    pub global_min_delay: Duration,
    /// Instance-wide request rate cap.
    pub floor_requests_per_second: u32,
    /// Worker sleep when the frontier has nothing due yet.
    pub idle_poll: StdDuration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agents: vec!["IntakeBot/1.0".to_string()],
            proxies: Vec::new(),
            max_redirects: 5,
            connect_timeout: StdDuration::from_secs(10),
            total_timeout: StdDuration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            respect_robots: true,
            workers: 10,
            global_min_delay: Duration::milliseconds(500),
            floor_requests_per_second: 8,
            idle_poll: StdDuration::from_millis(200),
        }
    }
}

/// A fetched page handed from the pool to the extraction side. Bodies live
/// only in this in-process hand-off, never in the store.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub requested_url: Url,
    /// After following redirects; the canonical identity.
    pub final_url: Url,
    pub status: u16,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

/// Single-request fetch seam (mockable in tests).
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError>;
}

/// reqwest-backed fetcher with UA and proxy rotation.
pub struct HttpFetcher {
    clients: Vec<reqwest::Client>,
    user_agents: Vec<String>,
    max_redirects: usize,
    max_body_bytes: u64,
    client_cursor: AtomicUsize,
    agent_cursor: AtomicUsize,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let build = |proxy: Option<&str>| -> std::result::Result<reqwest::Client, FetchError> {
            let mut builder = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
                .connect_timeout(config.connect_timeout)
                .timeout(config.total_timeout);
            if let Some(proxy) = proxy {
                builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                    FetchError::InvalidUrl {
                        url: proxy.to_string(),
                        reason: e.to_string(),
                    }
                })?);
            }
            builder.build().map_err(|e| FetchError::Connect(e.to_string()))
        };

        let clients = if config.proxies.is_empty() {
            vec![build(None)?]
        } else {
            config
                .proxies
                .iter()
                .map(|p| build(Some(p)))
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let user_agents = if config.user_agents.is_empty() {
            FetchConfig::default().user_agents
        } else {
            config.user_agents.clone()
        };

        Ok(Self {
            clients,
            user_agents,
            max_redirects: config.max_redirects,
            max_body_bytes: config.max_body_bytes,
            client_cursor: AtomicUsize::new(0),
            agent_cursor: AtomicUsize::new(0),
        })
    }

    fn next_client(&self) -> &reqwest::Client {
        let i = self.client_cursor.fetch_add(1, Ordering::Relaxed);
        &self.clients[i % self.clients.len()]
    }

    fn next_user_agent(&self) -> &str {
        let i = self.agent_cursor.fetch_add(1, Ordering::Relaxed);
        &self.user_agents[i % self.user_agents.len()]
    }

    fn classify(&self, url: &Url, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else if e.is_redirect() {
            FetchError::TooManyRedirects {
                max: self.max_redirects,
            }
        } else if e.is_connect() {
            // DNS failures surface as connect errors in reqwest; keep the
            // host so operators can tell which name failed.
            let text = e.to_string();
            if text.contains("dns") {
                FetchError::Dns {
                    host: url.host_str().unwrap_or_default().to_string(),
                }
            } else {
                FetchError::Connect(text)
            }
        } else {
            FetchError::Connect(e.to_string())
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError> {
        let response = self
            .next_client()
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, self.next_user_agent())
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let status = response.status();
        let final_url = response.url().clone();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url.to_string(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
        }

        // Content-Length lies or is absent often enough that the cap is
        // enforced on the stream as well.
        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.classify(url, e))?
        {
            if body.len() as u64 + chunk.len() as u64 > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            requested_url: url.clone(),
            final_url,
            status: status.as_u16(),
            html: String::from_utf8_lossy(&body).into_owned(),
            fetched_at: Utc::now(),
        })
    }
}

/// Bounded worker pool: each worker leases one entry at a time, fetches,
/// and reports back to the frontier. Fetched bodies flow to the caller over
/// the channel; workers stop at the next lease boundary when cancelled.
pub struct FetchPool<F> {
    frontier: Arc<Frontier<F>>,
    fetcher: Arc<dyn PageFetcher>,
    robots: Arc<RobotsCache>,
    limiter: Arc<DirectRateLimiter>,
    workers: usize,
    idle_poll: StdDuration,
}

impl<F: FrontierStore + 'static> FetchPool<F> {
    pub fn new(
        frontier: Arc<Frontier<F>>,
        fetcher: Arc<dyn PageFetcher>,
        robots: Arc<RobotsCache>,
        config: &FetchConfig,
    ) -> Self {
        let rps = NonZeroU32::new(config.floor_requests_per_second.max(1))
            .expect("max(1) is non-zero");
        Self {
            frontier,
            fetcher,
            robots,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            workers: config.workers.max(1),
            idle_poll: config.idle_poll,
        }
    }

    /// Run the pool for one origin. Workers stop at the next lease boundary
    /// once `cancel` fires; the caller (the execution runtime) owns the
    /// drain decision, since it is the only party submitting new URLs.
    /// Completes when every worker has exited.
    pub async fn run(
        &self,
        origin: uuid::Uuid,
        per_host_delay: Duration,
        tx: mpsc::Sender<(FrontierEntry, FetchedPage)>,
        cancel: CancellationToken,
    ) {
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let frontier = self.frontier.clone();
            let fetcher = self.fetcher.clone();
            let robots = self.robots.clone();
            let limiter = self.limiter.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let idle_poll = self.idle_poll;
            handles.push(tokio::spawn(async move {
                fetch_worker(
                    worker,
                    origin,
                    per_host_delay,
                    frontier,
                    fetcher,
                    robots,
                    limiter,
                    tx,
                    cancel,
                    idle_poll,
                )
                .await;
            }));
        }
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_worker<F: FrontierStore>(
    worker: usize,
    origin: uuid::Uuid,
    per_host_delay: Duration,
    frontier: Arc<Frontier<F>>,
    fetcher: Arc<dyn PageFetcher>,
    robots: Arc<RobotsCache>,
    limiter: Arc<DirectRateLimiter>,
    tx: mpsc::Sender<(FrontierEntry, FetchedPage)>,
    cancel: CancellationToken,
    idle_poll: StdDuration,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let leased = match frontier.lease(origin, 1, 1).await {
            Ok(leased) => leased,
            Err(e) => {
                warn!(worker, error = %e, "frontier lease failed");
                tokio::time::sleep(idle_poll).await;
                continue;
            }
        };
        let Some(entry) = leased.into_iter().next() else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle_poll) => {}
            }
            continue;
        };

        if cancel.is_cancelled() {
            // Leased but not yet fetched: hand it back untouched.
            if let Err(e) = frontier.release(&entry).await {
                warn!(worker, error = %e, "failed to release frontier entry");
            }
            break;
        }

        process_entry(
            worker,
            &entry,
            per_host_delay,
            &frontier,
            &*fetcher,
            &robots,
            &limiter,
            &tx,
        )
        .await;
    }
    debug!(worker, "fetch worker stopped");
}

#[allow(clippy::too_many_arguments)]
async fn process_entry<F: FrontierStore>(
    worker: usize,
    entry: &FrontierEntry,
    per_host_delay: Duration,
    frontier: &Frontier<F>,
    fetcher: &dyn PageFetcher,
    robots: &RobotsCache,
    limiter: &DirectRateLimiter,
    tx: &mpsc::Sender<(FrontierEntry, FetchedPage)>,
) {
    let fail = |e: FetchError| async move {
        if let Err(store_err) = frontier.complete_failure(entry, &e, per_host_delay).await {
            warn!(worker, error = %store_err, "failed to record fetch failure");
        }
    };

    let url = match canonicalize(&entry.url) {
        Ok(url) => url,
        Err(e) => return fail(e).await,
    };

    if !robots.is_allowed(&url).await {
        return fail(FetchError::RobotsDisallowed {
            url: url.to_string(),
        })
        .await;
    }

    limiter.until_ready().await;

    match fetcher.fetch(&url).await {
        Ok(page) => {
            let content_hash = ContentHash::from_content(&page.html);
            if let Err(e) = frontier
                .complete_success(entry, &page.final_url, &content_hash, per_host_delay)
                .await
            {
                warn!(worker, error = %e, "failed to record fetch success");
                return;
            }
            // Receiver gone means the execution is unwinding; nothing to do.
            let _ = tx.send((entry.clone(), page)).await;
        }
        Err(e) => {
            debug!(worker, url = %entry.url, bucket = e.bucket().as_str(), error = %e, "fetch failed");
            fail(e).await;
        }
    }
}
