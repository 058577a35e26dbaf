//! Explicit composition of the core's subsystems.
//!
//! The builder takes a config, a clock, a store handle, and an HTTP client
//! and returns the wired core; nothing is reachable as a package-level
//! mutable. Long-lived workers are started by `start` and stop through the
//! one cancellation root handed to it.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crawler::{
    ExecutionRuntime, Extractor, FetchConfig, Frontier, FrontierConfig, HttpContentSink,
    HttpFetcher, HttpSourceProvider, PageFetcher, PostgresFrontierStore, RobotsCache,
    RuntimeConfig, SourceProvider,
};
use scheduler::slots::BucketMap;
use scheduler::{
    Clock, PostgresContentHashStore, PostgresJobStore, Scheduler, SchedulerConfig, SystemClock,
};

use crate::app::AppState;
use crate::config::Config;
use crate::events::{run_event_loop, NatsEventSubscriber};

pub struct Core {
    pub state: AppState<PostgresJobStore>,
    scheduler: Arc<Scheduler<PostgresJobStore>>,
    frontier: Arc<Frontier<PostgresFrontierStore>>,
    sources: Arc<dyn SourceProvider>,
    store: Arc<PostgresJobStore>,
    config: Config,
}

pub struct CoreBuilder {
    config: Config,
    pool: PgPool,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
}

impl CoreBuilder {
    pub fn new(config: Config, pool: PgPool) -> Self {
        Self {
            config,
            pool,
            clock: Arc::new(SystemClock),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Core> {
        let Self {
            config,
            pool,
            clock,
            http,
        } = self;

        let store = Arc::new(PostgresJobStore::new(pool.clone()));
        let hash_store = Arc::new(PostgresContentHashStore::new(pool.clone()));
        let frontier = Arc::new(Frontier::new(
            Arc::new(PostgresFrontierStore::new(pool.clone())),
            clock.clone(),
            FrontierConfig::default(),
        ));

        let mut fetch = FetchConfig::default();
        fetch.workers = config.crawl_workers;
        if !config.user_agents.is_empty() {
            fetch.user_agents = config.user_agents.clone();
        }
        fetch.proxies = config.proxies.clone();
        fetch.respect_robots = config.respect_robots;

        let fetcher: Arc<dyn PageFetcher> =
            Arc::new(HttpFetcher::new(&fetch).context("building HTTP fetcher")?);
        let robots = Arc::new(RobotsCache::new(
            http.clone(),
            fetch.user_agents[0].clone(),
            fetch.respect_robots,
        ));
        let sources: Arc<dyn SourceProvider> = Arc::new(HttpSourceProvider::new(
            http.clone(),
            config.source_manager_url.clone(),
        ));
        let sink = Arc::new(HttpContentSink::new(
            http.clone(),
            config.index_sink_url.clone(),
        ));

        let extractor = Extractor::default();
        let runtime = Arc::new(ExecutionRuntime::new(
            store.clone(),
            frontier.clone(),
            fetcher.clone(),
            robots,
            sources.clone(),
            sink,
            // Blob archival is deployment-provided; none wired by default.
            None,
            hash_store.clone(),
            clock.clone(),
            extractor.clone(),
            RuntimeConfig {
                fetch,
                archive_html: config.archive_html,
                ..Default::default()
            },
        ));

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            hash_store,
            runtime,
            clock.clone(),
            SchedulerConfig {
                tick_interval: config.tick_interval,
                dispatch_batch: config.dispatch_batch,
                ..Default::default()
            },
        ));
        let bucket_map = Arc::new(BucketMap::new(store.clone(), clock.clone()));

        let state = AppState {
            scheduler: scheduler.clone(),
            bucket_map,
            store: store.clone(),
            sources: sources.clone(),
            fetcher,
            extractor,
            clock,
            db: Some(pool),
        };

        Ok(Core {
            state,
            scheduler,
            frontier,
            sources,
            store,
            config,
        })
    }
}

impl Core {
    /// Start the long-lived workers: scheduler loop, lease reaper, frontier
    /// lease reaper, and (when configured) the source event loop. All stop
    /// through `cancel`.
    pub async fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            self.scheduler.clone().start(cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.scheduler
                .lease_manager()
                .clone()
                .run_reaper(self.scheduler.config().reaper_cadence, cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.frontier.clone().run_reaper(cancel.clone()),
        ));

        if let Some(nats_url) = &self.config.nats_url {
            let subscriber = NatsEventSubscriber::connect(nats_url)
                .await
                .context("connecting to NATS")?;
            tasks.push(tokio::spawn(run_event_loop(
                subscriber,
                self.scheduler.clone(),
                self.store.clone(),
                self.sources.clone(),
                cancel.clone(),
            )));
        }

        info!(tasks = tasks.len(), "core workers started");
        Ok(tasks)
    }
}
