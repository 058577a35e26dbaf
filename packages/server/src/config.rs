//! Environment-driven configuration for the intake server.

use std::time::Duration as StdDuration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base URL of the external Source Manager service.
    pub source_manager_url: String,
    /// Endpoint records are pushed to for classification.
    pub index_sink_url: String,
    /// Optional NATS server for source lifecycle events.
    pub nats_url: Option<String>,

    pub crawl_workers: usize,
    pub respect_robots: bool,
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    pub archive_html: bool,

    pub tick_interval: StdDuration,
    pub dispatch_batch: i64,
}

impl Config {
    /// Read configuration from the environment. Only `DATABASE_URL`,
    /// `SOURCE_MANAGER_URL` and `INDEX_SINK_URL` are required.
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let source_manager_url =
            std::env::var("SOURCE_MANAGER_URL").context("SOURCE_MANAGER_URL must be set")?;
        let index_sink_url =
            std::env::var("INDEX_SINK_URL").context("INDEX_SINK_URL must be set")?;

        let port = env_parse("PORT", 8080u16)?;
        let crawl_workers = env_parse("CRAWL_WORKERS", 10usize)?;
        let respect_robots = env_parse("RESPECT_ROBOTS", true)?;
        let archive_html = env_parse("ARCHIVE_HTML", false)?;
        let tick_seconds = env_parse("SCHEDULER_TICK_SECONDS", 10u64)?;
        let dispatch_batch = env_parse("DISPATCH_BATCH", 16i64)?;

        Ok(Self {
            database_url,
            port,
            source_manager_url,
            index_sink_url,
            nats_url: std::env::var("NATS_URL").ok().filter(|v| !v.is_empty()),
            crawl_workers,
            respect_robots,
            user_agents: env_list("CRAWL_USER_AGENTS"),
            proxies: env_list("CRAWL_PROXIES"),
            archive_html,
            tick_interval: StdDuration::from_secs(tick_seconds),
            dispatch_batch,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
