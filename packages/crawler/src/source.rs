//! Source configuration, read from the external Source Manager.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use scheduler::SourceId;

use crate::error::{CrawlError, Result};
use crate::extract::SelectorSet;

/// Externally managed source configuration consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    /// Minimum delay between fetches against this source's host, in
    /// milliseconds. The effective per-host delay is
    /// `max(rate_limit_ms, global_min_delay)`.
    #[serde(default)]
    pub rate_limit_ms: i64,
    #[serde(default = "default_max_depth")]
    pub max_depth: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Crawl cadence used when a job is created from a source event;
    /// operators can still override per job through the API.
    #[serde(default)]
    pub refresh_interval_minutes: Option<i32>,
    #[serde(default)]
    pub selectors: SelectorSet,
}

fn default_max_depth() -> i32 {
    3
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    /// Stable output sink name: lowercased, every non-alphanumeric
    /// character replaced with `_`.
    pub fn sink_name(&self) -> String {
        self.name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

/// Read access to source configurations.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn get_source(&self, id: SourceId) -> Result<Option<SourceConfig>>;

    /// All currently enabled sources (drives full reconciliation).
    async fn list_enabled(&self) -> Result<Vec<SourceConfig>>;
}

/// HTTP client against the Source Manager service.
pub struct HttpSourceProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSourceProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceProvider for HttpSourceProvider {
    async fn get_source(&self, id: SourceId) -> Result<Option<SourceConfig>> {
        let url = format!("{}/sources/{}", self.base_url.trim_end_matches('/'), id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CrawlError::SourceManager(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CrawlError::SourceManager(format!(
                "source manager returned {}",
                response.status()
            )));
        }
        let config = response
            .json::<SourceConfig>()
            .await
            .map_err(|e| CrawlError::SourceManager(e.to_string()))?;
        Ok(Some(config))
    }

    async fn list_enabled(&self) -> Result<Vec<SourceConfig>> {
        let url = format!("{}/sources?enabled=true", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CrawlError::SourceManager(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CrawlError::SourceManager(format!(
                "source manager returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<SourceConfig>>()
            .await
            .map_err(|e| CrawlError::SourceManager(e.to_string()))
    }
}

/// Fixed map of sources, for tests and local development.
#[derive(Default)]
pub struct StaticSourceProvider {
    sources: Mutex<HashMap<SourceId, SourceConfig>>,
}

impl StaticSourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(self, config: SourceConfig) -> Self {
        self.sources.lock().unwrap().insert(config.id, config);
        self
    }

    pub fn insert(&self, config: SourceConfig) {
        self.sources.lock().unwrap().insert(config.id, config);
    }
}

#[async_trait]
impl SourceProvider for StaticSourceProvider {
    async fn get_source(&self, id: SourceId) -> Result<Option<SourceConfig>> {
        Ok(self.sources.lock().unwrap().get(&id).cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<SourceConfig>> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn sink_name_is_lowercased_and_sanitized() {
        let config = SourceConfig {
            id: SourceId(Uuid::now_v7()),
            name: "City Water Board (Main)".into(),
            url: "https://x.test/".into(),
            rate_limit_ms: 0,
            max_depth: 3,
            enabled: true,
            refresh_interval_minutes: None,
            selectors: SelectorSet::default(),
        };
        assert_eq!(config.sink_name(), "city_water_board__main_");
    }
}
