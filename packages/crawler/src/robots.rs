//! robots.txt parsing and a per-host cache.
//!
//! Longest-prefix rule matching; `Allow` wins ties against `Disallow` of
//! equal length. Unreachable or missing robots.txt means everything is
//! allowed, matching crawler convention.

use std::collections::HashMap;
use std::time::{Duration as StdDuration, Instant};

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// One `User-agent:` group with its rules.
#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
    crawl_delay: Option<f64>,
}

#[derive(Debug, Clone)]
struct Rule {
    path: String,
    allow: bool,
}

/// Parsed robots.txt.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    groups: Vec<Group>,
}

impl RobotsTxt {
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        let mut in_rules = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    // A user-agent line after rules starts a new group.
                    if in_rules {
                        if !current.agents.is_empty() {
                            groups.push(std::mem::take(&mut current));
                        }
                        in_rules = false;
                    }
                    current.agents.push(value.to_ascii_lowercase());
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        current.rules.push(Rule {
                            path: value.to_string(),
                            allow: directive == "allow",
                        });
                    }
                }
                "crawl-delay" => {
                    in_rules = true;
                    current.crawl_delay = value.parse().ok().or(current.crawl_delay);
                }
                _ => {}
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }

        Self { groups }
    }

    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let agent = user_agent.to_ascii_lowercase();
        self.groups
            .iter()
            .find(|g| g.agents.iter().any(|a| a != "*" && agent.contains(a.as_str())))
            .or_else(|| {
                self.groups
                    .iter()
                    .find(|g| g.agents.iter().any(|a| a == "*"))
            })
    }

    /// Longest-match decision for a path; unmatched paths are allowed.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };
        let mut verdict = true;
        let mut best_len = 0;
        for rule in &group.rules {
            if path.starts_with(&rule.path) {
                let len = rule.path.len();
                if len > best_len || (len == best_len && rule.allow) {
                    best_len = len;
                    verdict = rule.allow;
                }
            }
        }
        verdict
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<StdDuration> {
        self.group_for(user_agent)
            .and_then(|g| g.crawl_delay)
            .map(StdDuration::from_secs_f64)
    }
}

struct CacheSlot {
    fetched_at: Instant,
    robots: Arc<RobotsTxt>,
}

/// Per-host robots.txt cache, in-process per instance.
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    ttl: StdDuration,
    enabled: bool,
    entries: Mutex<HashMap<String, CacheSlot>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>, enabled: bool) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            ttl: StdDuration::from_secs(24 * 60 * 60),
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: StdDuration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Whether `url` may be fetched. Always true when robots checking is
    /// disabled; fetch failures fail open.
    pub async fn is_allowed(&self, url: &Url) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(host) = url.host_str() else {
            return true;
        };

        let robots = self.robots_for(url, host).await;
        robots.is_allowed(&self.user_agent, url.path())
    }

    async fn robots_for(&self, url: &Url, host: &str) -> Arc<RobotsTxt> {
        {
            let entries = self.entries.lock().await;
            if let Some(slot) = entries.get(host) {
                if slot.fetched_at.elapsed() < self.ttl {
                    return slot.robots.clone();
                }
            }
        }

        // Briefly racing workers may fetch the same robots.txt twice; the
        // cache converges on whichever lands last.
        let robots = Arc::new(self.fetch(url).await);
        self.entries.lock().await.insert(
            host.to_string(),
            CacheSlot {
                fetched_at: Instant::now(),
                robots: robots.clone(),
            },
        );
        robots
    }

    async fn fetch(&self, url: &Url) -> RobotsTxt {
        let robots_url = format!(
            "{}://{}/robots.txt",
            url.scheme(),
            url.host_str().unwrap_or_default()
        );
        debug!(url = %robots_url, "fetching robots.txt");
        match self
            .client
            .get(&robots_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => RobotsTxt::parse(&body),
                Err(_) => RobotsTxt::default(),
            },
            // 404 or transport failure: allow everything.
            _ => RobotsTxt::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_allow_disallow() {
        let robots = RobotsTxt::parse(
            "User-agent: *\nDisallow: /private/\nDisallow: /admin/\nAllow: /public/\nCrawl-delay: 2\n",
        );
        assert!(robots.is_allowed("IntakeBot", "/public/page"));
        assert!(!robots.is_allowed("IntakeBot", "/private/page"));
        assert!(!robots.is_allowed("IntakeBot", "/admin/"));
        assert!(robots.is_allowed("IntakeBot", "/elsewhere"));
        assert_eq!(
            robots.crawl_delay("IntakeBot"),
            Some(StdDuration::from_secs(2))
        );
    }

    #[test]
    fn longest_match_wins() {
        let robots =
            RobotsTxt::parse("User-agent: *\nDisallow: /private/\nAllow: /private/public/\n");
        assert!(!robots.is_allowed("Bot", "/private/secret"));
        assert!(robots.is_allowed("Bot", "/private/public/page"));
    }

    #[test]
    fn specific_agent_overrides_wildcard() {
        let robots = RobotsTxt::parse(
            "User-agent: *\nDisallow: /\n\nUser-agent: goodbot\nAllow: /\n",
        );
        assert!(!robots.is_allowed("BadBot", "/page"));
        assert!(robots.is_allowed("GoodBot/1.0", "/page"));
    }

    #[test]
    fn shared_group_applies_to_all_listed_agents() {
        let robots = RobotsTxt::parse(
            "User-agent: alpha\nUser-agent: beta\nDisallow: /x/\n",
        );
        assert!(!robots.is_allowed("alpha", "/x/1"));
        assert!(!robots.is_allowed("beta", "/x/1"));
        assert!(robots.is_allowed("gamma", "/x/1"));
    }

    #[test]
    fn empty_robots_allows_everything() {
        let robots = RobotsTxt::parse("");
        assert!(robots.is_allowed("Bot", "/anything"));
        assert!(robots.crawl_delay("Bot").is_none());
    }

    #[test]
    fn comments_and_noise_are_ignored() {
        let robots = RobotsTxt::parse(
            "# intro comment\nUser-agent: * # trailing\nDisallow: /hidden/ # note\nnot-a-directive\n",
        );
        assert!(!robots.is_allowed("Bot", "/hidden/x"));
    }
}
