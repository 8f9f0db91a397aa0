use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::aggregator::MAX_ITEMS;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// How long an aggregated result is served before refreshing, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Per-source fetch budget in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    /// Upper bound on the number of items in an aggregated result
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub sources: Vec<Source>,
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_max_items() -> usize {
    MAX_ITEMS
}

fn default_bind_address() -> String {
    "0.0.0.0:8000".to_string()
}

/// A feed to aggregate. `name` is the display label stamped on every item.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    #[serde(alias = "endpoint")]
    pub url: String,
}

impl Source {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache_ttl == 0 {
            anyhow::bail!("cache_ttl must be positive");
        }
        if self.fetch_timeout == 0 {
            anyhow::bail!("fetch_timeout must be positive");
        }
        if self.max_items == 0 {
            anyhow::bail!("max_items must be positive");
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                anyhow::bail!("source with url '{}' has an empty name", source.url);
            }
            if source.url.trim().is_empty() {
                anyhow::bail!("source '{}' has an empty url", source.name);
            }
            if !names.insert(source.name.as_str()) {
                anyhow::bail!("duplicate source name '{}'", source.name);
            }
        }

        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}
