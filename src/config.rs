// src/config.rs
// =============================================================================
// Settings for every component of the pipeline.
//
// Precedence (lowest to highest):
//   1. Built-in defaults (the Default impls below)
//   2. Optional JSON file (`--config scout.json`)
//   3. Environment variables (a `.env` file is loaded first)
//   4. CLI flags, applied by main.rs
//
// Every struct uses #[serde(default)] so a config file only needs the keys
// it wants to change.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ScoutError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rate_limit: RateLimitConfig,
    pub fetch: FetchConfig,
    pub pagination: PaginationConfig,
    pub dedup: DedupConfig,
}

/// Per-origin cadence and backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    /// Consecutive failures before an origin is blocked
    pub max_consecutive_errors: u32,
    pub base_backoff_secs: f64,
    /// Ceiling for the exponential part of a block
    pub max_backoff_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            max_consecutive_errors: 3,
            base_backoff_secs: 5.0,
            max_backoff_secs: 300.0,
        }
    }
}

impl RateLimitConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.requests_per_second)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.base_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.max_backoff_secs)
    }
}

/// Shape of what the reader proxy is asked to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderFormat {
    Markdown,
    Html,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Shorter bodies are treated as placeholder pages
    pub min_content_length: usize,
    pub direct_timeout_secs: u64,
    pub browser_timeout_secs: u64,
    pub render_timeout_secs: u64,
    pub reader_timeout_secs: u64,
    /// Rendering proxy is skipped entirely while this is None
    pub render_api_key: Option<String>,
    pub render_endpoint: String,
    pub reader_endpoint: String,
    pub reader_format: ReaderFormat,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_content_length: 1000,
            direct_timeout_secs: 15,
            browser_timeout_secs: 20,
            render_timeout_secs: 60,
            reader_timeout_secs: 30,
            render_api_key: None,
            render_endpoint: "https://app.scrapingbee.com/api/v1/".to_string(),
            reader_endpoint: "https://r.jina.ai/".to_string(),
            reader_format: ReaderFormat::Markdown,
            user_agent: concat!("leilao-scout/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub max_pages: usize,
    pub page_delay_ms: u64,
    /// Consecutive pages without new items before the session ends
    pub max_empty_pages: usize,
    /// Used for offset/start parameters until the first page is counted
    pub default_items_per_page: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: 50,
            page_delay_ms: 1000,
            max_empty_pages: 2,
            default_items_per_page: 20,
        }
    }
}

impl PaginationConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Minimum address similarity for a fuzzy match
    pub fuzzy_threshold: f64,
    /// Sources in decreasing order of trust. A listing first seen from a
    /// listed source is not overwritten by observations from a source
    /// ranked below it; unlisted sources rank lowest.
    pub source_priority: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            source_priority: Vec::new(),
        }
    }
}

impl Settings {
    // Loads defaults, then the optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        // Ignore a missing .env file
        let _ = dotenvy::dotenv();
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScoutError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(key) = env::var("SCOUT_RENDER_API_KEY") {
            if !key.trim().is_empty() {
                self.fetch.render_api_key = Some(key);
            }
        }
        if let Some(rps) = env_number::<f64>("SCOUT_REQUESTS_PER_SECOND")? {
            self.rate_limit.requests_per_second = rps;
        }
        if let Some(max_pages) = env_number::<usize>("SCOUT_MAX_PAGES")? {
            self.pagination.max_pages = max_pages;
        }
        if let Some(threshold) = env_number::<f64>("SCOUT_FUZZY_THRESHOLD")? {
            self.dedup.fuzzy_threshold = threshold;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.rate_limit.requests_per_second > 0.0) {
            return Err(ScoutError::Config(
                "requests_per_second must be positive".to_string(),
            ));
        }
        if self.rate_limit.max_consecutive_errors == 0 {
            return Err(ScoutError::Config(
                "max_consecutive_errors must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.base_backoff_secs < 0.0
            || self.rate_limit.max_backoff_secs < self.rate_limit.base_backoff_secs
        {
            return Err(ScoutError::Config(
                "backoff must satisfy 0 <= base_backoff_secs <= max_backoff_secs".to_string(),
            ));
        }
        if self.pagination.max_pages == 0 || self.pagination.max_empty_pages == 0 {
            return Err(ScoutError::Config(
                "max_pages and max_empty_pages must be at least 1".to_string(),
            ));
        }
        if !(self.dedup.fuzzy_threshold > 0.0 && self.dedup.fuzzy_threshold <= 1.0) {
            return Err(ScoutError::Config(
                "fuzzy_threshold must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ScoutError::Config(format!("{} must be a number, got '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
