// src/fetch/gated.rs
// =============================================================================
// Call-site wiring of the RateLimiter around the MultiLayerFetcher.
//
//   acquire(url) --false--> failed FetchResult ("origin temporarily blocked")
//        |
//       true
//        v
//   fetch(url) --success--> record_success(url)
//        |
//      failure
//        v
//   record_error(url, is_rate_limit = some layer saw HTTP 429)
//
// The two components stay independent; this is the only place they meet.
// =============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{FetchResult, MultiLayerFetcher};
use crate::error::Result;
use crate::paginate::PageSource;
use crate::ratelimit::RateLimiter;

pub const BLOCKED_ORIGIN_ERROR: &str = "origin temporarily blocked";

#[derive(Clone)]
pub struct RateLimitedFetcher {
    fetcher: Arc<MultiLayerFetcher>,
    limiter: RateLimiter,
}

impl RateLimitedFetcher {
    pub fn new(fetcher: Arc<MultiLayerFetcher>, limiter: RateLimiter) -> Self {
        Self { fetcher, limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchResult> {
        if !self.limiter.acquire(url).await? {
            warn!(url = %url, "origin blocked, skipping fetch");
            return Ok(FetchResult::failed(url, BLOCKED_ORIGIN_ERROR));
        }

        let result = self.fetcher.fetch(url).await?;
        if result.success {
            self.limiter.record_success(url)?;
        } else {
            self.limiter.record_error(url, result.rate_limited)?;
        }
        Ok(result)
    }
}

#[async_trait]
impl PageSource for RateLimitedFetcher {
    async fn fetch_page(&self, url: &str) -> FetchResult {
        match self.fetch(url).await {
            Ok(result) => result,
            Err(e) => FetchResult::failed(url, e.to_string()),
        }
    }
}
