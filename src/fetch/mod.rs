// src/fetch/mod.rs
// =============================================================================
// Multi-layer content retrieval.
//
// A URL is tried against up to four retrieval layers, cheapest first:
//   1. Direct GET with a plain user agent
//   2. GET with a full browser header set
//   3. Managed rendering proxy (only when an API key is configured)
//   4. Reader proxy (always, as the last resort)
//
// The first *valid* result wins. Valid means the layer succeeded, the body
// is longer than `min_content_length`, and it carries none of the known
// bot-challenge markers. Transport errors are recorded per attempt and never
// returned as `Err`; only a malformed URL is.
//
// The fetcher does not talk to the RateLimiter itself. See gated.rs for the
// call-site wiring.
// =============================================================================

mod gated;
mod layers;

pub use gated::RateLimitedFetcher;
pub use layers::{BrowserRetriever, DirectRetriever, ReaderProxyRetriever, RenderingProxyRetriever};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::FetchConfig;
use crate::error::{Result, RetrievalError, ScoutError};

// Case-insensitive substrings that identify an anti-bot interstitial rather
// than real listing content
pub const BOT_CHALLENGE_MARKERS: &[&str] = &[
    "checking your browser",
    "just a moment",
    "cf-browser-verification",
    "challenge-platform",
    "attention required! | cloudflare",
    "ddos protection by",
];

/// Which retrieval strategy produced (or failed to produce) content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchLayer {
    Direct,
    BrowserHeaders,
    RenderingProxy,
    ReaderProxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Html,
    Markdown,
}

/// Body returned by a single layer before validation.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub body: String,
    pub kind: ContentKind,
}

impl Retrieved {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            kind: ContentKind::Html,
        }
    }

    pub fn markdown(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            kind: ContentKind::Markdown,
        }
    }
}

/// One layer's try at a URL. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct FetchAttempt {
    pub url: String,
    pub layer: FetchLayer,
    pub content_length: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The layer saw an HTTP 429
    #[serde(skip)]
    pub rate_limited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub url: String,
    pub success: bool,
    #[serde(skip)]
    pub content: String,
    pub content_kind: Option<ContentKind>,
    pub layer_used: Option<FetchLayer>,
    pub content_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Some layer was answered with HTTP 429
    pub rate_limited: bool,
    pub attempts: Vec<FetchAttempt>,
}

impl FetchResult {
    /// Failed result with no attempts, e.g. for an origin that is blocked.
    pub fn failed(url: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            content: String::new(),
            content_kind: None,
            layer_used: None,
            content_length: 0,
            error: Some(error.into()),
            rate_limited: false,
            attempts: Vec::new(),
        }
    }
}

/// A single retrieval strategy.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn layer(&self) -> FetchLayer;

    /// Layers that need credentials report false and are skipped
    fn is_configured(&self) -> bool {
        true
    }

    async fn retrieve(&self, url: &str) -> std::result::Result<Retrieved, RetrievalError>;
}

pub struct MultiLayerFetcher {
    retrievers: Vec<Box<dyn Retriever>>,
    min_content_length: usize,
}

impl MultiLayerFetcher {
    /// Builds the standard four-layer chain.
    pub fn from_config(config: &FetchConfig) -> Result<Self> {
        let retrievers: Vec<Box<dyn Retriever>> = vec![
            Box::new(DirectRetriever::new(config)?),
            Box::new(BrowserRetriever::new(config)?),
            Box::new(RenderingProxyRetriever::new(config)?),
            Box::new(ReaderProxyRetriever::new(config)?),
        ];
        Ok(Self::with_retrievers(retrievers, config.min_content_length))
    }

    /// Custom chain, tried in the given order.
    pub fn with_retrievers(retrievers: Vec<Box<dyn Retriever>>, min_content_length: usize) -> Self {
        Self {
            retrievers,
            min_content_length,
        }
    }

    pub fn layers(&self) -> Vec<FetchLayer> {
        self.retrievers.iter().map(|r| r.layer()).collect()
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchResult> {
        Url::parse(url).map_err(|e| ScoutError::invalid_url(url, e))?;

        let mut attempts = Vec::new();

        for retriever in &self.retrievers {
            let layer = retriever.layer();
            if !retriever.is_configured() {
                debug!(url = %url, layer = ?layer, "layer not configured, skipping");
                continue;
            }

            debug!(url = %url, layer = ?layer, "fetch attempt");
            let outcome = retriever
                .retrieve(url)
                .await
                .map_err(|e| (e.is_rate_limit(), 0, e.to_string()))
                .and_then(|retrieved| {
                    let bytes = retrieved.body.len();
                    validate_content(&retrieved.body, self.min_content_length)
                        .map(|()| retrieved)
                        .map_err(|reason| (false, bytes, reason))
                });

            match outcome {
                Ok(retrieved) => {
                    let content_length = retrieved.body.len();
                    attempts.push(FetchAttempt {
                        url: url.to_string(),
                        layer,
                        content_length,
                        success: true,
                        error: None,
                        rate_limited: false,
                    });
                    info!(url = %url, layer = ?layer, bytes = content_length, "fetched");
                    let rate_limited = attempts.iter().any(|a| a.rate_limited);
                    return Ok(FetchResult {
                        url: url.to_string(),
                        success: true,
                        content: retrieved.body,
                        content_kind: Some(retrieved.kind),
                        layer_used: Some(layer),
                        content_length,
                        error: None,
                        rate_limited,
                        attempts,
                    });
                }
                // Rejected bodies keep their size so the attempt log shows what came back
                Err((rate_limited, content_length, reason)) => {
                    warn!(url = %url, layer = ?layer, bytes = content_length, error = %reason, "fetch layer failed");
                    attempts.push(FetchAttempt {
                        url: url.to_string(),
                        layer,
                        content_length,
                        success: false,
                        error: Some(reason),
                        rate_limited,
                    });
                }
            }
        }

        let error = attempts
            .last()
            .and_then(|a| a.error.clone())
            .unwrap_or_else(|| "no retrieval layer available".to_string());
        warn!(url = %url, attempts = attempts.len(), "all fetch layers failed");

        Ok(FetchResult {
            url: url.to_string(),
            success: false,
            content: String::new(),
            content_kind: None,
            layer_used: None,
            content_length: 0,
            error: Some(format!("all layers failed; last error: {}", error)),
            rate_limited: attempts.iter().any(|a| a.rate_limited),
            attempts,
        })
    }
}

/// Checks a body a layer reported as successful.
///
/// Returns the reason it is unusable, if any.
pub fn validate_content(content: &str, min_content_length: usize) -> std::result::Result<(), String> {
    if content.len() <= min_content_length {
        return Err(format!(
            "content too short ({} bytes, need more than {})",
            content.len(),
            min_content_length
        ));
    }

    let lowered = content.to_lowercase();
    if let Some(marker) = BOT_CHALLENGE_MARKERS.iter().find(|m| lowered.contains(*m)) {
        return Err(format!("bot challenge detected ({})", marker));
    }

    Ok(())
}
