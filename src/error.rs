// src/error.rs
// =============================================================================
// Typed errors for the library surface.
//
// Only programmer/configuration mistakes (a malformed URL, a bad config
// value) and storage failures come back as `Err`. Network trouble never
// does: fetch failures live inside `FetchResult`, extraction failures are
// counted as empty pages, and records without identity are still promoted.
// =============================================================================

use thiserror::Error;

/// Errors returned by the acquisition and deduplication core.
#[derive(Debug, Error)]
pub enum ScoutError {
    /// A URL handed to one of the components could not be parsed
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The catalog backend failed
    #[error("catalog store error: {0}")]
    Store(#[from] StoreError),

    /// A setting is out of range or a config file is unreadable
    #[error("config error: {0}")]
    Config(String),

    /// JSON parse error (config files, field bags)
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScoutError {
    pub fn invalid_url(url: &str, reason: impl ToString) -> Self {
        ScoutError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by a `CatalogStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record id that should exist is missing
    #[error("record not found: {0}")]
    NotFound(uuid::Uuid),

    /// Backend-specific failure (connection, constraint, ...)
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Why a single fetch layer failed.
///
/// These are captured into `FetchAttempt::error`; they never escape
/// `MultiLayerFetcher::fetch` as an `Err`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrievalError {
    /// Server answered with a non-success status
    #[error("HTTP {0}")]
    Status(u16),

    /// Request timed out
    #[error("request timed out")]
    Timeout,

    /// Connection, TLS, DNS or body read failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Layer needs a credential that is not configured
    #[error("layer not configured")]
    NotConfigured,
}

impl RetrievalError {
    /// HTTP 429 is the one status treated as an explicit rate-limit signal
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RetrievalError::Status(429))
    }
}

impl From<reqwest::Error> for RetrievalError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            RetrievalError::Timeout
        } else if let Some(status) = error.status() {
            RetrievalError::Status(status.as_u16())
        } else {
            RetrievalError::Transport(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ScoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_status() {
        assert!(RetrievalError::Status(429).is_rate_limit());
        assert!(!RetrievalError::Status(503).is_rate_limit());
        assert!(!RetrievalError::Timeout.is_rate_limit());
    }

    #[test]
    fn test_invalid_url_message() {
        let err = ScoutError::invalid_url("nota url", "relative URL without a base");
        assert_eq!(
            err.to_string(),
            "invalid URL 'nota url': relative URL without a base"
        );
    }
}
