// src/ratelimit/origin.rs
// =============================================================================
// Per-origin bookkeeping for the rate limiter.
//
// One OriginState exists per lower-cased hostname. It is created lazily on
// the first request and lives until the process exits or `reset` is called.
// =============================================================================

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::config::RateLimitConfig;
use crate::error::{Result, ScoutError};

// Exponent cap so 2^n never overflows before the max_backoff clamp applies
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Default)]
pub(crate) struct OriginState {
    /// Start time of the most recently granted request (may be in the future
    /// while a caller is still waiting out its slot)
    pub last_request_time: Option<Instant>,
    pub consecutive_errors: u32,
    pub is_blocked: bool,
    pub blocked_until: Option<Instant>,
    pub total_requests: u64,
    pub total_errors: u64,
}

impl OriginState {
    // True while a block is in force at `now`
    pub fn blocked_at(&self, now: Instant) -> bool {
        self.is_blocked && self.blocked_until.map_or(false, |until| now < until)
    }

    // Lifts an expired block and forgets the failure streak
    pub fn clear_block(&mut self) {
        self.is_blocked = false;
        self.blocked_until = None;
        self.consecutive_errors = 0;
    }

    pub fn block_for(&mut self, duration: Duration, now: Instant) {
        let until = now + duration;
        // Never shorten a block that is already running longer
        let until = match self.blocked_until {
            Some(existing) if self.is_blocked && existing > until => existing,
            _ => until,
        };
        self.is_blocked = true;
        self.blocked_until = Some(until);
    }

    pub fn snapshot(&self, origin: &str, now: Instant) -> OriginStats {
        let blocked = self.blocked_at(now);
        OriginStats {
            origin: origin.to_string(),
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            consecutive_errors: self.consecutive_errors,
            is_blocked: blocked,
            blocked_for_secs: if blocked {
                self.blocked_until
                    .map(|until| until.saturating_duration_since(now).as_secs_f64())
            } else {
                None
            },
        }
    }
}

/// Read-only view of one origin, returned by `RateLimiter::get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginStats {
    pub origin: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub is_blocked: bool,
    /// Remaining block time, present only while blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_for_secs: Option<f64>,
}

// Block length for an origin that just crossed the error threshold or sent
// an explicit rate-limit signal.
//
//   base * 2^(errors beyond the threshold), capped at max_backoff,
//   then doubled again for a rate-limit signal.
//
// The doubling happens after the cap so a 429 always blocks strictly longer
// than the same number of plain failures.
pub(crate) fn backoff_duration(
    config: &RateLimitConfig,
    consecutive_errors: u32,
    is_rate_limit_signal: bool,
) -> Duration {
    let excess = consecutive_errors
        .saturating_sub(config.max_consecutive_errors)
        .min(MAX_BACKOFF_EXPONENT);
    let exponential = config.base_backoff().saturating_mul(1u32 << excess);
    let capped = exponential.min(config.max_backoff());

    if is_rate_limit_signal {
        capped.saturating_mul(2)
    } else {
        capped
    }
}

/// Returns the rate-limiting key for a URL: its lower-cased hostname.
pub fn origin_key(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| ScoutError::invalid_url(url, e))?;
    parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase())
        .ok_or_else(|| ScoutError::invalid_url(url, "URL has no host"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: 1.0,
            max_consecutive_errors: 3,
            base_backoff_secs: 5.0,
            max_backoff_secs: 300.0,
        }
    }

    #[test]
    fn test_origin_key_lowercases_host() {
        assert_eq!(origin_key("https://WWW.Zukerman.com.br/imoveis").unwrap(), "www.zukerman.com.br");
        assert_eq!(origin_key("http://leilao.example:8080/a").unwrap(), "leilao.example");
    }

    #[test]
    fn test_origin_key_rejects_malformed() {
        assert!(origin_key("not a url").is_err());
        assert!(origin_key("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = config();
        assert_eq!(backoff_duration(&config, 3, false), Duration::from_secs(5));
        assert_eq!(backoff_duration(&config, 4, false), Duration::from_secs(10));
        assert_eq!(backoff_duration(&config, 5, false), Duration::from_secs(20));
        assert_eq!(backoff_duration(&config, 40, false), Duration::from_secs(300));
    }

    #[test]
    fn test_rate_limit_signal_doubles_even_at_cap() {
        let config = config();
        assert_eq!(backoff_duration(&config, 1, true), Duration::from_secs(10));
        assert_eq!(backoff_duration(&config, 40, true), Duration::from_secs(600));
    }
}
