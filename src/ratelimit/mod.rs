// src/ratelimit/mod.rs
// =============================================================================
// Adaptive per-origin rate limiter.
//
// What it does:
// - Spaces requests to the same hostname at least 1 / requests_per_second
//   apart, suspending the caller until its slot comes up
// - Counts failures per origin and blocks the origin for an exponentially
//   growing period once the streak reaches the threshold (or immediately
//   on an explicit 429)
// - Lets a blocked origin's `acquire` return false until the block expires,
//   then clears the block and the error streak
//
// Locking:
// - The origin map is behind one short-lived mutex used only to find or
//   create an origin's slot
// - Each origin has its own mutex, so callers on different hosts never
//   wait on each other while callers on the same host are serialized
// - No lock is held across an .await: `acquire` reserves its slot under the
//   lock, then sleeps outside it
// =============================================================================

mod origin;

pub use origin::{origin_key, OriginStats};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;
use crate::error::Result;
use origin::{backoff_duration, OriginState};

type OriginSlot = Arc<Mutex<OriginState>>;

/// Shared by reference (or by cheap clone) across every scrape session in
/// the process.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    origins: Arc<Mutex<HashMap<String, OriginSlot>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            origins: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits until `url`'s origin may be hit again.
    ///
    /// Returns `Ok(false)` without waiting if the origin is blocked. Only a
    /// malformed URL produces an error.
    pub async fn acquire(&self, url: &str) -> Result<bool> {
        let origin = origin_key(url)?;
        let slot = self.slot(&origin);

        let wait = {
            let mut state = lock(&slot);
            let now = Instant::now();

            if state.is_blocked {
                if state.blocked_at(now) {
                    debug!(origin = %origin, "origin blocked, skipping");
                    return Ok(false);
                }
                state.clear_block();
                info!(origin = %origin, "origin block expired");
            }

            let ready_at = state
                .last_request_time
                .map(|last| last + self.config.min_interval())
                .unwrap_or(now);
            let start = ready_at.max(now);
            state.last_request_time = Some(start);
            state.total_requests += 1;
            start - now
        };

        if !wait.is_zero() {
            debug!(origin = %origin, wait_ms = wait.as_millis() as u64, "waiting for request slot");
            tokio::time::sleep(wait).await;
        }

        Ok(true)
    }

    /// Resets the origin's failure streak.
    pub fn record_success(&self, url: &str) -> Result<()> {
        let origin = origin_key(url)?;
        let slot = self.slot(&origin);
        lock(&slot).consecutive_errors = 0;
        Ok(())
    }

    /// Counts a failure and blocks the origin when the streak reaches the
    /// threshold or the server explicitly asked us to slow down.
    pub fn record_error(&self, url: &str, is_rate_limit_signal: bool) -> Result<()> {
        let origin = origin_key(url)?;
        let slot = self.slot(&origin);
        let mut state = lock(&slot);

        state.consecutive_errors += 1;
        state.total_errors += 1;

        if state.consecutive_errors >= self.config.max_consecutive_errors || is_rate_limit_signal {
            let duration =
                backoff_duration(&self.config, state.consecutive_errors, is_rate_limit_signal);
            state.block_for(duration, Instant::now());
            warn!(
                origin = %origin,
                consecutive_errors = state.consecutive_errors,
                rate_limited = is_rate_limit_signal,
                block_secs = duration.as_secs_f64(),
                "blocking origin"
            );
        }

        Ok(())
    }

    /// Snapshot of one origin (if `url` is given) or of every known origin.
    /// Never creates or changes state.
    pub fn get_stats(&self, url: Option<&str>) -> Result<HashMap<String, OriginStats>> {
        let now = Instant::now();
        let origins = lock(&self.origins);

        match url {
            Some(url) => {
                let origin = origin_key(url)?;
                Ok(origins
                    .get(&origin)
                    .map(|slot| (origin.clone(), lock(slot).snapshot(&origin, now)))
                    .into_iter()
                    .collect())
            }
            None => Ok(origins
                .iter()
                .map(|(origin, slot)| (origin.clone(), lock(slot).snapshot(origin, now)))
                .collect()),
        }
    }

    /// Forgets one origin, or all of them.
    pub fn reset(&self, url: Option<&str>) -> Result<()> {
        let mut origins = lock(&self.origins);
        match url {
            Some(url) => {
                origins.remove(&origin_key(url)?);
            }
            None => origins.clear(),
        }
        Ok(())
    }

    fn slot(&self, origin: &str) -> OriginSlot {
        let mut origins = lock(&self.origins);
        origins
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OriginState::default())))
            .clone()
    }
}

// A panic while holding the lock leaves plain counters behind; keep going
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
