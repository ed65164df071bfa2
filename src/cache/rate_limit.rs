//! Fixed-Window Rate Limiter
//!
//! Counts requests per key in fixed windows aligned to the Unix epoch. Each
//! window has its own counter in the shared store, created with an expiry of
//! one window so counters clean themselves up.
//!
//! A client can burst up to `2 * max` across a window boundary; that is the
//! accepted cost of fixed windows.

use crate::cache::storage::{bounded, SharedStoreRef};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix for rate-limit counters in the shared store
pub const RATE_LIMIT_KEY_PREFIX: &str = "ratelimit:";

/// Outcome of one rate-limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// Start of the next window
    pub reset_at: DateTime<Utc>,
}

/// Fixed window containing an instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    index: i64,
    reset_at: DateTime<Utc>,
}

impl Window {
    fn containing(now: DateTime<Utc>, length: Duration) -> Self {
        let length_ms = (length.as_millis() as i64).max(1);
        let index = now.timestamp_millis().div_euclid(length_ms);
        let reset_at = DateTime::<Utc>::from_timestamp_millis((index + 1) * length_ms).unwrap_or(now);
        Self { index, reset_at }
    }
}

/// Per-key request counter over the shared store
pub struct RateLimiter {
    store: SharedStoreRef,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: SharedStoreRef, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Count one request for `key` against `max` per `window`
    pub async fn check(&self, key: &str, max: u64, window: Duration) -> RateLimitDecision {
        self.check_at(key, max, window, Utc::now()).await
    }

    /// Count one request as if made at `now`
    ///
    /// Fails open: if the store is unreachable the request is allowed with
    /// the full allowance reported.
    pub async fn check_at(
        &self,
        key: &str,
        max: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let current = Window::containing(now, window);
        let counter = format!("{}{}:{}", RATE_LIMIT_KEY_PREFIX, key, current.index);

        let count = match bounded("INCR", self.timeout, self.store.incr(&counter)).await {
            Ok(count) => u64::try_from(count).unwrap_or(0),
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
                return RateLimitDecision {
                    allowed: true,
                    remaining: max,
                    reset_at: current.reset_at,
                };
            }
        };

        if count == 1 {
            if let Err(e) = bounded("EXPIRE", self.timeout, self.store.expire(&counter, window)).await {
                warn!(key = %key, error = %e, "Failed to set rate limit window expiry");
            }
        }

        let allowed = count <= max;
        if !allowed {
            debug!(key = %key, count = count, max = max, "Rate limit exceeded");
        }

        RateLimitDecision {
            allowed,
            remaining: max.saturating_sub(count),
            reset_at: current.reset_at,
        }
    }
}
