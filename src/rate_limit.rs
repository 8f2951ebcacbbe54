//! Per-venue rate limiting: a minimum-inter-request gate, exponential 429
//! backoff, and a TTL response cache keyed by request signature.
//!
//! One `VenueRateLimiter` is constructed per venue per process and passed to
//! whatever needs it — there is no ambient global state.  The spacing gate is
//! a queue, not a token bucket: concurrent callers line up on a fair mutex
//! and each sleeps out the remaining spacing before releasing it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::model::Venue;

/// Outcome of asking the limiter for permission to issue a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Proceed,
    /// The venue is being skipped; carries the reason (e.g. "backoff_active").
    Skip { reason: &'static str },
}

/// Per-venue backoff tracking.  Mutates only on request outcomes; cleared in
/// full on the first success.
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    pub consecutive_429: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub min_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

pub struct VenueRateLimiter {
    venue: Venue,
    cfg: RateLimitConfig,
    /// Spacing gate.  Tokio's mutex wakes waiters FIFO, which gives the
    /// required serialization order for free.
    gate: Mutex<Option<Instant>>,
    backoff: Mutex<BackoffState>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl VenueRateLimiter {
    pub fn new(venue: Venue, cfg: RateLimitConfig) -> Self {
        VenueRateLimiter {
            venue,
            cfg,
            gate: Mutex::new(None),
            backoff: Mutex::new(BackoffState::default()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Request permission to issue one request.  Either waits out the spacing
    /// interval and returns `Proceed`, or short-circuits with `Skip` while a
    /// backoff window is active.
    pub async fn acquire(&self) -> Acquire {
        {
            let backoff = self.backoff.lock().await;
            if let Some(until) = backoff.backoff_until {
                if Utc::now() < until {
                    debug!(
                        venue = %self.venue,
                        until = %until,
                        "request skipped: backoff active"
                    );
                    return Acquire::Skip {
                        reason: "backoff_active",
                    };
                }
            }
        }

        let mut last = self.gate.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.cfg.min_interval {
                tokio::time::sleep(self.cfg.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
        Acquire::Proceed
    }

    /// Report the outcome of a request issued after `acquire`.
    ///
    /// A success clears the consecutive-429 counter and any backoff window
    /// immediately.  A 429 activates (or extends) backoff, doubling on each
    /// consecutive hit up to the configured ceiling and honoring the server's
    /// `Retry-After` as a floor.
    pub async fn record_outcome(
        &self,
        success: bool,
        retry_after_secs: Option<u64>,
        status: Option<u16>,
    ) {
        let mut backoff = self.backoff.lock().await;
        if success {
            if backoff.consecutive_429 > 0 {
                debug!(venue = %self.venue, "backoff cleared after success");
            }
            *backoff = BackoffState::default();
            return;
        }

        if status == Some(429) {
            backoff.consecutive_429 += 1;
            backoff.last_retry_after_secs = retry_after_secs;
            let delay = next_backoff(
                backoff.consecutive_429,
                retry_after_secs,
                self.cfg.backoff_base,
                self.cfg.backoff_max,
            );
            backoff.backoff_until =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            warn!(
                venue = %self.venue,
                consecutive = backoff.consecutive_429,
                delay_ms = delay.as_millis() as u64,
                "rate limited (429), backing off"
            );
        }
        // Non-429 failures are the caller's problem; they do not suppress
        // future requests.
    }

    /// Current backoff state (for logging and tests).
    pub async fn backoff_state(&self) -> BackoffState {
        self.backoff.lock().await.clone()
    }

    /// Look up a cached response for this request signature, if still fresh.
    pub async fn cached(&self, signature: &str) -> Option<serde_json::Value> {
        let cache = self.cache.read().await;
        cache
            .get(signature)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Store a response body under this signature with an independent TTL.
    /// Expired entries are swept opportunistically on each store.
    pub async fn store(&self, signature: &str, value: serde_json::Value, ttl: Duration) {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        cache.retain(|_, e| e.expires_at > now);
        cache.insert(
            signature.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }
}

/// Backoff delay for the Nth consecutive 429:
/// `max(base, retry_after) * 2^(n-1)`, capped at `max`.
pub fn next_backoff(
    consecutive: u32,
    retry_after_secs: Option<u64>,
    base: Duration,
    max: Duration,
) -> Duration {
    let floor_ms = base
        .as_millis()
        .max(retry_after_secs.unwrap_or(0) as u128 * 1000) as u64;
    let shift = consecutive.saturating_sub(1).min(16);
    let delay_ms = floor_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay_ms).min(max)
}

/// Normalized request signature: endpoint plus sorted query params.  Two
/// requests that differ only in parameter order share a cache entry.
pub fn request_signature(endpoint: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort();
    let mut sig = endpoint.to_string();
    for (k, v) in sorted {
        sig.push('&');
        sig.push_str(k);
        sig.push('=');
        sig.push_str(v);
    }
    sig
}
