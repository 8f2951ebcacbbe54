//! Venue ingestion clients.
//!
//! Each venue module turns its API's listings into canonical [`Market`] and
//! [`VendorEvent`] records.  Everything shared across venues lives here: the
//! client trait, the rate-limited fetch path, and the defensive JSON helpers
//! that cope with field renames across API versions.

pub mod kalshi;
pub mod kalshi_auth;
pub mod polymarket;
pub mod sportsbook;

use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use tracing::{debug, warn};

use crate::model::{Market, Venue, VendorEvent};
use crate::rate_limit::{request_signature, Acquire, VenueRateLimiter};

/// What one refresh cycle produced for a venue.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub markets: Vec<Market>,
    pub events: Vec<VendorEvent>,
    /// Listings seen before filtering
    pub raw_count: usize,
    /// Listings dropped by filters (closed, one-sided, unparseable expiry)
    pub filtered_count: usize,
    /// Set when the venue was skipped entirely this cycle
    pub skip_reason: Option<String>,
}

impl FetchOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        FetchOutcome {
            skip_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Trait that every venue client must implement.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Fetch the venue's current listings, normalized to canonical records.
    ///
    /// Rate-limit skips and missing credentials are reported via
    /// `FetchOutcome::skip_reason`, not as errors — a skipped venue this
    /// cycle is normal operation, not a failure.
    async fn fetch_markets(&self) -> Result<FetchOutcome>;

    fn venue(&self) -> Venue;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Result of a rate-limited GET: fresh body, cache hit, or a skip.
#[derive(Debug)]
pub enum FetchedJson {
    Fresh(serde_json::Value),
    Cached(serde_json::Value),
    Skipped(&'static str),
}

impl FetchedJson {
    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            FetchedJson::Fresh(v) | FetchedJson::Cached(v) => Some(v),
            FetchedJson::Skipped(_) => None,
        }
    }
}

/// Issue one GET through the venue's rate limiter.
///
/// Checks the response cache first (when a TTL is given), then acquires the
/// spacing gate, and reports the outcome back to the limiter so 429 backoff
/// state stays accurate.  A 429 comes back as `Skipped("rate_limited")`
/// rather than an error; the cycle carries on with the other venues.
pub async fn rate_limited_get(
    http: &Client,
    limiter: &VenueRateLimiter,
    url: &str,
    endpoint: &str,
    params: &[(&str, String)],
    headers: &[(String, String)],
    cache_ttl: Option<StdDuration>,
) -> Result<FetchedJson> {
    let param_refs: Vec<(&str, &str)> =
        params.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let signature = request_signature(endpoint, &param_refs);

    if cache_ttl.is_some() {
        if let Some(value) = limiter.cached(&signature).await {
            debug!(endpoint, "response cache hit");
            return Ok(FetchedJson::Cached(value));
        }
    }

    match limiter.acquire().await {
        Acquire::Proceed => {}
        Acquire::Skip { reason } => return Ok(FetchedJson::Skipped(reason)),
    }

    let mut req = http.get(url).query(params);
    for (name, value) in headers {
        req = req.header(name.as_str(), value.as_str());
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            limiter.record_outcome(false, None, None).await;
            return Err(e).with_context(|| format!("Request to {} failed", endpoint));
        }
    };

    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        limiter
            .record_outcome(false, retry_after, Some(429))
            .await;
        warn!(endpoint, ?retry_after, "rate limited (429)");
        return Ok(FetchedJson::Skipped("rate_limited"));
    }
    if !status.is_success() {
        limiter
            .record_outcome(false, None, Some(status.as_u16()))
            .await;
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{} returned {}: {}", endpoint, status, body);
    }

    limiter.record_outcome(true, None, None).await;
    let value: serde_json::Value = resp
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", endpoint))?;
    if let Some(ttl) = cache_ttl {
        limiter.store(&signature, value.clone(), ttl).await;
    }
    Ok(FetchedJson::Fresh(value))
}

// ── JSON field helpers ─────────────────────────────────────────────────────────

/// First present string field among `keys`, in order.
pub fn field_str<'a>(item: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| item.get(*k).and_then(|v| v.as_str()))
}

/// First present numeric field among `keys`; numeric strings count too, as
/// several venue APIs quote their decimals.
pub fn field_f64(item: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        let v = item.get(*k)?;
        v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

pub fn field_bool(item: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| item.get(*k).and_then(|v| v.as_bool()))
}

/// Parse a timestamp that may be an RFC 3339 string, epoch seconds, or epoch
/// milliseconds.  Values above ~year 2603 in seconds are assumed to be
/// milliseconds.
pub fn parse_time(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    if let Some(s) = v.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok();
    }
    let n = v.as_i64()?;
    if n <= 0 {
        return None;
    }
    if n > 20_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

/// First present timestamp field among `keys`.
pub fn field_time(item: &serde_json::Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .find_map(|k| item.get(*k).and_then(parse_time))
}

/// Effective YES price in cents for book-shaped venues, best source first:
/// the ask you can actually lift, the ask implied by the opposing side's bid,
/// your own side's bid, and finally the last trade.
pub fn yes_price_fallback(
    yes_ask: Option<f64>,
    no_bid: Option<f64>,
    yes_bid: Option<f64>,
    last_price: Option<f64>,
) -> Option<f64> {
    yes_ask
        .filter(|p| *p > 0.0)
        .or_else(|| no_bid.filter(|p| *p > 0.0).map(|p| 100.0 - p))
        .or_else(|| yes_bid.filter(|p| *p > 0.0))
        .or_else(|| last_price.filter(|p| *p > 0.0))
}
