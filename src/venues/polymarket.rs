//! Polymarket Gamma API client.
//!
//! The markets endpoint is open (no auth) and pages by offset/limit.  Prices
//! arrive as 0–1 strings in either a `tokens` array or an `outcomePrices`
//! pair depending on endpoint vintage, so parsing tries both before giving
//! up on a listing.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{info, warn};

use crate::matching::normalize;
use crate::model::{Market, MarketKind, Venue, VendorEvent};
use crate::rate_limit::VenueRateLimiter;
use crate::venues::{
    field_bool, field_f64, field_str, field_time, rate_limited_get, FetchOutcome, FetchedJson,
    VenueClient,
};

const PAGE_LIMIT: usize = 100;

pub struct PolymarketClient {
    http: Client,
    api_url: String,
    limiter: Arc<VenueRateLimiter>,
    max_pages: u32,
    max_items: usize,
    cache_ttl: StdDuration,
}

impl PolymarketClient {
    pub fn new(
        api_url: &str,
        limiter: Arc<VenueRateLimiter>,
        max_pages: u32,
        max_items: usize,
        cache_ttl: StdDuration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(StdDuration::from_secs(15))
            .build()?;
        Ok(PolymarketClient {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            limiter,
            max_pages,
            max_items,
            cache_ttl,
        })
    }
}

#[async_trait::async_trait]
impl VenueClient for PolymarketClient {
    async fn fetch_markets(&self) -> Result<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        let url = format!("{}/markets", self.api_url);
        let now = Utc::now();
        let mut offset = 0usize;

        for _page in 0..self.max_pages {
            if outcome.raw_count >= self.max_items {
                break;
            }
            let params = [
                ("active", "true".to_string()),
                ("closed", "false".to_string()),
                ("limit", PAGE_LIMIT.to_string()),
                ("offset", offset.to_string()),
            ];
            let fetched = rate_limited_get(
                &self.http,
                &self.limiter,
                &url,
                "/markets",
                &params,
                &[],
                Some(self.cache_ttl),
            )
            .await?;
            let raw = match fetched {
                FetchedJson::Skipped(reason) => {
                    if outcome.raw_count == 0 {
                        return Ok(FetchOutcome::skipped(reason));
                    }
                    warn!(reason, "polymarket page skipped mid-refresh");
                    break;
                }
                other => match other.into_value() {
                    Some(v) => v,
                    None => break,
                },
            };

            // Both bare arrays and { "markets": [...] } envelopes occur
            let items = match raw.as_array() {
                Some(a) => a.clone(),
                None => raw
                    .get("markets")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default(),
            };
            if items.is_empty() {
                break;
            }
            let page_len = items.len();
            for item in &items {
                if outcome.raw_count >= self.max_items {
                    break;
                }
                outcome.raw_count += 1;
                match parse_market(item, now) {
                    Some((market, event)) => {
                        outcome.markets.push(market);
                        outcome.events.push(event);
                    }
                    None => outcome.filtered_count += 1,
                }
            }
            if page_len < PAGE_LIMIT {
                break;
            }
            offset += page_len;
        }

        dedup_events(&mut outcome.events);
        info!(
            markets = outcome.markets.len(),
            events = outcome.events.len(),
            raw = outcome.raw_count,
            filtered = outcome.filtered_count,
            "polymarket refresh complete"
        );
        Ok(outcome)
    }

    fn venue(&self) -> Venue {
        Venue::Polymarket
    }

    fn name(&self) -> &str {
        "polymarket"
    }
}

// ── Parsing ────────────────────────────────────────────────────────────────────

fn parse_market(
    item: &serde_json::Value,
    now: DateTime<Utc>,
) -> Option<(Market, VendorEvent)> {
    let id = field_str(item, &["conditionId", "condition_id", "id"])?;
    let question = field_str(item, &["question", "title"])?.to_string();
    if field_bool(item, &["closed"]).unwrap_or(false) {
        return None;
    }
    let close_time = field_time(item, &["endDate", "end_date_iso", "endDateIso"])?;
    if close_time <= now {
        return None;
    }

    let (yes, no) = parse_token_prices(item)?;
    // Gamma quotes probabilities 0–1; canonical prices are cents
    let yes_price = yes * 100.0;
    let no_price = no * 100.0;
    if !(0.0..=100.0).contains(&yes_price) || !(0.0..=100.0).contains(&no_price) {
        return None;
    }

    let event_id = item
        .get("events")
        .and_then(|e| e.as_array())
        .and_then(|a| a.first())
        .and_then(|e| field_str(e, &["id", "slug"]))
        .unwrap_or(id)
        .to_string();
    let sport = field_str(item, &["category", "sport"]).map(|s| s.to_lowercase());
    let start_time = field_time(item, &["gameStartTime", "startDate", "start_date_iso"]);

    let market = Market {
        venue: Venue::Polymarket,
        ticker: id.to_string(),
        title: question.clone(),
        kind: MarketKind::ProbabilityCents,
        yes_price: Some(yes_price),
        no_price: Some(no_price),
        home_odds: None,
        away_odds: None,
        yes_bid: field_f64(item, &["bestBid", "best_bid"]).map(|p| p * 100.0),
        yes_ask: field_f64(item, &["bestAsk", "best_ask"]).map(|p| p * 100.0),
        volume: field_f64(item, &["volumeNum", "volume", "liquidityNum"]),
        close_time,
        event_ticker: Some(event_id.clone()),
        fetched_at: now,
    };

    let normalized = normalize(&question, sport.as_deref());
    let event = VendorEvent {
        venue: Venue::Polymarket,
        event_id,
        raw_title: question,
        normalized_title: normalized.title,
        tokens: normalized.tokens,
        sport,
        vendor_closed: false,
        start_time,
        close_time: Some(close_time),
        home_team: None,
        away_team: None,
    };
    Some((market, event))
}

/// YES/NO probabilities from either price shape the API serves.
fn parse_token_prices(item: &serde_json::Value) -> Option<(f64, f64)> {
    if let Some(tokens) = item.get("tokens").and_then(|v| v.as_array()) {
        let mut yes = None;
        let mut no = None;
        for token in tokens {
            let outcome = field_str(token, &["outcome"]).unwrap_or("").to_lowercase();
            let price = field_f64(token, &["price"]);
            match outcome.as_str() {
                "yes" => yes = price,
                "no" => no = price,
                _ => {}
            }
        }
        if let (Some(y), Some(n)) = (yes, no) {
            return Some((y, n));
        }
    }

    // Fallback: outcomePrices pair, sometimes a JSON-encoded string
    let prices = match item.get("outcomePrices") {
        Some(serde_json::Value::Array(a)) => a.clone(),
        Some(serde_json::Value::String(s)) => {
            serde_json::from_str::<Vec<serde_json::Value>>(s).ok()?
        }
        _ => return None,
    };
    let as_f64 = |v: &serde_json::Value| {
        v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    };
    let yes = prices.first().and_then(as_f64)?;
    let no = prices.get(1).and_then(as_f64)?;
    Some((yes, no))
}

/// Multi-market events produce one vendor event per market; keep the first
/// sighting per event ID.
fn dedup_events(events: &mut Vec<VendorEvent>) {
    let mut seen = std::collections::HashSet::new();
    events.retain(|e| seen.insert(e.event_id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_parse_tokens_shape() {
        let now = Utc::now();
        let item = json!({
            "conditionId": "0xabc",
            "question": "Will the Lakers beat the Celtics?",
            "endDate": (now + Duration::hours(3)).to_rfc3339(),
            "gameStartTime": (now + Duration::hours(1)).to_rfc3339(),
            "category": "NBA",
            "tokens": [
                {"outcome": "Yes", "price": "0.43"},
                {"outcome": "No", "price": "0.59"}
            ],
            "volumeNum": 25000.0
        });
        let (market, event) = parse_market(&item, now).unwrap();
        assert_eq!(market.yes_price, Some(43.0));
        assert_eq!(market.no_price, Some(59.0));
        assert_eq!(event.sport.as_deref(), Some("nba"));
        assert!(event.tokens.contains("lakers"));
        assert!(event.start_time.is_some());
    }

    #[test]
    fn test_parse_outcome_prices_string_fallback() {
        let now = Utc::now();
        let item = json!({
            "id": "12345",
            "question": "Celtics vs Lakers",
            "endDate": (now + Duration::hours(3)).to_rfc3339(),
            "outcomePrices": "[\"0.58\", \"0.44\"]"
        });
        let (market, _) = parse_market(&item, now).unwrap();
        // 0.58 × 100 is not exactly 58 in f64
        assert_relative_eq!(market.yes_price.unwrap(), 58.0, epsilon = 1e-9);
        assert_relative_eq!(market.no_price.unwrap(), 44.0, epsilon = 1e-9);
    }

    #[test]
    fn test_closed_and_priceless_markets_dropped() {
        let now = Utc::now();
        let end = (now + Duration::hours(3)).to_rfc3339();
        let closed = json!({
            "id": "1", "question": "x", "endDate": end, "closed": true,
            "outcomePrices": ["0.5", "0.5"]
        });
        assert!(parse_market(&closed, now).is_none());

        let no_prices = json!({"id": "2", "question": "x", "endDate": end});
        assert!(parse_market(&no_prices, now).is_none());
    }

    #[test]
    fn test_event_id_prefers_event_envelope() {
        let now = Utc::now();
        let item = json!({
            "id": "m1",
            "question": "Knicks vs Heat",
            "endDate": (now + Duration::hours(3)).to_rfc3339(),
            "events": [{"id": "ev-789"}],
            "outcomePrices": ["0.5", "0.52"]
        });
        let (market, event) = parse_market(&item, now).unwrap();
        assert_eq!(event.event_id, "ev-789");
        assert_eq!(market.event_ticker.as_deref(), Some("ev-789"));
    }

    #[test]
    fn test_dedup_events_keeps_first() {
        let now = Utc::now();
        let end = (now + Duration::hours(3)).to_rfc3339();
        let mk = |id: &str, q: &str| {
            parse_market(
                &json!({"id": id, "question": q, "endDate": end,
                        "events": [{"id": "ev-1"}], "outcomePrices": ["0.5", "0.5"]}),
                now,
            )
            .unwrap()
            .1
        };
        let mut events = vec![mk("m1", "Lakers vs Celtics"), mk("m2", "Lakers vs Celtics spread")];
        dedup_events(&mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw_title, "Lakers vs Celtics");
    }
}
