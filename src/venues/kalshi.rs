//! Kalshi trade-API client: scored series discovery plus per-series market
//! fetch with cursor pagination.
//!
//! Kalshi lists tens of thousands of markets, so the client first discovers
//! sports series, scores them (single-game series up, futures/parlay series
//! down), and only pulls markets for the top scorers.  The API's `status`
//! filter is applied server-side; the close-time window has to be applied
//! client-side because the markets endpoint rejects combining the two.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::matching::normalize;
use crate::model::{Market, MarketKind, Venue, VendorEvent};
use crate::rate_limit::VenueRateLimiter;
use crate::venues::kalshi_auth::RequestSigner;
use crate::venues::{
    field_f64, field_str, field_time, rate_limited_get, yes_price_fallback, FetchOutcome,
    FetchedJson, VenueClient,
};

const MARKETS_PATH: &str = "/trade-api/v2/markets";
const SERIES_PATH: &str = "/trade-api/v2/series";
const PAGE_LIMIT: u32 = 100;

pub struct KalshiConfig {
    pub top_series: usize,
    pub inter_series_delay: StdDuration,
    pub denylist: Vec<String>,
    pub allowlist: Vec<String>,
    pub max_pages: u32,
    pub max_items: usize,
    pub market_cache_ttl: StdDuration,
    pub series_cache_ttl: StdDuration,
}

pub struct KalshiClient {
    http: Client,
    base_url: String,
    signer: Option<RequestSigner>,
    limiter: Arc<VenueRateLimiter>,
    cfg: KalshiConfig,
}

/// Signed paths embed the `/trade-api/v2` prefix (the signature covers the
/// full path), so a configured base URL that also carries it must not repeat
/// it in the final URL.
fn host_base(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    trimmed
        .strip_suffix("/trade-api/v2")
        .unwrap_or(trimmed)
        .to_string()
}

impl KalshiClient {
    pub fn new(
        api_url: &str,
        signer: Option<RequestSigner>,
        limiter: Arc<VenueRateLimiter>,
        cfg: KalshiConfig,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(StdDuration::from_secs(15))
            .build()?;
        Ok(KalshiClient {
            http,
            base_url: host_base(api_url),
            signer,
            limiter,
            cfg,
        })
    }

    async fn signed_get(
        &self,
        path: &str,
        params: &[(&str, String)],
        cache_ttl: StdDuration,
    ) -> Result<FetchedJson> {
        // Unsignable requests are not sent at all.
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("signer not configured"))?;
        let headers = signer.headers("GET", path, "")?;
        let url = format!("{}{}", self.base_url, path);
        rate_limited_get(
            &self.http,
            &self.limiter,
            &url,
            path,
            params,
            &headers,
            Some(cache_ttl),
        )
        .await
    }

    /// List sports series and pick the top scorers.
    async fn discover_series(&self) -> Result<Vec<String>> {
        let params = [
            ("category", "Sports".to_string()),
            ("limit", "200".to_string()),
        ];
        let fetched = self
            .signed_get(SERIES_PATH, &params, self.cfg.series_cache_ttl)
            .await?;
        let Some(raw) = fetched.into_value() else {
            return Ok(vec![]);
        };
        let empty = vec![];
        let items = raw
            .get("series")
            .and_then(|v| v.as_array())
            .unwrap_or(&empty);

        let mut scored: Vec<(f64, String)> = items
            .iter()
            .filter_map(|item| {
                let ticker = field_str(item, &["ticker", "series_ticker"])?;
                let title = field_str(item, &["title", "name"]).unwrap_or("");
                let latest_close = field_time(item, &["latest_close_time", "latestCloseTime"]);
                let score = score_series(
                    ticker,
                    title,
                    latest_close,
                    &self.cfg.denylist,
                    &self.cfg.allowlist,
                    Utc::now(),
                );
                (score > 0.0).then(|| (score, ticker.to_string()))
            })
            .collect();
        // Ties break by ticker so the selection is deterministic
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(self.cfg.top_series);

        debug!(selected = ?scored, "kalshi series selected");
        Ok(scored.into_iter().map(|(_, t)| t).collect())
    }

    /// Pull one series' open markets, following cursors up to the page and
    /// item caps.
    async fn fetch_series_markets(
        &self,
        series: &str,
        outcome: &mut FetchOutcome,
        items_budget: &mut usize,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        let now = Utc::now();
        for _page in 0..self.cfg.max_pages {
            if *items_budget == 0 {
                break;
            }
            let mut params = vec![
                ("series_ticker", series.to_string()),
                ("status", "open".to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let fetched = self
                .signed_get(MARKETS_PATH, &params, self.cfg.market_cache_ttl)
                .await?;
            let raw = match fetched {
                FetchedJson::Skipped(reason) => {
                    // A mid-refresh rate limit keeps what we already have
                    warn!(series, reason, "kalshi page skipped");
                    break;
                }
                other => match other.into_value() {
                    Some(v) => v,
                    None => break,
                },
            };

            let empty = vec![];
            let items = raw
                .get("markets")
                .and_then(|v| v.as_array())
                .unwrap_or(&empty);
            for item in items {
                if *items_budget == 0 {
                    break;
                }
                *items_budget -= 1;
                outcome.raw_count += 1;
                match parse_market(item, now) {
                    Some(m) => outcome.markets.push(m),
                    None => outcome.filtered_count += 1,
                }
            }

            cursor = raw
                .get("cursor")
                .and_then(|v| v.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl VenueClient for KalshiClient {
    async fn fetch_markets(&self) -> Result<FetchOutcome> {
        if self.signer.is_none() {
            info!("kalshi skipped: credentials not configured");
            return Ok(FetchOutcome::skipped("missing_credentials"));
        }

        let series = self.discover_series().await?;
        if series.is_empty() {
            return Ok(FetchOutcome::skipped("no_series_selected"));
        }

        let mut outcome = FetchOutcome::default();
        let mut items_budget = self.cfg.max_items;
        for (i, s) in series.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.cfg.inter_series_delay).await;
            }
            if let Err(e) = self
                .fetch_series_markets(s, &mut outcome, &mut items_budget)
                .await
            {
                warn!(series = %s, error = %e, "kalshi series fetch failed");
            }
        }

        outcome.events = events_from_markets(&outcome.markets);
        info!(
            markets = outcome.markets.len(),
            events = outcome.events.len(),
            raw = outcome.raw_count,
            filtered = outcome.filtered_count,
            "kalshi refresh complete"
        );
        Ok(outcome)
    }

    fn venue(&self) -> Venue {
        Venue::Kalshi
    }

    fn name(&self) -> &str {
        "kalshi"
    }
}

// ── Series scoring ─────────────────────────────────────────────────────────────

/// Score a series for fetch priority.  Single-game series score up,
/// futures/season-long and combo series score down, the operator's
/// allowlist overrides everything.
pub fn score_series(
    ticker: &str,
    title: &str,
    latest_close: Option<DateTime<Utc>>,
    denylist: &[String],
    allowlist: &[String],
    now: DateTime<Utc>,
) -> f64 {
    let ticker_upper = ticker.to_uppercase();
    let title_lower = title.to_lowercase();

    if allowlist.iter().any(|a| ticker_upper.contains(&a.to_uppercase())) {
        return 10.0;
    }

    let mut score = 1.0;
    if ticker_upper.contains("GAME") || title_lower.contains(" vs ") || title_lower.contains(" at ")
    {
        score += 3.0;
    }
    if denylist.iter().any(|d| ticker_upper.contains(&d.to_uppercase())) {
        score -= 5.0;
    }
    for kw in ["season", "futures", "champion", "award", "mvp"] {
        if title_lower.contains(kw) {
            score -= 3.0;
            break;
        }
    }
    for kw in ["parlay", "combo", "special"] {
        if ticker_upper.contains(&kw.to_uppercase()) || title_lower.contains(kw) {
            score -= 4.0;
            break;
        }
    }
    // Series with activity in the next two days outrank dormant ones
    if let Some(close) = latest_close {
        if close > now && close - now < Duration::hours(48) {
            score += 2.0;
        }
    }
    score
}

// ── Parsing ────────────────────────────────────────────────────────────────────

/// Parse one market listing.  Markets without a parseable future close time
/// or without both derivable price sides are dropped.
fn parse_market(item: &serde_json::Value, now: DateTime<Utc>) -> Option<Market> {
    let ticker = field_str(item, &["ticker", "market_ticker"])?;
    let title = field_str(item, &["title", "question"]).unwrap_or(ticker);
    let close_time = field_time(item, &["close_time", "closeTime", "expiration_time"])?;
    // Status says open; the close-time window is ours to enforce
    if close_time <= now {
        return None;
    }

    let yes_bid = field_f64(item, &["yes_bid", "yesBid"]);
    let yes_ask = field_f64(item, &["yes_ask", "yesAsk"]);
    let no_bid = field_f64(item, &["no_bid", "noBid"]);
    let no_ask = field_f64(item, &["no_ask", "noAsk"]);
    let last = field_f64(item, &["last_price", "lastPrice"]);

    let yes_price = yes_price_fallback(yes_ask, no_bid, yes_bid, last)?;
    let no_price = yes_price_fallback(no_ask, yes_bid, no_bid, last.map(|p| 100.0 - p))?;

    Some(Market {
        venue: Venue::Kalshi,
        ticker: ticker.to_string(),
        title: title.to_string(),
        kind: MarketKind::ProbabilityCents,
        yes_price: Some(yes_price),
        no_price: Some(no_price),
        home_odds: None,
        away_odds: None,
        yes_bid,
        yes_ask,
        volume: field_f64(item, &["volume", "volume_24h", "liquidity"]),
        close_time,
        event_ticker: field_str(item, &["event_ticker", "eventTicker"]).map(str::to_string),
        fetched_at: now,
    })
}

/// Derive one vendor event per event ticker from the fetched markets.
fn events_from_markets(markets: &[Market]) -> Vec<VendorEvent> {
    let mut by_event: BTreeMap<&str, Vec<&Market>> = BTreeMap::new();
    for m in markets {
        let key = m.event_ticker.as_deref().unwrap_or(&m.ticker);
        by_event.entry(key).or_default().push(m);
    }

    by_event
        .into_iter()
        .map(|(event_id, group)| {
            let title = &group[0].title;
            let normalized = normalize(title, None);
            let close_time = group.iter().map(|m| m.close_time).min();
            VendorEvent {
                venue: Venue::Kalshi,
                event_id: event_id.to_string(),
                raw_title: title.clone(),
                normalized_title: normalized.title,
                tokens: normalized.tokens,
                sport: None,
                vendor_closed: false,
                start_time: None,
                close_time,
                home_team: None,
                away_team: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lists() -> (Vec<String>, Vec<String>) {
        (
            vec!["SEASON".into(), "CHAMP".into(), "PARLAY".into()],
            vec![],
        )
    }

    #[test]
    fn test_request_url_does_not_repeat_api_prefix() {
        // The shipped default base URL already ends in /trade-api/v2; the
        // signed path carries it too, so the join must strip one copy.
        let base = host_base("https://api.elections.kalshi.com/trade-api/v2");
        assert_eq!(
            format!("{}{}", base, MARKETS_PATH),
            "https://api.elections.kalshi.com/trade-api/v2/markets"
        );
        // A bare host joins unchanged
        let bare = host_base("https://api.elections.kalshi.com/");
        assert_eq!(
            format!("{}{}", bare, SERIES_PATH),
            "https://api.elections.kalshi.com/trade-api/v2/series"
        );
    }

    #[test]
    fn test_score_game_series_beats_futures() {
        let (deny, allow) = lists();
        let now = Utc::now();
        let game = score_series(
            "KXNBAGAME",
            "NBA: Lakers vs Celtics",
            Some(now + Duration::hours(6)),
            &deny,
            &allow,
            now,
        );
        let futures = score_series("KXNBACHAMP", "NBA Champion this season", None, &deny, &allow, now);
        let parlay = score_series("KXNBAPARLAY", "NBA parlay special", None, &deny, &allow, now);
        assert!(game > 0.0);
        assert!(futures < 0.0);
        assert!(parlay < futures);
        assert!(game > futures);
    }

    #[test]
    fn test_allowlist_overrides_denylist() {
        let deny = vec!["CHAMP".to_string()];
        let allow = vec!["nbachamp".to_string()];
        let score = score_series("KXNBACHAMP", "NBA Champion", None, &deny, &allow, Utc::now());
        assert_eq!(score, 10.0);
    }

    #[test]
    fn test_parse_market_price_fallbacks() {
        let now = Utc::now();
        let close = (now + Duration::hours(2)).to_rfc3339();
        let item = json!({
            "ticker": "KXNBAGAME-26MAR01LALBOS-LAL",
            "title": "Lakers vs Celtics",
            "close_time": close,
            "yes_bid": 39, "no_bid": 58,
            "last_price": 40,
            "volume": 12000,
            "event_ticker": "KXNBAGAME-26MAR01LALBOS"
        });
        let m = parse_market(&item, now).unwrap();
        // No asks: YES comes from the opposing bid, NO from its own bid
        assert_eq!(m.yes_price, Some(42.0));
        assert_eq!(m.no_price, Some(61.0));
        assert_eq!(m.kind, MarketKind::ProbabilityCents);
        assert!(m.has_both_sides());
    }

    #[test]
    fn test_parse_market_drops_closed_and_unparseable() {
        let now = Utc::now();
        let past = (now - Duration::hours(1)).to_rfc3339();
        let closed = json!({
            "ticker": "T1", "title": "x", "close_time": past,
            "yes_ask": 40, "no_ask": 62
        });
        assert!(parse_market(&closed, now).is_none());

        let no_close = json!({"ticker": "T2", "title": "x", "yes_ask": 40, "no_ask": 62});
        assert!(parse_market(&no_close, now).is_none());

        let future = (now + Duration::hours(1)).to_rfc3339();
        let one_sided = json!({"ticker": "T3", "title": "x", "close_time": future, "yes_ask": 40});
        assert!(parse_market(&one_sided, now).is_none());
    }

    #[test]
    fn test_events_group_by_event_ticker() {
        let now = Utc::now();
        let close = (now + Duration::hours(2)).to_rfc3339();
        let items = [
            json!({"ticker": "E1-LAL", "title": "Lakers vs Celtics", "close_time": close,
                   "yes_ask": 41, "no_ask": 61, "event_ticker": "E1"}),
            json!({"ticker": "E1-BOS", "title": "Lakers vs Celtics", "close_time": close,
                   "yes_ask": 61, "no_ask": 41, "event_ticker": "E1"}),
            json!({"ticker": "E2-NYK", "title": "Knicks vs Heat", "close_time": close,
                   "yes_ask": 55, "no_ask": 47, "event_ticker": "E2"}),
        ];
        let markets: Vec<Market> = items
            .iter()
            .filter_map(|i| parse_market(i, now))
            .collect();
        let events = events_from_markets(&markets);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "E1");
        assert!(events[0].tokens.contains("lakers"));
        assert_eq!(events[1].event_id, "E2");
    }
}
