//! Sportsbook odds-feed client.
//!
//! The feed lists events with decimal-odds moneylines.  Each event becomes
//! one two-sided market (home side maps to YES, away to NO) plus a vendor
//! event carrying the team names and start time the matcher wants.

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
    field_f64, field_str, field_time, rate_limited_get, FetchOutcome, FetchedJson, VenueClient,
};

pub struct SportsbookClient {
    http: Client,
    api_url: String,
    api_key: Option<String>,
    limiter: Arc<VenueRateLimiter>,
    cache_ttl: StdDuration,
}

impl SportsbookClient {
    pub fn new(
        api_url: &str,
        api_key: Option<String>,
        limiter: Arc<VenueRateLimiter>,
        cache_ttl: StdDuration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(StdDuration::from_secs(15))
            .build()?;
        Ok(SportsbookClient {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            limiter,
            cache_ttl,
        })
    }

    async fn fetch_listing(&self, status: &str) -> Result<FetchedJson> {
        let key = self.api_key.as_deref().unwrap_or_default();
        let headers = vec![("X-Api-Key".to_string(), key.to_string())];
        let url = format!("{}/events", self.api_url);
        let params = [
            ("status", status.to_string()),
            ("markets", "moneyline".to_string()),
        ];
        rate_limited_get(
            &self.http,
            &self.limiter,
            &url,
            "/events",
            &params,
            &headers,
            Some(self.cache_ttl),
        )
        .await
    }
}

#[async_trait::async_trait]
impl VenueClient for SportsbookClient {
    async fn fetch_markets(&self) -> Result<FetchOutcome> {
        if self.api_key.is_none() {
            info!("sportsbook skipped: api key not configured");
            return Ok(FetchOutcome::skipped("missing_credentials"));
        }

        let mut outcome = FetchOutcome::default();
        let now = Utc::now();
        // Upcoming and in-play books are separate listings on this feed
        for status in ["upcoming", "live"] {
            let fetched = match self.fetch_listing(status).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(status, error = %e, "sportsbook listing failed");
                    continue;
                }
            };
            let raw = match fetched {
                FetchedJson::Skipped(reason) => {
                    if outcome.raw_count == 0 && status == "upcoming" {
                        return Ok(FetchOutcome::skipped(reason));
                    }
                    warn!(status, reason, "sportsbook listing skipped");
                    continue;
                }
                other => match other.into_value() {
                    Some(v) => v,
                    None => continue,
                },
            };

            let items = match raw.as_array() {
                Some(a) => a.clone(),
                None => raw
                    .get("events")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default(),
            };
            for item in &items {
                outcome.raw_count += 1;
                match parse_event(item, now) {
                    Some((market, event)) => {
                        outcome.markets.push(market);
                        outcome.events.push(event);
                    }
                    None => outcome.filtered_count += 1,
                }
            }
        }

        info!(
            markets = outcome.markets.len(),
            raw = outcome.raw_count,
            filtered = outcome.filtered_count,
            "sportsbook refresh complete"
        );
        Ok(outcome)
    }

    fn venue(&self) -> Venue {
        Venue::Sportsbook
    }

    fn name(&self) -> &str {
        "sportsbook"
    }
}

// ── Parsing ────────────────────────────────────────────────────────────────────

fn parse_event(
    item: &serde_json::Value,
    now: DateTime<Utc>,
) -> Option<(Market, VendorEvent)> {
    let id = field_str(item, &["id", "event_id", "eventId"])?;
    let home = field_str(item, &["home_team", "homeTeam"])?.to_string();
    let away = field_str(item, &["away_team", "awayTeam"])?.to_string();
    let sport = field_str(item, &["sport", "sport_key", "league"]).map(|s| s.to_lowercase());
    let start_time = field_time(item, &["commence_time", "commenceTime", "start_time"]);
    let status = field_str(item, &["status"]).unwrap_or("upcoming");
    let vendor_closed = matches!(status, "ended" | "completed" | "settled" | "closed");

    let home_odds = moneyline_odds(item, &home, &["home_odds", "homeOdds"]);
    let away_odds = moneyline_odds(item, &away, &["away_odds", "awayOdds"]);
    // Degenerate odds (≤ 1.0) cannot price a stake
    let home_odds = home_odds.filter(|o| *o > 1.0)?;
    let away_odds = away_odds.filter(|o| *o > 1.0)?;

    // A book with no close time is priced until the game ends; approximate
    // with the start time when only that is known.
    let close_time = field_time(item, &["close_time", "closeTime"]).or(start_time)?;

    let title = format!("{} vs {}", home, away);
    let normalized = normalize(&title, sport.as_deref());

    let market = Market {
        venue: Venue::Sportsbook,
        ticker: id.to_string(),
        title: title.clone(),
        kind: MarketKind::DecimalOdds,
        yes_price: None,
        no_price: None,
        home_odds: Some(home_odds),
        away_odds: Some(away_odds),
        yes_bid: None,
        yes_ask: None,
        volume: field_f64(item, &["volume", "matched", "liquidity"]),
        close_time,
        event_ticker: Some(id.to_string()),
        fetched_at: now,
    };
    let event = VendorEvent {
        venue: Venue::Sportsbook,
        event_id: id.to_string(),
        raw_title: title,
        normalized_title: normalized.title,
        tokens: normalized.tokens,
        sport,
        vendor_closed,
        start_time,
        close_time: Some(close_time),
        home_team: Some(home),
        away_team: Some(away),
    };
    Some((market, event))
}

/// Moneyline odds for one team: flat fields first, then the
/// bookmaker-outcomes shape keyed by team name.
fn moneyline_odds(item: &serde_json::Value, team: &str, flat_keys: &[&str]) -> Option<f64> {
    if let Some(odds) = field_f64(item, flat_keys) {
        return Some(odds);
    }
    let outcomes = item
        .get("markets")
        .and_then(|m| m.as_array())
        .and_then(|a| {
            a.iter()
                .find(|m| field_str(m, &["key", "market"]) == Some("moneyline"))
        })
        .and_then(|m| m.get("outcomes"))
        .and_then(|o| o.as_array())?;
    outcomes
        .iter()
        .find(|o| field_str(o, &["name", "team"]) == Some(team))
        .and_then(|o| field_f64(o, &["price", "odds"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_parse_flat_odds_event() {
        let now = Utc::now();
        let item = json!({
            "id": "sb-100",
            "home_team": "Los Angeles Lakers",
            "away_team": "Boston Celtics",
            "sport": "NBA",
            "commence_time": (now + Duration::hours(2)).to_rfc3339(),
            "home_odds": 2.10,
            "away_odds": 1.85,
            "status": "upcoming"
        });
        let (market, event) = parse_event(&item, now).unwrap();
        assert_eq!(market.kind, MarketKind::DecimalOdds);
        assert_eq!(market.home_odds, Some(2.10));
        assert_eq!(market.away_odds, Some(1.85));
        assert!(market.has_both_sides());
        assert_eq!(event.home_team.as_deref(), Some("Los Angeles Lakers"));
        assert!(!event.vendor_closed);
        assert!(event.tokens.contains("lakers"));
        assert!(event.tokens.contains("celtics"));
    }

    #[test]
    fn test_parse_nested_outcomes_shape() {
        let now = Utc::now();
        let item = json!({
            "eventId": "sb-200",
            "homeTeam": "Knicks",
            "awayTeam": "Heat",
            "commence_time": (now + Duration::hours(1)).to_rfc3339(),
            "markets": [{
                "key": "moneyline",
                "outcomes": [
                    {"name": "Knicks", "price": "1.72"},
                    {"name": "Heat", "price": 2.25}
                ]
            }]
        });
        let (market, _) = parse_event(&item, now).unwrap();
        assert_eq!(market.home_odds, Some(1.72));
        assert_eq!(market.away_odds, Some(2.25));
    }

    #[test]
    fn test_degenerate_odds_dropped() {
        let now = Utc::now();
        let item = json!({
            "id": "sb-300",
            "home_team": "A", "away_team": "B",
            "commence_time": (now + Duration::hours(1)).to_rfc3339(),
            "home_odds": 1.0, "away_odds": 2.0
        });
        assert!(parse_event(&item, now).is_none());
    }

    #[test]
    fn test_settled_event_flagged_vendor_closed() {
        let now = Utc::now();
        let item = json!({
            "id": "sb-400",
            "home_team": "A", "away_team": "B",
            "commence_time": (now - Duration::hours(3)).to_rfc3339(),
            "home_odds": 2.0, "away_odds": 1.9,
            "status": "settled"
        });
        let (_, event) = parse_event(&item, now).unwrap();
        assert!(event.vendor_closed);
    }
}
