use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Snapshot records written with a different schema version are treated as
/// absent by readers.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 3;

/// One of the three trading venues the scanner ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    /// Probability-cents exchange, signed REST API, series-based discovery.
    Kalshi,
    /// Probability-cents exchange, open REST API.
    Polymarket,
    /// Decimal-odds sportsbook.
    Sportsbook,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Kalshi => "kalshi",
            Venue::Polymarket => "polymarket",
            Venue::Sportsbook => "sportsbook",
        }
    }

    pub fn all() -> [Venue; 3] {
        [Venue::Kalshi, Venue::Polymarket, Venue::Sportsbook]
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a market's two sides are priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    /// Binary contract priced 0–100 cents per $1 payout share.
    ProbabilityCents,
    /// Multiplier odds: payout = stake × odds.
    DecimalOdds,
}

/// A canonical two-sided listing as fetched from a venue.
///
/// Immutable once fetched — the next fetch cycle supersedes rather than
/// mutates.  Probability-cents markets carry `yes_price`/`no_price` in cents;
/// decimal-odds markets carry `home_odds`/`away_odds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub venue: Venue,
    /// Venue-native ticker or listing ID
    pub ticker: String,
    /// Human-readable title as the venue shows it
    pub title: String,
    pub kind: MarketKind,
    /// YES price in cents (0–100), probability-cents venues only
    pub yes_price: Option<f64>,
    /// NO price in cents (0–100), probability-cents venues only
    pub no_price: Option<f64>,
    /// Decimal odds on the home/first-listed side, sportsbook only
    pub home_odds: Option<f64>,
    /// Decimal odds on the away/second-listed side, sportsbook only
    pub away_odds: Option<f64>,
    /// Best bid on the YES side in cents, when the venue returns a book
    pub yes_bid: Option<f64>,
    /// Best ask on the YES side in cents, when the venue returns a book
    pub yes_ask: Option<f64>,
    /// Traded volume proxy in USD (or contracts where USD is unavailable)
    pub volume: Option<f64>,
    /// Expiry / close time; markets without a parseable close time are dropped
    pub close_time: DateTime<Utc>,
    /// Linkage to the venue's event/series grouping, when present
    pub event_ticker: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Market {
    /// True when both price sides are populated for this market's kind.
    pub fn has_both_sides(&self) -> bool {
        match self.kind {
            MarketKind::ProbabilityCents => self.yes_price.is_some() && self.no_price.is_some(),
            MarketKind::DecimalOdds => self.home_odds.is_some() && self.away_odds.is_some(),
        }
    }
}

/// Lifecycle phase of a real-world event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventPhase {
    Pre,
    Live,
    Ended,
}

/// A venue's notion of a real-world occurrence, created per fetch cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorEvent {
    pub venue: Venue,
    /// Venue-native event/series identifier
    pub event_id: String,
    pub raw_title: String,
    pub normalized_title: String,
    /// Canonical token set produced by the normalizer
    pub tokens: BTreeSet<String>,
    pub sport: Option<String>,
    /// Whether the venue explicitly reports the event closed or settled
    pub vendor_closed: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
}

/// A set of vendor events (2–3 venues) believed to denote the same
/// occurrence.  Derived state — recomputed every matcher cycle.
#[derive(Debug, Clone)]
pub struct MatchedGroup {
    /// Canonical key: sorted venue:event_id pairs joined with '|'
    pub key: String,
    pub sport: Option<String>,
    pub phase: EventPhase,
    pub members: Vec<VendorEvent>,
}

impl MatchedGroup {
    pub fn venues(&self) -> BTreeSet<Venue> {
        self.members.iter().map(|m| m.venue).collect()
    }
}

/// Which side of a binary market a leg buys.  For decimal-odds markets,
/// `Yes` maps to the home/first-listed side and `No` to the away side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

/// One leg of an arbitrage: what to buy, where, and for how much.
#[derive(Debug, Clone, Serialize)]
pub struct Leg {
    pub venue: Venue,
    pub ticker: String,
    pub side: Side,
    pub kind: MarketKind,
    /// Cents for probability venues, decimal odds for the sportsbook
    pub price: f64,
    /// Stake committed on this leg (USD)
    pub stake: f64,
    /// Fee charged on this leg if it wins (USD)
    pub fee: f64,
    /// Liquidity/volume proxy carried through for the safety gate
    pub volume: Option<f64>,
    /// When this leg's price was fetched from its venue
    pub fetched_at: DateTime<Utc>,
}

/// A riskless-profit candidate across two venues.  Ephemeral — created per
/// scan and consumed immediately by the safety gate.
#[derive(Debug, Clone, Serialize)]
pub struct ArbitrageOpportunity {
    pub legs: (Leg, Leg),
    /// Fixed payout both legs are sized to return (USD)
    pub payout_target: f64,
    /// Sum of both stakes (USD)
    pub total_cost: f64,
    /// payout − cost, before fees
    pub gross_profit: f64,
    /// payout − cost − worst-case fees
    pub net_profit: f64,
    /// net_profit / total_cost × 100
    pub margin_pct: f64,
    /// Age of the oldest price the legs were built from
    pub price_fetched_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

/// Durable, schema-versioned capture of one venue's canonical market list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema_version: u32,
    pub platform: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
    pub total_markets: usize,
    pub markets: Vec<Market>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<SnapshotMeta>,
}

/// Diagnostic counts recorded alongside a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub raw_items: usize,
    pub filtered_items: usize,
    pub hydrated_items: usize,
}
