//! Arbitrage engine: unifies probability-cents and decimal-odds pricing,
//! applies per-venue fee schedules, and sizes both legs for an equal payout.
//!
//! A probability-cents contract pays a fixed $1 per share, so locking in a
//! payout of P costs `P × price/100`.  A decimal-odds bet pays
//! `stake × odds`, so the same payout costs `P / odds`.  Stakes are always
//! sized so both legs return the same target payout — equal-dollar stakes do
//! not hedge, because the two legs would pay different amounts.

use chrono::Utc;

use crate::model::{ArbitrageOpportunity, Leg, Market, MarketKind, Side, Venue};

/// How a venue charges fees on a winning leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeeSchedule {
    Zero,
    /// Charged on the stake at entry, win or lose (fraction, e.g. 0.02)
    PctOfNotional(f64),
    /// Charged on the winning leg's profit only (fraction, e.g. 0.07)
    PctOfProfit(f64),
}

impl FeeSchedule {
    /// Fee attributable to this leg in the worst case: notional fees are
    /// always paid; profit fees only apply if this leg is the winner.
    fn amount(&self, stake: f64, payout: f64) -> f64 {
        match self {
            FeeSchedule::Zero => 0.0,
            FeeSchedule::PctOfNotional(r) => stake * r,
            FeeSchedule::PctOfProfit(r) => ((payout - stake) * r).max(0.0),
        }
    }

    fn is_contingent(&self) -> bool {
        matches!(self, FeeSchedule::PctOfProfit(_))
    }
}

/// Per-venue fee table.  The sportsbook's margin lives inside its odds, so
/// it carries no explicit fee.
#[derive(Debug, Clone)]
pub struct FeeTable {
    pub kalshi_pct_of_profit: f64,
    pub polymarket_pct_of_notional: f64,
}

impl FeeTable {
    pub fn schedule_for(&self, venue: Venue) -> FeeSchedule {
        match venue {
            Venue::Kalshi => FeeSchedule::PctOfProfit(self.kalshi_pct_of_profit / 100.0),
            Venue::Polymarket => {
                FeeSchedule::PctOfNotional(self.polymarket_pct_of_notional / 100.0)
            }
            Venue::Sportsbook => FeeSchedule::Zero,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed payout both legs are sized to return (USD)
    pub payout_target: f64,
    /// Minimum net margin an opportunity must clear (%)
    pub min_margin_pct: f64,
    pub fees: FeeTable,
}

/// Price for one side of a market in its native convention, or `None` when
/// that side is unquoted.
fn side_price(market: &Market, side: Side) -> Option<f64> {
    match (market.kind, side) {
        (MarketKind::ProbabilityCents, Side::Yes) => market.yes_price,
        (MarketKind::ProbabilityCents, Side::No) => market.no_price,
        (MarketKind::DecimalOdds, Side::Yes) => market.home_odds,
        (MarketKind::DecimalOdds, Side::No) => market.away_odds,
    }
}

/// Cost of locking in `payout` on one side of a market.
fn leg_cost(kind: MarketKind, price: f64, payout: f64) -> Option<f64> {
    match kind {
        MarketKind::ProbabilityCents => {
            if !(0.0..=100.0).contains(&price) || price == 0.0 {
                return None;
            }
            Some(payout * price / 100.0)
        }
        MarketKind::DecimalOdds => {
            if price <= 1.0 {
                return None;
            }
            Some(payout / price)
        }
    }
}

fn build_leg(market: &Market, side: Side, payout: f64, fees: &FeeTable) -> Option<(Leg, FeeSchedule)> {
    let price = side_price(market, side)?;
    let stake = leg_cost(market.kind, price, payout)?;
    let schedule = fees.schedule_for(market.venue);
    let fee = schedule.amount(stake, payout);
    Some((
        Leg {
            venue: market.venue,
            ticker: market.ticker.clone(),
            side,
            kind: market.kind,
            price,
            stake,
            fee,
            volume: market.volume,
            fetched_at: market.fetched_at,
        },
        schedule,
    ))
}

/// Evaluate one complementary side combination on a matched market pair.
fn evaluate_combo(
    a: &Market,
    side_a: Side,
    b: &Market,
    cfg: &EngineConfig,
) -> Option<ArbitrageOpportunity> {
    let payout = cfg.payout_target;
    let (leg_a, sched_a) = build_leg(a, side_a, payout, &cfg.fees)?;
    let (leg_b, sched_b) = build_leg(b, side_a.opposite(), payout, &cfg.fees)?;

    let total_cost = leg_a.stake + leg_b.stake;
    let gross_profit = payout - total_cost;

    // Exactly one leg wins.  Notional fees are sunk either way; of the
    // contingent (profit-only) fees, charge the worst case.
    let upfront: f64 = [(&leg_a, sched_a), (&leg_b, sched_b)]
        .iter()
        .filter(|(_, s)| !s.is_contingent())
        .map(|(l, _)| l.fee)
        .sum();
    let contingent = [(&leg_a, sched_a), (&leg_b, sched_b)]
        .iter()
        .filter(|(_, s)| s.is_contingent())
        .map(|(l, _)| l.fee)
        .fold(0.0f64, f64::max);

    let net_profit = gross_profit - upfront - contingent;
    if total_cost <= 0.0 {
        return None;
    }
    let margin_pct = net_profit / total_cost * 100.0;

    Some(ArbitrageOpportunity {
        price_fetched_at: a.fetched_at.min(b.fetched_at),
        legs: (leg_a, leg_b),
        payout_target: payout,
        total_cost,
        gross_profit,
        net_profit,
        margin_pct,
        detected_at: Utc::now(),
    })
}

/// Evaluate every viable complementary side combination on a market pair and
/// return the best one clearing the margin floor, or `None`.
///
/// Both markets must already be oriented the same way by the matcher (YES on
/// either market, like the home side of the sportsbook line, denotes the same
/// real-world outcome).
pub fn evaluate_pair(a: &Market, b: &Market, cfg: &EngineConfig) -> Option<ArbitrageOpportunity> {
    if a.venue == b.venue {
        return None;
    }
    [Side::Yes, Side::No]
        .into_iter()
        .filter_map(|side| evaluate_combo(a, side, b, cfg))
        .filter(|opp| opp.margin_pct >= cfg.min_margin_pct)
        .max_by(|x, y| {
            x.margin_pct
                .partial_cmp(&y.margin_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Best opportunity over every cross-venue market pair in a matched group.
pub fn best_for_group<'a, I>(markets: I, cfg: &EngineConfig) -> Option<ArbitrageOpportunity>
where
    I: IntoIterator<Item = &'a Market>,
{
    let markets: Vec<&Market> = markets.into_iter().collect();
    let mut best: Option<ArbitrageOpportunity> = None;
    for i in 0..markets.len() {
        for j in (i + 1)..markets.len() {
            if let Some(opp) = evaluate_pair(markets[i], markets[j], cfg) {
                if best
                    .as_ref()
                    .map(|b| opp.margin_pct > b.margin_pct)
                    .unwrap_or(true)
                {
                    best = Some(opp);
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    fn cents_market(venue: Venue, yes: f64, no: f64) -> Market {
        Market {
            venue,
            ticker: format!("{}-MKT", venue.as_str().to_uppercase()),
            title: "Lakers vs Celtics".into(),
            kind: MarketKind::ProbabilityCents,
            yes_price: Some(yes),
            no_price: Some(no),
            home_odds: None,
            away_odds: None,
            yes_bid: None,
            yes_ask: None,
            volume: Some(10_000.0),
            close_time: Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
            event_ticker: None,
            fetched_at: Utc::now(),
        }
    }

    fn odds_market(home: f64, away: f64) -> Market {
        Market {
            venue: Venue::Sportsbook,
            ticker: "SB-MKT".into(),
            title: "Lakers vs Celtics".into(),
            kind: MarketKind::DecimalOdds,
            yes_price: None,
            no_price: None,
            home_odds: Some(home),
            away_odds: Some(away),
            yes_bid: None,
            yes_ask: None,
            volume: Some(50_000.0),
            close_time: Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
            event_ticker: None,
            fetched_at: Utc::now(),
        }
    }

    fn cfg() -> EngineConfig {
        EngineConfig {
            payout_target: 100.0,
            min_margin_pct: 1.0,
            fees: FeeTable {
                kalshi_pct_of_profit: 7.0,
                polymarket_pct_of_notional: 0.0,
            },
        }
    }

    #[test]
    fn test_cents_vs_odds_reference_case() {
        // 40¢ YES (7% of profit) hedged with 2.10 decimal odds on the
        // complementary outcome, $100 payout: gross cost ≈ $87.62.
        let kalshi = cents_market(Venue::Kalshi, 40.0, 62.0);
        let book = odds_market(1.55, 2.10);

        let opp = evaluate_pair(&kalshi, &book, &cfg()).expect("opportunity");
        assert_relative_eq!(opp.total_cost, 87.6190, epsilon = 1e-3);
        assert_relative_eq!(opp.gross_profit, 12.3810, epsilon = 1e-3);
        // Worst case fee: Kalshi leg wins, 7% of its $60 profit
        assert_relative_eq!(opp.net_profit, 12.3810 - 4.20, epsilon = 1e-3);
        assert!(opp.margin_pct > 9.0);

        // The winning combination is YES-on-Kalshi + away side of the book
        assert_eq!(opp.legs.0.side, Side::Yes);
        assert_eq!(opp.legs.1.side, Side::No);
        // The other combination (NO at 62¢ + home at 1.55) costs over $100
        // and must not be chosen.
        assert!(opp.legs.0.price == 40.0);
    }

    #[test]
    fn test_equal_payout_stakes_not_equal_dollars() {
        let kalshi = cents_market(Venue::Kalshi, 40.0, 62.0);
        let book = odds_market(1.55, 2.10);
        let opp = evaluate_pair(&kalshi, &book, &cfg()).unwrap();
        let (a, b) = (&opp.legs.0, &opp.legs.1);
        // Both legs return the payout target...
        assert_relative_eq!(a.stake / (a.price / 100.0), 100.0, epsilon = 1e-9);
        assert_relative_eq!(b.stake * b.price, 100.0, epsilon = 1e-9);
        // ...which means the dollar stakes differ.
        assert!((a.stake - b.stake).abs() > 1.0);
    }

    #[test]
    fn test_cents_vs_cents_pair() {
        // YES at 40¢ on one exchange, NO at 52¢ on the other: $92 for $100.
        // Worst case the Kalshi leg wins, so 7% of its $60 profit comes off.
        let a = cents_market(Venue::Kalshi, 40.0, 62.0);
        let b = cents_market(Venue::Polymarket, 48.0, 52.0);
        let opp = evaluate_pair(&a, &b, &cfg()).unwrap();
        assert_relative_eq!(opp.total_cost, 92.0, epsilon = 1e-9);
        assert_relative_eq!(opp.net_profit, 8.0 - 4.20, epsilon = 1e-9);
        assert!(opp.margin_pct >= 1.0);
    }

    #[test]
    fn test_no_opportunity_below_margin_floor() {
        // 50¢ + 52¢ = $102 cost for $100 payout on every combination.
        let a = cents_market(Venue::Kalshi, 50.0, 52.0);
        let b = cents_market(Venue::Polymarket, 50.0, 52.0);
        assert!(evaluate_pair(&a, &b, &cfg()).is_none());
    }

    #[test]
    fn test_margin_floor_is_respected() {
        let a = cents_market(Venue::Kalshi, 49.0, 62.0);
        let b = cents_market(Venue::Polymarket, 48.0, 50.5);
        let mut config = cfg();
        // Cost $99.50, net below 1% after the profit fee
        config.min_margin_pct = 5.0;
        assert!(evaluate_pair(&a, &b, &config).is_none());
    }

    #[test]
    fn test_notional_fee_charged_regardless() {
        let a = cents_market(Venue::Kalshi, 40.0, 62.0);
        let b = cents_market(Venue::Polymarket, 48.0, 50.0);
        let mut config = cfg();
        config.fees.polymarket_pct_of_notional = 2.0;
        let with_fee = evaluate_pair(&a, &b, &config).unwrap();
        config.fees.polymarket_pct_of_notional = 0.0;
        let without_fee = evaluate_pair(&a, &b, &config).unwrap();
        assert!(with_fee.net_profit < without_fee.net_profit);
    }

    #[test]
    fn test_missing_side_skips_combo() {
        let mut a = cents_market(Venue::Kalshi, 40.0, 62.0);
        a.no_price = None;
        let b = cents_market(Venue::Polymarket, 48.0, 52.0);
        // Only YES-on-A + NO-on-B remains viable; it still wins.
        let opp = evaluate_pair(&a, &b, &cfg()).unwrap();
        assert_eq!(opp.legs.0.side, Side::Yes);
    }

    #[test]
    fn test_degenerate_odds_rejected() {
        let a = cents_market(Venue::Kalshi, 40.0, 62.0);
        let mut book = odds_market(1.0, 0.9);
        book.away_odds = Some(0.9); // odds must exceed 1.0
        assert!(evaluate_pair(&a, &book, &cfg()).is_none());
    }

    #[test]
    fn test_same_venue_pair_rejected() {
        let a = cents_market(Venue::Kalshi, 40.0, 62.0);
        let b = cents_market(Venue::Kalshi, 30.0, 40.0);
        assert!(evaluate_pair(&a, &b, &cfg()).is_none());
    }

    #[test]
    fn test_best_for_group_picks_highest_margin() {
        let kalshi = cents_market(Venue::Kalshi, 40.0, 62.0);
        let poly = cents_market(Venue::Polymarket, 48.0, 55.0);
        let book = odds_market(1.55, 2.10);
        let best = best_for_group([&kalshi, &poly, &book], &cfg()).unwrap();
        // Kalshi YES + book away is the widest edge in this set.
        assert_eq!(best.legs.1.venue, Venue::Sportsbook);
    }
}
