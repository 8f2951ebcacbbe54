//! Scan-cycle orchestration.
//!
//! One cycle fans out a refresh to every venue, snapshots what came back,
//! matches events across venues, prices each matched group, and runs any
//! opportunity through the safety gate.  Cycles never overlap: a compare-
//! and-swap guard skips the tick instead of queueing behind a slow one.
//! The cadence adapts to what the cycle saw — imminent games tighten the
//! interval, a quiet board relaxes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::arb::{self, EngineConfig};
use crate::live_prices::LivePriceFeed;
use crate::matching::matcher::{group_events, MatcherConfig};
use crate::matching::normalize;
use crate::model::{
    ArbitrageOpportunity, Leg, Market, MarketKind, MatchedGroup, SnapshotMeta, Venue, VendorEvent,
};
use crate::safety::SafetyGate;
use crate::snapshot::SnapshotStore;
use crate::venues::VenueClient;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub dry_run: bool,
    pub interval_live: StdDuration,
    pub interval_active: StdDuration,
    pub interval_default: StdDuration,
    /// A sportsbook game starting inside this window puts the scanner in
    /// live cadence
    pub live_close_window: Duration,
    /// Oldest snapshot considered fresh when a venue is skipped
    pub snapshot_max_age: Duration,
}

/// What one cycle did, for the summary log line.
#[derive(Debug, Default)]
struct CycleStats {
    venues_fetched: usize,
    venues_skipped: usize,
    venues_from_snapshot: usize,
    markets: usize,
    groups: usize,
    opportunities: usize,
    gated: usize,
}

pub struct Orchestrator {
    cfg: OrchestratorConfig,
    clients: Vec<Arc<dyn VenueClient>>,
    store: SnapshotStore,
    matcher_cfg: MatcherConfig,
    engine_cfg: EngineConfig,
    gate: SafetyGate,
    feed: Option<LivePriceFeed>,
    in_flight: Arc<AtomicBool>,
    last_opportunity_at: Option<DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        clients: Vec<Arc<dyn VenueClient>>,
        store: SnapshotStore,
        matcher_cfg: MatcherConfig,
        engine_cfg: EngineConfig,
        gate: SafetyGate,
        feed: Option<LivePriceFeed>,
    ) -> Self {
        Orchestrator {
            cfg,
            clients,
            store,
            matcher_cfg,
            engine_cfg,
            gate,
            feed,
            in_flight: Arc::new(AtomicBool::new(false)),
            last_opportunity_at: None,
        }
    }

    /// Main loop.  Runs a cycle, sleeps the adaptive interval, repeats until
    /// the shutdown signal flips; flushes the stopped marker on the way out.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        if let Err(e) = self.store.set_state_marker("running") {
            warn!(error = %e, "failed to record running marker");
        }
        loop {
            let interval = self.run_cycle().await;
            info!(next_scan_secs = interval.as_secs(), "cycle complete");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("orchestrator stopping");
        if let Err(e) = self.store.set_state_marker("stopped") {
            warn!(error = %e, "failed to record stopped marker");
        }
    }

    /// One full scan cycle.  Returns the interval to sleep before the next.
    pub async fn run_cycle(&mut self) -> StdDuration {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("scan skipped: previous cycle still running");
            return self.cfg.interval_default;
        }
        let interval = self.cycle_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        interval
    }

    async fn cycle_inner(&mut self) -> StdDuration {
        let now = Utc::now();
        let mut stats = CycleStats::default();
        let mut markets: Vec<Market> = Vec::new();
        let mut events: Vec<VendorEvent> = Vec::new();

        // Fan out to every venue concurrently, fan the results back in.
        let fetches = self
            .clients
            .iter()
            .map(|c| {
                let client = Arc::clone(c);
                async move { (client.venue(), client.fetch_markets().await) }
            })
            .collect::<Vec<_>>();
        let results = futures_util::future::join_all(fetches).await;

        for (venue, result) in results {
            match result {
                Ok(outcome) if outcome.skip_reason.is_none() => {
                    stats.venues_fetched += 1;
                    let meta = SnapshotMeta {
                        raw_items: outcome.raw_count,
                        filtered_items: outcome.filtered_count,
                        hydrated_items: outcome.markets.len(),
                    };
                    if outcome.markets.is_empty() {
                        warn!(venue = %venue, "refresh returned no markets");
                    } else if let Err(e) =
                        self.store
                            .write(venue, outcome.markets.clone(), None, Some(meta))
                    {
                        warn!(venue = %venue, error = %e, "snapshot write rejected");
                    }
                    markets.extend(outcome.markets);
                    events.extend(outcome.events);
                }
                Ok(outcome) => {
                    stats.venues_skipped += 1;
                    let reason = outcome.skip_reason.as_deref().unwrap_or("unknown");
                    info!(venue = %venue, reason, "venue skipped this cycle");
                    self.fall_back_to_snapshot(venue, &mut markets, &mut events, &mut stats);
                }
                Err(e) => {
                    stats.venues_skipped += 1;
                    error!(venue = %venue, error = %e, "venue refresh failed");
                    self.fall_back_to_snapshot(venue, &mut markets, &mut events, &mut stats);
                }
            }
        }
        stats.markets = markets.len();

        let groups = group_events(&events, &self.matcher_cfg, now);
        stats.groups = groups.len();

        let mut found_opportunity = false;
        for group in &groups {
            let group_markets = markets_for_group(group, &markets);
            let Some(mut opp) = arb::best_for_group(group_markets.iter().copied(), &self.engine_cfg)
            else {
                continue;
            };
            stats.opportunities += 1;
            found_opportunity = true;

            self.freshen_price_age(&mut opp).await;
            let spread_bps = self.widest_leg_spread(&opp).await;
            let report = self.gate.evaluate(&opp, spread_bps, now);
            if report.overall_passed {
                for w in report.warnings() {
                    warn!(group = %group.key, check = w.name, reason = ?w.reason, "gate warning");
                }
                self.act(group, &opp);
            } else {
                stats.gated += 1;
                for c in report.failed_critical() {
                    warn!(
                        group = %group.key,
                        check = c.name,
                        reason = ?c.reason,
                        "opportunity blocked"
                    );
                }
            }
        }
        if found_opportunity {
            self.last_opportunity_at = Some(now);
        }

        self.subscribe_feed(&markets, &groups).await;

        info!(
            fetched = stats.venues_fetched,
            skipped = stats.venues_skipped,
            from_snapshot = stats.venues_from_snapshot,
            markets = stats.markets,
            groups = stats.groups,
            opportunities = stats.opportunities,
            gated = stats.gated,
            "scan cycle summary"
        );

        next_interval(
            &markets,
            found_opportunity,
            self.last_opportunity_at,
            now,
            &self.cfg,
        )
    }

    /// A skipped or failed venue still contributes its last snapshot, stale
    /// or not — a one-cycle-old price the gate can veto beats a blind spot.
    fn fall_back_to_snapshot(
        &self,
        venue: Venue,
        markets: &mut Vec<Market>,
        events: &mut Vec<VendorEvent>,
        stats: &mut CycleStats,
    ) {
        let read = self.store.read(venue, self.cfg.snapshot_max_age);
        match read.snapshot {
            Some(snap) => {
                info!(
                    venue = %venue,
                    markets = snap.total_markets,
                    stale = read.stale,
                    "using snapshot fallback"
                );
                stats.venues_from_snapshot += 1;
                events.extend(events_from_snapshot(venue, &snap.markets));
                markets.extend(snap.markets);
            }
            None => {
                info!(venue = %venue, fast = %read.fast, durable = %read.durable,
                      "no snapshot fallback available");
            }
        }
    }

    /// Credit the price-age check with live quotes.  A leg on the feed's
    /// venue whose quote is newer than its REST fetch counts at the quote
    /// time; the clock only ever moves forward.
    async fn freshen_price_age(&self, opp: &mut ArbitrageOpportunity) {
        let Some(feed) = self.feed.as_ref() else { return };
        let qa = feed.quote(&opp.legs.0.ticker).await.map(|q| q.updated_at);
        let qb = feed.quote(&opp.legs.1.ticker).await.map(|q| q.updated_at);
        opp.price_fetched_at = freshened_price_age(opp, feed.venue(), qa, qb);
    }

    /// Widest live spread across the legs that trade on the feed's venue.
    async fn widest_leg_spread(&self, opp: &ArbitrageOpportunity) -> Option<f64> {
        let feed = self.feed.as_ref()?;
        let mut widest: Option<f64> = None;
        for leg in [&opp.legs.0, &opp.legs.1] {
            if leg.venue != feed.venue() {
                continue;
            }
            if let Some(s) = feed.spread_bps(&leg.ticker).await {
                widest = Some(widest.map_or(s, |w: f64| w.max(s)));
            }
        }
        widest
    }

    /// Act on a gate-approved opportunity.  Order placement is not wired to
    /// the venue APIs, so both modes log the full trade plan and nothing
    /// else.  When an executor lands it reports its real outcome through
    /// `SafetyGate::record_execution` from here; until then the breaker only
    /// moves on genuinely reported outcomes.
    fn act(&self, group: &MatchedGroup, opp: &ArbitrageOpportunity) {
        let (a, b) = (&opp.legs.0, &opp.legs.1);
        info!(
            group = %group.key,
            leg_a = %format!("{} {} {:?} stake=${:.2}", a.venue, a.ticker, a.side, a.stake),
            leg_b = %format!("{} {} {:?} stake=${:.2}", b.venue, b.ticker, b.side, b.stake),
            payout = %format!("${:.2}", opp.payout_target),
            cost = %format!("${:.2}", opp.total_cost),
            net = %format!("${:.2}", opp.net_profit),
            margin = %format!("{:.2}%", opp.margin_pct),
            dry_run = self.cfg.dry_run,
            "arbitrage opportunity"
        );
    }

    /// Keep the price feed watching every matched-group market on its own
    /// venue, so the slippage check sees live spreads next cycle.  Other
    /// venues' tickers mean nothing to this socket and are never sent.
    async fn subscribe_feed(&self, markets: &[Market], groups: &[MatchedGroup]) {
        let Some(feed) = &self.feed else { return };
        let mut grouped: std::collections::HashSet<(Venue, &str)> = Default::default();
        for g in groups {
            for m in &g.members {
                grouped.insert((m.venue, m.event_id.as_str()));
            }
        }
        let tickers: Vec<String> = markets
            .iter()
            .filter(|m| m.venue == feed.venue())
            .filter(|m| {
                m.event_ticker
                    .as_deref()
                    .map(|e| grouped.contains(&(m.venue, e)))
                    .unwrap_or(false)
            })
            .map(|m| m.ticker.clone())
            .collect();
        feed.subscribe(&tickers).await;
    }
}

/// Effective price age once live quotes are credited.  A quote applies only
/// to a leg on the feed's venue and only when newer than that leg's REST
/// fetch; the result is the older of the two effective leg times and never
/// predates the current value.
fn freshened_price_age(
    opp: &ArbitrageOpportunity,
    feed_venue: Venue,
    quote_a: Option<DateTime<Utc>>,
    quote_b: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let effective = |leg: &Leg, quote: Option<DateTime<Utc>>| match quote {
        Some(t) if leg.venue == feed_venue && t > leg.fetched_at => t,
        _ => leg.fetched_at,
    };
    let combined = effective(&opp.legs.0, quote_a).min(effective(&opp.legs.1, quote_b));
    combined.max(opp.price_fetched_at)
}

/// Markets belonging to a matched group, associated through each member's
/// (venue, event id) key.
fn markets_for_group<'a>(group: &MatchedGroup, markets: &'a [Market]) -> Vec<&'a Market> {
    let mut keys: HashMap<(Venue, &str), ()> = HashMap::new();
    for m in &group.members {
        keys.insert((m.venue, m.event_id.as_str()), ());
    }
    markets
        .iter()
        .filter(|m| {
            m.event_ticker
                .as_deref()
                .map(|e| keys.contains_key(&(m.venue, e)))
                .unwrap_or(false)
        })
        .collect()
}

/// Rebuild matcher inputs from snapshot markets.  Snapshots persist markets
/// only, so the event view is re-derived from titles.
fn events_from_snapshot(venue: Venue, markets: &[Market]) -> Vec<VendorEvent> {
    let mut seen = std::collections::HashSet::new();
    markets
        .iter()
        .filter_map(|m| {
            let event_id = m.event_ticker.clone().unwrap_or_else(|| m.ticker.clone());
            if !seen.insert(event_id.clone()) {
                return None;
            }
            let normalized = normalize(&m.title, None);
            Some(VendorEvent {
                venue,
                event_id,
                raw_title: m.title.clone(),
                normalized_title: normalized.title,
                tokens: normalized.tokens,
                sport: None,
                vendor_closed: false,
                start_time: None,
                close_time: Some(m.close_time),
                home_team: None,
                away_team: None,
            })
        })
        .collect()
}

/// Pick the next scan interval from what this cycle saw.
///
/// Live cadence when a sportsbook game starts inside the live window or any
/// market closes within the hour; active cadence while opportunities are
/// recent; default otherwise.
fn next_interval(
    markets: &[Market],
    found_opportunity: bool,
    last_opportunity_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cfg: &OrchestratorConfig,
) -> StdDuration {
    let imminent = markets.iter().any(|m| {
        let until_close = m.close_time - now;
        if until_close < Duration::zero() {
            return false;
        }
        match m.kind {
            MarketKind::DecimalOdds => until_close <= cfg.live_close_window,
            MarketKind::ProbabilityCents => until_close <= Duration::hours(1),
        }
    });
    if imminent {
        return cfg.interval_live;
    }

    let recently_active = found_opportunity
        || last_opportunity_at
            .map(|t| now - t <= Duration::minutes(10))
            .unwrap_or(false);
    if recently_active {
        return cfg.interval_active;
    }
    cfg.interval_default
}
