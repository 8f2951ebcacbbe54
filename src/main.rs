use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

mod arb;
mod config;
mod live_prices;
mod matching;
mod model;
mod orchestrator;
mod rate_limit;
mod safety;
mod snapshot;
mod venues;

use arb::{EngineConfig, FeeTable};
use config::Config;
use live_prices::LivePriceFeed;
use matching::matcher::MatcherConfig;
use model::Venue;
use orchestrator::{Orchestrator, OrchestratorConfig};
use rate_limit::{RateLimitConfig, VenueRateLimiter};
use safety::{SafetyConfig, SafetyGate};
use snapshot::SnapshotStore;
use venues::kalshi::{KalshiClient, KalshiConfig};
use venues::kalshi_auth::RequestSigner;
use venues::polymarket::PolymarketClient;
use venues::sportsbook::SportsbookClient;
use venues::VenueClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    if config.dry_run {
        info!("🟡 DRY RUN mode – opportunities are logged, never executed");
    } else {
        info!("🔴 LIVE mode – gate-approved opportunities feed the execution path");
    }

    // Snapshot store (fast JSON tier + durable SQLite tier)
    let store = SnapshotStore::open(
        Some(&config.snapshot_cache_dir),
        Some(&config.snapshot_db_path),
    )?;
    info!(
        cache_dir = %config.snapshot_cache_dir,
        db = %config.snapshot_db_path,
        "snapshot store opened"
    );

    // One independent rate limiter per venue
    let rate_cfg = RateLimitConfig {
        min_interval: StdDuration::from_millis(config.min_request_interval_ms),
        backoff_base: StdDuration::from_millis(config.backoff_base_ms),
        backoff_max: StdDuration::from_millis(config.backoff_max_ms),
    };
    let limiter_for = |venue: Venue| Arc::new(VenueRateLimiter::new(venue, rate_cfg.clone()));

    // Kalshi signs every request; without credentials the client skips itself
    let signer = match (&config.kalshi_api_key_id, &config.kalshi_private_key_path) {
        (Some(key_id), Some(path)) => Some(RequestSigner::from_pem_file(key_id, path)?),
        _ => {
            warn!("Kalshi credentials not configured; venue will be skipped");
            None
        }
    };
    let kalshi = KalshiClient::new(
        &config.kalshi_api_url,
        signer,
        limiter_for(Venue::Kalshi),
        KalshiConfig {
            top_series: config.kalshi_top_series,
            inter_series_delay: StdDuration::from_millis(config.kalshi_inter_series_delay_ms),
            denylist: Config::split_list(&config.kalshi_series_denylist),
            allowlist: Config::split_list(&config.kalshi_series_allowlist),
            max_pages: config.max_pages_per_refresh,
            max_items: config.max_items_per_refresh,
            market_cache_ttl: StdDuration::from_secs(config.market_cache_ttl_secs),
            series_cache_ttl: StdDuration::from_secs(config.series_cache_ttl_secs),
        },
    )?;
    let polymarket = PolymarketClient::new(
        &config.polymarket_api_url,
        limiter_for(Venue::Polymarket),
        config.max_pages_per_refresh,
        config.max_items_per_refresh,
        StdDuration::from_secs(config.market_cache_ttl_secs),
    )?;
    let sportsbook = SportsbookClient::new(
        &config.sportsbook_api_url,
        config.sportsbook_api_key.clone(),
        limiter_for(Venue::Sportsbook),
        StdDuration::from_secs(config.market_cache_ttl_secs),
    )?;
    let clients: Vec<Arc<dyn VenueClient>> =
        vec![Arc::new(kalshi), Arc::new(polymarket), Arc::new(sportsbook)];

    let feed = config
        .enable_live_prices
        .then(|| LivePriceFeed::spawn(Venue::Polymarket, &config.polymarket_ws_url));
    if feed.is_some() {
        info!(url = %config.polymarket_ws_url, "live price feed enabled");
    }

    let gate = SafetyGate::new(SafetyConfig {
        max_price_age_secs: config.max_price_age_secs,
        max_slippage_bps: config.max_slippage_bps,
        min_leg_liquidity_usd: config.min_leg_liquidity_usd,
        min_margin_pct: config.min_profit_margin_pct,
        max_implied_skew_pct: config.max_implied_skew_pct,
        skew_window: Duration::seconds(config.skew_window_secs),
        breaker_failure_threshold: config.breaker_failure_threshold,
        breaker_cooldown: Duration::seconds(config.breaker_cooldown_secs),
    });

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            dry_run: config.dry_run,
            interval_live: StdDuration::from_secs(config.scan_interval_live_secs),
            interval_active: StdDuration::from_secs(config.scan_interval_active_secs),
            interval_default: StdDuration::from_secs(config.scan_interval_default_secs),
            live_close_window: Duration::hours(config.live_close_window_hours),
            snapshot_max_age: Duration::seconds(config.snapshot_fast_ttl_secs as i64),
        },
        clients,
        store,
        MatcherConfig {
            time_tolerance_ms: config.match_time_tolerance_ms,
            min_overlap: config.match_min_overlap,
            min_coverage: config.match_min_coverage,
        },
        EngineConfig {
            payout_target: config.payout_target_usd,
            min_margin_pct: config.min_profit_margin_pct,
            fees: FeeTable {
                kalshi_pct_of_profit: config.kalshi_fee_pct_of_profit,
                polymarket_pct_of_notional: config.polymarket_fee_pct_of_notional,
            },
        },
        gate,
        feed,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(orchestrator.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Let the in-flight cycle wind down, but not forever
    match tokio::time::timeout(StdDuration::from_secs(10), handle).await {
        Ok(_) => info!("orchestrator stopped cleanly"),
        Err(_) => warn!("orchestrator did not stop within deadline; exiting"),
    }

    Ok(())
}
