use clap::Parser;

/// Cross-venue prediction-market arbitrage scanner
#[derive(Parser, Debug, Clone)]
#[command(name = "arbscan", version, about)]
pub struct Config {
    /// Run in dry-run mode (detected opportunities are logged, never acted on)
    #[arg(long, env = "DRY_RUN", default_value = "true")]
    pub dry_run: bool,

    // ── Venue endpoints & credentials ────────────────────────────────────────
    /// Kalshi trade API base URL
    #[arg(
        long,
        env = "KALSHI_API_URL",
        default_value = "https://api.elections.kalshi.com/trade-api/v2"
    )]
    pub kalshi_api_url: String,

    /// Kalshi API key ID (requests are skipped gracefully when absent)
    #[arg(long, env = "KALSHI_API_KEY_ID")]
    pub kalshi_api_key_id: Option<String>,

    /// Path to the Kalshi RSA private key (PKCS#8 PEM)
    #[arg(long, env = "KALSHI_PRIVATE_KEY_PATH")]
    pub kalshi_private_key_path: Option<String>,

    /// Polymarket Gamma API base URL
    #[arg(
        long,
        env = "POLYMARKET_API_URL",
        default_value = "https://gamma-api.polymarket.com"
    )]
    pub polymarket_api_url: String,

    /// Polymarket CLOB WebSocket URL (live price path)
    #[arg(
        long,
        env = "POLYMARKET_WS_URL",
        default_value = "wss://ws-subscriptions-clob.polymarket.com/ws/market"
    )]
    pub polymarket_ws_url: String,

    /// Sportsbook API base URL
    #[arg(long, env = "SPORTSBOOK_API_URL", default_value = "https://api.sportsbook.example")]
    pub sportsbook_api_url: String,

    /// Sportsbook API key
    #[arg(long, env = "SPORTSBOOK_API_KEY")]
    pub sportsbook_api_key: Option<String>,

    /// Enable the WebSocket live-price feed
    #[arg(long, env = "ENABLE_LIVE_PRICES", default_value = "false")]
    pub enable_live_prices: bool,

    // ── Rate limiting ────────────────────────────────────────────────────────
    /// Minimum spacing between requests to one venue (ms)
    #[arg(long, env = "MIN_REQUEST_INTERVAL_MS", default_value = "350")]
    pub min_request_interval_ms: u64,

    /// Base backoff delay on HTTP 429 (ms)
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "2000")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling (ms)
    #[arg(long, env = "BACKOFF_MAX_MS", default_value = "120000")]
    pub backoff_max_ms: u64,

    /// TTL for cached market-list responses (secs)
    #[arg(long, env = "MARKET_CACHE_TTL_SECS", default_value = "20")]
    pub market_cache_ttl_secs: u64,

    /// TTL for cached series/category metadata responses (secs)
    #[arg(long, env = "SERIES_CACHE_TTL_SECS", default_value = "3600")]
    pub series_cache_ttl_secs: u64,

    // ── Fetch bounds ─────────────────────────────────────────────────────────
    /// Maximum pages to walk per venue refresh
    #[arg(long, env = "MAX_PAGES_PER_REFRESH", default_value = "10")]
    pub max_pages_per_refresh: u32,

    /// Maximum markets to retain per venue refresh
    #[arg(long, env = "MAX_ITEMS_PER_REFRESH", default_value = "1000")]
    pub max_items_per_refresh: usize,

    /// Number of top-scored series tickers polled per Kalshi cycle
    #[arg(long, env = "KALSHI_TOP_SERIES", default_value = "8")]
    pub kalshi_top_series: usize,

    /// Delay between per-series Kalshi market fetches (ms)
    #[arg(long, env = "KALSHI_INTER_SERIES_DELAY_MS", default_value = "500")]
    pub kalshi_inter_series_delay_ms: u64,

    /// Comma-separated substrings a Kalshi series ticker must NOT contain
    #[arg(long, env = "KALSHI_SERIES_DENYLIST", default_value = "SEASON,CHAMP,PARLAY")]
    pub kalshi_series_denylist: String,

    /// Comma-separated substrings that force-include a Kalshi series ticker
    #[arg(long, env = "KALSHI_SERIES_ALLOWLIST", default_value = "")]
    pub kalshi_series_allowlist: String,

    // ── Snapshot store ───────────────────────────────────────────────────────
    /// Directory for the fast snapshot tier (per-venue JSON files)
    #[arg(long, env = "SNAPSHOT_CACHE_DIR", default_value = ".snapshots")]
    pub snapshot_cache_dir: String,

    /// SQLite path for the durable snapshot tier
    #[arg(long, env = "SNAPSHOT_DB_PATH", default_value = "arbscan.db")]
    pub snapshot_db_path: String,

    /// Fast-tier snapshot TTL (secs); older fast-tier reads classify as stale
    #[arg(long, env = "SNAPSHOT_FAST_TTL_SECS", default_value = "120")]
    pub snapshot_fast_ttl_secs: u64,

    // ── Matcher ──────────────────────────────────────────────────────────────
    /// Start-time bucket tolerance for cross-venue matching (ms)
    #[arg(long, env = "MATCH_TIME_TOLERANCE_MS", default_value = "900000")]
    pub match_time_tolerance_ms: i64,

    /// Minimum shared tokens for a textual match
    #[arg(long, env = "MATCH_MIN_OVERLAP", default_value = "2")]
    pub match_min_overlap: usize,

    /// Minimum coverage (overlap / smaller token set) for a textual match
    #[arg(long, env = "MATCH_MIN_COVERAGE", default_value = "0.5")]
    pub match_min_coverage: f64,

    // ── Arbitrage engine ─────────────────────────────────────────────────────
    /// Payout both legs are sized to return (USD)
    #[arg(long, env = "PAYOUT_TARGET_USD", default_value = "100.0")]
    pub payout_target_usd: f64,

    /// Minimum net profit margin to report an opportunity (%)
    #[arg(long, env = "MIN_PROFIT_MARGIN_PCT", default_value = "1.0")]
    pub min_profit_margin_pct: f64,

    /// Kalshi fee as a percentage of winning-leg profit
    #[arg(long, env = "KALSHI_FEE_PCT_OF_PROFIT", default_value = "7.0")]
    pub kalshi_fee_pct_of_profit: f64,

    /// Polymarket fee as a percentage of notional
    #[arg(long, env = "POLYMARKET_FEE_PCT_OF_NOTIONAL", default_value = "0.0")]
    pub polymarket_fee_pct_of_notional: f64,

    // ── Safety gate ──────────────────────────────────────────────────────────
    /// Maximum acceptable price-data age (secs)
    #[arg(long, env = "MAX_PRICE_AGE_SECS", default_value = "30")]
    pub max_price_age_secs: i64,

    /// Maximum estimated slippage from the bid/ask spread (basis points)
    #[arg(long, env = "MAX_SLIPPAGE_BPS", default_value = "150.0")]
    pub max_slippage_bps: f64,

    /// Minimum per-leg volume proxy (USD)
    #[arg(long, env = "MIN_LEG_LIQUIDITY_USD", default_value = "500.0")]
    pub min_leg_liquidity_usd: f64,

    /// Maximum combined implied-probability skew from 100% (%)
    #[arg(long, env = "MAX_IMPLIED_SKEW_PCT", default_value = "12.0")]
    pub max_implied_skew_pct: f64,

    /// Rolling window for the sustained-skew data-quality check (secs)
    #[arg(long, env = "SKEW_WINDOW_SECS", default_value = "300")]
    pub skew_window_secs: i64,

    /// Consecutive execution failures before the circuit breaker opens
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value = "3")]
    pub breaker_failure_threshold: u32,

    /// Circuit-breaker cooldown before auto-close (secs)
    #[arg(long, env = "BREAKER_COOLDOWN_SECS", default_value = "600")]
    pub breaker_cooldown_secs: i64,

    // ── Adaptive scan intervals ──────────────────────────────────────────────
    /// Interval while a live-event signal is present (secs)
    #[arg(long, env = "SCAN_INTERVAL_LIVE_SECS", default_value = "15")]
    pub scan_interval_live_secs: u64,

    /// Interval after recent opportunities were found (secs)
    #[arg(long, env = "SCAN_INTERVAL_ACTIVE_SECS", default_value = "60")]
    pub scan_interval_active_secs: u64,

    /// Default interval (secs)
    #[arg(long, env = "SCAN_INTERVAL_DEFAULT_SECS", default_value = "300")]
    pub scan_interval_default_secs: u64,

    /// A sportsbook listing closing within this many hours counts as a
    /// live-event signal
    #[arg(long, env = "LIVE_CLOSE_WINDOW_HOURS", default_value = "3")]
    pub live_close_window_hours: i64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            anyhow::bail!("backoff_max_ms must be >= backoff_base_ms and both positive");
        }
        if self.match_time_tolerance_ms <= 0 {
            anyhow::bail!("match_time_tolerance_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.match_min_coverage) {
            anyhow::bail!("match_min_coverage must be between 0.0 and 1.0");
        }
        if self.payout_target_usd <= 0.0 {
            anyhow::bail!("payout_target_usd must be positive");
        }
        if self.min_profit_margin_pct < 0.0 {
            anyhow::bail!("min_profit_margin_pct must not be negative");
        }
        if !(0.0..=100.0).contains(&self.kalshi_fee_pct_of_profit)
            || !(0.0..=100.0).contains(&self.polymarket_fee_pct_of_notional)
        {
            anyhow::bail!("venue fee percentages must be between 0 and 100");
        }
        if self.breaker_failure_threshold == 0 {
            anyhow::bail!("breaker_failure_threshold must be at least 1");
        }
        if self.scan_interval_live_secs == 0
            || self.scan_interval_active_secs < self.scan_interval_live_secs
            || self.scan_interval_default_secs < self.scan_interval_active_secs
        {
            anyhow::bail!(
                "scan intervals must satisfy 0 < live <= active <= default"
            );
        }
        Ok(())
    }

    /// Split a comma-separated env list into trimmed uppercase entries.
    pub fn split_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config::parse_from(["arbscan"])
    }

    #[test]
    fn test_defaults_validate() {
        default_config().validate().unwrap();
    }

    #[test]
    fn test_interval_ordering_enforced() {
        let mut cfg = default_config();
        cfg.scan_interval_active_secs = 5; // below live interval
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds() {
        let mut cfg = default_config();
        cfg.backoff_max_ms = 100;
        cfg.backoff_base_ms = 2000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            Config::split_list("season, champ ,parlay"),
            vec!["SEASON", "CHAMP", "PARLAY"]
        );
        assert!(Config::split_list("").is_empty());
        assert!(Config::split_list(" , ").is_empty());
    }
}
