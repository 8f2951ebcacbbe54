//! Safety gate: independent all-must-pass checks over a detected
//! opportunity, plus a circuit breaker over recent execution outcomes.
//!
//! Only `critical` failures block; `warning` results pass through but are
//! surfaced so the operator sees data-quality degradation before it costs
//! anything.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::model::{ArbitrageOpportunity, MarketKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Outcome of one independent check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub reason: Option<String>,
    pub severity: Severity,
}

impl CheckResult {
    fn pass(name: &'static str) -> Self {
        CheckResult {
            name,
            passed: true,
            reason: None,
            severity: Severity::Info,
        }
    }

    fn fail(name: &'static str, severity: Severity, reason: String) -> Self {
        CheckResult {
            name,
            passed: false,
            reason: Some(reason),
            severity,
        }
    }
}

/// Full gate verdict.  `overall_passed` is false iff any critical check
/// failed.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub checks: Vec<CheckResult>,
    pub overall_passed: bool,
}

impl GateReport {
    pub fn failed_critical(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Critical)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Warning)
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub max_price_age_secs: i64,
    pub max_slippage_bps: f64,
    pub min_leg_liquidity_usd: f64,
    pub min_margin_pct: f64,
    /// Maximum |combined implied probability − 100| (%)
    pub max_implied_skew_pct: f64,
    /// Rolling window for the sustained-skew check
    pub skew_window: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
}

/// Circuit breaker driven by reported execution outcomes.
#[derive(Debug, Clone)]
pub enum BreakerStatus {
    Closed,
    Open {
        reason: String,
        opened_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    status: BreakerStatus,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold,
            cooldown,
            consecutive_failures: 0,
            status: BreakerStatus::Closed,
        }
    }

    pub fn record_failure(&mut self, reason: &str, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold
            && matches!(self.status, BreakerStatus::Closed)
        {
            warn!(
                consecutive = self.consecutive_failures,
                reason, "circuit breaker opened"
            );
            self.status = BreakerStatus::Open {
                reason: reason.to_string(),
                opened_at: now,
            };
        }
    }

    /// Any reported success resets the consecutive-failure counter.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.status = BreakerStatus::Closed;
    }

    /// Check openness, auto-closing once the cooldown has elapsed.
    pub fn is_open(&mut self, now: DateTime<Utc>) -> bool {
        if let BreakerStatus::Open { opened_at, .. } = &self.status {
            if now - *opened_at >= self.cooldown {
                self.status = BreakerStatus::Closed;
                self.consecutive_failures = 0;
                return false;
            }
            return true;
        }
        false
    }

    /// Operator-initiated reset.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.status = BreakerStatus::Closed;
    }

    pub fn status(&self) -> &BreakerStatus {
        &self.status
    }
}

pub struct SafetyGate {
    cfg: SafetyConfig,
    breaker: CircuitBreaker,
    /// Rolling (observed_at, skew_pct) samples for the sustained-skew check
    skew_samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl SafetyGate {
    pub fn new(cfg: SafetyConfig) -> Self {
        let breaker = CircuitBreaker::new(cfg.breaker_failure_threshold, cfg.breaker_cooldown);
        SafetyGate {
            cfg,
            breaker,
            skew_samples: VecDeque::new(),
        }
    }

    /// Run every check against an opportunity.  `spread_bps` is the widest
    /// observed bid/ask spread across the legs' markets, when books were
    /// available.
    pub fn evaluate(
        &mut self,
        opp: &ArbitrageOpportunity,
        spread_bps: Option<f64>,
        now: DateTime<Utc>,
    ) -> GateReport {
        let mut checks = Vec::with_capacity(7);

        // (1) price-data age
        let age_secs = (now - opp.price_fetched_at).num_seconds();
        checks.push(if age_secs <= self.cfg.max_price_age_secs {
            CheckResult::pass("price_age")
        } else {
            CheckResult::fail(
                "price_age",
                Severity::Critical,
                format!(
                    "price data is {}s old (max {}s)",
                    age_secs, self.cfg.max_price_age_secs
                ),
            )
        });

        // (2) spread-driven slippage estimate
        checks.push(match spread_bps {
            Some(bps) if bps > self.cfg.max_slippage_bps => CheckResult::fail(
                "slippage",
                Severity::Critical,
                format!(
                    "estimated slippage {:.0}bps exceeds max {:.0}bps",
                    bps, self.cfg.max_slippage_bps
                ),
            ),
            Some(_) => CheckResult::pass("slippage"),
            None => CheckResult {
                name: "slippage",
                passed: true,
                reason: Some("no orderbook spread available".to_string()),
                severity: Severity::Info,
            },
        });

        // (3) circuit breaker
        checks.push(if self.breaker.is_open(now) {
            let reason = match self.breaker.status() {
                BreakerStatus::Open { reason, .. } => reason.clone(),
                BreakerStatus::Closed => String::new(),
            };
            CheckResult::fail(
                "circuit_breaker",
                Severity::Critical,
                format!("breaker open: {}", reason),
            )
        } else {
            CheckResult::pass("circuit_breaker")
        });

        // (4) per-leg liquidity proxy
        let thin_leg = [&opp.legs.0, &opp.legs.1]
            .into_iter()
            .find(|l| l.volume.unwrap_or(0.0) < self.cfg.min_leg_liquidity_usd);
        checks.push(match thin_leg {
            Some(leg) => CheckResult::fail(
                "liquidity",
                Severity::Critical,
                format!(
                    "{} leg volume {:.0} below minimum {:.0}",
                    leg.venue,
                    leg.volume.unwrap_or(0.0),
                    self.cfg.min_leg_liquidity_usd
                ),
            ),
            None => CheckResult::pass("liquidity"),
        });

        // (5) minimum profit margin
        checks.push(if opp.margin_pct >= self.cfg.min_margin_pct {
            CheckResult::pass("profit_margin")
        } else {
            CheckResult::fail(
                "profit_margin",
                Severity::Critical,
                format!(
                    "margin {:.2}% below minimum {:.2}%",
                    opp.margin_pct, self.cfg.min_margin_pct
                ),
            )
        });

        // (6) implied-probability skew — a combined probability far from
        // 100% is a data-quality red flag, not a genuine edge
        let skew_pct = implied_skew_pct(opp);
        self.push_skew_sample(now, skew_pct);
        checks.push(if skew_pct <= self.cfg.max_implied_skew_pct {
            CheckResult::pass("implied_skew")
        } else {
            CheckResult::fail(
                "implied_skew",
                Severity::Critical,
                format!(
                    "combined implied probability off by {:.1}% (max {:.1}%)",
                    skew_pct, self.cfg.max_implied_skew_pct
                ),
            )
        });

        // (6b) sustained skew over the rolling window
        checks.push(match self.sustained_skew() {
            Some(avg) if avg > self.cfg.max_implied_skew_pct => CheckResult::fail(
                "sustained_skew",
                Severity::Warning,
                format!(
                    "average skew {:.1}% over the last {}s",
                    avg,
                    self.cfg.skew_window.num_seconds()
                ),
            ),
            _ => CheckResult::pass("sustained_skew"),
        });

        let overall_passed = !checks
            .iter()
            .any(|c| !c.passed && c.severity == Severity::Critical);
        GateReport {
            checks,
            overall_passed,
        }
    }

    /// Report an execution outcome to the breaker.
    pub fn record_execution(&mut self, success: bool, reason: &str, now: DateTime<Utc>) {
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure(reason, now);
        }
    }

    pub fn breaker_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.breaker
    }

    fn push_skew_sample(&mut self, now: DateTime<Utc>, skew_pct: f64) {
        self.skew_samples.push_back((now, skew_pct));
        let cutoff = now - self.cfg.skew_window;
        while let Some((t, _)) = self.skew_samples.front() {
            if *t < cutoff {
                self.skew_samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Windowed average skew; requires a few samples before it can fire.
    fn sustained_skew(&self) -> Option<f64> {
        if self.skew_samples.len() < 3 {
            return None;
        }
        let sum: f64 = self.skew_samples.iter().map(|(_, s)| s).sum();
        Some(sum / self.skew_samples.len() as f64)
    }
}

/// |combined implied probability − 100| in percent, across both legs.
fn implied_skew_pct(opp: &ArbitrageOpportunity) -> f64 {
    let implied = |leg: &crate::model::Leg| match leg.kind {
        MarketKind::ProbabilityCents => leg.price / 100.0,
        MarketKind::DecimalOdds => 1.0 / leg.price,
    };
    let combined = implied(&opp.legs.0) + implied(&opp.legs.1);
    (combined * 100.0 - 100.0).abs()
}
