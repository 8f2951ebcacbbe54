//! Optional WebSocket price feed for the probability-cents venues.
//!
//! A background task keeps a shared quote map fresh; lookups are instant
//! reads from memory.  The feed only tightens the safety gate's view of
//! spreads between REST refreshes — scan cycles never block on it, and a
//! dead feed simply means the slippage check falls back to REST quotes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::model::Venue;

/// Lifecycle of the background connection, observable via a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Last connect attempt failed; a reconnect is pending
    Error,
}

/// Best bid/ask (plus last trade, when seen) for one market, in cents.
#[derive(Debug, Clone)]
pub struct Quote {
    pub best_bid: f64,
    pub best_ask: f64,
    pub last_trade: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        if self.best_bid > 0.0 && self.best_ask > 0.0 {
            (self.best_bid + self.best_ask) / 2.0
        } else if self.best_bid > 0.0 {
            self.best_bid
        } else {
            self.best_ask
        }
    }

    /// Bid/ask spread in basis points of the midpoint.
    pub fn spread_bps(&self) -> Option<f64> {
        if self.best_bid <= 0.0 || self.best_ask <= 0.0 || self.best_ask < self.best_bid {
            return None;
        }
        let mid = self.mid();
        (mid > 0.0).then(|| (self.best_ask - self.best_bid) / mid * 10_000.0)
    }
}

/// One feed serves one venue's socket; quotes from it only ever apply to
/// that venue's tickers.
pub struct LivePriceFeed {
    venue: Venue,
    quotes: Arc<RwLock<HashMap<String, Quote>>>,
    subscribe_tx: mpsc::Sender<Vec<String>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl LivePriceFeed {
    /// Spawn the background connection task and return a handle.
    pub fn spawn(venue: Venue, ws_url: &str) -> Self {
        let quotes: Arc<RwLock<HashMap<String, Quote>>> = Arc::new(RwLock::new(HashMap::new()));
        let (subscribe_tx, subscribe_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let quotes_clone = Arc::clone(&quotes);
        let ws_url = ws_url.to_string();
        tokio::spawn(async move {
            feed_loop(&ws_url, quotes_clone, subscribe_rx, state_tx).await;
        });

        LivePriceFeed {
            venue,
            quotes,
            subscribe_tx,
            state_rx,
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    /// Track additional market tickers.  Subscriptions accumulate and
    /// survive reconnects.
    pub async fn subscribe(&self, tickers: &[String]) {
        if !tickers.is_empty() {
            let _ = self.subscribe_tx.send(tickers.to_vec()).await;
        }
    }

    pub async fn quote(&self, ticker: &str) -> Option<Quote> {
        self.quotes.read().await.get(ticker).cloned()
    }

    /// Current spread for a ticker, when the feed has seen both sides.
    pub async fn spread_bps(&self, ticker: &str) -> Option<f64> {
        self.quote(ticker).await.and_then(|q| q.spread_bps())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }
}

async fn feed_loop(
    ws_url: &str,
    quotes: Arc<RwLock<HashMap<String, Quote>>>,
    mut subscribe_rx: mpsc::Receiver<Vec<String>>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut backoff_secs = 1u64;
    let max_backoff = 30u64;
    let mut first_attempt = true;
    // Subscriptions accumulate across reconnects
    let mut subscribed: Vec<String> = Vec::new();

    loop {
        let _ = state_tx.send(if first_attempt {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });
        first_attempt = false;

        match tokio_tungstenite::connect_async(ws_url).await {
            Ok((ws_stream, _)) => {
                info!(url = ws_url, "price feed connected");
                let _ = state_tx.send(ConnectionState::Connected);
                backoff_secs = 1;

                let (mut write, mut read) = ws_stream.split();

                if !subscribed.is_empty() {
                    let msg = build_subscribe_message(&subscribed);
                    if let Err(e) = write.send(Message::Text(msg)).await {
                        error!(error = %e, "price feed re-subscribe failed");
                        continue;
                    }
                    info!(count = subscribed.len(), "price feed re-subscribed");
                }

                let mut ping_interval =
                    tokio::time::interval(std::time::Duration::from_secs(25));

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let mut map = quotes.write().await;
                                    apply_message(&text, &mut map, Utc::now());
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) => {
                                    warn!("price feed server closed connection");
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!(error = %e, "price feed stream error");
                                    break;
                                }
                                None => {
                                    warn!("price feed stream ended");
                                    break;
                                }
                                _ => {}
                            }
                        }
                        Some(tickers) = subscribe_rx.recv() => {
                            subscribed.extend(tickers.clone());
                            subscribed.sort();
                            subscribed.dedup();
                            let msg = build_subscribe_message(&tickers);
                            if let Err(e) = write.send(Message::Text(msg)).await {
                                error!(error = %e, "price feed subscribe failed");
                            }
                        }
                        _ = ping_interval.tick() => {
                            if let Err(e) = write.send(Message::Ping(vec![])).await {
                                error!(error = %e, "price feed ping failed");
                                break;
                            }
                        }
                    }
                }
                let _ = state_tx.send(ConnectionState::Disconnected);
            }
            Err(e) => {
                error!(error = %e, "price feed connection failed");
                let _ = state_tx.send(ConnectionState::Error);
            }
        }

        let delay = reconnect_delay_ms(backoff_secs, rand::thread_rng().gen_range(0..500));
        warn!(delay_ms = delay, "price feed reconnecting");
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        backoff_secs = (backoff_secs * 2).min(max_backoff);
    }
}

/// Doubling backoff with jitter so parallel feeds don't reconnect in
/// lockstep after a venue-side drop.
fn reconnect_delay_ms(backoff_secs: u64, jitter_ms: u64) -> u64 {
    backoff_secs * 1000 + jitter_ms
}

fn build_subscribe_message(tickers: &[String]) -> String {
    serde_json::json!({
        "type": "subscribe",
        "channel": "book",
        "markets": tickers,
    })
    .to_string()
}

/// Apply one feed message to the quote map.  Returns how many quotes were
/// updated; malformed messages are dropped silently.
fn apply_message(text: &str, quotes: &mut HashMap<String, Quote>, now: DateTime<Utc>) -> usize {
    let Ok(val) = serde_json::from_str::<serde_json::Value>(text) else {
        return 0;
    };
    let event = val.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event {
        // Full book snapshot for one market
        "book" => {
            let Some(ticker) = val.get("market").and_then(|v| v.as_str()) else {
                return 0;
            };
            let best_bid = top_of_book(&val, "bids");
            let best_ask = top_of_book(&val, "asks");
            if best_bid <= 0.0 && best_ask <= 0.0 {
                return 0;
            }
            let last_trade = quotes.get(ticker).and_then(|q| q.last_trade);
            quotes.insert(
                ticker.to_string(),
                Quote {
                    best_bid,
                    best_ask,
                    last_trade,
                    updated_at: now,
                },
            );
            1
        }
        // Incremental best-quote updates, possibly batched
        "ticker" | "price_change" => {
            let single = std::slice::from_ref(&val);
            let changes = val
                .get("changes")
                .and_then(|v| v.as_array())
                .map(|a| a.as_slice())
                .unwrap_or(single);
            let mut applied = 0;
            for change in changes {
                let Some(ticker) = change.get("market").and_then(|v| v.as_str()) else {
                    continue;
                };
                let best_bid = price_field(change, "best_bid");
                let best_ask = price_field(change, "best_ask");
                if best_bid <= 0.0 && best_ask <= 0.0 {
                    continue;
                }
                let last_trade = quotes.get(ticker).and_then(|q| q.last_trade);
                quotes.insert(
                    ticker.to_string(),
                    Quote {
                        best_bid,
                        best_ask,
                        last_trade,
                        updated_at: now,
                    },
                );
                applied += 1;
            }
            applied
        }
        // Trade prints refresh the last-trade reference without touching
        // whatever book quote is already held
        "trade" => {
            let Some(ticker) = val.get("market").and_then(|v| v.as_str()) else {
                return 0;
            };
            let price = price_field(&val, "price");
            if price <= 0.0 {
                return 0;
            }
            let entry = quotes.entry(ticker.to_string()).or_insert(Quote {
                best_bid: 0.0,
                best_ask: 0.0,
                last_trade: None,
                updated_at: now,
            });
            entry.last_trade = Some(price);
            entry.updated_at = now;
            1
        }
        _ => 0,
    }
}

fn top_of_book(val: &serde_json::Value, side: &str) -> f64 {
    val.get(side)
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .map(|level| price_field(level, "price"))
        .unwrap_or(0.0)
}

fn price_field(val: &serde_json::Value, field: &str) -> f64 {
    val.get(field)
        .and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_snapshot_updates_quote() {
        let mut quotes = HashMap::new();
        let now = Utc::now();
        let msg = serde_json::json!({
            "type": "book",
            "market": "KXNBAGAME-LAL",
            "bids": [{"price": "39"}, {"price": "38"}],
            "asks": [{"price": 41}, {"price": 42}]
        })
        .to_string();
        assert_eq!(apply_message(&msg, &mut quotes, now), 1);
        let q = &quotes["KXNBAGAME-LAL"];
        assert_eq!(q.best_bid, 39.0);
        assert_eq!(q.best_ask, 41.0);
        assert_eq!(q.mid(), 40.0);
    }

    #[test]
    fn test_batched_ticker_updates() {
        let mut quotes = HashMap::new();
        let now = Utc::now();
        let msg = serde_json::json!({
            "type": "ticker",
            "changes": [
                {"market": "A", "best_bid": 39.0, "best_ask": 41.0},
                {"market": "B", "best_bid": "58", "best_ask": "60"},
                {"best_bid": 10.0, "best_ask": 11.0}
            ]
        })
        .to_string();
        assert_eq!(apply_message(&msg, &mut quotes, now), 2);
        assert!(quotes.contains_key("A"));
        assert!(quotes.contains_key("B"));
    }

    #[test]
    fn test_malformed_and_unknown_messages_ignored() {
        let mut quotes = HashMap::new();
        let now = Utc::now();
        assert_eq!(apply_message("{not json", &mut quotes, now), 0);
        assert_eq!(
            apply_message(r#"{"type":"heartbeat"}"#, &mut quotes, now),
            0
        );
        assert_eq!(
            apply_message(r#"{"type":"book","bids":[],"asks":[]}"#, &mut quotes, now),
            0
        );
        assert!(quotes.is_empty());
    }

    #[test]
    fn test_spread_bps() {
        let q = Quote {
            best_bid: 39.0,
            best_ask: 41.0,
            last_trade: None,
            updated_at: Utc::now(),
        };
        // 2 cents on a 40-cent mid = 500 bps
        assert!((q.spread_bps().unwrap() - 500.0).abs() < 1e-9);

        let one_sided = Quote {
            best_bid: 0.0,
            best_ask: 41.0,
            last_trade: None,
            updated_at: Utc::now(),
        };
        assert_eq!(one_sided.spread_bps(), None);

        let crossed = Quote {
            best_bid: 42.0,
            best_ask: 41.0,
            last_trade: None,
            updated_at: Utc::now(),
        };
        assert_eq!(crossed.spread_bps(), None);
    }

    #[test]
    fn test_trade_updates_last_trade_only() {
        let mut quotes = HashMap::new();
        let now = Utc::now();
        let book = serde_json::json!({
            "type": "book",
            "market": "A",
            "bids": [{"price": 39.0}],
            "asks": [{"price": 41.0}]
        })
        .to_string();
        apply_message(&book, &mut quotes, now);

        let trade = serde_json::json!({
            "type": "trade",
            "market": "A",
            "price": "40"
        })
        .to_string();
        assert_eq!(apply_message(&trade, &mut quotes, now), 1);
        let q = &quotes["A"];
        assert_eq!(q.best_bid, 39.0);
        assert_eq!(q.best_ask, 41.0);
        assert_eq!(q.last_trade, Some(40.0));

        // Trade for an unseen market still records the print
        let other = serde_json::json!({"type": "trade", "market": "B", "price": 58.0}).to_string();
        assert_eq!(apply_message(&other, &mut quotes, now), 1);
        assert_eq!(quotes["B"].last_trade, Some(58.0));
    }

    #[test]
    fn test_reconnect_delay_doubles_with_jitter() {
        assert_eq!(reconnect_delay_ms(1, 0), 1000);
        assert_eq!(reconnect_delay_ms(4, 250), 4250);
        let mut backoff = 1u64;
        for _ in 0..10 {
            backoff = (backoff * 2).min(30);
        }
        assert_eq!(backoff, 30);
    }
}
