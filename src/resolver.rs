//! Position resolution tracker.
//!
//! Wakes shortly after each window close, loads open positions whose window
//! has ended, and settles them against the resolved market. Positions the
//! exchange has not resolved yet are retried on the next wake; settlement
//! fires at most once per position thanks to the terminal-state check.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::book::OutcomeSide;
use crate::catalog::{GammaMarket, MarketCatalog};
use crate::clock::{self, Timeframe};
use crate::fees;
use crate::store::{Position, PositionStatus, PositionStore};

/// Grace delay after window close before querying resolution.
const RESOLUTION_GRACE: Duration = Duration::from_secs(60);
/// Winner rule: a side must print above this to count as resolved.
const WIN_PRICE: f64 = 0.9;

pub struct ResolutionTracker {
    catalog: MarketCatalog,
    store: PositionStore,
    timeframe: Timeframe,
    paper_mode: bool,
    rng: Mutex<ChaCha8Rng>,
}

impl ResolutionTracker {
    pub fn new(
        catalog: MarketCatalog,
        store: PositionStore,
        timeframe: Timeframe,
        paper_mode: bool,
    ) -> Self {
        Self {
            catalog,
            store,
            timeframe,
            paper_mode,
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    #[cfg(test)]
    fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(ChaCha8Rng::seed_from_u64(seed));
        self
    }

    /// Timer loop: wake 60s after every window close until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let now_ms = Utc::now().timestamp_millis();
            let wait = Duration::from_millis(clock::ms_until_next_boundary(now_ms, self.timeframe))
                + RESOLUTION_GRACE;
            debug!(wait_secs = wait.as_secs(), "resolution tracker sleeping");

            tokio::select! {
                _ = sleep(wait) => {
                    if let Err(e) = self.resolve_pending(Utc::now().timestamp()).await {
                        warn!(error = %e, "resolution pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("resolution tracker stopping");
                    return;
                }
            }
        }
    }

    /// One resolution pass. Returns how many positions settled.
    pub async fn resolve_pending(&self, now_unix: i64) -> Result<usize> {
        let open = self
            .store
            .open_positions()
            .await
            .context("load open positions")?;
        if open.is_empty() {
            return Ok(0);
        }

        let mut settled = 0;
        for position in open {
            // Positions are partitioned by the window they opened in; only
            // ended windows are eligible.
            let window_end = window_end_unix(&position, self.timeframe);
            if window_end + RESOLUTION_GRACE.as_secs() as i64 > now_unix {
                continue;
            }

            let outcome = if self.paper_mode {
                // Arbitrage profit is outcome-independent; assign uniformly.
                Some(if self.rng.lock().gen::<bool>() {
                    OutcomeSide::Up
                } else {
                    OutcomeSide::Down
                })
            } else {
                match self.catalog.lookup_by_slug(&position.window_key).await {
                    Ok(Some(market)) => outcome_from_market(&market),
                    Ok(None) => {
                        debug!(window = position.window_key.as_str(), "market not yet queryable");
                        None
                    }
                    Err(e) => {
                        // HTTP failure: leave open, retry next wake.
                        warn!(window = position.window_key.as_str(), error = %e, "resolution lookup failed");
                        None
                    }
                }
            };

            let Some(outcome) = outcome else {
                continue;
            };
            if self.settle(position, outcome).await? {
                settled += 1;
            }
        }

        if settled > 0 {
            info!(settled, "resolution pass complete");
        }
        Ok(settled)
    }

    /// Settle one position. At most once: terminal states are never
    /// overwritten.
    pub async fn settle(&self, position: Position, outcome: OutcomeSide) -> Result<bool> {
        // Re-read for the terminal-state check; another pass may have won.
        let current = match self.store.by_id(&position.id).await? {
            Some(p) => p,
            None => position,
        };
        if current.status.is_terminal() {
            return Ok(false);
        }

        let mut settledp = current;
        let payout = settledp.size_up.min(settledp.size_down);
        let fee_total = recompute_fees(&settledp, self.timeframe);
        let actual_profit = payout - settledp.total_cost - fee_total;

        settledp.status = PositionStatus::Resolved;
        settledp.resolved_at_ms = Some(Utc::now().timestamp_millis());
        settledp.outcome = Some(outcome.as_str().to_string());
        settledp.payout = Some(payout);
        settledp.fees = Some(fee_total);
        settledp.actual_profit = Some(actual_profit);

        self.store.save(&settledp).await?;
        info!(
            id = settledp.id.as_str(),
            window = settledp.window_key.as_str(),
            outcome = outcome.as_str(),
            payout,
            actual_profit,
            "position resolved"
        );
        Ok(true)
    }
}

/// Unix end of the window a position was opened in.
fn window_end_unix(position: &Position, timeframe: Timeframe) -> i64 {
    let opened_unix = position.opened_at_ms / 1000;
    clock::current_period_start(opened_unix, timeframe) + timeframe.period_secs()
}

/// Read the winner out of a resolved market. None = not resolved yet or
/// malformed prices; the caller leaves the position open either way.
pub fn outcome_from_market(market: &GammaMarket) -> Option<OutcomeSide> {
    let closed = market.closed.unwrap_or(false) || market.resolved.unwrap_or(false);
    if !closed {
        return None;
    }

    let prices = market.parsed_outcome_prices();
    if prices.len() != market.outcomes.len() {
        return None;
    }

    let price_of = |names: &[&str]| -> Option<f64> {
        market
            .outcomes
            .iter()
            .position(|o| names.iter().any(|n| o.eq_ignore_ascii_case(n)))
            .and_then(|i| prices.get(i).copied())
    };

    let up_price = price_of(&["up", "yes"])?;
    let down_price = price_of(&["down", "no"])?;

    if up_price > WIN_PRICE {
        Some(OutcomeSide::Up)
    } else if down_price > WIN_PRICE {
        Some(OutcomeSide::Down)
    } else {
        None
    }
}

/// Entry fees re-derived from the recorded fills.
fn recompute_fees(position: &Position, timeframe: Timeframe) -> f64 {
    let price_up = if position.size_up > 0.0 {
        position.cost_up / position.size_up
    } else {
        0.0
    };
    let price_down = if position.size_down > 0.0 {
        position.cost_down / position.size_down
    } else {
        0.0
    };
    fees::entry_fees(
        timeframe,
        position.cost_up,
        price_up,
        position.cost_down,
        price_down,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_GAMMA_BASE;

    fn tracker(store: PositionStore, timeframe: Timeframe, paper: bool) -> ResolutionTracker {
        let catalog = MarketCatalog::new(reqwest::Client::new(), DEFAULT_GAMMA_BASE, timeframe);
        ResolutionTracker::new(catalog, store, timeframe, paper).with_seed(11)
    }

    fn open_position(id: &str, opened_at_ms: i64) -> Position {
        Position {
            id: id.to_string(),
            market: "BTC".to_string(),
            window_key: "btc-updown-15m-1700000000".to_string(),
            opened_at_ms,
            resolved_at_ms: None,
            status: PositionStatus::Open,
            cost_up: 50.0,
            cost_down: 45.0,
            size_up: 105.0,
            size_down: 103.0,
            total_cost: 95.0,
            expected_profit: 5.0,
            ask_up: Some(0.48),
            ask_down: Some(0.43),
            liquidity_up: None,
            liquidity_down: None,
            est_slippage: None,
            latency_detect_ms: None,
            latency_exec_ms: None,
            latency_total_ms: None,
            outcome: None,
            payout: None,
            fees: None,
            actual_profit: None,
        }
    }

    fn resolved_market(up_price: &str, down_price: &str) -> GammaMarket {
        serde_json::from_str(&format!(
            r#"{{
                "slug": "btc-updown-15m-1700000000",
                "conditionId": "c",
                "closed": true,
                "outcomes": ["Up", "Down"],
                "clobTokenIds": ["u", "d"],
                "outcomePrices": "[\"{up_price}\", \"{down_price}\"]"
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn outcome_rules() {
        assert_eq!(
            outcome_from_market(&resolved_market("1", "0")),
            Some(OutcomeSide::Up)
        );
        assert_eq!(
            outcome_from_market(&resolved_market("0.02", "0.98")),
            Some(OutcomeSide::Down)
        );
        // Neither side above 0.9: malformed, stay open.
        assert_eq!(outcome_from_market(&resolved_market("0.5", "0.5")), None);

        // Not closed yet.
        let mut market = resolved_market("1", "0");
        market.closed = Some(false);
        market.resolved = None;
        assert_eq!(outcome_from_market(&market), None);
    }

    #[tokio::test]
    async fn settlement_math_uses_min_size() {
        let store = PositionStore::open_in_memory().unwrap();
        let position = open_position("p1", 1_700_000_000_000);
        store.save(&position).await.unwrap();

        let tracker = tracker(store.clone(), Timeframe::H1, true);
        assert!(tracker.settle(position, OutcomeSide::Up).await.unwrap());

        let settledp = store.by_id("p1").await.unwrap().unwrap();
        assert_eq!(settledp.status, PositionStatus::Resolved);
        assert_eq!(settledp.payout, Some(103.0));
        assert_eq!(settledp.fees, Some(0.0)); // 1h: fee-free
        assert!((settledp.actual_profit.unwrap() - (103.0 - 95.0)).abs() < 1e-9);
        assert_eq!(settledp.outcome.as_deref(), Some("UP"));
        assert!(settledp.resolved_at_ms.is_some());
    }

    #[tokio::test]
    async fn settlement_fires_at_most_once() {
        let store = PositionStore::open_in_memory().unwrap();
        let position = open_position("p1", 1_700_000_000_000);
        store.save(&position).await.unwrap();

        let tracker = tracker(store.clone(), Timeframe::H1, true);
        assert!(tracker
            .settle(position.clone(), OutcomeSide::Up)
            .await
            .unwrap());
        // Second fire is a no-op, even with a different outcome.
        assert!(!tracker.settle(position, OutcomeSide::Down).await.unwrap());

        let settledp = store.by_id("p1").await.unwrap().unwrap();
        assert_eq!(settledp.outcome.as_deref(), Some("UP"));
    }

    #[tokio::test]
    async fn paper_pass_settles_only_ended_windows() {
        let store = PositionStore::open_in_memory().unwrap();
        // Window long over.
        store
            .save(&open_position("old", 1_700_000_000_000))
            .await
            .unwrap();
        // Window still running at `now`.
        let now_unix = 1_700_003_600;
        store
            .save(&open_position("fresh", now_unix * 1000 - 10_000))
            .await
            .unwrap();

        let tracker = tracker(store.clone(), Timeframe::M15, true);
        let settled = tracker.resolve_pending(now_unix).await.unwrap();
        assert_eq!(settled, 1);

        assert_eq!(
            store.by_id("old").await.unwrap().unwrap().status,
            PositionStatus::Resolved
        );
        assert_eq!(
            store.by_id("fresh").await.unwrap().unwrap().status,
            PositionStatus::Open
        );
    }

    #[tokio::test]
    async fn fifteen_minute_fees_are_recomputed_at_settlement() {
        let store = PositionStore::open_in_memory().unwrap();
        let mut position = open_position("p1", 1_700_000_000_000);
        // Fills at 0.50 and 0.43, ~107.53 shares each.
        position.size_up = 107.53;
        position.size_down = 107.53;
        position.cost_up = 107.53 * 0.50;
        position.cost_down = 107.53 * 0.43;
        position.total_cost = position.cost_up + position.cost_down;
        store.save(&position).await.unwrap();

        let tracker = tracker(store.clone(), Timeframe::M15, true);
        tracker.settle(position, OutcomeSide::Down).await.unwrap();

        let settledp = store.by_id("p1").await.unwrap().unwrap();
        let fees = settledp.fees.unwrap();
        assert!((fees - 2.97).abs() < 0.05);
        let expected_profit = 107.53 - settledp.total_cost - fees;
        assert!((settledp.actual_profit.unwrap() - expected_profit).abs() < 1e-9);
    }

    #[test]
    fn window_end_is_derived_from_open_time() {
        let position = open_position("p", 1_700_000_200_000);
        let end = window_end_unix(&position, Timeframe::M15);
        let start = clock::current_period_start(1_700_000_200, Timeframe::M15);
        assert_eq!(end, start + 900);
        assert!(end > 1_700_000_200);

        let end_h = window_end_unix(&position, Timeframe::H1);
        let start_h = clock::current_period_start(1_700_000_200, Timeframe::H1);
        assert_eq!(end_h, start_h + 3600);
    }
}
