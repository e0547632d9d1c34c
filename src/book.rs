//! Per-window orderbook store.
//!
//! One `PairBook` per (symbol, window) holds the UP and DOWN outcome
//! ladders. The ingest task is the only writer; detection reads the cloned
//! book it gets back from each apply call, so no lock is held across
//! evaluation.
//!
//! Two update shapes arrive from the feed:
//! - full snapshot: replaces both ladders of one outcome side
//! - price change: touches the top of one ladder only; when the message
//!   carries no explicit size, deeper levels stop being trusted for
//!   liquidity until the next snapshot

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Exchange price quantum.
pub const TICK: f64 = 0.01;
/// Best asks below this are treated as noise, never traded.
pub const MIN_REALISTIC_PRICE: f64 = 0.05;
/// Levels kept per ladder on ingest.
pub const MAX_BOOK_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

/// Which outcome token of the pair an update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeSide {
    Up,
    Down,
}

impl OutcomeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSide::Up => "UP",
            OutcomeSide::Down => "DOWN",
        }
    }
}

/// Which ladder of an outcome book a price change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderSide {
    Bid,
    Ask,
}

/// One outcome token's two ladders.
#[derive(Debug, Clone, Default)]
pub struct SideQuotes {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// False after a best-ask-only price change: sizes beyond level 0 are
    /// stale until the next snapshot.
    pub depth_trusted: bool,
}

impl SideQuotes {
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    /// The ask levels usable for liquidity / VWAP math right now.
    pub fn usable_asks(&self) -> &[PriceLevel] {
        if self.depth_trusted {
            &self.asks
        } else {
            &self.asks[..self.asks.len().min(1)]
        }
    }

    pub fn ask_liquidity(&self) -> f64 {
        self.usable_asks().iter().map(|l| l.size).sum()
    }

    /// Ask liquidity within `pct` of the best ask (audit snapshots).
    pub fn ask_liquidity_within(&self, pct: f64) -> Option<f64> {
        let best = self.best_ask()?.price;
        let cap = best * (1.0 + pct);
        Some(
            self.usable_asks()
                .iter()
                .filter(|l| l.price <= cap)
                .map(|l| l.size)
                .sum(),
        )
    }

    fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price >= a.price,
            _ => false,
        }
    }
}

/// The full orderbook of one (symbol, window).
#[derive(Debug, Clone)]
pub struct PairBook {
    pub symbol: String,
    pub window_offset: u8,
    /// Market slug; the window key used everywhere.
    pub window_label: String,
    pub up: SideQuotes,
    pub down: SideQuotes,
    pub last_update: Instant,
}

impl PairBook {
    fn new(symbol: &str, window_offset: u8, window_label: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            window_offset,
            window_label: window_label.to_string(),
            up: SideQuotes::default(),
            down: SideQuotes::default(),
            last_update: Instant::now(),
        }
    }

    pub fn side(&self, side: OutcomeSide) -> &SideQuotes {
        match side {
            OutcomeSide::Up => &self.up,
            OutcomeSide::Down => &self.down,
        }
    }

    fn side_mut(&mut self, side: OutcomeSide) -> &mut SideQuotes {
        match side {
            OutcomeSide::Up => &mut self.up,
            OutcomeSide::Down => &mut self.down,
        }
    }

    /// A book is usable for detection only when both outcome sides quote an
    /// ask. An empty side mid-snapshot is a non-opportunity, never a
    /// zero-cost one.
    pub fn valid_for_detection(&self) -> bool {
        self.up.best_ask().is_some() && self.down.best_ask().is_some()
    }

    /// Combined best-ask cost of buying both outcomes.
    pub fn best_case_cost(&self) -> Option<f64> {
        Some(self.up.best_ask()?.price + self.down.best_ask()?.price)
    }
}

/// A price-change message for one ladder.
#[derive(Debug, Clone, Copy)]
pub struct PriceChange {
    pub ladder: LadderSide,
    pub price: f64,
    /// None when the feed only reported a new best price.
    pub size: Option<f64>,
}

/// Result of walking an ask ladder to a target share count.
#[derive(Debug, Clone, Copy)]
pub struct LadderFill {
    pub shares: f64,
    pub vwap: f64,
    pub levels_used: usize,
}

/// Walk `asks` (ascending) to fill up to `target_shares`. Fills what the
/// ladder has when liquidity is short.
pub fn walk_asks(asks: &[PriceLevel], target_shares: f64) -> Option<LadderFill> {
    if target_shares <= 0.0 {
        return None;
    }
    let mut remaining = target_shares;
    let mut cost = 0.0;
    let mut filled = 0.0;
    let mut levels_used = 0;

    for level in asks {
        if remaining <= 0.0 {
            break;
        }
        let take = remaining.min(level.size);
        if take <= 0.0 {
            continue;
        }
        cost += take * level.price;
        filled += take;
        remaining -= take;
        levels_used += 1;
    }

    if filled <= 0.0 {
        return None;
    }
    Some(LadderFill {
        shares: filled,
        vwap: cost / filled,
        levels_used,
    })
}

/// Normalise a raw ladder: drop zero/negative sizes, sort, dedup by price,
/// cap depth.
fn normalize_ladder(mut levels: Vec<PriceLevel>, ladder: LadderSide) -> Vec<PriceLevel> {
    levels.retain(|l| l.size > 0.0 && l.price > 0.0);
    match ladder {
        LadderSide::Ask => levels.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        LadderSide::Bid => levels.sort_by(|a, b| {
            b.price
                .partial_cmp(&a.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
    levels.dedup_by(|a, b| (a.price - b.price).abs() < TICK / 2.0);
    levels.truncate(MAX_BOOK_DEPTH);
    levels
}

#[derive(Debug, Default)]
pub struct BookMetrics {
    pub snapshots_applied: AtomicU64,
    pub price_changes_applied: AtomicU64,
    pub crossed_rejects: AtomicU64,
    pub updates_dropped: AtomicU64,
}

impl BookMetrics {
    pub fn summary(&self) -> String {
        format!(
            "snapshots={} price_changes={} crossed_rejects={} dropped={}",
            self.snapshots_applied.load(Ordering::Relaxed),
            self.price_changes_applied.load(Ordering::Relaxed),
            self.crossed_rejects.load(Ordering::Relaxed),
            self.updates_dropped.load(Ordering::Relaxed),
        )
    }
}

/// All live pair books, keyed by window label (market slug).
pub struct BookStore {
    books: RwLock<HashMap<String, PairBook>>,
    metrics: BookMetrics,
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookStore {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::with_capacity(16)),
            metrics: BookMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &BookMetrics {
        &self.metrics
    }

    pub fn get(&self, window_label: &str) -> Option<PairBook> {
        self.books.read().get(window_label).cloned()
    }

    /// Apply a full snapshot for one outcome side. Returns the updated book
    /// for inline detection, or None when the snapshot was rejected.
    pub fn apply_snapshot(
        &self,
        symbol: &str,
        window_offset: u8,
        window_label: &str,
        side: OutcomeSide,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Option<PairBook> {
        let bids = normalize_ladder(bids, LadderSide::Bid);
        let asks = normalize_ladder(asks, LadderSide::Ask);

        let mut books = self.books.write();
        let book = books
            .entry(window_label.to_string())
            .or_insert_with(|| PairBook::new(symbol, window_offset, window_label));

        let quotes = book.side_mut(side);
        let prev = std::mem::replace(
            quotes,
            SideQuotes {
                bids,
                asks,
                depth_trusted: true,
            },
        );
        if quotes.is_crossed() {
            warn!(
                window = window_label,
                side = side.as_str(),
                "crossed snapshot, keeping previous ladders"
            );
            *book.side_mut(side) = prev;
            self.metrics.crossed_rejects.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        book.last_update = Instant::now();
        self.metrics
            .snapshots_applied
            .fetch_add(1, Ordering::Relaxed);
        trace!(
            window = window_label,
            side = side.as_str(),
            bids = book.side(side).bids.len(),
            asks = book.side(side).asks.len(),
            "applied snapshot"
        );
        Some(book.clone())
    }

    /// Apply a top-of-ladder price change. Older levels beyond the new best
    /// are kept unless the new best price swept through them.
    pub fn apply_price_change(
        &self,
        symbol: &str,
        window_offset: u8,
        window_label: &str,
        side: OutcomeSide,
        change: PriceChange,
    ) -> Option<PairBook> {
        if change.price <= 0.0 {
            self.metrics.updates_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut books = self.books.write();
        let book = books
            .entry(window_label.to_string())
            .or_insert_with(|| PairBook::new(symbol, window_offset, window_label));
        let quotes = book.side_mut(side);

        match change.ladder {
            LadderSide::Ask => {
                let prev_best = quotes.asks.first().copied();
                // Levels the new best swept through are gone.
                quotes.asks.retain(|l| l.price > change.price);
                let size = match change.size {
                    Some(s) => s,
                    // Best-price-only message: carry the old size forward
                    // when the price is unchanged, else an opaque zero.
                    None => match prev_best {
                        Some(p) if (p.price - change.price).abs() < TICK / 2.0 => p.size,
                        _ => 0.0,
                    },
                };
                if size > 0.0 || change.size.is_none() {
                    quotes.asks.insert(
                        0,
                        PriceLevel {
                            price: change.price,
                            size,
                        },
                    );
                } // explicit size 0 = deletion; the retain above removed it
                if change.size.is_none() {
                    quotes.depth_trusted = false;
                }
            }
            LadderSide::Bid => {
                let prev_best = quotes.bids.first().copied();
                quotes.bids.retain(|l| l.price < change.price);
                let size = match change.size {
                    Some(s) => s,
                    None => match prev_best {
                        Some(p) if (p.price - change.price).abs() < TICK / 2.0 => p.size,
                        _ => 0.0,
                    },
                };
                if size > 0.0 || change.size.is_none() {
                    quotes.bids.insert(
                        0,
                        PriceLevel {
                            price: change.price,
                            size,
                        },
                    );
                }
            }
        }

        book.last_update = Instant::now();
        self.metrics
            .price_changes_applied
            .fetch_add(1, Ordering::Relaxed);
        Some(book.clone())
    }

    pub fn dropped(&self) {
        self.metrics.updates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop books for windows no longer watched (rotation cleanup).
    pub fn retain_windows(&self, keep: &[String]) {
        let mut books = self.books.write();
        books.retain(|label, _| keep.iter().any(|k| k == label));
    }

    pub fn window_labels(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, size: f64) -> PriceLevel {
        PriceLevel { price, size }
    }

    fn store_with_snapshot(asks: Vec<PriceLevel>) -> (BookStore, PairBook) {
        let store = BookStore::new();
        let book = store
            .apply_snapshot(
                "BTC",
                0,
                "btc-updown-15m-1700000000",
                OutcomeSide::Up,
                vec![lvl(0.40, 100.0)],
                asks,
            )
            .unwrap();
        (store, book)
    }

    #[test]
    fn snapshot_sorts_and_drops_zero_sizes() {
        let (_store, book) = store_with_snapshot(vec![
            lvl(0.50, 10.0),
            lvl(0.47, 20.0),
            lvl(0.49, 0.0),
            lvl(0.48, 5.0),
        ]);
        let asks = &book.up.asks;
        assert_eq!(asks.len(), 3);
        // Strictly ascending.
        for w in asks.windows(2) {
            assert!(w[0].price < w[1].price);
        }
        assert_eq!(asks[0].price, 0.47);
    }

    #[test]
    fn snapshot_dedups_duplicate_prices() {
        let (_store, book) = store_with_snapshot(vec![lvl(0.47, 20.0), lvl(0.47, 30.0)]);
        assert_eq!(book.up.asks.len(), 1);
    }

    #[test]
    fn crossed_snapshot_is_rejected() {
        let store = BookStore::new();
        let out = store.apply_snapshot(
            "BTC",
            0,
            "w",
            OutcomeSide::Up,
            vec![lvl(0.55, 10.0)],
            vec![lvl(0.50, 10.0)],
        );
        assert!(out.is_none());
        assert_eq!(store.metrics().crossed_rejects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn price_change_with_size_updates_top_and_keeps_depth() {
        let (store, _) = store_with_snapshot(vec![lvl(0.47, 20.0), lvl(0.48, 5.0)]);
        let book = store
            .apply_price_change(
                "BTC",
                0,
                "btc-updown-15m-1700000000",
                OutcomeSide::Up,
                PriceChange {
                    ladder: LadderSide::Ask,
                    price: 0.46,
                    size: Some(15.0),
                },
            )
            .unwrap();
        assert_eq!(book.up.asks[0], lvl(0.46, 15.0));
        // Deeper levels survive and remain trusted.
        assert_eq!(book.up.asks.len(), 3);
        assert!(book.up.depth_trusted);
        assert_eq!(book.up.ask_liquidity(), 40.0);
    }

    #[test]
    fn best_only_change_untrusts_depth() {
        let (store, _) = store_with_snapshot(vec![lvl(0.47, 20.0), lvl(0.48, 5.0)]);
        let book = store
            .apply_price_change(
                "BTC",
                0,
                "btc-updown-15m-1700000000",
                OutcomeSide::Up,
                PriceChange {
                    ladder: LadderSide::Ask,
                    price: 0.46,
                    size: None,
                },
            )
            .unwrap();
        assert!(!book.up.depth_trusted);
        // Liquidity restricted to level 0 until the next snapshot.
        assert_eq!(book.up.usable_asks().len(), 1);

        // A fresh snapshot restores trust.
        let book = store
            .apply_snapshot(
                "BTC",
                0,
                "btc-updown-15m-1700000000",
                OutcomeSide::Up,
                vec![],
                vec![lvl(0.47, 20.0)],
            )
            .unwrap();
        assert!(book.up.depth_trusted);
    }

    #[test]
    fn price_change_sweeps_stale_levels() {
        let (store, _) = store_with_snapshot(vec![lvl(0.47, 20.0), lvl(0.48, 5.0), lvl(0.52, 9.0)]);
        // Best ask moves up through 0.48: both lower levels are gone.
        let book = store
            .apply_price_change(
                "BTC",
                0,
                "btc-updown-15m-1700000000",
                OutcomeSide::Up,
                PriceChange {
                    ladder: LadderSide::Ask,
                    price: 0.50,
                    size: Some(12.0),
                },
            )
            .unwrap();
        assert_eq!(book.up.asks[0], lvl(0.50, 12.0));
        assert_eq!(book.up.asks.len(), 2);
        for w in book.up.asks.windows(2) {
            assert!(w[0].price < w[1].price);
        }
    }

    #[test]
    fn empty_side_is_not_an_opportunity() {
        let store = BookStore::new();
        let book = store
            .apply_snapshot(
                "BTC",
                0,
                "w",
                OutcomeSide::Up,
                vec![],
                vec![lvl(0.47, 20.0)],
            )
            .unwrap();
        assert!(!book.valid_for_detection());
        assert!(book.best_case_cost().is_none());
    }

    #[test]
    fn walk_asks_vwap_bounds() {
        let asks = vec![lvl(0.47, 50.0), lvl(0.49, 50.0), lvl(0.55, 100.0)];
        let fill = walk_asks(&asks, 80.0).unwrap();
        assert_eq!(fill.shares, 80.0);
        assert_eq!(fill.levels_used, 2);
        // VWAP >= best ask, and equals the blended fill cost.
        assert!(fill.vwap >= 0.47);
        let expect = (50.0 * 0.47 + 30.0 * 0.49) / 80.0;
        assert!((fill.vwap - expect).abs() < 1e-12);
    }

    #[test]
    fn walk_asks_partial_when_ladder_short() {
        let asks = vec![lvl(0.47, 10.0)];
        let fill = walk_asks(&asks, 100.0).unwrap();
        assert_eq!(fill.shares, 10.0);
        assert_eq!(fill.vwap, 0.47);
        assert!(walk_asks(&[], 10.0).is_none());
    }
}
