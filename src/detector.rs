//! Dip detection & sizing engine.
//!
//! Runs inline on every orderbook update: no awaits, no I/O. Evaluates the
//! gate sequence, tracks dip intervals per (symbol, window), and produces an
//! immutable opportunity for the executor when every gate passes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::book::{walk_asks, PairBook, MIN_REALISTIC_PRICE};
use crate::clock::Timeframe;
use crate::config::{BotConfig, MIN_TRADE_USD};
use crate::fees;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TradePending,
    CooldownActive,
    EmptyOrderbook,
    PriceTooLow,
    NoDip,
    TradeTooSmall,
    SlippageTooHigh,
    ProfitTooLow,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TradePending => "trade pending",
            SkipReason::CooldownActive => "cooldown active",
            SkipReason::EmptyOrderbook => "empty orderbook",
            SkipReason::PriceTooLow => "price too low",
            SkipReason::NoDip => "no dip",
            SkipReason::TradeTooSmall => "trade too small",
            SkipReason::SlippageTooHigh => "slippage too high",
            SkipReason::ProfitTooLow => "profit too low",
        }
    }

    fn index(&self) -> usize {
        match self {
            SkipReason::TradePending => 0,
            SkipReason::CooldownActive => 1,
            SkipReason::EmptyOrderbook => 2,
            SkipReason::PriceTooLow => 3,
            SkipReason::NoDip => 4,
            SkipReason::TradeTooSmall => 5,
            SkipReason::SlippageTooHigh => 6,
            SkipReason::ProfitTooLow => 7,
        }
    }
}

/// Everything the executor needs, frozen at detection time.
#[derive(Debug, Clone, Serialize)]
pub struct DipOpportunity {
    pub symbol: String,
    pub window_label: String,
    pub window_offset: u8,
    pub timestamp_ms: i64,
    pub ask_up: f64,
    pub ask_down: f64,
    pub avg_fill_up: f64,
    pub avg_fill_down: f64,
    /// Per-share VWAP cost of both legs.
    pub total_cost: f64,
    /// Per-share best-ask cost of both legs.
    pub best_case_cost: f64,
    pub shares: f64,
    pub trade_value: f64,
    pub expected_profit: f64,
    pub profit_pct: f64,
    pub fees: f64,
    pub slippage_up: f64,
    pub slippage_down: f64,
    pub liquidity_up: f64,
    pub liquidity_down: f64,
    pub levels_used_up: usize,
    pub levels_used_down: usize,
    #[serde(skip)]
    pub detected_at: Option<Instant>,
}

#[derive(Debug)]
pub enum DetectionResult {
    Skip(SkipReason),
    Trade(Box<DipOpportunity>),
}

/// A dip interval in progress for one (symbol, window).
#[derive(Debug, Clone)]
pub struct ActiveDip {
    pub symbol: String,
    pub window_label: String,
    pub start_ts_ms: i64,
    pub start_cost: f64,
    pub min_cost: f64,
    pub max_liq_up: f64,
    pub max_liq_down: f64,
    pub update_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub enum DipEvent {
    Started {
        symbol: String,
        window_label: String,
        ts_ms: i64,
        cost: f64,
        liquidity_up: f64,
        liquidity_down: f64,
    },
    Ended {
        symbol: String,
        window_label: String,
        ts_ms: i64,
        duration_ms: i64,
        min_cost: f64,
        update_count: u64,
        max_liq_up: f64,
        max_liq_down: f64,
    },
}

impl DipEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DipEvent::Started { .. } => "DIP_STARTED",
            DipEvent::Ended { .. } => "DIP_ENDED",
        }
    }
}

/// Shared admission bookkeeping: the pending set and per-market trade
/// debounce. Touched by detection (admit) and execution (complete), so the
/// critical section stays short.
pub struct Admission {
    inner: Mutex<AdmissionInner>,
    max_open: usize,
}

#[derive(Default)]
struct AdmissionInner {
    pending_windows: HashSet<String>,
    pending_symbols: HashSet<String>,
    last_trade: HashMap<String, Instant>,
}

impl Admission {
    pub fn new(max_open: usize) -> Self {
        Self {
            inner: Mutex::new(AdmissionInner::default()),
            max_open,
        }
    }

    /// Gate 1 + 2: pending duplicate / concurrency cap / cooldown.
    pub fn blocked(&self, window: &str, symbol: &str, cooldown: Duration) -> Option<SkipReason> {
        let inner = self.inner.lock();
        if inner.pending_windows.contains(window)
            || inner.pending_symbols.contains(symbol)
            || inner.pending_windows.len() >= self.max_open
        {
            return Some(SkipReason::TradePending);
        }
        if let Some(at) = inner.last_trade.get(window) {
            if at.elapsed() < cooldown {
                return Some(SkipReason::CooldownActive);
            }
        }
        None
    }

    /// Reserve the (symbol, window) before any order is issued. False when
    /// a concurrent admission beat us to it.
    pub fn admit(&self, window: &str, symbol: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending_windows.contains(window)
            || inner.pending_symbols.contains(symbol)
            || inner.pending_windows.len() >= self.max_open
        {
            return false;
        }
        inner.pending_windows.insert(window.to_string());
        inner.pending_symbols.insert(symbol.to_string());
        true
    }

    /// Release after the order outcome. Success installs the cooldown;
    /// failure clears without one.
    pub fn complete(&self, window: &str, symbol: &str, success: bool) {
        let mut inner = self.inner.lock();
        inner.pending_windows.remove(window);
        inner.pending_symbols.remove(symbol);
        if success {
            inner.last_trade.insert(window.to_string(), Instant::now());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending_windows.len()
    }

    #[cfg(test)]
    fn backdate_last_trade(&self, window: &str, ago: Duration) {
        self.inner
            .lock()
            .last_trade
            .insert(window.to_string(), Instant::now() - ago);
    }
}

#[derive(Debug, Default)]
pub struct DetectorMetrics {
    pub evaluations: AtomicU64,
    pub admissions: AtomicU64,
    pub dips_started: AtomicU64,
    pub dips_ended: AtomicU64,
    pub skips: [AtomicU64; 8],
}

impl DetectorMetrics {
    pub fn summary(&self) -> String {
        format!(
            "evaluations={} admissions={} dips_started={} dips_ended={}",
            self.evaluations.load(Ordering::Relaxed),
            self.admissions.load(Ordering::Relaxed),
            self.dips_started.load(Ordering::Relaxed),
            self.dips_ended.load(Ordering::Relaxed),
        )
    }
}

pub struct DipDetector {
    timeframe: Timeframe,
    threshold: f64,
    trade_budget_usd: f64,
    cooldown: Duration,
    max_slippage_pct: f64,
    min_profit_pct: f64,
    min_profit_usd: f64,
    active_dips: HashMap<String, ActiveDip>,
    admission: std::sync::Arc<Admission>,
    events: Option<mpsc::UnboundedSender<DipEvent>>,
    metrics: DetectorMetrics,
}

impl DipDetector {
    pub fn new(config: &BotConfig, admission: std::sync::Arc<Admission>) -> Self {
        Self {
            timeframe: config.timeframe,
            threshold: config.threshold,
            trade_budget_usd: config.trade_budget_usd(),
            cooldown: Duration::from_millis(config.cooldown_ms),
            max_slippage_pct: config.max_slippage_pct,
            min_profit_pct: config.min_profit_pct,
            min_profit_usd: config.min_profit_usd,
            active_dips: HashMap::new(),
            admission,
            events: None,
            metrics: DetectorMetrics::default(),
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<DipEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn metrics(&self) -> &DetectorMetrics {
        &self.metrics
    }

    pub fn admission(&self) -> &std::sync::Arc<Admission> {
        &self.admission
    }

    pub fn detect(&mut self, book: &PairBook) -> DetectionResult {
        self.detect_at(book, chrono::Utc::now().timestamp_millis())
    }

    /// Evaluate one book state. `now_ms` is wall-clock; dip durations are
    /// measured on it.
    pub fn detect_at(&mut self, book: &PairBook, now_ms: i64) -> DetectionResult {
        self.metrics.evaluations.fetch_add(1, Ordering::Relaxed);
        let result = self.evaluate(book, now_ms);
        match &result {
            DetectionResult::Skip(reason) => {
                self.metrics.skips[reason.index()].fetch_add(1, Ordering::Relaxed);
                trace!(
                    window = book.window_label.as_str(),
                    reason = reason.as_str(),
                    "skip"
                );
            }
            DetectionResult::Trade(_) => {
                self.metrics.admissions.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn evaluate(&mut self, book: &PairBook, now_ms: i64) -> DetectionResult {
        let window = &book.window_label;
        let symbol = &book.symbol;

        // 1+2: admission serialisation and cooldown.
        if let Some(reason) = self.admission.blocked(window, symbol, self.cooldown) {
            return DetectionResult::Skip(reason);
        }

        // 3: both sides must quote an ask. An empty side mid-snapshot is
        // never a zero-cost opportunity.
        let (ask_up, ask_down) = match (book.up.best_ask(), book.down.best_ask()) {
            (Some(u), Some(d)) => (*u, *d),
            _ => return DetectionResult::Skip(SkipReason::EmptyOrderbook),
        };

        // 4: sub-nickel quotes are resolution noise.
        if ask_up.price < MIN_REALISTIC_PRICE || ask_down.price < MIN_REALISTIC_PRICE {
            return DetectionResult::Skip(SkipReason::PriceTooLow);
        }

        let best_case_cost = ask_up.price + ask_down.price;
        let liquidity_up = book.up.ask_liquidity();
        let liquidity_down = book.down.ask_liquidity();

        // 5: dip gate, and the ActiveDip machine either way.
        if best_case_cost >= self.threshold {
            self.end_dip_if_active(window, now_ms);
            return DetectionResult::Skip(SkipReason::NoDip);
        }
        self.track_dip(symbol, window, now_ms, best_case_cost, liquidity_up, liquidity_down);

        // 6: sizing. Affordable fillable shares must clear the value floor.
        let budget_shares = self.trade_budget_usd / best_case_cost;
        let fillable = budget_shares.min(liquidity_up).min(liquidity_down);
        let trade_value = fillable * best_case_cost;
        if trade_value < MIN_TRADE_USD {
            return DetectionResult::Skip(SkipReason::TradeTooSmall);
        }

        // Slippage over the actual fill path.
        let fill_up = match walk_asks(book.up.usable_asks(), fillable) {
            Some(f) => f,
            None => return DetectionResult::Skip(SkipReason::EmptyOrderbook),
        };
        let fill_down = match walk_asks(book.down.usable_asks(), fillable) {
            Some(f) => f,
            None => return DetectionResult::Skip(SkipReason::EmptyOrderbook),
        };
        let slippage_up = (fill_up.vwap - ask_up.price) / ask_up.price;
        let slippage_down = (fill_down.vwap - ask_down.price) / ask_down.price;
        if (slippage_up + slippage_down) / 2.0 > self.max_slippage_pct {
            return DetectionResult::Skip(SkipReason::SlippageTooHigh);
        }

        // 7: profit after fees, on the slippage-adjusted cost.
        let shares = fillable;
        let total_cost = fill_up.vwap + fill_down.vwap;
        let cost_up = shares * fill_up.vwap;
        let cost_down = shares * fill_down.vwap;
        let fee_total =
            fees::entry_fees(self.timeframe, cost_up, ask_up.price, cost_down, ask_down.price);
        let expected_profit = (1.0 - total_cost) * shares - fee_total;
        let profit_pct = expected_profit / trade_value * 100.0;
        if profit_pct < self.min_profit_pct * 100.0 || expected_profit < self.min_profit_usd {
            return DetectionResult::Skip(SkipReason::ProfitTooLow);
        }

        debug!(
            window = window.as_str(),
            cost = best_case_cost,
            shares,
            expected_profit,
            profit_pct,
            "dip opportunity"
        );

        DetectionResult::Trade(Box::new(DipOpportunity {
            symbol: symbol.clone(),
            window_label: window.clone(),
            window_offset: book.window_offset,
            timestamp_ms: now_ms,
            ask_up: ask_up.price,
            ask_down: ask_down.price,
            avg_fill_up: fill_up.vwap,
            avg_fill_down: fill_down.vwap,
            total_cost,
            best_case_cost,
            shares,
            trade_value,
            expected_profit,
            profit_pct,
            fees: fee_total,
            slippage_up,
            slippage_down,
            liquidity_up,
            liquidity_down,
            levels_used_up: fill_up.levels_used,
            levels_used_down: fill_down.levels_used,
            detected_at: Some(Instant::now()),
        }))
    }

    fn emit(&self, event: DipEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn track_dip(
        &mut self,
        symbol: &str,
        window: &str,
        now_ms: i64,
        cost: f64,
        liquidity_up: f64,
        liquidity_down: f64,
    ) {
        match self.active_dips.get_mut(window) {
            Some(dip) => {
                dip.min_cost = dip.min_cost.min(cost);
                dip.max_liq_up = dip.max_liq_up.max(liquidity_up);
                dip.max_liq_down = dip.max_liq_down.max(liquidity_down);
                dip.update_count += 1;
            }
            None => {
                self.active_dips.insert(
                    window.to_string(),
                    ActiveDip {
                        symbol: symbol.to_string(),
                        window_label: window.to_string(),
                        start_ts_ms: now_ms,
                        start_cost: cost,
                        min_cost: cost,
                        max_liq_up: liquidity_up,
                        max_liq_down: liquidity_down,
                        update_count: 1,
                    },
                );
                self.metrics.dips_started.fetch_add(1, Ordering::Relaxed);
                info!(window, cost, "📉 dip started");
                self.emit(DipEvent::Started {
                    symbol: symbol.to_string(),
                    window_label: window.to_string(),
                    ts_ms: now_ms,
                    cost,
                    liquidity_up,
                    liquidity_down,
                });
            }
        }
    }

    fn end_dip_if_active(&mut self, window: &str, now_ms: i64) {
        if let Some(dip) = self.active_dips.remove(window) {
            let duration_ms = now_ms - dip.start_ts_ms;
            self.metrics.dips_ended.fetch_add(1, Ordering::Relaxed);
            info!(
                window,
                duration_ms,
                min_cost = dip.min_cost,
                updates = dip.update_count,
                "dip ended"
            );
            self.emit(DipEvent::Ended {
                symbol: dip.symbol,
                window_label: dip.window_label,
                ts_ms: now_ms,
                duration_ms,
                min_cost: dip.min_cost,
                update_count: dip.update_count,
                max_liq_up: dip.max_liq_up,
                max_liq_down: dip.max_liq_down,
            });
        }
    }

    /// Close every open dip (shutdown path) so each START is paired.
    pub fn close_all_dips(&mut self, now_ms: i64) {
        let windows: Vec<String> = self.active_dips.keys().cloned().collect();
        for w in windows {
            self.end_dip_if_active(&w, now_ms);
        }
    }

    pub fn active_dip(&self, window: &str) -> Option<&ActiveDip> {
        self.active_dips.get(window)
    }
}
