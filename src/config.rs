//! Runtime configuration.
//!
//! Every knob is env-driven (after `.env` is loaded) with validated ranges.
//! Out-of-range values are a fatal boot error, not a clamp.

use anyhow::{bail, Result};

use crate::catalog::Asset;
use crate::clock::Timeframe;

pub const DEFAULT_GAMMA_BASE: &str = "https://gamma-api.polymarket.com";
pub const DEFAULT_CLOB_BASE: &str = "https://clob.polymarket.com";
pub const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Trade value floor in USDC.
pub const MIN_TRADE_USD: f64 = 20.0;
/// Trade value cap in USDC.
pub const MAX_TRADE_USD: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub timeframe: Timeframe,
    pub assets: Vec<Asset>,
    /// Number of future window offsets to watch (0 = current only).
    pub max_window_offset: u8,

    /// Dip admission cutoff: combined best-ask cost must be below this.
    pub threshold: f64,
    /// Executor rejection cutoff on total cost per share.
    pub max_total_cost: f64,
    /// Per-trade USD cap before the fixed 100 USD trade cap.
    pub max_position_usd: f64,
    /// Concurrent admissions across all markets.
    pub max_open_positions: usize,
    /// Per-market debounce after a successful trade.
    pub cooldown_ms: u64,
    /// Reject opportunities whose combined slippage exceeds this fraction.
    pub max_slippage_pct: f64,
    /// Minimum profit percentage after fees and slippage.
    pub min_profit_pct: f64,
    /// Absolute profit floor in USD.
    pub min_profit_usd: f64,
    /// Fraction of max_position_usd deployed per trade.
    pub risk_per_trade_fraction: f64,

    pub paper_mode: bool,
    pub simulate_feed: bool,

    pub db_path: String,
    pub gamma_base_url: String,
    pub clob_base_url: String,
    pub ws_url: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::M15,
            assets: vec![Asset::Btc, Asset::Eth],
            max_window_offset: 1,
            threshold: 0.97,
            max_total_cost: 0.94,
            max_position_usd: 100.0,
            max_open_positions: 3,
            cooldown_ms: 30_000,
            max_slippage_pct: 0.02,
            min_profit_pct: 0.01,
            min_profit_usd: 0.50,
            risk_per_trade_fraction: 1.0,
            paper_mode: true,
            simulate_feed: false,
            db_path: "dipbot.db".to_string(),
            gamma_base_url: DEFAULT_GAMMA_BASE.to_string(),
            clob_base_url: DEFAULT_CLOB_BASE.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
        }
    }
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("DIPBOT_TIMEFRAME") {
            cfg.timeframe = v.parse()?;
        }
        if let Ok(v) = std::env::var("DIPBOT_ASSETS") {
            let assets: Result<Vec<Asset>> = v
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.parse())
                .collect();
            cfg.assets = assets?;
        }
        if let Ok(v) = std::env::var("DIPBOT_MAX_WINDOW_OFFSET") {
            if let Ok(n) = v.parse() {
                cfg.max_window_offset = n;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_THRESHOLD") {
            if let Ok(f) = v.parse() {
                cfg.threshold = f;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_MAX_TOTAL_COST") {
            if let Ok(f) = v.parse() {
                cfg.max_total_cost = f;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_MAX_POSITION_USD") {
            if let Ok(f) = v.parse() {
                cfg.max_position_usd = f;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_MAX_OPEN_POSITIONS") {
            if let Ok(n) = v.parse() {
                cfg.max_open_positions = n;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_COOLDOWN_MS") {
            if let Ok(ms) = v.parse() {
                cfg.cooldown_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_MAX_SLIPPAGE_PCT") {
            if let Ok(f) = v.parse() {
                cfg.max_slippage_pct = f;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_MIN_PROFIT_PCT") {
            if let Ok(f) = v.parse() {
                cfg.min_profit_pct = f;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_MIN_PROFIT_USD") {
            if let Ok(f) = v.parse() {
                cfg.min_profit_usd = f;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_RISK_PER_TRADE_FRACTION") {
            if let Ok(f) = v.parse() {
                cfg.risk_per_trade_fraction = f;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_PAPER_MODE") {
            cfg.paper_mode = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = std::env::var("DIPBOT_SIMULATE_FEED") {
            cfg.simulate_feed = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = std::env::var("DIPBOT_DB_PATH") {
            if !v.is_empty() {
                cfg.db_path = v;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_GAMMA_BASE_URL") {
            if !v.is_empty() {
                cfg.gamma_base_url = v;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_CLOB_BASE_URL") {
            if !v.is_empty() {
                cfg.clob_base_url = v;
            }
        }
        if let Ok(v) = std::env::var("DIPBOT_WS_URL") {
            if !v.is_empty() {
                cfg.ws_url = v;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Range checks per the configuration surface. Violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            bail!("config: at least one asset required");
        }
        if !(0.80..=0.99).contains(&self.threshold) {
            bail!("config: threshold {} outside [0.80, 0.99]", self.threshold);
        }
        if !(0.80..=0.99).contains(&self.max_total_cost) {
            bail!(
                "config: max_total_cost {} outside [0.80, 0.99]",
                self.max_total_cost
            );
        }
        if !(10.0..=1000.0).contains(&self.max_position_usd) {
            bail!(
                "config: max_position_usd {} outside [10, 1000]",
                self.max_position_usd
            );
        }
        if !(1..=10).contains(&self.max_open_positions) {
            bail!(
                "config: max_open_positions {} outside [1, 10]",
                self.max_open_positions
            );
        }
        if !(0.0..=1.0).contains(&self.max_slippage_pct) {
            bail!(
                "config: max_slippage_pct {} outside [0, 1]",
                self.max_slippage_pct
            );
        }
        if !(0.0..=1.0).contains(&self.risk_per_trade_fraction)
            || self.risk_per_trade_fraction == 0.0
        {
            bail!(
                "config: risk_per_trade_fraction {} outside (0, 1]",
                self.risk_per_trade_fraction
            );
        }
        if self.min_profit_usd < 0.0 {
            bail!("config: min_profit_usd must be >= 0");
        }
        Ok(())
    }

    /// Effective USD budget for a single trade before the 100 USD cap.
    pub fn trade_budget_usd(&self) -> f64 {
        (self.max_position_usd * self.risk_per_trade_fraction).min(MAX_TRADE_USD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BotConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = BotConfig::default();
        cfg.threshold = 0.5;
        assert!(cfg.validate().is_err());

        cfg.threshold = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_open_position_bounds() {
        let mut cfg = BotConfig::default();
        cfg.max_open_positions = 0;
        assert!(cfg.validate().is_err());
        cfg.max_open_positions = 11;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn trade_budget_respects_risk_fraction_and_cap() {
        let mut cfg = BotConfig::default();
        cfg.max_position_usd = 400.0;
        cfg.risk_per_trade_fraction = 0.5;
        // 400 * 0.5 = 200, capped at 100.
        assert_eq!(cfg.trade_budget_usd(), 100.0);

        cfg.risk_per_trade_fraction = 0.2;
        assert_eq!(cfg.trade_budget_usd(), 80.0);
    }
}
