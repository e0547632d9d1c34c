//! Fee model.
//!
//! 15-minute markets charge a price-dependent taker fee that peaks at the
//! 50c midpoint; hourly and longer markets are fee-free. A profitable dip
//! on paper must stay profitable after fees.

use crate::clock::Timeframe;

/// Per-side taker fee rate for a fill at price `p`.
///
/// 15m: `2 * (p * (1 - p))^3`, maximised at p = 0.5 (~3.125%).
pub fn fee_rate(timeframe: Timeframe, price: f64) -> f64 {
    if !timeframe.has_fees() {
        return 0.0;
    }
    let p = price.clamp(0.0, 1.0);
    2.0 * (p * (1.0 - p)).powi(3)
}

/// Total fees for a dual-leg entry: each leg pays its own price-dependent
/// rate on its own cost.
pub fn entry_fees(
    timeframe: Timeframe,
    cost_up: f64,
    price_up: f64,
    cost_down: f64,
    price_down: f64,
) -> f64 {
    cost_up * fee_rate(timeframe, price_up) + cost_down * fee_rate(timeframe, price_down)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn peak_at_midpoint() {
        let peak = fee_rate(Timeframe::M15, 0.5);
        assert!((peak - 0.03125).abs() < EPS);
        assert!(peak <= 0.0313);

        // Strictly below the peak away from the midpoint.
        assert!(fee_rate(Timeframe::M15, 0.4) < peak);
        assert!(fee_rate(Timeframe::M15, 0.6) < peak);
    }

    #[test]
    fn symmetric_about_half() {
        for p in [0.1, 0.25, 0.37, 0.45] {
            let lo = fee_rate(Timeframe::M15, p);
            let hi = fee_rate(Timeframe::M15, 1.0 - p);
            assert!((lo - hi).abs() < EPS, "fee not symmetric at {p}");
        }
    }

    #[test]
    fn vanishes_at_extremes() {
        assert!(fee_rate(Timeframe::M15, 0.0) < EPS);
        assert!(fee_rate(Timeframe::M15, 1.0) < EPS);
        assert!(fee_rate(Timeframe::M15, 0.01) < 1e-5);
        assert!(fee_rate(Timeframe::M15, 0.99) < 1e-5);
    }

    #[test]
    fn other_timeframes_are_free() {
        for tf in [Timeframe::H1, Timeframe::H4, Timeframe::D1] {
            assert_eq!(fee_rate(tf, 0.5), 0.0);
            assert_eq!(entry_fees(tf, 50.0, 0.5, 45.0, 0.45), 0.0);
        }
    }

    #[test]
    fn entry_fees_match_hand_calc() {
        // 107.53 shares at 0.50 and 0.43.
        let shares = 100.0 / 0.93;
        let fees = entry_fees(Timeframe::M15, shares * 0.50, 0.50, shares * 0.43, 0.43);
        let expect = shares * 0.50 * fee_rate(Timeframe::M15, 0.50)
            + shares * 0.43 * fee_rate(Timeframe::M15, 0.43);
        assert!((fees - expect).abs() < EPS);
        assert!((fees - 2.97).abs() < 0.05);
    }
}
