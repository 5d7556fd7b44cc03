//! Traditional-indicator calculators backing the detector gate.
//!
//! VWAP over a rolling time window, Wilder RSI over per-trade closes, and
//! top-of-band order-book imbalance. The gate produces a side-aware verdict
//! that is recorded on every candidate; a `Filter` verdict rejects the
//! signal regardless of detector score.

use crate::config::IndicatorConfig;
use crate::numerics::safe_divide;
use crate::types::{EnrichedTrade, GateVerdict, IndicatorSnapshot, Side};
use std::collections::VecDeque;

/// Rolling VWAP with incremental sums, evicting entries outside the window.
#[derive(Debug, Clone)]
pub struct VwapTracker {
    window_ms: i64,
    buffer: VecDeque<(i64, f64, f64)>, // (ts_ms, price, qty)
    sum_pq: f64,
    sum_q: f64,
}

impl VwapTracker {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            buffer: VecDeque::with_capacity(1024),
            sum_pq: 0.0,
            sum_q: 0.0,
        }
    }

    pub fn update(&mut self, ts_ms: i64, price: f64, qty: f64) {
        if price <= 0.0 || qty < 0.0 {
            return;
        }
        self.buffer.push_back((ts_ms, price, qty));
        self.sum_pq += price * qty;
        self.sum_q += qty;
        let cutoff = ts_ms - self.window_ms;
        while self.buffer.front().is_some_and(|(t, _, _)| *t < cutoff) {
            if let Some((_, p, q)) = self.buffer.pop_front() {
                self.sum_pq -= p * q;
                self.sum_q -= q;
            }
        }
    }

    pub fn vwap(&self) -> f64 {
        safe_divide(self.sum_pq, self.sum_q, 0.0)
    }

    pub fn has_data(&self) -> bool {
        self.sum_q > 0.0
    }
}

/// Wilder-smoothed RSI over successive trade prices.
#[derive(Debug, Clone)]
pub struct RsiCalculator {
    period: usize,
    last_price: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    samples: usize,
}

impl RsiCalculator {
    pub fn new(period: usize) -> Self {
        assert!(period > 0);
        Self {
            period,
            last_price: None,
            avg_gain: 0.0,
            avg_loss: 0.0,
            samples: 0,
        }
    }

    pub fn update(&mut self, price: f64) {
        if price <= 0.0 {
            return;
        }
        let Some(last) = self.last_price.replace(price) else {
            return;
        };
        let change = price - last;
        let (gain, loss) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        self.samples += 1;
        if self.samples <= self.period {
            // Seed with a simple average over the first period.
            self.avg_gain += (gain - self.avg_gain) / self.samples as f64;
            self.avg_loss += (loss - self.avg_loss) / self.samples as f64;
        } else {
            let p = self.period as f64;
            self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
        }
    }

    pub fn is_valid(&self) -> bool {
        self.samples >= self.period
    }

    /// RSI in [0, 100]; 50 when no movement has been observed.
    pub fn rsi(&self) -> f64 {
        if self.avg_gain == 0.0 && self.avg_loss == 0.0 {
            return 50.0;
        }
        let rs = safe_divide(self.avg_gain, self.avg_loss, f64::MAX);
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// The gate itself: owns the calculators and produces side-aware verdicts.
pub struct IndicatorGate {
    cfg: IndicatorConfig,
    vwap: VwapTracker,
    rsi: RsiCalculator,
    last_imbalance: f64,
    last_price: f64,
}

impl IndicatorGate {
    pub fn new(cfg: IndicatorConfig) -> Self {
        let vwap = VwapTracker::new(cfg.vwap_window_ms);
        let rsi = RsiCalculator::new(cfg.rsi_period);
        Self {
            cfg,
            vwap,
            rsi,
            last_imbalance: 1.0,
            last_price: 0.0,
        }
    }

    /// Feed one enriched trade. Imbalance uses the band passive sums the
    /// preprocessor already captured.
    pub fn update(&mut self, trade: &EnrichedTrade, price: f64, qty: f64) {
        self.vwap.update(trade.trade.timestamp_ms, price, qty);
        self.rsi.update(price);
        self.last_price = price;
        if trade.book.book_synced {
            self.last_imbalance = safe_divide(
                trade.book.zone_passive_bid_units as f64,
                trade.book.zone_passive_ask_units as f64,
                1.0,
            );
        }
    }

    /// Side-aware verdict for a prospective signal. `Filter` rejects the
    /// signal regardless of detector score; `Unavailable` (not enough
    /// samples) passes but is recorded distinctly.
    pub fn assess(&self, side: Side) -> IndicatorSnapshot {
        let vwap = self.vwap.vwap();
        let rsi = self.rsi.rsi();
        let imbalance = self.last_imbalance;

        if !self.cfg.enabled {
            return IndicatorSnapshot {
                vwap,
                rsi,
                book_imbalance: imbalance,
                verdict: GateVerdict::Pass,
            };
        }
        if !self.vwap.has_data() || !self.rsi.is_valid() {
            return IndicatorSnapshot {
                vwap,
                rsi,
                book_imbalance: imbalance,
                verdict: GateVerdict::Unavailable,
            };
        }

        let vwap_band = vwap * self.cfg.vwap_band_pct;
        let filtered = match side {
            Side::Buy => {
                // No longs into an overbought tape, a price stretched far
                // above fair value, or a book stacked against bids.
                rsi >= self.cfg.rsi_overbought
                    || self.last_price > vwap + vwap_band
                    || imbalance < self.cfg.imbalance_min_ratio
            }
            Side::Sell => {
                rsi <= self.cfg.rsi_oversold
                    || self.last_price < vwap - vwap_band
                    || imbalance > safe_divide(1.0, self.cfg.imbalance_min_ratio, f64::MAX)
            }
        };

        IndicatorSnapshot {
            vwap,
            rsi,
            book_imbalance: imbalance,
            verdict: if filtered {
                GateVerdict::Filter
            } else {
                GateVerdict::Pass
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BookContext, Trade};

    fn enriched(ts: i64, bid_units: i64, ask_units: i64) -> EnrichedTrade {
        EnrichedTrade {
            trade: Trade {
                trade_id: 1,
                price_ticks: 10_000,
                qty_units: 100,
                timestamp_ms: ts,
                buyer_is_maker: false,
            },
            book: BookContext {
                book_synced: true,
                zone_passive_bid_units: bid_units,
                zone_passive_ask_units: ask_units,
                ..Default::default()
            },
            zone_id: 1_000,
            is_large: false,
            zone_data: Vec::new(),
        }
    }

    #[test]
    fn test_vwap_weighted() {
        let mut v = VwapTracker::new(10_000);
        v.update(1_000, 100.0, 3.0);
        v.update(2_000, 106.0, 1.0);
        assert!((v.vwap() - 101.5).abs() < 1e-10);
    }

    #[test]
    fn test_vwap_eviction() {
        let mut v = VwapTracker::new(5_000);
        v.update(1_000, 100.0, 1.0);
        v.update(7_000, 120.0, 1.0);
        assert!((v.vwap() - 120.0).abs() < 1e-10);
    }

    #[test]
    fn test_rsi_neutral_and_extremes() {
        let mut rsi = RsiCalculator::new(5);
        for p in [100.0, 100.0, 100.0, 100.0, 100.0, 100.0] {
            rsi.update(p);
        }
        assert!((rsi.rsi() - 50.0).abs() < 1e-9);

        let mut rsi = RsiCalculator::new(5);
        for i in 0..10 {
            rsi.update(100.0 + i as f64);
        }
        assert!(rsi.rsi() > 95.0, "all-gains RSI = {}", rsi.rsi());

        let mut rsi = RsiCalculator::new(5);
        for i in 0..10 {
            rsi.update(100.0 - i as f64 * 0.5);
        }
        assert!(rsi.rsi() < 5.0, "all-losses RSI = {}", rsi.rsi());
    }

    #[test]
    fn test_gate_unavailable_until_warm() {
        let gate = IndicatorGate::new(IndicatorConfig::default());
        assert_eq!(gate.assess(Side::Buy).verdict, GateVerdict::Unavailable);
    }

    /// Scenario: strongly rising tape drives RSI over the overbought bar.
    /// Expected: buy candidates filter, sell candidates pass.
    #[test]
    fn test_gate_filters_overbought_buys() {
        let mut cfg = IndicatorConfig::default();
        cfg.rsi_period = 5;
        cfg.rsi_overbought = 70.0;
        cfg.vwap_band_pct = 10.0; // neutralize the vwap check
        cfg.imbalance_min_ratio = 0.0; // neutralize the imbalance check
        let mut gate = IndicatorGate::new(cfg);
        for i in 0..20 {
            gate.update(&enriched(i * 1_000, 100, 100), 100.0 + i as f64, 1.0);
        }
        assert_eq!(gate.assess(Side::Buy).verdict, GateVerdict::Filter);
        assert_eq!(gate.assess(Side::Sell).verdict, GateVerdict::Pass);
    }

    /// Scenario: book heavily stacked on the ask side.
    /// Expected: buys filter on imbalance; the snapshot records the ratio.
    #[test]
    fn test_gate_filters_on_imbalance() {
        let mut cfg = IndicatorConfig::default();
        cfg.rsi_period = 2;
        cfg.vwap_band_pct = 10.0;
        cfg.imbalance_min_ratio = 0.5;
        let mut gate = IndicatorGate::new(cfg);
        // Flat prices, bid/ask band 100 vs 1000 → imbalance 0.1.
        for i in 0..5 {
            gate.update(&enriched(i * 1_000, 100, 1_000), 100.0, 1.0);
        }
        let snap = gate.assess(Side::Buy);
        assert_eq!(snap.verdict, GateVerdict::Filter);
        assert!((snap.book_imbalance - 0.1).abs() < 1e-9);
        assert_eq!(gate.assess(Side::Sell).verdict, GateVerdict::Pass);
    }

    #[test]
    fn test_gate_disabled_always_passes() {
        let cfg = IndicatorConfig {
            enabled: false,
            ..Default::default()
        };
        let gate = IndicatorGate::new(cfg);
        assert_eq!(gate.assess(Side::Buy).verdict, GateVerdict::Pass);
    }
}
