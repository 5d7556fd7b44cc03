//! Market-health monitor.
//!
//! A fast verdict over recent volatility, spread behavior, book depth, and
//! flow imbalance. The signal manager consumes the summary; nothing here is
//! re-derived downstream. One canonical volatility horizon
//! (`volatility_lookback_sec`) feeds both the ratio here and the manager's
//! regime classification.

use crate::config::HealthConfig;
use crate::numerics::safe_divide;
use crate::rolling::{RollingWindow, TimeWindow};
use crate::types::EnrichedTrade;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Anomaly classes the monitor can flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    FlashCrashRisk,
    LiquidityVoid,
    SpreadBlowout,
    FlowImbalance,
    VolatilitySpike,
}

/// Severity ladder; `Critical` forces a halt recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Trading posture recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Continue,
    Caution,
    Halt,
}

/// Raw metrics backing the verdict, surfaced for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub volatility_ratio: f64,
    pub spread_multiplier: f64,
    pub flow_imbalance: f64,
    pub depth_ratio: f64,
    pub sample_count: usize,
}

/// The summary consumed by the signal manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketHealth {
    pub is_healthy: bool,
    pub recommendation: Recommendation,
    pub recent_anomaly_types: Vec<AnomalyKind>,
    pub volatility_ratio: f64,
    pub highest_severity: Option<Severity>,
    pub metrics: HealthMetrics,
}

impl MarketHealth {
    /// Neutral verdict used before the monitor has warmed up.
    pub fn warming_up() -> Self {
        Self {
            is_healthy: true,
            recommendation: Recommendation::Continue,
            recent_anomaly_types: Vec::new(),
            volatility_ratio: 1.0,
            highest_severity: None,
            metrics: HealthMetrics::default(),
        }
    }
}

/// 1-second-sampled EWMA realized volatility. Sampling decouples the
/// estimate from the trade rate; sigma is directly per-second.
#[derive(Debug, Clone)]
struct SampledVol {
    lambda: f64,
    sigma_sq: f64,
    last_price: f64,
    last_ts: i64,
    seeded: bool,
    n_samples: u32,
}

impl SampledVol {
    fn new(lambda: f64) -> Self {
        Self {
            lambda,
            sigma_sq: 0.0,
            last_price: 0.0,
            last_ts: 0,
            seeded: false,
            n_samples: 0,
        }
    }

    fn update(&mut self, price: f64, ts_ms: i64) -> bool {
        if price <= 0.0 {
            return false;
        }
        if !self.seeded {
            self.last_price = price;
            self.last_ts = ts_ms;
            self.seeded = true;
            return false;
        }
        let elapsed = ts_ms - self.last_ts;
        if elapsed < 1_000 {
            return false;
        }
        let dt_s = elapsed as f64 / 1_000.0;
        let r = (price / self.last_price).ln();
        self.sigma_sq = self.lambda * self.sigma_sq + (1.0 - self.lambda) * (r * r) / dt_s;
        self.n_samples += 1;
        self.last_price = price;
        self.last_ts = ts_ms;
        true
    }

    fn sigma(&self) -> f64 {
        self.sigma_sq.sqrt()
    }

    fn n_samples(&self) -> u32 {
        self.n_samples
    }
}

pub struct MarketHealthMonitor {
    cfg: HealthConfig,
    /// Fast and slow volatility trackers; their ratio is the regime signal.
    vol_fast: SampledVol,
    vol_slow: SampledVol,
    spread_window: TimeWindow,
    depth_window: TimeWindow,
    buy_flow: TimeWindow,
    sell_flow: TimeWindow,
    anomalies: RollingWindow<(i64, AnomalyKind, Severity)>,
}

impl MarketHealthMonitor {
    pub fn new(cfg: HealthConfig) -> Self {
        let lookback_ms = cfg.volatility_lookback_sec as i64 * 1_000;
        let baseline_ms = lookback_ms * cfg.baseline_multiple.max(1) as i64;
        // Lambda tuned so the fast tracker's memory roughly matches the
        // lookback at 1-second sampling.
        let fast_lambda = 1.0 - safe_divide(2.0, cfg.volatility_lookback_sec as f64 + 1.0, 0.05);
        let slow_lambda =
            1.0 - safe_divide(
                2.0,
                (cfg.volatility_lookback_sec * cfg.baseline_multiple.max(1)) as f64 + 1.0,
                0.005,
            );
        Self {
            vol_fast: SampledVol::new(fast_lambda),
            vol_slow: SampledVol::new(slow_lambda),
            spread_window: TimeWindow::new(baseline_ms),
            depth_window: TimeWindow::new(baseline_ms),
            buy_flow: TimeWindow::new(lookback_ms),
            sell_flow: TimeWindow::new(lookback_ms),
            anomalies: RollingWindow::new(cfg.anomaly_window),
            cfg,
        }
    }

    /// Feed one enriched trade. All state updates are O(1) amortized.
    pub fn update(&mut self, trade: &EnrichedTrade, price: f64, qty: f64) {
        let ts = trade.trade.timestamp_ms;
        self.vol_fast.update(price, ts);
        self.vol_slow.update(price, ts);
        if trade.book.book_synced {
            self.spread_window.push(ts, trade.book.spread_ticks as f64);
            let depth =
                (trade.book.zone_passive_bid_units + trade.book.zone_passive_ask_units) as f64;
            self.depth_window.push(ts, depth);
        }
        match trade.trade.aggressor() {
            crate::types::Side::Buy => self.buy_flow.push(ts, qty),
            crate::types::Side::Sell => self.sell_flow.push(ts, qty),
        }
    }

    fn record_anomaly(&mut self, ts: i64, kind: AnomalyKind, severity: Severity) {
        warn!(?kind, ?severity, "Market anomaly flagged");
        self.anomalies.push((ts, kind, severity));
    }

    /// Compute the verdict at `now_ms`. Requires a minimum sample count;
    /// before that the verdict is neutral.
    pub fn assess(&mut self, now_ms: i64) -> Result<MarketHealth> {
        let samples = self.vol_fast.n_samples() as usize;
        if samples < self.cfg.min_samples {
            return Ok(MarketHealth::warming_up());
        }

        let volatility_ratio = safe_divide(self.vol_fast.sigma(), self.vol_slow.sigma(), 1.0);

        let spread_now = self.spread_window.last().map_or(0.0, |(_, s)| s);
        let spread_multiplier = safe_divide(spread_now, self.spread_window.mean(), 1.0);

        let depth_now = self.depth_window.last().map_or(0.0, |(_, d)| d);
        let depth_ratio = safe_divide(depth_now, self.depth_window.mean(), 1.0);

        let buy = self.buy_flow.sum();
        let sell = self.sell_flow.sum();
        let flow_imbalance = safe_divide(buy.max(sell), buy + sell, 0.5);

        let metrics = HealthMetrics {
            volatility_ratio,
            spread_multiplier,
            flow_imbalance,
            depth_ratio,
            sample_count: samples,
        };

        // Flag anomalies against the configured gates.
        if depth_ratio <= 1.0 - self.cfg.depth_drain_halt
            && spread_multiplier >= self.cfg.spread_multiplier_halt
        {
            self.record_anomaly(now_ms, AnomalyKind::FlashCrashRisk, Severity::Critical);
        } else if depth_ratio <= self.cfg.void_depth_fraction {
            self.record_anomaly(now_ms, AnomalyKind::LiquidityVoid, Severity::High);
        }
        if spread_multiplier >= self.cfg.spread_multiplier_caution
            && spread_multiplier < self.cfg.spread_multiplier_halt
        {
            self.record_anomaly(now_ms, AnomalyKind::SpreadBlowout, Severity::Medium);
        }
        if flow_imbalance >= self.cfg.flow_imbalance_caution {
            self.record_anomaly(now_ms, AnomalyKind::FlowImbalance, Severity::Medium);
        }
        if volatility_ratio >= self.cfg.vol_ratio_halt {
            self.record_anomaly(now_ms, AnomalyKind::VolatilitySpike, Severity::High);
        }

        // Recent anomalies within the lookback drive the verdict.
        let lookback_ms = self.cfg.volatility_lookback_sec as i64 * 1_000;
        let recent: Vec<(AnomalyKind, Severity)> = self
            .anomalies
            .iter()
            .filter(|(ts, _, _)| now_ms - ts <= lookback_ms)
            .map(|(_, k, s)| (*k, *s))
            .collect();
        let highest_severity = recent.iter().map(|(_, s)| *s).max();
        let mut recent_anomaly_types: Vec<AnomalyKind> = recent.iter().map(|(k, _)| *k).collect();
        recent_anomaly_types.dedup();

        let recommendation = match highest_severity {
            Some(Severity::Critical) => Recommendation::Halt,
            _ if volatility_ratio >= self.cfg.vol_ratio_halt => Recommendation::Halt,
            Some(Severity::High) => Recommendation::Caution,
            _ if volatility_ratio >= self.cfg.vol_ratio_caution => Recommendation::Caution,
            Some(Severity::Medium) => Recommendation::Caution,
            _ => Recommendation::Continue,
        };

        Ok(MarketHealth {
            is_healthy: recommendation == Recommendation::Continue,
            recommendation,
            recent_anomaly_types,
            volatility_ratio,
            highest_severity,
            metrics,
        })
    }
}
