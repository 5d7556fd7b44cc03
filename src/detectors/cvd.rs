//! CVD / delta-confirmation detector.
//!
//! Maintains rolling sums of signed aggressive volume per configured window,
//! z-scores the delta stream, correlates delta with price, and detects
//! volume surges against a baseline. Momentum mode confirms price with flow;
//! divergence mode flags flow failing to confirm price. All statistics are
//! clamped and gated on a minimum sample count.

use crate::config::{CvdConfig, CvdMode, EngineConfig, PassiveSource};
use crate::detectors::{
    apply_indicator_gate, CooldownKey, CooldownTracker, Detector, DetectorContext, DetectorEvent,
    SignalBuilder,
};
use crate::numerics::safe_divide;
use crate::rolling::{RollingStats, TimeWindow};
use crate::types::{
    EnrichedTrade, Side, SignalKind, SignalMetadata, ThresholdOp, ThresholdRecord,
};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::VecDeque;
use tracing::debug;

const DETECTOR_ID: &str = "cvd_confirmation";

/// Bound on correlation magnitude per the detector contract.
const CORRELATION_BOUND: f64 = 0.999;

/// One rolling delta window plus the paired series used for correlation.
struct DeltaWindow {
    window_sec: u32,
    deltas: TimeWindow,
    /// Sampled windowed-delta history for the z-score baseline.
    delta_samples: RollingStats,
    /// (ts, windowed_delta, price) pairs for delta/price correlation.
    pairs: VecDeque<(i64, f64, f64)>,
}

impl DeltaWindow {
    fn new(window_sec: u32, sample_capacity: usize) -> Self {
        Self {
            window_sec,
            deltas: TimeWindow::new(window_sec as i64 * 1_000),
            delta_samples: RollingStats::new(sample_capacity),
            pairs: VecDeque::with_capacity(512),
        }
    }

    fn update(&mut self, ts_ms: i64, signed_qty: f64, price: f64) {
        self.deltas.push(ts_ms, signed_qty);
        let delta = self.deltas.sum();
        self.delta_samples.push(delta);
        self.pairs.push_back((ts_ms, delta, price));
        let cutoff = ts_ms - self.window_sec as i64 * 1_000;
        while self.pairs.front().is_some_and(|(t, _, _)| *t < cutoff) {
            self.pairs.pop_front();
        }
    }

    fn delta(&self) -> f64 {
        self.deltas.sum()
    }

    /// Z-score of the current delta against its sampled history, clamped.
    fn z_score(&self, min_samples: usize, lo: f64, hi: f64) -> Option<f64> {
        if self.delta_samples.count() < min_samples {
            return None;
        }
        let std = self.delta_samples.std_dev();
        let z = safe_divide(self.delta() - self.delta_samples.mean(), std, 0.0);
        Some(z.clamp(lo, hi))
    }

    /// Pearson correlation of windowed delta against price, bounded.
    fn correlation(&self, min_samples: usize) -> Option<f64> {
        let n = self.pairs.len();
        if n < min_samples {
            return None;
        }
        let nf = n as f64;
        let (mut sx, mut sy, mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(_, d, p) in &self.pairs {
            sx += d;
            sy += p;
            sxy += d * p;
            sxx += d * d;
            syy += p * p;
        }
        let cov = nf * sxy - sx * sy;
        let var = (nf * sxx - sx * sx) * (nf * syy - sy * sy);
        if var <= 0.0 {
            return Some(0.0);
        }
        Some((cov / var.sqrt()).clamp(-CORRELATION_BOUND, CORRELATION_BOUND))
    }

    /// (delta_change, price_change) across the window, for divergence side
    /// selection.
    fn drift(&self) -> Option<(f64, f64)> {
        let (_, d0, p0) = self.pairs.front()?;
        let (_, d1, p1) = self.pairs.back()?;
        Some((d1 - d0, p1 - p0))
    }
}

pub struct CvdDetector {
    /// Shortest-first windows per the config.
    windows: Vec<DeltaWindow>,
    divergence: DeltaWindow,
    vol_short: TimeWindow,
    vol_baseline: TimeWindow,
    cooldowns: CooldownTracker,
    builder: SignalBuilder,
    last_eval: Option<ThresholdRecord>,
}

impl CvdDetector {
    pub fn new(config: &EngineConfig) -> Self {
        let cfg = &config.cvd;
        let sample_capacity = (cfg.min_samples_for_stats * 8).max(256);
        let mut windows: Vec<DeltaWindow> = cfg
            .windows_sec
            .iter()
            .map(|w| DeltaWindow::new(*w, sample_capacity))
            .collect();
        if windows.is_empty() {
            windows.push(DeltaWindow::new(60, sample_capacity));
        }
        let shortest = windows[0].window_sec;
        Self {
            windows,
            divergence: DeltaWindow::new(cfg.divergence_lookback_sec, sample_capacity),
            vol_short: TimeWindow::new(shortest as i64 * 1_000),
            vol_baseline: TimeWindow::new(cfg.baseline_window_sec as i64 * 1_000),
            cooldowns: CooldownTracker::new(cfg.event_cooldown_ms),
            builder: SignalBuilder::new(DETECTOR_ID),
            last_eval: None,
        }
    }

    /// Signed flow contribution of one trade, optionally blending passive
    /// volume on the aggression side (zone-passive by default; best-quote
    /// kept as the A/B alternative).
    fn signed_contribution(cfg: &CvdConfig, trade: &EnrichedTrade, qty: f64, scale: &crate::numerics::SymbolScale) -> f64 {
        let sign = match trade.trade.aggressor() {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        let mut contribution = qty;
        if cfg.use_passive_volume {
            let passive_units = match (cfg.passive_source, trade.trade.aggressor()) {
                (PassiveSource::ZonePassive, Side::Buy) => trade.book.zone_passive_bid_units,
                (PassiveSource::ZonePassive, Side::Sell) => trade.book.zone_passive_ask_units,
                (PassiveSource::BestQuote, Side::Buy) => trade.book.passive_bid_units,
                (PassiveSource::BestQuote, Side::Sell) => trade.book.passive_ask_units,
            };
            contribution += scale.units_to_f64(passive_units) * cfg.passive_volume_weight;
        }
        sign * contribution
    }

    /// Volume surge of the short window rate over the baseline rate.
    fn volume_surge(&self) -> f64 {
        let short_rate = safe_divide(
            self.vol_short.sum(),
            self.vol_short.window_ms() as f64,
            0.0,
        );
        let base_rate = safe_divide(
            self.vol_baseline.sum(),
            self.vol_baseline.window_ms() as f64,
            0.0,
        );
        safe_divide(short_rate, base_rate, 1.0)
    }
}

impl Detector for CvdDetector {
    fn id(&self) -> &'static str {
        DETECTOR_ID
    }

    fn on_trade(&mut self, trade: &EnrichedTrade, ctx: &DetectorContext<'_>) -> Vec<DetectorEvent> {
        let cfg = &ctx.config.cvd;
        let scale = ctx.scale;
        let ts = trade.trade.timestamp_ms;
        let qty = scale.units_to_f64(trade.trade.qty_units);
        let price = scale.ticks_to_f64(trade.trade.price_ticks);
        let signed = Self::signed_contribution(cfg, trade, qty, scale);

        for w in &mut self.windows {
            w.update(ts, signed, price);
        }
        self.divergence.update(ts, signed, price);
        self.vol_short.push(ts, qty);
        self.vol_baseline.push(ts, qty);

        let short = &self.windows[0];
        let mut rec = ThresholdRecord::default();

        let g_samples = rec.record(
            "min_samples_for_stats",
            cfg.min_samples_for_stats as f64,
            short.delta_samples.count() as f64,
            ThresholdOp::Eql,
        );

        let z = short
            .z_score(
                cfg.min_samples_for_stats,
                cfg.min_z_score_bound,
                cfg.max_z_score_bound,
            )
            .unwrap_or(0.0);
        let corr = short.correlation(cfg.min_samples_for_stats).unwrap_or(0.0);
        let surge = self.volume_surge();
        let delta = short.delta();

        let g_z = rec.record("min_z_score", cfg.min_z, z.abs(), ThresholdOp::Eql);
        let g_corr = rec.record(
            "strong_correlation",
            cfg.strong_correlation_threshold,
            corr,
            ThresholdOp::Eql,
        );
        let g_surge = rec.record(
            "volume_surge",
            cfg.volume_surge_multiplier,
            surge,
            ThresholdOp::Eql,
        );
        let momentum_pass = g_samples && g_z && g_corr && g_surge;

        let div_corr = self
            .divergence
            .correlation(cfg.min_samples_for_stats)
            .unwrap_or(1.0);
        let div_z = self
            .divergence
            .z_score(
                cfg.min_samples_for_stats,
                cfg.min_z_score_bound,
                cfg.max_z_score_bound,
            )
            .unwrap_or(0.0);
        let g_div_corr = rec.record(
            "divergence_correlation",
            cfg.divergence_threshold,
            div_corr,
            ThresholdOp::Eqs,
        );
        let g_div_z = rec.record("divergence_z_score", cfg.min_z, div_z.abs(), ThresholdOp::Eql);
        let divergence_pass = g_samples && g_div_corr && g_div_z;

        let (fired_momentum, fired_divergence) = match cfg.mode {
            CvdMode::Momentum => (momentum_pass, false),
            CvdMode::Divergence => (false, divergence_pass),
            CvdMode::Hybrid => {
                if momentum_pass {
                    (true, false)
                } else {
                    (false, divergence_pass)
                }
            }
        };

        // Confidence: probability mass of |z| under the standard normal,
        // blended with the mode-specific corroboration.
        let normal = Normal::new(0.0, 1.0).expect("unit normal is well-formed");
        let (mode_label, used_z, confidence) = if fired_momentum {
            let conf_z = 2.0 * normal.cdf(z.abs()) - 1.0;
            let surge_norm = ((surge - 1.0)
                / (cfg.volume_surge_multiplier - 1.0).max(f64::MIN_POSITIVE))
            .clamp(0.0, 1.0);
            (
                "momentum",
                z,
                (0.5 * conf_z + 0.3 * corr.max(0.0) + 0.2 * surge_norm).clamp(0.0, 1.0),
            )
        } else if fired_divergence {
            let conf_z = 2.0 * normal.cdf(div_z.abs()) - 1.0;
            let corr_shortfall = safe_divide(
                cfg.divergence_threshold - div_corr,
                cfg.divergence_threshold + 1.0,
                0.0,
            )
            .clamp(0.0, 1.0);
            (
                "divergence",
                div_z,
                (0.6 * conf_z + 0.4 * corr_shortfall).clamp(0.0, 1.0),
            )
        } else {
            ("none", z, 0.0)
        };

        let g_confidence = rec.record(
            "final_confidence",
            cfg.final_confidence_required,
            confidence,
            ThresholdOp::Eql,
        );

        self.last_eval = Some(rec.clone());

        if (!fired_momentum && !fired_divergence) || !g_confidence {
            return Vec::new();
        }

        let side = if fired_momentum {
            if delta >= 0.0 {
                Side::Buy
            } else {
                Side::Sell
            }
        } else {
            // Divergence: flow leads. Delta rising against price falling
            // (or flat) argues up; delta falling argues down.
            match self.divergence.drift() {
                Some((delta_change, _)) if delta_change >= 0.0 => Side::Buy,
                _ => Side::Sell,
            }
        };

        let (indicators, survives) = apply_indicator_gate(DETECTOR_ID, ctx, side);
        if !survives {
            return Vec::new();
        }

        if !self.cooldowns.can_emit(CooldownKey::per_side(side), ts, true) {
            debug!(detector = DETECTOR_ID, side = side.as_str(), "CVD suppressed by cooldown");
            return Vec::new();
        }

        let window_sec = if fired_momentum {
            self.windows[0].window_sec
        } else {
            self.divergence.window_sec
        };
        let metadata = SignalMetadata::Cvd {
            window_sec,
            delta: if fired_momentum {
                delta
            } else {
                self.divergence.delta()
            },
            z_score: used_z,
            correlation: if fired_momentum { corr } else { div_corr },
            volume_surge: surge,
            mode: mode_label.to_string(),
        };
        let candidate = self.builder.build(
            SignalKind::CvdConfirmation,
            side,
            trade.trade.price_ticks,
            confidence,
            ts,
            rec,
            Some(indicators),
            metadata,
        );
        vec![DetectorEvent::Signal(candidate)]
    }

    fn last_evaluation(&self) -> Option<&ThresholdRecord> {
        self.last_eval.as_ref()
    }
}
