//! Absorption detector.
//!
//! Hypothesis: large aggressive flow is being absorbed at a price level
//! without proportional price motion, implying a latent opposing participant
//! and a likely contrarian turn.
//!
//! Side rule: buy aggression absorbed into passive asks yields a `sell`
//! candidate (reversal down); sell aggression into passive bids yields a
//! `buy` candidate. The EWMA dominance gate enforces that the side opposite
//! the candidate is the one with elevated aggression.

use crate::detectors::{
    apply_indicator_gate, CooldownKey, CooldownTracker, Detector, DetectorContext, DetectorEvent,
    SignalBuilder,
};
use crate::config::EngineConfig;
use crate::numerics::{safe_divide, EPSILON};
use crate::rolling::{RollingStats, RollingWindow};
use crate::types::{
    EnrichedTrade, Side, SignalKind, SignalMetadata, ThresholdOp, ThresholdRecord,
};
use crate::zones::find_zones_near_price;
use tracing::debug;

const DETECTOR_ID: &str = "absorption";

/// Per-side EWMA of aggressive quantity. Both sides decay on every trade so
/// a one-sided burst pulls the opposite tracker toward zero.
#[derive(Debug, Clone)]
struct AggressionEwma {
    lambda: f64,
    buy: f64,
    sell: f64,
}

impl AggressionEwma {
    fn new(lambda: f64) -> Self {
        Self {
            lambda,
            buy: 0.0,
            sell: 0.0,
        }
    }

    fn update(&mut self, side: Side, qty: f64) {
        let (hit, other) = match side {
            Side::Buy => (&mut self.buy, &mut self.sell),
            Side::Sell => (&mut self.sell, &mut self.buy),
        };
        *hit = self.lambda * *hit + (1.0 - self.lambda) * qty;
        *other *= self.lambda;
    }

    fn get(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.buy,
            Side::Sell => self.sell,
        }
    }
}

pub struct AbsorptionDetector {
    ewma: AggressionEwma,
    /// (timestamp_ms, price_ticks) lookback for the actual price move.
    price_lookback: RollingWindow<(i64, i64)>,
    spread_baseline: RollingStats,
    zone_volume_baseline: RollingStats,
    cooldowns: CooldownTracker,
    builder: SignalBuilder,
    last_eval: Option<ThresholdRecord>,
}

impl AbsorptionDetector {
    pub fn new(config: &EngineConfig) -> Self {
        let cfg = &config.absorption;
        Self {
            ewma: AggressionEwma::new(cfg.ewma_lambda),
            price_lookback: RollingWindow::new(cfg.lookback_trades),
            spread_baseline: RollingStats::new(cfg.lookback_trades),
            zone_volume_baseline: RollingStats::new(cfg.lookback_trades),
            cooldowns: CooldownTracker::new(cfg.event_cooldown_ms),
            builder: SignalBuilder::new(DETECTOR_ID),
            last_eval: None,
        }
    }

    fn price_range_ticks(&self) -> f64 {
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for (_, p) in self.price_lookback.iter() {
            min = min.min(*p);
            max = max.max(*p);
        }
        if min == i64::MAX {
            0.0
        } else {
            (max - min) as f64
        }
    }
}

impl Detector for AbsorptionDetector {
    fn id(&self) -> &'static str {
        DETECTOR_ID
    }

    fn on_trade(&mut self, trade: &EnrichedTrade, ctx: &DetectorContext<'_>) -> Vec<DetectorEvent> {
        let cfg = &ctx.config.absorption;
        let scale = ctx.scale;
        let aggressor = trade.trade.aggressor();
        let candidate_side = aggressor.opposite();
        let ts = trade.trade.timestamp_ms;

        // Rolling state first: the current trade is part of its own lookback.
        self.ewma
            .update(aggressor, scale.units_to_f64(trade.trade.qty_units));
        self.price_lookback.push((ts, trade.trade.price_ticks));

        let Some(own) = trade.own_zone() else {
            return Vec::new();
        };

        let agg_qty = scale.units_to_f64(own.aggressive_units(aggressor));
        let passive_opposite = scale.units_to_f64(own.passive_consumed_units(aggressor));
        let zone_total_qty = scale.units_to_f64(own.aggressive_total_units());

        let mut rec = ThresholdRecord::default();

        // Gate 1: enough aggressive flow in the zone.
        let g_volume = rec.record(
            "min_aggressive_volume",
            scale.units_to_f64(cfg.min_agg_volume_units),
            agg_qty,
            ThresholdOp::Eql,
        );

        // Gate 2: passive dominance on the single opposite side only.
        let passive_ratio = safe_divide(passive_opposite, agg_qty + passive_opposite, 0.0);
        let g_passive = rec.record(
            "passive_absorption_ratio",
            cfg.passive_absorption_threshold,
            passive_ratio,
            ThresholdOp::Eql,
        );

        // Gate 3: price efficiency — heavy flow, little movement.
        let actual_move = self.price_range_ticks();
        let expected_move = agg_qty * cfg.expected_move_ticks_per_qty;
        let price_efficiency = safe_divide(actual_move, expected_move, 1.0);
        let g_efficiency = rec.record(
            "price_efficiency",
            cfg.price_efficiency_threshold,
            price_efficiency,
            ThresholdOp::Eqs,
        );

        // Gate 4: spread stays controlled versus its baseline.
        let spread_impact = if trade.book.book_synced && self.spread_baseline.count() > 0 {
            safe_divide(
                trade.book.spread_ticks as f64,
                self.spread_baseline.mean(),
                1.0,
            )
        } else {
            1.0
        };
        let g_spread = rec.record(
            "spread_impact",
            cfg.spread_impact_threshold,
            spread_impact,
            ThresholdOp::Eqs,
        );

        // Gate 5 (optional): institutional participation in the zone.
        let mut institutional_qty = 0.0;
        let mut ring_total_qty = 0.0;
        let mut aggressor_side_trades = 0usize;
        let mut ring_trades = 0usize;
        for t in &own.recent_trades {
            let q = scale.units_to_f64(t.qty_units);
            ring_total_qty += q;
            ring_trades += 1;
            if t.qty_units >= cfg.institutional_volume_units {
                institutional_qty += q;
            }
            if t.side == aggressor {
                aggressor_side_trades += 1;
            }
        }
        let institutional_ratio = safe_divide(institutional_qty, ring_total_qty, 0.0);
        let g_institutional = rec.record(
            "institutional_volume_ratio",
            cfg.institutional_volume_ratio_threshold,
            institutional_ratio,
            ThresholdOp::Eql,
        ) || !cfg.require_institutional;

        // Gate 6: aggression on the side opposite the candidate must be the
        // elevated one. Mis-selecting sides here was a named historical bug:
        // a buy candidate requires elevated *sell* aggression.
        let opposite_ewma = self.ewma.get(candidate_side.opposite());
        let candidate_ewma = self.ewma.get(candidate_side);
        let g_ewma_present = rec.record(
            "opposite_aggression_present",
            EPSILON,
            opposite_ewma,
            ThresholdOp::Eql,
        );
        let g_ewma = rec.record(
            "ewma_side_dominance",
            candidate_ewma,
            opposite_ewma,
            ThresholdOp::Eql,
        ) && g_ewma_present;

        // Confidence: weighted sum of normalized components, clamped.
        let efficiency_shortfall =
            (1.0 - safe_divide(price_efficiency, cfg.price_efficiency_threshold, 1.0))
                .clamp(0.0, 1.0);
        let passive_dominance = safe_divide(
            passive_ratio - cfg.passive_absorption_threshold,
            1.0 - cfg.passive_absorption_threshold,
            0.0,
        )
        .clamp(0.0, 1.0);
        let surge = if self.zone_volume_baseline.count() > 0 {
            safe_divide(zone_total_qty, self.zone_volume_baseline.mean(), 1.0)
        } else {
            1.0
        };
        let volume_surge_norm = ((surge - 1.0) / 2.0).clamp(0.0, 1.0);
        let consistency = safe_divide(
            aggressor_side_trades as f64,
            ring_trades as f64,
            0.0,
        );

        let mut confidence = 0.35 * efficiency_shortfall
            + 0.30 * passive_dominance
            + 0.20 * volume_surge_norm
            + 0.15 * consistency;

        let confluence_cfg = &ctx.config.confluence;
        if confluence_cfg.enable_zone_confluence_filter {
            let near = find_zones_near_price(
                &trade.zone_data,
                trade.trade.price_ticks,
                confluence_cfg.max_zone_confluence_distance_ticks,
            );
            if near.len() >= confluence_cfg.min_zone_confluence_count {
                confidence += confluence_cfg.confluence_confidence_boost;
            }
        }
        confidence = confidence.clamp(0.0, 1.0);

        let g_confidence = rec.record(
            "final_confidence",
            cfg.final_confidence_required,
            confidence,
            ThresholdOp::Eql,
        );

        // Push baselines after evaluation so the comparison was against
        // history, not the current observation.
        if trade.book.book_synced {
            self.spread_baseline.push(trade.book.spread_ticks as f64);
        }
        self.zone_volume_baseline.push(zone_total_qty);

        let gates_passed = g_volume
            && g_passive
            && g_efficiency
            && g_spread
            && g_institutional
            && g_ewma
            && g_confidence;
        self.last_eval = Some(rec.clone());

        if !gates_passed {
            debug!(
                detector = DETECTOR_ID,
                zone_id = trade.zone_id,
                failed = ?rec.failed_names(),
                "Absorption gates not met"
            );
            return Vec::new();
        }

        let (indicators, survives) = apply_indicator_gate(DETECTOR_ID, ctx, candidate_side);
        if !survives {
            return Vec::new();
        }

        if !self
            .cooldowns
            .can_emit(CooldownKey::per_zone(trade.zone_id), ts, true)
        {
            debug!(
                detector = DETECTOR_ID,
                zone_id = trade.zone_id,
                "Absorption suppressed by cooldown"
            );
            return Vec::new();
        }

        let metadata = SignalMetadata::Absorption {
            aggressive_in_zone: agg_qty,
            passive_opposite,
            passive_ratio,
            price_efficiency,
            spread_impact,
            institutional_ratio,
            opposite_side_ewma: opposite_ewma,
            candidate_side_ewma: candidate_ewma,
        };
        let candidate = self.builder.build(
            SignalKind::Absorption,
            candidate_side,
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
