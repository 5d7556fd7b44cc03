//! Exhaustion detector.
//!
//! Hypothesis: passive liquidity on one side is being depleted without
//! replenishment — the book is running out and the prevailing direction is
//! about to fail.
//!
//! Side rule: bids depleted (support broken) yields a `buy` candidate
//! (reversal up from capitulation); asks depleted yields `sell`. Both sides
//! depleted is ambiguous and produces nothing.

use crate::config::EngineConfig;
use crate::detectors::{
    apply_indicator_gate, CooldownKey, CooldownTracker, Detector, DetectorContext, DetectorEvent,
    SignalBuilder,
};
use crate::numerics::safe_divide;
use crate::types::{
    EnrichedTrade, Side, SignalKind, SignalMetadata, ThresholdOp, ThresholdRecord,
};
use crate::zones::find_zones_near_price;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

const DETECTOR_ID: &str = "exhaustion";

/// Result of analyzing one zone side's passive history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Depletion {
    /// Depleted volume over peak volume in the window, in [0, 1].
    pub ratio: f64,
    /// Quantity depleted per second since the peak.
    pub velocity: f64,
    /// Peak passive quantity observed in the window.
    pub peak: f64,
}

/// Detects a monotone (refill-tolerant) decline over a passive-volume
/// history and quantifies it.
pub fn analyze_depletion(
    history: &VecDeque<(i64, f64)>,
    refill_tolerance: f64,
    max_refills: usize,
) -> Option<Depletion> {
    if history.len() < 3 {
        return None;
    }
    let (mut peak, mut peak_ts) = (f64::MIN, 0i64);
    for &(ts, v) in history.iter() {
        if v > peak {
            peak = v;
            peak_ts = ts;
        }
    }
    let &(last_ts, current) = history.back()?;
    if peak <= 0.0 || current >= peak {
        return None;
    }

    // Refills after the peak: an observation rising more than the tolerance
    // above its predecessor offsets the decline.
    let mut refills = 0usize;
    let mut prev: Option<f64> = None;
    for &(ts, v) in history.iter() {
        if ts < peak_ts {
            continue;
        }
        if let Some(p) = prev {
            if v > p * (1.0 + refill_tolerance) {
                refills += 1;
            }
        }
        prev = Some(v);
    }
    if refills > max_refills {
        return None;
    }

    let depleted = peak - current;
    let elapsed_s = ((last_ts - peak_ts).max(1)) as f64 / 1_000.0;
    Some(Depletion {
        ratio: depleted / peak,
        velocity: depleted / elapsed_s,
        peak,
    })
}

pub struct ExhaustionDetector {
    /// Per (zone, side) passive-quantity history fed from zone snapshots.
    histories: HashMap<(i64, Side), VecDeque<(i64, f64)>>,
    cooldowns: CooldownTracker,
    builder: SignalBuilder,
    last_eval: Option<ThresholdRecord>,
}

impl ExhaustionDetector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            histories: HashMap::new(),
            cooldowns: CooldownTracker::new(config.exhaustion.event_cooldown_ms),
            builder: SignalBuilder::new(DETECTOR_ID),
            last_eval: None,
        }
    }

    fn record_history(&mut self, trade: &EnrichedTrade, window: usize, scale: &crate::numerics::SymbolScale) {
        for zone in &trade.zone_data {
            for (side, units) in [
                (Side::Sell, zone.passive_bid_units),
                (Side::Buy, zone.passive_ask_units),
            ] {
                let hist = self
                    .histories
                    .entry((zone.zone_id, side))
                    .or_insert_with(|| VecDeque::with_capacity(window));
                if hist.len() == window {
                    hist.pop_front();
                }
                hist.push_back((zone.last_update_ms, scale.units_to_f64(units)));
            }
        }
    }

    fn depletion_for(
        &self,
        zone_id: i64,
        consumed_by: Side,
        tolerance: f64,
        max_refills: usize,
    ) -> Option<Depletion> {
        self.histories
            .get(&(zone_id, consumed_by))
            .and_then(|h| analyze_depletion(h, tolerance, max_refills))
    }
}

impl Detector for ExhaustionDetector {
    fn id(&self) -> &'static str {
        DETECTOR_ID
    }

    fn on_trade(&mut self, trade: &EnrichedTrade, ctx: &DetectorContext<'_>) -> Vec<DetectorEvent> {
        let cfg = &ctx.config.exhaustion;
        let confluence_cfg = &ctx.config.confluence;
        let scale = ctx.scale;
        let aggressor = trade.trade.aggressor();
        let ts = trade.trade.timestamp_ms;

        // History first: this trade's snapshots are part of the series.
        self.record_history(trade, cfg.depletion_window, scale);

        let near = find_zones_near_price(
            &trade.zone_data,
            trade.trade.price_ticks,
            confluence_cfg.max_zone_confluence_distance_ticks,
        );
        if near.is_empty() {
            return Vec::new();
        }

        // Directional volumes over the confluence set: aggressive flow on
        // the trade's side, passive on the side it consumes. Single side
        // only, never bid+ask summed.
        let mut dir_aggressive = 0.0;
        let mut dir_passive = 0.0;
        for zone in &near {
            dir_aggressive += scale.units_to_f64(zone.aggressive_units(aggressor));
            dir_passive += scale.units_to_f64(zone.passive_consumed_units(aggressor));
        }

        let mut rec = ThresholdRecord::default();

        let g_volume = rec.record(
            "min_directional_aggressive",
            scale.units_to_f64(cfg.min_agg_volume_units),
            dir_aggressive,
            ThresholdOp::Eql,
        );

        let passive_ratio = safe_divide(dir_passive, dir_aggressive + dir_passive, 1.0);
        let g_ratio = rec.record(
            "accumulated_passive_ratio",
            cfg.passive_ratio_balance_threshold,
            passive_ratio,
            ThresholdOp::Eqs,
        );

        // Depletion on the consumed side, corroborated across zones.
        let mut corroborating = 0usize;
        let mut best: Option<Depletion> = None;
        let mut opposite_depleted = false;
        for zone in &near {
            if let Some(d) = self.depletion_for(
                zone.zone_id,
                aggressor,
                cfg.refill_tolerance,
                cfg.max_refills,
            ) {
                if d.ratio >= cfg.exhaustion_threshold {
                    corroborating += 1;
                    if best.map_or(true, |b| d.ratio > b.ratio) {
                        best = Some(d);
                    }
                }
            }
            if let Some(d) = self.depletion_for(
                zone.zone_id,
                aggressor.opposite(),
                cfg.refill_tolerance,
                cfg.max_refills,
            ) {
                if d.ratio >= cfg.exhaustion_threshold {
                    opposite_depleted = true;
                }
            }
        }
        let depletion = best.unwrap_or(Depletion {
            ratio: 0.0,
            velocity: 0.0,
            peak: 0.0,
        });

        let g_depletion = rec.record(
            "depletion_ratio",
            cfg.exhaustion_threshold,
            depletion.ratio,
            ThresholdOp::Eql,
        );
        let g_confluence = rec.record(
            "zone_confluence_count",
            confluence_cfg.min_zone_confluence_count as f64,
            corroborating as f64,
            ThresholdOp::Eql,
        );

        let depl_norm = safe_divide(
            depletion.ratio - cfg.exhaustion_threshold,
            1.0 - cfg.exhaustion_threshold,
            0.0,
        )
        .clamp(0.0, 1.0);
        let ratio_shortfall = safe_divide(
            cfg.passive_ratio_balance_threshold - passive_ratio,
            cfg.passive_ratio_balance_threshold,
            0.0,
        )
        .clamp(0.0, 1.0);
        // Velocity normalized against emptying the peak within ten seconds.
        let velocity_norm = safe_divide(depletion.velocity * 10.0, depletion.peak, 0.0).clamp(0.0, 1.0);
        let confidence =
            (0.50 * depl_norm + 0.30 * ratio_shortfall + 0.20 * velocity_norm).clamp(0.0, 1.0);
        let g_confidence = rec.record(
            "final_confidence",
            cfg.final_confidence_required,
            confidence,
            ThresholdOp::Eql,
        );

        self.last_eval = Some(rec.clone());

        let gates = g_volume && g_ratio && g_depletion && g_confluence && g_confidence;
        if !gates {
            debug!(
                detector = DETECTOR_ID,
                failed = ?rec.failed_names(),
                "Exhaustion gates not met"
            );
            return Vec::new();
        }

        // Both sides depleted is ambiguous: stand down.
        if opposite_depleted {
            debug!(
                detector = DETECTOR_ID,
                zone_id = trade.zone_id,
                "Both book sides depleted, ambiguous, no signal"
            );
            return Vec::new();
        }

        // Bids depleted -> buy; asks depleted -> sell.
        let candidate_side = aggressor.opposite();

        let (indicators, survives) = apply_indicator_gate(DETECTOR_ID, ctx, candidate_side);
        if !survives {
            return Vec::new();
        }

        // Exhaustion is rare and high-value: one detector-wide key.
        if !self
            .cooldowns
            .can_emit(CooldownKey::detector_wide(), ts, true)
        {
            return Vec::new();
        }

        let metadata = SignalMetadata::Exhaustion {
            directional_aggressive: dir_aggressive,
            directional_passive: dir_passive,
            accumulated_passive_ratio: passive_ratio,
            depletion_ratio: depletion.ratio,
            depletion_velocity: depletion.velocity,
            confluence_count: corroborating,
        };
        let candidate = self.builder.build(
            SignalKind::Exhaustion,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorGate;
    use crate::numerics::SymbolScale;
    use crate::types::{BookContext, Trade};
    use crate::zones::{ZoneSnapshot, ZoneTradeRecord};
    use rust_decimal::Decimal;

    fn scale() -> SymbolScale {
        SymbolScale::new(Decimal::new(1, 2), 2, 8)
    }

    fn test_config() -> EngineConfig {
        let mut cfg = EngineConfig::for_tests(false);
        cfg.exhaustion.min_agg_volume_units = 100_00_000_000; // 100.0
        cfg.exhaustion.passive_ratio_balance_threshold = 0.30;
        cfg.exhaustion.exhaustion_threshold = 0.75;
        cfg.exhaustion.final_confidence_required = 0.70;
        cfg.confluence.min_zone_confluence_count = 1;
        cfg.indicators.enabled = false;
        cfg
    }

    /// A sell trade at 500.00 into a zone whose passive bid is `bid_qty`.
    fn sell_trade(ts: i64, seq: u64, qty_units: i64, agg_sell_units: i64, bid_units: i64) -> EnrichedTrade {
        EnrichedTrade {
            trade: Trade {
                trade_id: seq,
                price_ticks: 50_000,
                qty_units,
                timestamp_ms: ts,
                buyer_is_maker: true,
            },
            book: BookContext {
                book_synced: true,
                best_bid_ticks: 49_999,
                best_ask_ticks: 50_001,
                spread_ticks: 2,
                mid_ticks: 50_000,
                passive_bid_units: bid_units,
                passive_ask_units: 300_00_000_000,
                zone_passive_bid_units: bid_units,
                zone_passive_ask_units: 300_00_000_000,
            },
            zone_id: 5_000,
            is_large: false,
            zone_data: vec![ZoneSnapshot {
                zone_id: 5_000,
                price_level_ticks: 50_000,
                aggressive_buy_units: 0,
                aggressive_sell_units: agg_sell_units,
                passive_bid_units: bid_units,
                passive_ask_units: 300_00_000_000,
                trade_count: seq,
                first_seen_ms: 0,
                last_update_ms: ts,
                recent_trades: vec![ZoneTradeRecord {
                    price_ticks: 50_000,
                    qty_units,
                    timestamp_ms: ts,
                    side: Side::Sell,
                }],
            }],
        }
    }

    fn run(det: &mut ExhaustionDetector, cfg: &EngineConfig, t: &EnrichedTrade) -> Vec<DetectorEvent> {
        let gate = IndicatorGate::new(cfg.indicators.clone());
        let s = scale();
        let ctx = DetectorContext {
            config: cfg,
            scale: &s,
            indicators: &gate,
        };
        det.on_trade(t, &ctx)
    }

    #[test]
    fn test_analyze_depletion_monotone_decline() {
        let hist: VecDeque<(i64, f64)> = [(0, 400.0), (1_000, 300.0), (2_000, 150.0), (3_000, 5.0)]
            .into_iter()
            .collect();
        let d = analyze_depletion(&hist, 0.10, 1).unwrap();
        assert!((d.ratio - 0.9875).abs() < 1e-9);
        assert!((d.velocity - 395.0 / 3.0).abs() < 1e-6);
        assert_eq!(d.peak, 400.0);
    }

    #[test]
    fn test_analyze_depletion_refills_cancel() {
        // Decline offset by two refills above tolerance: not exhaustion.
        let hist: VecDeque<(i64, f64)> = [
            (0, 400.0),
            (1_000, 200.0),
            (2_000, 380.0),
            (3_000, 150.0),
            (4_000, 360.0),
            (5_000, 100.0),
        ]
        .into_iter()
        .collect();
        assert!(analyze_depletion(&hist, 0.10, 1).is_none());
    }

    #[test]
    fn test_analyze_depletion_needs_decline_and_samples() {
        let hist: VecDeque<(i64, f64)> = [(0, 100.0), (1_000, 100.0)].into_iter().collect();
        assert!(analyze_depletion(&hist, 0.1, 1).is_none());
        let rising: VecDeque<(i64, f64)> =
            [(0, 100.0), (1_000, 150.0), (2_000, 200.0)].into_iter().collect();
        assert!(analyze_depletion(&rising, 0.1, 1).is_none());
    }

    /// Scenario: seed passive_bid 400 at 500.00, then seven aggressive sell
    /// trades (50, 70, 80, 60, 55, 40, 15) with the zone's bid declining
    /// monotonically to ~5.
    /// Expected: one exhaustion signal with side=buy and depletion_ratio at
    /// or above the threshold; an immediate follow-up trade emits nothing.
    #[test]
    fn test_bid_depletion_emits_buy_once() {
        let cfg = test_config();
        let mut det = ExhaustionDetector::new(&cfg);
        let quantities = [50i64, 70, 80, 60, 55, 40, 15];
        let bids_after = [350i64, 280, 200, 140, 85, 45, 5];

        let mut cumulative = 0i64;
        let mut events = Vec::new();
        for (i, (q, bid)) in quantities.iter().zip(bids_after).enumerate() {
            cumulative += q * 100_000_000;
            let t = sell_trade(
                (i as i64 + 1) * 1_000,
                i as u64 + 1,
                q * 100_000_000,
                cumulative,
                bid * 100_000_000,
            );
            events = run(&mut det, &cfg, &t);
        }
        assert_eq!(events.len(), 1, "eval: {:?}", det.last_evaluation());
        let DetectorEvent::Signal(sig) = &events[0] else {
            panic!("expected signal")
        };
        assert_eq!(sig.kind, SignalKind::Exhaustion);
        assert_eq!(sig.side, Side::Buy);
        let SignalMetadata::Exhaustion {
            depletion_ratio, ..
        } = &sig.metadata
        else {
            panic!("wrong metadata variant")
        };
        assert!(*depletion_ratio >= 0.75);

        // Cooldown-window-immediate second trade: no second signal.
        let t = sell_trade(8_000, 8, 10 * 100_000_000, cumulative + 1_000_000_000, 4 * 100_000_000);
        assert!(run(&mut det, &cfg, &t).is_empty());
    }

    /// Scenario: heavy selling but the bid keeps refilling.
    /// Expected: depletion gate fails; record shows it.
    #[test]
    fn test_refilling_bid_not_exhaustion() {
        let cfg = test_config();
        let mut det = ExhaustionDetector::new(&cfg);
        let bids = [400i64, 150, 390, 120, 380, 100, 370];
        let mut events = Vec::new();
        for (i, bid) in bids.iter().enumerate() {
            let t = sell_trade(
                (i as i64 + 1) * 1_000,
                i as u64 + 1,
                60 * 100_000_000,
                (i as i64 + 1) * 60 * 100_000_000,
                bid * 100_000_000,
            );
            events = run(&mut det, &cfg, &t);
        }
        assert!(events.is_empty());
        let rec = det.last_evaluation().unwrap();
        assert!(rec.failed_names().contains(&"depletion_ratio"));
    }

    /// Scenario: both sides of the zone drain together.
    /// Expected: ambiguous, no signal even though all gates pass.
    #[test]
    fn test_both_sides_depleted_is_ambiguous() {
        let cfg = test_config();
        let mut det = ExhaustionDetector::new(&cfg);
        let declining = [400i64, 300, 200, 100, 30, 5];
        let mut events = Vec::new();
        for (i, v) in declining.iter().enumerate() {
            let mut t = sell_trade(
                (i as i64 + 1) * 1_000,
                i as u64 + 1,
                60 * 100_000_000,
                (i as i64 + 1) * 60 * 100_000_000,
                v * 100_000_000,
            );
            // Ask side drains in lockstep.
            t.zone_data[0].passive_ask_units = v * 100_000_000;
            events = run(&mut det, &cfg, &t);
        }
        assert!(events.is_empty());
        // The gates themselves passed; ambiguity stood the signal down.
        assert!(det.last_evaluation().unwrap().all_passed());
    }
}
