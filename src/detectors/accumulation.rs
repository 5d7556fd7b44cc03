//! Accumulation / distribution zone detector.
//!
//! Hypothesis: a tight price zone is being accumulated (or distributed) over
//! an extended time — one side's share of volume persistently dominates,
//! with institutional-size prints. Candidate zones grow per price bucket and
//! are promoted to active zones when the promotion criteria hold; promotions
//! emit a zone signal plus a lifecycle event, and meaningful strength
//! changes on active zones emit `zone_update` events.
//!
//! One detector instance runs per mode; they share no state.

use crate::config::EngineConfig;
use crate::detectors::{
    apply_indicator_gate, CooldownKey, CooldownTracker, Detector, DetectorContext, DetectorEvent,
    SignalBuilder,
};
use crate::numerics::safe_divide;
use crate::rolling::RollingWindow;
use crate::types::{
    EnrichedTrade, Side, SignalKind, SignalMetadata, ThresholdOp, ThresholdRecord, ZoneEvent,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// Which side of the hypothesis this instance detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMode {
    Accumulation,
    Distribution,
}

impl ZoneMode {
    pub fn kind(self) -> SignalKind {
        match self {
            ZoneMode::Accumulation => SignalKind::Accumulation,
            ZoneMode::Distribution => SignalKind::Distribution,
        }
    }

    pub fn side(self) -> Side {
        match self {
            ZoneMode::Accumulation => Side::Buy,
            ZoneMode::Distribution => Side::Sell,
        }
    }

    fn detector_id(self) -> &'static str {
        match self {
            ZoneMode::Accumulation => "accumulation",
            ZoneMode::Distribution => "distribution",
        }
    }
}

/// A price bucket being watched for promotion.
#[derive(Debug, Clone)]
struct CandidateZone {
    buy_units: i64,
    sell_units: i64,
    trade_count: u64,
    start_ms: i64,
    last_update_ms: i64,
    min_price_ticks: i64,
    max_price_ticks: i64,
}

impl CandidateZone {
    fn new(trade: &EnrichedTrade) -> Self {
        let mut c = Self {
            buy_units: 0,
            sell_units: 0,
            trade_count: 0,
            start_ms: trade.trade.timestamp_ms,
            last_update_ms: trade.trade.timestamp_ms,
            min_price_ticks: trade.trade.price_ticks,
            max_price_ticks: trade.trade.price_ticks,
        };
        c.absorb(trade);
        c
    }

    fn absorb(&mut self, trade: &EnrichedTrade) {
        match trade.trade.aggressor() {
            Side::Buy => self.buy_units += trade.trade.qty_units,
            Side::Sell => self.sell_units += trade.trade.qty_units,
        }
        self.trade_count += 1;
        self.last_update_ms = trade.trade.timestamp_ms;
        self.min_price_ticks = self.min_price_ticks.min(trade.trade.price_ticks);
        self.max_price_ticks = self.max_price_ticks.max(trade.trade.price_ticks);
    }

    fn total_units(&self) -> i64 {
        self.buy_units + self.sell_units
    }
}

/// A promoted zone whose strength evolution is tracked.
#[derive(Debug, Clone)]
struct ActiveZone {
    zone_key: u64,
    candidate: CandidateZone,
    strength: f64,
    strength_history: RollingWindow<f64>,
}

pub struct ZoneAccumulationDetector {
    mode: ZoneMode,
    candidates: HashMap<i64, CandidateZone>,
    zones: Vec<ActiveZone>,
    next_zone_key: u64,
    cooldowns: CooldownTracker,
    builder: SignalBuilder,
    last_eval: Option<ThresholdRecord>,
}

impl ZoneAccumulationDetector {
    pub fn new(mode: ZoneMode, config: &EngineConfig) -> Self {
        Self {
            mode,
            candidates: HashMap::new(),
            zones: Vec::new(),
            next_zone_key: 0,
            cooldowns: CooldownTracker::new(config.accumulation.event_cooldown_ms),
            builder: SignalBuilder::new(mode.detector_id()),
            last_eval: None,
        }
    }

    pub fn active_zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Dominant-side share for this mode: buy share for accumulation, sell
    /// share for distribution.
    fn dominant_ratio(&self, buy_units: i64, sell_units: i64) -> f64 {
        let total = (buy_units + sell_units) as f64;
        match self.mode {
            ZoneMode::Accumulation => safe_divide(buy_units as f64, total, 0.0),
            ZoneMode::Distribution => safe_divide(sell_units as f64, total, 0.0),
        }
    }

    fn min_dominant_ratio(&self, cfg: &crate::config::AccumulationConfig) -> f64 {
        match self.mode {
            ZoneMode::Accumulation => cfg.min_buy_ratio,
            ZoneMode::Distribution => cfg.min_sell_ratio,
        }
    }

    /// Strength in [0, 1]: how far the dominant-side share sits above its
    /// promotion floor.
    fn strength(&self, candidate: &CandidateZone, cfg: &crate::config::AccumulationConfig) -> f64 {
        let floor = self.min_dominant_ratio(cfg);
        let ratio = self.dominant_ratio(candidate.buy_units, candidate.sell_units);
        safe_divide(ratio - floor, 1.0 - floor, 0.0).clamp(0.0, 1.0)
    }

    fn sweep_timeouts(&mut self, now_ms: i64, timeout_ms: i64, events: &mut Vec<DetectorEvent>) {
        let mode = self.mode;
        self.zones.retain(|z| {
            let alive = now_ms - z.candidate.last_update_ms <= timeout_ms;
            if !alive {
                debug!(
                    detector = mode.detector_id(),
                    zone_key = z.zone_key,
                    "Zone invalidated after inactivity"
                );
                events.push(DetectorEvent::Zone(ZoneEvent::ZoneInvalidated {
                    kind: mode.kind(),
                    zone_key: z.zone_key,
                    timestamp_ms: now_ms,
                }));
            }
            alive
        });
        self.candidates
            .retain(|_, c| now_ms - c.last_update_ms <= timeout_ms);
    }

    /// Merge rule: a trade landing inside an active zone's price range plus
    /// the percentage tolerance updates that zone in place instead of
    /// seeding a parallel candidate.
    fn try_merge(
        &mut self,
        trade: &EnrichedTrade,
        cfg: &crate::config::AccumulationConfig,
        events: &mut Vec<DetectorEvent>,
    ) -> bool {
        let price = trade.trade.price_ticks;
        let tolerance = (price as f64 * cfg.merge_tolerance_pct).ceil() as i64;
        let mode = self.mode;
        let strength_floor = self.min_dominant_ratio(cfg);
        let Some(zone) = self.zones.iter_mut().find(|z| {
            price >= z.candidate.min_price_ticks - tolerance
                && price <= z.candidate.max_price_ticks + tolerance
        }) else {
            return false;
        };

        zone.candidate.absorb(trade);
        let ratio = match mode {
            ZoneMode::Accumulation => safe_divide(
                zone.candidate.buy_units as f64,
                zone.candidate.total_units() as f64,
                0.0,
            ),
            ZoneMode::Distribution => safe_divide(
                zone.candidate.sell_units as f64,
                zone.candidate.total_units() as f64,
                0.0,
            ),
        };
        let new_strength =
            safe_divide(ratio - strength_floor, 1.0 - strength_floor, 0.0).clamp(0.0, 1.0);
        let change = new_strength - zone.strength;
        zone.strength_history.push(new_strength);
        if change.abs() >= cfg.strength_change_threshold {
            events.push(DetectorEvent::Zone(ZoneEvent::ZoneUpdated {
                kind: mode.kind(),
                zone_key: zone.zone_key,
                strength: new_strength,
                strength_change: change,
                timestamp_ms: trade.trade.timestamp_ms,
            }));
            zone.strength = new_strength;
        }
        true
    }
}

impl Detector for ZoneAccumulationDetector {
    fn id(&self) -> &'static str {
        self.mode.detector_id()
    }

    fn on_trade(&mut self, trade: &EnrichedTrade, ctx: &DetectorContext<'_>) -> Vec<DetectorEvent> {
        let cfg = &ctx.config.accumulation;
        let scale = ctx.scale;
        let now_ms = trade.trade.timestamp_ms;
        let mut events = Vec::new();

        self.sweep_timeouts(now_ms, cfg.zone_timeout_ms, &mut events);

        if self.try_merge(trade, cfg, &mut events) {
            return events;
        }

        let candidate = self
            .candidates
            .entry(trade.zone_id)
            .and_modify(|c| c.absorb(trade))
            .or_insert_with(|| CandidateZone::new(trade))
            .clone();

        // Promotion criteria. The record carries every gate even when the
        // candidate stays unpromoted.
        let mut rec = ThresholdRecord::default();
        let duration_ms = now_ms - candidate.start_ms;
        let g_duration = rec.record(
            "min_duration_ms",
            cfg.min_duration_ms as f64,
            duration_ms as f64,
            ThresholdOp::Eql,
        );
        let total_qty = scale.units_to_f64(candidate.total_units());
        let g_volume = rec.record(
            "min_zone_volume",
            scale.units_to_f64(cfg.min_zone_volume_units),
            total_qty,
            ThresholdOp::Eql,
        );
        let g_trades = rec.record(
            "min_trade_count",
            cfg.min_trade_count as f64,
            candidate.trade_count as f64,
            ThresholdOp::Eql,
        );
        let width_pct = safe_divide(
            (candidate.max_price_ticks - candidate.min_price_ticks) as f64,
            trade.trade.price_ticks as f64,
            1.0,
        );
        let g_width = rec.record(
            "max_zone_width_pct",
            cfg.max_zone_width_pct,
            width_pct,
            ThresholdOp::Eqs,
        );

        let dominant = self.dominant_ratio(candidate.buy_units, candidate.sell_units);
        let floor = self.min_dominant_ratio(cfg);
        let g_dominant = rec.record("min_dominant_ratio", floor, dominant, ThresholdOp::Eql);
        let opposing = 1.0 - dominant;
        let g_opposing = rec.record(
            "max_opposing_ratio",
            1.0 - floor,
            opposing,
            ThresholdOp::Eqs,
        );

        let avg_order_qty = safe_divide(total_qty, candidate.trade_count as f64, 0.0);
        // Institutional size is a score contribution, not a hard gate.
        let institutional_score = safe_divide(
            avg_order_qty,
            scale.units_to_f64(cfg.institutional_order_units),
            0.0,
        )
        .clamp(0.0, 1.0);
        rec.record(
            "institutional_order_size",
            scale.units_to_f64(cfg.institutional_order_units),
            avg_order_qty,
            ThresholdOp::Eql,
        );

        let recency_ms = now_ms - candidate.last_update_ms;
        let g_recent = rec.record(
            "min_recent_activity_ms",
            cfg.min_recent_activity_ms as f64,
            recency_ms as f64,
            ThresholdOp::Eqs,
        );

        let strength = self.strength(&candidate, cfg);
        let volume_score =
            (safe_divide(total_qty, scale.units_to_f64(cfg.min_zone_volume_units), 0.0) - 1.0)
                .clamp(0.0, 1.0);
        let confidence =
            (0.55 * strength + 0.25 * institutional_score + 0.20 * volume_score).clamp(0.0, 1.0);
        let g_confidence = rec.record(
            "final_confidence",
            cfg.final_confidence_required,
            confidence,
            ThresholdOp::Eql,
        );

        self.last_eval = Some(rec.clone());

        let promoted = g_duration
            && g_volume
            && g_trades
            && g_width
            && g_dominant
            && g_opposing
            && g_recent
            && g_confidence;
        if !promoted {
            return events;
        }

        let (indicators, survives) = apply_indicator_gate(self.mode.detector_id(), ctx, self.mode.side());
        if !survives {
            return events;
        }

        if !self
            .cooldowns
            .can_emit(CooldownKey::per_zone(trade.zone_id), now_ms, true)
        {
            return events;
        }

        // Promote: the candidate becomes an active zone.
        let zone_key = self.next_zone_key;
        self.next_zone_key += 1;
        let mut history = RollingWindow::new(64);
        history.push(strength);
        info!(
            detector = self.mode.detector_id(),
            zone_key,
            total_qty,
            strength,
            "Zone promoted"
        );
        self.zones.push(ActiveZone {
            zone_key,
            candidate: candidate.clone(),
            strength,
            strength_history: history,
        });
        self.candidates.remove(&trade.zone_id);

        events.push(DetectorEvent::Zone(ZoneEvent::ZoneCreated {
            kind: self.mode.kind(),
            zone_key,
            price_low_ticks: candidate.min_price_ticks,
            price_high_ticks: candidate.max_price_ticks,
            total_volume: total_qty,
            strength,
            timestamp_ms: now_ms,
        }));

        let metadata = SignalMetadata::Zone {
            total_volume: total_qty,
            buy_ratio: safe_divide(
                candidate.buy_units as f64,
                candidate.total_units() as f64,
                0.0,
            ),
            sell_ratio: safe_divide(
                candidate.sell_units as f64,
                candidate.total_units() as f64,
                0.0,
            ),
            trade_count: candidate.trade_count,
            duration_ms,
            average_order_size: avg_order_qty,
            price_low_ticks: candidate.min_price_ticks,
            price_high_ticks: candidate.max_price_ticks,
            strength,
        };
        let signal = self.builder.build(
            self.mode.kind(),
            self.mode.side(),
            trade.trade.price_ticks,
            confidence,
            now_ms,
            rec,
            Some(indicators),
            metadata,
        );
        events.push(DetectorEvent::Signal(signal));
        events
    }

    fn last_evaluation(&self) -> Option<&ThresholdRecord> {
        self.last_eval.as_ref()
    }
}
