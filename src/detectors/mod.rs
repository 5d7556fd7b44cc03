//! Detector infrastructure shared by the detector set.
//!
//! Every detector is a synchronous state machine over the enriched-trade
//! stream: deterministic given identical inputs, no hidden clock, at most
//! one candidate per cooldown key per event, and a full threshold record
//! retained even on rejection so near-misses can be studied.

mod absorption;
mod accumulation;
mod cvd;
mod exhaustion;

pub use absorption::AbsorptionDetector;
pub use accumulation::{ZoneAccumulationDetector, ZoneMode};
pub use cvd::CvdDetector;
pub use exhaustion::ExhaustionDetector;

use crate::config::EngineConfig;
use crate::indicators::IndicatorGate;
use crate::numerics::SymbolScale;
use crate::types::{
    EnrichedTrade, GateVerdict, Side, SignalCandidate, SignalKind, SignalMetadata,
    ThresholdRecord, ZoneEvent,
};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Read-only context handed to detectors on every trade.
pub struct DetectorContext<'a> {
    pub config: &'a EngineConfig,
    pub scale: &'a SymbolScale,
    pub indicators: &'a IndicatorGate,
}

/// What a detector produced for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    Signal(SignalCandidate),
    Zone(ZoneEvent),
}

/// A detector is a pure function of the enriched-trade stream plus its own
/// rolling state; detectors never share mutable state.
pub trait Detector: Send {
    fn id(&self) -> &'static str;

    fn on_trade(&mut self, trade: &EnrichedTrade, ctx: &DetectorContext<'_>) -> Vec<DetectorEvent>;

    /// Observation hook: the threshold record of the most recent
    /// evaluation, present on rejections too.
    fn last_evaluation(&self) -> Option<&ThresholdRecord>;
}

/// Cooldown key: per-detector, optionally per-side and per-zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub side: Option<Side>,
    pub zone_id: Option<i64>,
}

impl CooldownKey {
    pub fn detector_wide() -> Self {
        Self {
            side: None,
            zone_id: None,
        }
    }

    pub fn per_zone(zone_id: i64) -> Self {
        Self {
            side: None,
            zone_id: Some(zone_id),
        }
    }

    pub fn per_side(side: Side) -> Self {
        Self {
            side: Some(side),
            zone_id: None,
        }
    }
}

/// Tracks last-emit timestamps per key and enforces the cooldown interval.
#[derive(Debug, Clone)]
pub struct CooldownTracker {
    cooldown_ms: i64,
    last_emit: HashMap<CooldownKey, i64>,
}

impl CooldownTracker {
    pub fn new(cooldown_ms: i64) -> Self {
        Self {
            cooldown_ms,
            last_emit: HashMap::new(),
        }
    }

    /// Whether an emit for `key` is allowed at `now_ms`. With `mark` set the
    /// timestamp is recorded in the same call, so check-and-mark is atomic
    /// with respect to the single-threaded event loop.
    pub fn can_emit(&mut self, key: CooldownKey, now_ms: i64, mark: bool) -> bool {
        let allowed = self
            .last_emit
            .get(&key)
            .map_or(true, |last| now_ms - last > self.cooldown_ms);
        if allowed && mark {
            self.last_emit.insert(key, now_ms);
        }
        allowed
    }

    pub fn last_emit_ms(&self, key: CooldownKey) -> Option<i64> {
        self.last_emit.get(&key).copied()
    }
}

/// Shared emit path: stamps the detector id, deterministic id/correlation
/// id, clamps confidence, and attaches the threshold record.
pub struct SignalBuilder {
    detector_id: &'static str,
    emit_seq: u64,
}

impl SignalBuilder {
    pub fn new(detector_id: &'static str) -> Self {
        Self {
            detector_id,
            emit_seq: 0,
        }
    }

    pub fn detector_id(&self) -> &'static str {
        self.detector_id
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        kind: SignalKind,
        side: Side,
        price_ticks: i64,
        confidence: f64,
        timestamp_ms: i64,
        thresholds: ThresholdRecord,
        indicators: Option<crate::types::IndicatorSnapshot>,
        metadata: SignalMetadata,
    ) -> SignalCandidate {
        let seq = self.emit_seq;
        self.emit_seq += 1;
        let id = SignalCandidate::deterministic_id(self.detector_id, timestamp_ms, seq);
        SignalCandidate {
            id,
            kind,
            side,
            price_ticks,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp_ms,
            detector_id: self.detector_id.to_string(),
            correlation_id: self.correlation_id(timestamp_ms),
            thresholds,
            indicators,
            metadata,
        }
    }

    /// Correlation ids group emissions from one detector within the same
    /// event timestamp; deterministic like signal ids.
    fn correlation_id(&self, timestamp_ms: i64) -> Uuid {
        SignalCandidate::deterministic_id(self.detector_id, timestamp_ms, u64::MAX)
    }
}

/// Apply the traditional-indicator gate for a prospective signal. Returns
/// the snapshot to record plus whether the signal survives. `Filter`
/// rejects regardless of detector score.
pub(crate) fn apply_indicator_gate(
    detector_id: &str,
    ctx: &DetectorContext<'_>,
    side: Side,
) -> (crate::types::IndicatorSnapshot, bool) {
    let snapshot = ctx.indicators.assess(side);
    let survives = snapshot.verdict != GateVerdict::Filter;
    if !survives {
        debug!(
            detector = detector_id,
            side = side.as_str(),
            rsi = snapshot.rsi,
            vwap = snapshot.vwap,
            imbalance = snapshot.book_imbalance,
            "Signal rejected by traditional-indicator gate"
        );
    }
    (snapshot, survives)
}
