//! Core data types: ingest events, normalized trades, enriched trades, and
//! signal artifacts.
//!
//! Ingest events mirror the exchange wire shapes with short serde keys;
//! everything downstream of normalization is integer-scaled fixed point.

use crate::zones::ZoneSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Namespace for deterministic (name-based v5) signal ids. Replay of the
/// same stream must reproduce identical ids, which rules out random v4.
pub const SIGNAL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f72_6465_7266_6c6f_7765_6e67_696e_6531);

/// Aggregated trade event from the exchange stream.
///
/// Example JSON:
/// ```json
/// {
///   "e": "aggTrade",
///   "E": 1672531200000,
///   "s": "BTCUSDT",
///   "a": 12345,
///   "p": "16800.50",
///   "q": "1.25",
///   "f": 100,
///   "l": 105,
///   "T": 1672531199999,
///   "m": true,
///   "M": true
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggTradeEvent {
    /// Event type (always "aggTrade")
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event timestamp (Unix milliseconds)
    #[serde(rename = "E")]
    pub event_time: i64,

    /// Symbol (e.g., "BTCUSDT")
    #[serde(rename = "s")]
    pub symbol: String,

    /// Aggregate trade ID
    #[serde(rename = "a")]
    pub agg_trade_id: u64,

    /// Price (as string to preserve precision)
    #[serde(rename = "p")]
    pub price: String,

    /// Quantity (as string to preserve precision)
    #[serde(rename = "q")]
    pub quantity: String,

    /// First trade ID
    #[serde(rename = "f")]
    pub first_trade_id: u64,

    /// Last trade ID
    #[serde(rename = "l")]
    pub last_trade_id: u64,

    /// Trade timestamp (Unix milliseconds)
    #[serde(rename = "T")]
    pub trade_time: i64,

    /// Is buyer the market maker? (true = aggressive seller)
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,

    /// Was trade the best price match?
    #[serde(rename = "M")]
    pub is_best_match: bool,
}

/// Incremental depth diff from the exchange stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthUpdateEvent {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "U")]
    pub first_update_id: i64,

    #[serde(rename = "u")]
    pub final_update_id: i64,

    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>, // [price, qty]

    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>, // [price, qty]
}

/// Full-depth snapshot obtained from the exchange collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

/// Taker side of a trade, or direction of a signal candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Normalized trade in fixed-point units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: u64,
    pub price_ticks: i64,
    pub qty_units: i64,
    pub timestamp_ms: i64,
    /// `true` means the aggressive side was the seller.
    pub buyer_is_maker: bool,
}

impl Trade {
    /// The taker side: buyer-is-maker means the seller crossed the spread.
    pub fn aggressor(&self) -> Side {
        if self.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

/// Point-in-time book context captured for one trade.
///
/// All fields are zero / `false` when the book is quarantined; the trade
/// still flows with degraded enrichment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookContext {
    /// Whether the book was synchronized when this context was captured.
    pub book_synced: bool,
    pub best_bid_ticks: i64,
    pub best_ask_ticks: i64,
    pub spread_ticks: i64,
    pub mid_ticks: i64,
    /// Passive volume resting at the exact trade price.
    pub passive_bid_units: i64,
    pub passive_ask_units: i64,
    /// Passive volume summed over the configured band around the trade price.
    pub zone_passive_bid_units: i64,
    pub zone_passive_ask_units: i64,
}

/// A trade enriched with book context and nearby zone aggregates.
///
/// Value semantics: produced once by the preprocessor, then consumed
/// downstream without aliasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTrade {
    pub trade: Trade,
    pub book: BookContext,
    /// Zone bucket of the trade price.
    pub zone_id: i64,
    /// Flagged when the single print meets the large-trade threshold.
    pub is_large: bool,
    /// Active zones near the trade price, including the trade's own zone
    /// with this trade already aggregated into it.
    pub zone_data: Vec<ZoneSnapshot>,
}

impl EnrichedTrade {
    /// The trade's own zone snapshot from `zone_data`.
    pub fn own_zone(&self) -> Option<&ZoneSnapshot> {
        self.zone_data.iter().find(|z| z.zone_id == self.zone_id)
    }
}

/// Signal candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Absorption,
    Exhaustion,
    Accumulation,
    Distribution,
    CvdConfirmation,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Absorption => "absorption",
            SignalKind::Exhaustion => "exhaustion",
            SignalKind::Accumulation => "accumulation",
            SignalKind::Distribution => "distribution",
            SignalKind::CvdConfirmation => "cvd_confirmation",
        }
    }

    pub const ALL: [SignalKind; 5] = [
        SignalKind::Absorption,
        SignalKind::Exhaustion,
        SignalKind::Accumulation,
        SignalKind::Distribution,
        SignalKind::CvdConfirmation,
    ];

    /// Static base priority before regime weighting.
    pub fn base_priority(self) -> f64 {
        match self {
            SignalKind::Exhaustion => 0.9,
            SignalKind::Absorption => 0.8,
            SignalKind::CvdConfirmation => 0.7,
            SignalKind::Accumulation => 0.6,
            SignalKind::Distribution => 0.6,
        }
    }
}

/// Comparison direction of a threshold check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    /// Pass when calculated >= threshold (equal-or-larger).
    #[serde(rename = "EQL")]
    Eql,
    /// Pass when calculated <= threshold (equal-or-smaller).
    #[serde(rename = "EQS")]
    Eqs,
}

/// One gate evaluation: the configured threshold, the calculated value, the
/// comparison direction, and the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub threshold: f64,
    pub calculated: f64,
    pub op: ThresholdOp,
    pub passed: bool,
}

/// Structured record of every gate a detector evaluated for one event,
/// produced on rejection too so near-misses can be studied offline.
/// Keys are sorted (BTreeMap) so serialized records are byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRecord {
    pub checks: BTreeMap<String, ThresholdCheck>,
}

impl ThresholdRecord {
    pub fn record(&mut self, name: &str, threshold: f64, calculated: f64, op: ThresholdOp) -> bool {
        let passed = match op {
            ThresholdOp::Eql => calculated >= threshold,
            ThresholdOp::Eqs => calculated <= threshold,
        };
        self.checks.insert(
            name.to_string(),
            ThresholdCheck {
                threshold,
                calculated,
                op,
                passed,
            },
        );
        passed
    }

    pub fn all_passed(&self) -> bool {
        self.checks.values().all(|c| c.passed)
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, c)| !c.passed)
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Typed per-kind calculation inputs attached to a candidate, replacing the
/// free-form metadata bag of earlier revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMetadata {
    Absorption {
        aggressive_in_zone: f64,
        passive_opposite: f64,
        passive_ratio: f64,
        price_efficiency: f64,
        spread_impact: f64,
        institutional_ratio: f64,
        opposite_side_ewma: f64,
        candidate_side_ewma: f64,
    },
    Exhaustion {
        directional_aggressive: f64,
        directional_passive: f64,
        accumulated_passive_ratio: f64,
        depletion_ratio: f64,
        depletion_velocity: f64,
        confluence_count: usize,
    },
    Zone {
        total_volume: f64,
        buy_ratio: f64,
        sell_ratio: f64,
        trade_count: u64,
        duration_ms: i64,
        average_order_size: f64,
        price_low_ticks: i64,
        price_high_ticks: i64,
        strength: f64,
    },
    Cvd {
        window_sec: u32,
        delta: f64,
        z_score: f64,
        correlation: f64,
        volume_surge: f64,
        mode: String,
    },
}

/// Side-aware verdict from the traditional-indicator gate, recorded on the
/// candidate for post-hoc analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub vwap: f64,
    pub rsi: f64,
    pub book_imbalance: f64,
    pub verdict: GateVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Filter,
    /// Not enough samples to judge; treated as pass but recorded distinctly.
    Unavailable,
}

/// The dispatched artifact: a labeled microstructure signal candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCandidate {
    pub id: Uuid,
    pub kind: SignalKind,
    pub side: Side,
    pub price_ticks: i64,
    /// Clamped to [0, 1].
    pub confidence: f64,
    pub timestamp_ms: i64,
    pub detector_id: String,
    pub correlation_id: Uuid,
    pub thresholds: ThresholdRecord,
    pub indicators: Option<IndicatorSnapshot>,
    pub metadata: SignalMetadata,
}

impl SignalCandidate {
    /// Deterministic id: a v5 UUID over the detector id, event timestamp and
    /// per-detector emit sequence, so replays reproduce ids byte-for-byte.
    pub fn deterministic_id(detector_id: &str, timestamp_ms: i64, seq: u64) -> Uuid {
        let name = format!("{detector_id}:{timestamp_ms}:{seq}");
        Uuid::new_v5(&SIGNAL_ID_NAMESPACE, name.as_bytes())
    }

    /// Event time as a chrono timestamp for log and egress formatting.
    pub fn emitted_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

/// Zone lifecycle events emitted by the accumulation/distribution detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ZoneEvent {
    ZoneCreated {
        kind: SignalKind,
        zone_key: u64,
        price_low_ticks: i64,
        price_high_ticks: i64,
        total_volume: f64,
        strength: f64,
        timestamp_ms: i64,
    },
    ZoneUpdated {
        kind: SignalKind,
        zone_key: u64,
        strength: f64,
        strength_change: f64,
        timestamp_ms: i64,
    },
    ZoneInvalidated {
        kind: SignalKind,
        zone_key: u64,
        timestamp_ms: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggtrade_deserialization() {
        let json = r#"{
            "e": "aggTrade",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "a": 12345,
            "p": "16800.50",
            "q": "1.25",
            "f": 100,
            "l": 105,
            "T": 1672531199999,
            "m": true,
            "M": true
        }"#;

        let trade: AggTradeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.price, "16800.50");
        assert_eq!(trade.quantity, "1.25");
        assert!(trade.is_buyer_maker);
    }

    #[test]
    fn test_depth_update_deserialization() {
        let json = r#"{
            "e": "depthUpdate",
            "E": 1699999999123,
            "s": "BTCUSDT",
            "U": 1000,
            "u": 1005,
            "b": [["67650.00", "1.23400"]],
            "a": [["67651.00", "0.98700"]]
        }"#;

        let update: DepthUpdateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(update.first_update_id, 1000);
        assert_eq!(update.final_update_id, 1005);
        assert_eq!(update.bids[0][0], "67650.00");
    }

    #[test]
    fn test_aggressor_side_from_maker_flag() {
        let t = Trade {
            trade_id: 1,
            price_ticks: 8905,
            qty_units: 100,
            timestamp_ms: 0,
            buyer_is_maker: true,
        };
        assert_eq!(t.aggressor(), Side::Sell);
        let t = Trade {
            buyer_is_maker: false,
            ..t
        };
        assert_eq!(t.aggressor(), Side::Buy);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_threshold_record_ops() {
        let mut rec = ThresholdRecord::default();
        assert!(rec.record("min_volume", 10.0, 12.0, ThresholdOp::Eql));
        assert!(rec.record("efficiency", 0.35, 0.2, ThresholdOp::Eqs));
        assert!(!rec.record("passive_ratio", 0.6, 0.5, ThresholdOp::Eql));
        assert!(!rec.all_passed());
        assert_eq!(rec.failed_names(), vec!["passive_ratio"]);
    }

    /// Scenario: the same detector/timestamp/sequence triple on two runs.
    /// Expected: identical v5 ids; a different sequence yields a new id.
    #[test]
    fn test_deterministic_signal_ids() {
        let a = SignalCandidate::deterministic_id("absorption", 1_000, 7);
        let b = SignalCandidate::deterministic_id("absorption", 1_000, 7);
        let c = SignalCandidate::deterministic_id("absorption", 1_000, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_threshold_record_serialization_is_sorted() {
        let mut rec = ThresholdRecord::default();
        rec.record("zeta", 1.0, 2.0, ThresholdOp::Eql);
        rec.record("alpha", 1.0, 2.0, ThresholdOp::Eql);
        let json = serde_json::to_string(&rec).unwrap();
        let alpha = json.find("alpha").unwrap();
        let zeta = json.find("zeta").unwrap();
        assert!(alpha < zeta);
    }
}
