//! Engine configuration.
//!
//! Every knob is read once at startup into an immutable [`EngineConfig`]
//! passed by reference through component constructors. There are no
//! singletons; tests get their own construction path which is the only way
//! to disable sequence validation.

use crate::types::SignalKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Symbol identity and fixed-point scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    /// Trading pair symbol (uppercase, e.g. "BTCUSDT").
    pub symbol: String,
    /// Price granularity in quote units.
    pub tick_size: Decimal,
    /// Maximum fractional digits accepted on price strings.
    pub price_precision: u32,
    /// Maximum fractional digits accepted on quantity strings.
    pub quantity_precision: u32,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            tick_size: Decimal::new(1, 2),
            price_precision: 2,
            quantity_precision: 8,
        }
    }
}

/// Order book state machine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookConfig {
    /// Hard cap on retained levels; farthest-from-mid evicted first.
    pub max_levels: usize,
    /// Levels farther than this many ticks from mid are pruned.
    pub max_price_distance_ticks: i64,
    /// Pruning cadence.
    pub prune_interval_ms: i64,
    /// Cadence of proactive snapshot refresh requests while healthy.
    pub snapshot_interval_ms: i64,
    /// Levels untouched for longer than this are pruned.
    pub stale_threshold_ms: i64,
    /// Error-rate (sequence errors + stale rejections per event) above which
    /// the circuit breaker opens.
    pub max_error_rate: f64,
    /// Sliding window over which the error rate is measured.
    pub error_window_ms: i64,
    /// Minimum events in the window before the rate is meaningful.
    pub min_events_for_rate: usize,
    /// Breaker cool-down before a clean snapshot may close it.
    pub circuit_cooldown_ms: i64,
    /// Bound on updates buffered while out-of-sync or breaker-open.
    pub max_buffered_updates: usize,
    /// Deadline handed to the exchange collaborator on snapshot requests.
    pub snapshot_deadline_ms: i64,
    /// Test-only: skip the sequence protocol. Not settable from the
    /// production constructor; see [`EngineConfig::for_tests`].
    pub(crate) disable_sequence_validation: bool,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            max_levels: 1_000,
            max_price_distance_ticks: 5_000,
            prune_interval_ms: 30_000,
            snapshot_interval_ms: 300_000,
            stale_threshold_ms: 300_000,
            max_error_rate: 0.10,
            error_window_ms: 10_000,
            min_events_for_rate: 20,
            circuit_cooldown_ms: 5_000,
            max_buffered_updates: 1_024,
            snapshot_deadline_ms: 5_000,
            disable_sequence_validation: false,
        }
    }
}

/// Trade preprocessor and zone store knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    /// Half-width, in ticks, of the passive band summed around the trade price.
    pub band_ticks: i64,
    /// Zone bucket width in ticks.
    pub zone_ticks: i64,
    /// Zones within this many ticks of the trade price go into `zone_data`.
    pub zone_calculation_range_ticks: i64,
    /// Cap on retained zones; oldest-inactive evicted beyond it.
    pub max_zone_history: usize,
    /// Per-zone bounded ring of recent trades.
    pub max_trades_per_zone: usize,
    /// Zones untouched this long are no longer active.
    pub zone_retention_ms: i64,
    /// Trades at or above this many quantity units are flagged large.
    pub large_trade_units: i64,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            band_ticks: 5,
            zone_ticks: 10,
            zone_calculation_range_ticks: 50,
            max_zone_history: 500,
            max_trades_per_zone: 50,
            zone_retention_ms: 900_000,
            large_trade_units: 1_000_000_000,
        }
    }
}

/// Universal zone confluence knobs shared by the detector set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfluenceConfig {
    pub min_zone_confluence_count: usize,
    pub max_zone_confluence_distance_ticks: i64,
    pub enable_zone_confluence_filter: bool,
    /// Added to confidence when confluence exceeds the minimum.
    pub confluence_confidence_boost: f64,
}

impl Default for ZoneConfluenceConfig {
    fn default() -> Self {
        Self {
            min_zone_confluence_count: 2,
            max_zone_confluence_distance_ticks: 20,
            enable_zone_confluence_filter: true,
            confluence_confidence_boost: 0.05,
        }
    }
}

/// Absorption detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsorptionConfig {
    /// Minimum aggressive volume in the zone, in quantity units.
    pub min_agg_volume_units: i64,
    /// Passive-opposite / (aggressive + passive-opposite) floor.
    pub passive_absorption_threshold: f64,
    /// Ceiling on actual/expected price move.
    pub price_efficiency_threshold: f64,
    /// Expected move in ticks per unit of aggressive quantity.
    pub expected_move_ticks_per_qty: f64,
    /// Ceiling on spread expansion versus its rolling baseline.
    pub spread_impact_threshold: f64,
    /// Per-trade quantity units at which a print counts as institutional.
    pub institutional_volume_units: i64,
    /// Floor on the institutional share of zone volume.
    pub institutional_volume_ratio_threshold: f64,
    /// Whether the institutional gate is enforced.
    pub require_institutional: bool,
    /// EWMA decay for the per-side aggression trackers.
    pub ewma_lambda: f64,
    /// Trades kept in the price lookback window.
    pub lookback_trades: usize,
    /// Confidence floor for emission.
    pub final_confidence_required: f64,
    pub event_cooldown_ms: i64,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            min_agg_volume_units: 5_000_000_000,
            passive_absorption_threshold: 0.60,
            price_efficiency_threshold: 0.35,
            expected_move_ticks_per_qty: 0.05,
            spread_impact_threshold: 2.0,
            institutional_volume_units: 1_000_000_000,
            institutional_volume_ratio_threshold: 0.40,
            require_institutional: false,
            ewma_lambda: 0.90,
            lookback_trades: 64,
            final_confidence_required: 0.65,
            event_cooldown_ms: 30_000,
        }
    }
}

/// Exhaustion detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustionConfig {
    /// Minimum directional aggressive volume across confluence zones.
    pub min_agg_volume_units: i64,
    /// Ceiling on passive / (aggressive + passive) for the consumed side.
    pub passive_ratio_balance_threshold: f64,
    /// Floor on depleted-to-peak passive ratio.
    pub exhaustion_threshold: f64,
    /// Passive observations retained per zone side.
    pub depletion_window: usize,
    /// Relative increase treated as a refill rather than noise.
    pub refill_tolerance: f64,
    /// Refills tolerated before the decline stops counting as monotone.
    pub max_refills: usize,
    pub final_confidence_required: f64,
    pub event_cooldown_ms: i64,
}

impl Default for ExhaustionConfig {
    fn default() -> Self {
        Self {
            min_agg_volume_units: 10_000_000_000,
            passive_ratio_balance_threshold: 0.30,
            exhaustion_threshold: 0.75,
            depletion_window: 32,
            refill_tolerance: 0.10,
            max_refills: 1,
            final_confidence_required: 0.70,
            event_cooldown_ms: 60_000,
        }
    }
}

/// Accumulation / distribution zone detector thresholds. One instance of the
/// detector runs per mode; both read the same config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulationConfig {
    /// Candidate lifetime before promotion is possible.
    pub min_duration_ms: i64,
    /// Total volume floor, in quantity units.
    pub min_zone_volume_units: i64,
    pub min_trade_count: u64,
    /// Price range ceiling as a fraction of price.
    pub max_zone_width_pct: f64,
    /// Accumulation: buy_volume / total floor.
    pub min_buy_ratio: f64,
    /// Distribution: sell_volume / total floor.
    pub min_sell_ratio: f64,
    /// Average order size, in units, counting as institutional.
    pub institutional_order_units: i64,
    /// Candidate must have traded within this window at promotion time.
    pub min_recent_activity_ms: i64,
    /// Merge tolerance as a fraction of price (percentage variant chosen;
    /// the absolute-price variant from older code paths is not carried).
    pub merge_tolerance_pct: f64,
    /// Active zones idle past this are invalidated.
    pub zone_timeout_ms: i64,
    /// |Δstrength| triggering a zone_update event.
    pub strength_change_threshold: f64,
    pub final_confidence_required: f64,
    pub event_cooldown_ms: i64,
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: 10_000,
            min_zone_volume_units: 30_000_000_000,
            min_trade_count: 10,
            max_zone_width_pct: 0.002,
            min_buy_ratio: 0.58,
            min_sell_ratio: 0.58,
            institutional_order_units: 2_000_000_000,
            min_recent_activity_ms: 30_000,
            merge_tolerance_pct: 0.0005,
            zone_timeout_ms: 300_000,
            strength_change_threshold: 0.15,
            final_confidence_required: 0.60,
            event_cooldown_ms: 60_000,
        }
    }
}

/// Passive-volume source for the CVD delta contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassiveSource {
    /// Zone-passive volume on the aggression side (canonical choice).
    ZonePassive,
    /// Best-quote passive at the trade price, kept for A/B comparison.
    BestQuote,
}

/// CVD confirmation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvdMode {
    Momentum,
    Divergence,
    Hybrid,
}

/// CVD / delta-confirmation detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvdConfig {
    /// Rolling delta windows, shortest first.
    pub windows_sec: Vec<u32>,
    /// |z| floor on the shortest window for momentum.
    pub min_z: f64,
    /// Delta/price correlation floor for momentum.
    pub strong_correlation_threshold: f64,
    /// Correlation ceiling signalling divergence.
    pub divergence_threshold: f64,
    /// Lookback for the divergence correlation.
    pub divergence_lookback_sec: u32,
    /// Volume surge floor versus baseline for momentum.
    pub volume_surge_multiplier: f64,
    /// Baseline horizon for the surge comparison.
    pub baseline_window_sec: u32,
    /// Samples required before any statistic is valid.
    pub min_samples_for_stats: usize,
    pub min_z_score_bound: f64,
    pub max_z_score_bound: f64,
    /// Whether passive volume contributes to the delta.
    pub use_passive_volume: bool,
    pub passive_source: PassiveSource,
    /// Weight of the passive contribution when enabled.
    pub passive_volume_weight: f64,
    pub mode: CvdMode,
    pub final_confidence_required: f64,
    pub event_cooldown_ms: i64,
}

impl Default for CvdConfig {
    fn default() -> Self {
        Self {
            windows_sec: vec![60, 300, 900],
            min_z: 2.0,
            strong_correlation_threshold: 0.70,
            divergence_threshold: 0.10,
            divergence_lookback_sec: 300,
            volume_surge_multiplier: 2.5,
            baseline_window_sec: 900,
            min_samples_for_stats: 30,
            min_z_score_bound: -8.0,
            max_z_score_bound: 8.0,
            use_passive_volume: false,
            passive_source: PassiveSource::ZonePassive,
            passive_volume_weight: 0.25,
            mode: CvdMode::Hybrid,
            final_confidence_required: 0.60,
            event_cooldown_ms: 45_000,
        }
    }
}

/// Traditional-indicator gate knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub enabled: bool,
    pub vwap_window_ms: i64,
    /// Tolerated adverse distance from VWAP as a fraction of price.
    pub vwap_band_pct: f64,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    /// Bid/ask imbalance below this filters buy candidates; its reciprocal
    /// filters sells.
    pub imbalance_min_ratio: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vwap_window_ms: 300_000,
            vwap_band_pct: 0.002,
            rsi_period: 14,
            rsi_overbought: 75.0,
            rsi_oversold: 25.0,
            imbalance_min_ratio: 0.5,
        }
    }
}

/// Market-health monitor knobs. `volatility_lookback_sec` is the one
/// canonical volatility horizon; the signal manager's regime classification
/// reads the same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub volatility_lookback_sec: u32,
    /// Long-horizon multiple of the lookback used as the volatility baseline.
    pub baseline_multiple: u32,
    pub vol_ratio_caution: f64,
    pub vol_ratio_halt: f64,
    /// Spread expansion versus baseline triggering caution/halt.
    pub spread_multiplier_caution: f64,
    pub spread_multiplier_halt: f64,
    /// One-sided flow share triggering caution.
    pub flow_imbalance_caution: f64,
    /// Band depth drain fraction versus baseline triggering halt.
    pub depth_drain_halt: f64,
    /// Band depth below this fraction of its median flags a liquidity void.
    pub void_depth_fraction: f64,
    pub min_samples: usize,
    /// Anomaly memory window.
    pub anomaly_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            volatility_lookback_sec: 60,
            baseline_multiple: 10,
            vol_ratio_caution: 2.0,
            vol_ratio_halt: 4.0,
            spread_multiplier_caution: 3.0,
            spread_multiplier_halt: 10.0,
            flow_imbalance_caution: 0.85,
            depth_drain_halt: 0.80,
            void_depth_fraction: 0.20,
            min_samples: 20,
            anomaly_window: 32,
        }
    }
}

/// One f64 per signal kind; used for confidence floors and for the
/// priority-matrix regime rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindTable {
    pub absorption: f64,
    pub exhaustion: f64,
    pub accumulation: f64,
    pub distribution: f64,
    pub cvd_confirmation: f64,
}

impl KindTable {
    pub fn get(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::Absorption => self.absorption,
            SignalKind::Exhaustion => self.exhaustion,
            SignalKind::Accumulation => self.accumulation,
            SignalKind::Distribution => self.distribution,
            SignalKind::CvdConfirmation => self.cvd_confirmation,
        }
    }
}

/// Default per-kind confidence floors for signal admission.
impl Default for KindTable {
    fn default() -> Self {
        Self {
            absorption: 0.65,
            exhaustion: 0.70,
            accumulation: 0.60,
            distribution: 0.60,
            cvd_confirmation: 0.60,
        }
    }
}

/// Regime weights in [0,1] per signal kind. High-volatility regimes favor
/// CVD/exhaustion; low-volatility favors absorption and zone signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityMatrix {
    pub high_volatility: KindTable,
    pub low_volatility: KindTable,
    pub balanced: KindTable,
}

impl Default for PriorityMatrix {
    fn default() -> Self {
        Self {
            high_volatility: KindTable {
                absorption: 0.5,
                exhaustion: 1.0,
                accumulation: 0.4,
                distribution: 0.4,
                cvd_confirmation: 1.0,
            },
            low_volatility: KindTable {
                absorption: 1.0,
                exhaustion: 0.6,
                accumulation: 0.9,
                distribution: 0.9,
                cvd_confirmation: 0.5,
            },
            balanced: KindTable {
                absorption: 0.8,
                exhaustion: 0.8,
                accumulation: 0.7,
                distribution: 0.7,
                cvd_confirmation: 0.8,
            },
        }
    }
}

/// Conflict-resolution policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    pub enabled: bool,
    /// Window within which opposite-side signals at the same price conflict.
    pub minimum_separation_ms: i64,
    pub price_tolerance_ticks: i64,
    /// Multiplier applied to the loser's confidence.
    pub contradiction_penalty_factor: f64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_separation_ms: 10_000,
            price_tolerance_ticks: 20,
            contradiction_penalty_factor: 0.5,
        }
    }
}

/// Signal manager knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalManagerConfig {
    pub confidence_floors: KindTable,
    /// Queued signals older than this are dropped at processing time.
    pub signal_timeout_ms: i64,
    pub max_queue_size: usize,
    pub processing_batch_size: usize,
    pub backpressure_threshold: usize,
    pub adaptive_batch_sizing: bool,
    pub max_adaptive_batch_size: usize,
    /// Final priority above this bypasses queue ordering entirely.
    pub high_priority_bypass_threshold: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_ms: i64,
    /// Per-side minimum interval between dispatches.
    pub signal_throttle_ms: i64,
    /// Signals within this window may be correlated together.
    pub correlation_window_ms: i64,
    /// Priority boost per second of queue wait, so no kind starves.
    pub aging_priority_per_sec: f64,
    pub priority_matrix: PriorityMatrix,
    pub conflict: ConflictConfig,
    /// Regime boundaries on the health monitor's volatility ratio.
    pub high_volatility_ratio: f64,
    pub low_volatility_ratio: f64,
    /// When true, degraded market health suppresses momentum-style signals.
    pub respect_market_health: bool,
}

impl Default for SignalManagerConfig {
    fn default() -> Self {
        Self {
            confidence_floors: KindTable::default(),
            signal_timeout_ms: 30_000,
            max_queue_size: 5_000,
            processing_batch_size: 32,
            backpressure_threshold: 4_000,
            adaptive_batch_sizing: true,
            max_adaptive_batch_size: 256,
            high_priority_bypass_threshold: 0.85,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_ms: 30_000,
            signal_throttle_ms: 5_000,
            correlation_window_ms: 15_000,
            aging_priority_per_sec: 0.01,
            priority_matrix: PriorityMatrix::default(),
            conflict: ConflictConfig::default(),
            high_volatility_ratio: 2.0,
            low_volatility_ratio: 0.75,
            respect_market_health: true,
        }
    }
}

/// The complete, immutable engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbol: SymbolConfig,
    pub book: BookConfig,
    pub preprocessor: PreprocessorConfig,
    pub confluence: ZoneConfluenceConfig,
    pub absorption: AbsorptionConfig,
    pub exhaustion: ExhaustionConfig,
    pub accumulation: AccumulationConfig,
    pub cvd: CvdConfig,
    pub indicators: IndicatorConfig,
    pub health: HealthConfig,
    pub signals: SignalManagerConfig,
}

impl EngineConfig {
    /// Production construction: sequence validation is always on.
    pub fn new(symbol: SymbolConfig) -> Self {
        Self {
            symbol,
            ..Default::default()
        }
    }

    /// Test construction: the only path that can relax the book's sequence
    /// protocol, so the flag cannot leak into production wiring.
    pub fn for_tests(disable_sequence_validation: bool) -> Self {
        let mut cfg = Self::default();
        cfg.book.disable_sequence_validation = disable_sequence_validation;
        cfg
    }

    pub fn sequence_validation_disabled(&self) -> bool {
        self.book.disable_sequence_validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.book.max_error_rate > 0.0 && cfg.book.max_error_rate < 1.0);
        assert!(cfg.signals.backpressure_threshold < cfg.signals.max_queue_size);
        assert!(cfg.cvd.windows_sec.windows(2).all(|w| w[0] < w[1]));
        assert!(!cfg.sequence_validation_disabled());
    }

    #[test]
    fn test_for_tests_is_only_escape_hatch() {
        let cfg = EngineConfig::new(SymbolConfig::default());
        assert!(!cfg.sequence_validation_disabled());
        let cfg = EngineConfig::for_tests(true);
        assert!(cfg.sequence_validation_disabled());
    }

    #[test]
    fn test_confidence_floor_lookup() {
        let floors = KindTable::default();
        assert_eq!(floors.get(SignalKind::Exhaustion), 0.70);
        assert_eq!(floors.get(SignalKind::CvdConfirmation), 0.60);
    }
}
