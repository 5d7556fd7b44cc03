//! Engine assembly and worker isolation.
//!
//! The per-trade data path is synchronous and runs to completion: raw trade
//! -> preprocessor -> every detector -> candidate emission. Workers are
//! isolated processes-in-miniature communicating only by serializable
//! messages over channels: the market-data worker owns the book, zones,
//! preprocessor, and detectors; the signal worker owns the signal manager.
//! Internal time is the maximum observed event timestamp, never the wall
//! clock, so replaying a stream reproduces identical output.

use crate::book::{ApplyOutcome, BookHealth, DepthUpdate, OrderBookState};
use crate::config::EngineConfig;
use crate::detectors::{
    AbsorptionDetector, CvdDetector, Detector, DetectorContext, DetectorEvent, ExhaustionDetector,
    ZoneAccumulationDetector, ZoneMode,
};
use crate::health::{MarketHealth, MarketHealthMonitor};
use crate::indicators::IndicatorGate;
use crate::numerics::SymbolScale;
use crate::preprocess::{PreprocessStats, TradePreprocessor};
use crate::signal::{SignalManager, SignalStats, SubmitOutcome};
use crate::types::{
    AggTradeEvent, DepthUpdateEvent, EnrichedTrade, SignalCandidate, SnapshotResponse, ZoneEvent,
};
use crate::zones::ZoneStore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Cadence for batching health/metrics emission toward other workers.
const HEALTH_EMIT_INTERVAL_MS: i64 = 100;

/// Inbound messages to the market-data worker. Serializable records only;
/// workers share no memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Trade(AggTradeEvent),
    Depth(DepthUpdateEvent),
    Snapshot(SnapshotResponse),
    Shutdown,
}

/// Outbound events from the market-data worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Enriched(Box<EnrichedTrade>),
    Candidate(Box<SignalCandidate>),
    Zone(ZoneEvent),
    /// The book needs a fresh snapshot; the exchange collaborator answers
    /// with a `WorkerMessage::Snapshot` before the deadline or health
    /// degrades.
    SnapshotRequest { symbol: String, deadline_ms: i64 },
    Health(MarketHealth),
}

/// Market-data worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub trades_in: u64,
    pub depth_updates_in: u64,
    pub snapshots_applied: u64,
    pub snapshot_requests: u64,
    pub candidates_emitted: u64,
    pub zone_events_emitted: u64,
    pub depth_parse_errors: u64,
}

/// The synchronous core of the market-data worker: book, zones,
/// preprocessor, detector set, and health monitor for one symbol.
pub struct MarketDataEngine {
    config: EngineConfig,
    scale: SymbolScale,
    book: OrderBookState,
    zones: ZoneStore,
    preprocessor: TradePreprocessor,
    indicators: IndicatorGate,
    detectors: Vec<Box<dyn Detector>>,
    health: MarketHealthMonitor,
    last_health: MarketHealth,
    last_health_emit_ms: i64,
    last_snapshot_ms: i64,
    clock_ms: i64,
    stats: EngineStats,
}

impl MarketDataEngine {
    pub fn new(config: EngineConfig) -> Self {
        let scale = SymbolScale::new(
            config.symbol.tick_size,
            config.symbol.price_precision,
            config.symbol.quantity_precision,
        );
        let detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(AbsorptionDetector::new(&config)),
            Box::new(ExhaustionDetector::new(&config)),
            Box::new(ZoneAccumulationDetector::new(ZoneMode::Accumulation, &config)),
            Box::new(ZoneAccumulationDetector::new(ZoneMode::Distribution, &config)),
            Box::new(CvdDetector::new(&config)),
        ];
        Self {
            book: OrderBookState::new(&config.symbol.symbol, config.book.clone()),
            zones: ZoneStore::new(&config.preprocessor),
            preprocessor: TradePreprocessor::new(scale.clone(), config.preprocessor.clone()),
            indicators: IndicatorGate::new(config.indicators.clone()),
            health: MarketHealthMonitor::new(config.health.clone()),
            last_health: MarketHealth::warming_up(),
            last_health_emit_ms: 0,
            last_snapshot_ms: 0,
            clock_ms: 0,
            detectors,
            scale,
            config,
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn preprocess_stats(&self) -> PreprocessStats {
        self.preprocessor.stats()
    }

    pub fn book_health(&self) -> BookHealth {
        self.book.health(self.clock_ms)
    }

    pub fn market_health(&self) -> &MarketHealth {
        &self.last_health
    }

    fn advance_clock(&mut self, event_time_ms: i64) {
        self.clock_ms = self.clock_ms.max(event_time_ms);
    }

    /// Integrate one depth diff; emits a snapshot request on gap, cross, or
    /// breaker trip.
    pub fn on_depth_event(&mut self, ev: &DepthUpdateEvent) -> Vec<EngineEvent> {
        self.advance_clock(ev.event_time);
        self.stats.depth_updates_in += 1;
        let mut events = Vec::new();

        match DepthUpdate::parse(ev, &self.scale) {
            Ok(update) => {
                let outcome = self.book.apply_depth_update(update, self.clock_ms);
                debug!(
                    symbol = %self.config.symbol.symbol,
                    first = ev.first_update_id,
                    last = ev.final_update_id,
                    ?outcome,
                    "Processed depth update"
                );
                if outcome == ApplyOutcome::GapDetected || outcome == ApplyOutcome::CrossedDetected
                {
                    debug_assert!(!self.book.is_synced());
                }
            }
            Err(e) => {
                self.stats.depth_parse_errors += 1;
                warn!(
                    symbol = %self.config.symbol.symbol,
                    error = %e,
                    "Dropping malformed depth update"
                );
            }
        }

        if self.book.take_snapshot_request() {
            self.stats.snapshot_requests += 1;
            events.push(EngineEvent::SnapshotRequest {
                symbol: self.config.symbol.symbol.clone(),
                deadline_ms: self.clock_ms + self.config.book.snapshot_deadline_ms,
            });
        } else if self.book.is_synced()
            && self.last_snapshot_ms > 0
            && self.clock_ms - self.last_snapshot_ms >= self.config.book.snapshot_interval_ms
        {
            // Proactive refresh on the configured cadence while healthy.
            self.last_snapshot_ms = self.clock_ms;
            self.stats.snapshot_requests += 1;
            events.push(EngineEvent::SnapshotRequest {
                symbol: self.config.symbol.symbol.clone(),
                deadline_ms: self.clock_ms + self.config.book.snapshot_deadline_ms,
            });
        }
        events
    }

    /// The exchange collaborator failed to answer a snapshot request before
    /// its deadline. The book stays quarantined (degraded health) and the
    /// request is re-armed; the collaborator retries with backoff.
    pub fn on_recovery_failure(&mut self, error: &crate::error::RecoveryError) -> Vec<EngineEvent> {
        warn!(
            symbol = %self.config.symbol.symbol,
            error = %error,
            retryable = error.is_retryable(),
            "Snapshot recovery failed, book health degraded"
        );
        self.stats.snapshot_requests += 1;
        vec![EngineEvent::SnapshotRequest {
            symbol: self.config.symbol.symbol.clone(),
            deadline_ms: self.clock_ms + self.config.book.snapshot_deadline_ms,
        }]
    }

    /// Rebuild the book from a snapshot response.
    pub fn on_snapshot(&mut self, snap: &SnapshotResponse) -> Vec<EngineEvent> {
        match self.book.apply_snapshot(snap, &self.scale, self.clock_ms) {
            Ok(()) => {
                self.stats.snapshots_applied += 1;
                self.last_snapshot_ms = self.clock_ms;
                Vec::new()
            }
            Err(e) => {
                warn!(
                    symbol = %self.config.symbol.symbol,
                    error = %e,
                    "Snapshot failed to parse, re-requesting"
                );
                self.stats.snapshot_requests += 1;
                vec![EngineEvent::SnapshotRequest {
                    symbol: self.config.symbol.symbol.clone(),
                    deadline_ms: self.clock_ms + self.config.book.snapshot_deadline_ms,
                }]
            }
        }
    }

    /// The synchronous per-trade chain: normalize, enrich, update health and
    /// indicators, run every detector, emit. A detector error affects only
    /// its own emission; the chain continues.
    pub fn on_trade_event(&mut self, ev: &AggTradeEvent) -> Vec<EngineEvent> {
        self.advance_clock(ev.event_time.max(ev.trade_time));
        self.stats.trades_in += 1;
        let mut events = Vec::new();

        let enriched = match self.preprocessor.process(ev, &self.book, &mut self.zones) {
            Ok(enriched) => enriched,
            // Already counted and logged by the preprocessor.
            Err(_) => return events,
        };

        let price = self.scale.ticks_to_f64(enriched.trade.price_ticks);
        let qty = self.scale.units_to_f64(enriched.trade.qty_units);
        self.health.update(&enriched, price, qty);
        self.indicators.update(&enriched, price, qty);

        let ctx = DetectorContext {
            config: &self.config,
            scale: &self.scale,
            indicators: &self.indicators,
        };
        for detector in &mut self.detectors {
            for event in detector.on_trade(&enriched, &ctx) {
                match event {
                    DetectorEvent::Signal(candidate) => {
                        self.stats.candidates_emitted += 1;
                        info!(
                            detector = %candidate.detector_id,
                            kind = candidate.kind.as_str(),
                            side = candidate.side.as_str(),
                            confidence = candidate.confidence,
                            correlation_id = %candidate.correlation_id,
                            "Signal candidate emitted"
                        );
                        events.push(EngineEvent::Candidate(Box::new(candidate)));
                    }
                    DetectorEvent::Zone(zone_event) => {
                        self.stats.zone_events_emitted += 1;
                        events.push(EngineEvent::Zone(zone_event));
                    }
                }
            }
        }

        // Health is batched toward other workers to bound IPC cost.
        if self.clock_ms - self.last_health_emit_ms >= HEALTH_EMIT_INTERVAL_MS {
            if let Ok(health) = self.health.assess(self.clock_ms) {
                self.last_health = health.clone();
                self.last_health_emit_ms = self.clock_ms;
                events.push(EngineEvent::Health(health));
            }
        }

        events.insert(0, EngineEvent::Enriched(Box::new(enriched)));
        events
    }

    /// Route one worker message. Returns `None` on shutdown.
    pub fn handle(&mut self, message: &WorkerMessage) -> Option<Vec<EngineEvent>> {
        match message {
            WorkerMessage::Trade(ev) => Some(self.on_trade_event(ev)),
            WorkerMessage::Depth(ev) => Some(self.on_depth_event(ev)),
            WorkerMessage::Snapshot(snap) => Some(self.on_snapshot(snap)),
            WorkerMessage::Shutdown => None,
        }
    }
}

/// The signal worker: owns the manager, classifies regime from the health
/// events the market worker batches over, and forwards accepted candidates
/// downstream.
pub struct SignalWorker {
    manager: SignalManager,
    last_health: MarketHealth,
    clock_ms: i64,
}

impl SignalWorker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            manager: SignalManager::new(config.signals.clone()),
            last_health: MarketHealth::warming_up(),
            clock_ms: 0,
        }
    }

    pub fn stats(&self) -> &SignalStats {
        self.manager.stats()
    }

    /// Handle one engine event, returning candidates ready for dispatch.
    pub fn handle(&mut self, event: EngineEvent) -> Vec<SignalCandidate> {
        let mut out = Vec::new();
        match event {
            EngineEvent::Candidate(candidate) => {
                self.clock_ms = self.clock_ms.max(candidate.timestamp_ms);
                match self
                    .manager
                    .submit(*candidate, &self.last_health, self.clock_ms)
                {
                    SubmitOutcome::DispatchedImmediately(processed) => {
                        out.push(processed.candidate);
                    }
                    SubmitOutcome::Enqueued | SubmitOutcome::Rejected(_) => {}
                }
                out.extend(
                    self.manager
                        .process_batch(self.clock_ms)
                        .into_iter()
                        .map(|p| p.candidate),
                );
            }
            EngineEvent::Health(health) => {
                self.last_health = health;
                out.extend(
                    self.manager
                        .process_batch(self.clock_ms)
                        .into_iter()
                        .map(|p| p.candidate),
                );
            }
            // Enriched trades and zone events pass through to dashboards;
            // the manager does not consume them.
            EngineEvent::Enriched(_) | EngineEvent::Zone(_) | EngineEvent::SnapshotRequest { .. } => {}
        }
        out
    }

    /// Drain everything still queued, used at shutdown.
    pub fn drain(&mut self) -> Vec<SignalCandidate> {
        let mut out = Vec::new();
        loop {
            let batch = self.manager.process_batch(self.clock_ms);
            if batch.is_empty() {
                break;
            }
            out.extend(batch.into_iter().map(|p| p.candidate));
        }
        out
    }
}

/// Run the market-data worker until a `Shutdown` message or channel close.
/// Per-trade processing is never pre-empted mid-event.
pub async fn run_market_worker(
    mut engine: MarketDataEngine,
    mut rx: mpsc::Receiver<WorkerMessage>,
    tx: mpsc::Sender<EngineEvent>,
) -> MarketDataEngine {
    info!(symbol = %engine.config.symbol.symbol, "Market-data worker started");
    while let Some(message) = rx.recv().await {
        let Some(events) = engine.handle(&message) else {
            info!(symbol = %engine.config.symbol.symbol, "Market-data worker shutting down");
            break;
        };
        for event in events {
            if tx.send(event).await.is_err() {
                warn!("Engine event receiver dropped, stopping market worker");
                return engine;
            }
        }
    }
    engine
}

/// Run the signal worker until the inbound channel closes, draining
/// in-flight work before exit.
pub async fn run_signal_worker(
    mut worker: SignalWorker,
    mut rx: mpsc::Receiver<EngineEvent>,
    tx: mpsc::Sender<SignalCandidate>,
) -> SignalWorker {
    info!("Signal worker started");
    while let Some(event) = rx.recv().await {
        for candidate in worker.handle(event) {
            if tx.send(candidate).await.is_err() {
                warn!("Signal receiver dropped, stopping signal worker");
                return worker;
            }
        }
    }
    for candidate in worker.drain() {
        let _ = tx.send(candidate).await;
    }
    info!("Signal worker drained and shut down");
    worker
}
