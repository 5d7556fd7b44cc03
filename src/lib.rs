//! Real-time orderflow analytics engine for a spot trading pair.
//!
//! Ingests aggregated trade executions and sequenced order-book depth
//! diffs, maintains a synchronized L2 book and per-zone orderflow
//! aggregates, runs a set of stateful microstructure detectors (absorption,
//! exhaustion, accumulation, distribution, CVD confirmation) over the
//! enriched-trade stream, and funnels signal candidates through a
//! prioritized, backpressured signal manager.
//!
//! Architecture: one synchronous data path per symbol (preprocessor ->
//! detectors -> manager), wrapped in isolated workers that exchange
//! serializable messages only. Exchange connectivity, persistence, and
//! dashboards are external collaborators.

pub mod book;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod health;
pub mod indicators;
pub mod numerics;
pub mod preprocess;
pub mod rolling;
pub mod signal;
pub mod types;
pub mod zones;

pub use book::{ApplyOutcome, BookHealth, OrderBookState};
pub use config::{EngineConfig, SymbolConfig};
pub use engine::{
    run_market_worker, run_signal_worker, EngineEvent, MarketDataEngine, SignalWorker,
    WorkerMessage,
};
pub use error::{BookError, ParseError, RecoveryError, SignalError};
pub use health::{MarketHealth, MarketHealthMonitor, Recommendation};
pub use preprocess::TradePreprocessor;
pub use signal::{Regime, SignalManager, SubmitOutcome};
pub use types::{
    AggTradeEvent, DepthUpdateEvent, EnrichedTrade, Side, SignalCandidate, SignalKind,
    SnapshotResponse, Trade, ZoneEvent,
};
pub use zones::{ZoneSnapshot, ZoneStore};
