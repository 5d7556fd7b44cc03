//! Order book state machine.
//!
//! Maintains a synchronized L2 book from one snapshot plus a sequenced diff
//! stream. Update handling follows the exchange sequence contract:
//! - `u <= last_update_id`: stale event, discard (counted)
//! - `U > last_update_id + 1`: gap, quarantine the book and request a snapshot
//! - otherwise: apply every level; quantity 0 removes the level
//!
//! A crossed book after an apply quarantines the book as well. While
//! quarantined (or while the error-rate circuit breaker is open) updates are
//! buffered, bounded, and replayed once a clean snapshot lands.

use crate::config::BookConfig;
use crate::error::{BookError, ParseError};
use crate::numerics::SymbolScale;
use crate::types::{DepthUpdateEvent, SnapshotResponse};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error, info, warn};

/// One price level. At most one side is non-zero at a time; both sides
/// populated at one price is a crossed-level protocol error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub bid_units: i64,
    pub ask_units: i64,
    pub last_update_ms: i64,
}

/// A depth diff already parsed into fixed point.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    pub first_update_id: i64,
    pub final_update_id: i64,
    pub event_time_ms: i64,
    pub bids: Vec<(i64, i64)>,
    pub asks: Vec<(i64, i64)>,
}

impl DepthUpdate {
    /// Parse a wire event. Fails whole: a single malformed level drops the
    /// entire update so it is never partially applied.
    pub fn parse(ev: &DepthUpdateEvent, scale: &SymbolScale) -> Result<Self, ParseError> {
        let mut bids = Vec::with_capacity(ev.bids.len());
        for [price, qty] in &ev.bids {
            bids.push((scale.parse_price(price)?, scale.parse_qty(qty)?));
        }
        let mut asks = Vec::with_capacity(ev.asks.len());
        for [price, qty] in &ev.asks {
            asks.push((scale.parse_price(price)?, scale.parse_qty(qty)?));
        }
        Ok(Self {
            first_update_id: ev.first_update_id,
            final_update_id: ev.final_update_id,
            event_time_ms: ev.event_time,
            bids,
            asks,
        })
    }
}

/// Outcome of integrating one depth update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// `u <= last_update_id`: discarded and counted.
    StaleDiscarded,
    /// Book is out-of-sync or breaker-open; the update was buffered.
    Buffered,
    /// A gap was detected by this update; the book is now out-of-sync.
    GapDetected,
    /// The update crossed the book; the offending side was dropped and the
    /// book marked for resync.
    CrossedDetected,
}

/// Read-only health snapshot of the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookHealth {
    pub initialized: bool,
    pub recovering: bool,
    pub circuit_breaker_open: bool,
    pub error_rate: f64,
    pub last_update_age_ms: i64,
}

/// Counters surfaced for observability; every drop is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookStats {
    pub updates_applied: u64,
    pub stale_discarded: u64,
    pub gaps_detected: u64,
    pub crossed_detected: u64,
    pub buffered_updates: u64,
    pub buffered_dropped: u64,
    pub levels_pruned: u64,
    pub snapshots_applied: u64,
}

pub struct OrderBookState {
    symbol: String,
    cfg: BookConfig,
    levels: BTreeMap<i64, Level>,
    last_update_id: i64,
    last_event_ms: i64,
    initialized: bool,
    out_of_sync: bool,
    snapshot_requested: bool,
    breaker_open: bool,
    breaker_opened_ms: i64,
    buffered: VecDeque<DepthUpdate>,
    /// (timestamp_ms, was_error) event log for the rolling error rate.
    event_log: VecDeque<(i64, bool)>,
    last_prune_ms: i64,
    stats: BookStats,
}

impl OrderBookState {
    pub fn new(symbol: &str, cfg: BookConfig) -> Self {
        Self {
            symbol: symbol.to_string(),
            cfg,
            levels: BTreeMap::new(),
            last_update_id: 0,
            last_event_ms: 0,
            initialized: false,
            out_of_sync: false,
            snapshot_requested: false,
            breaker_open: false,
            breaker_opened_ms: 0,
            buffered: VecDeque::new(),
            event_log: VecDeque::new(),
            last_prune_ms: 0,
            stats: BookStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    pub fn is_synced(&self) -> bool {
        self.initialized && !self.out_of_sync && !self.breaker_open
    }

    /// Whether the recovery path should request a fresh snapshot. Reading
    /// this arms the request latch so the engine asks exactly once per
    /// incident.
    pub fn take_snapshot_request(&mut self) -> bool {
        if self.snapshot_requested {
            self.snapshot_requested = false;
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> BookStats {
        self.stats
    }

    /// Integrate one incremental diff per the sequence protocol.
    pub fn apply_depth_update(&mut self, update: DepthUpdate, now_ms: i64) -> ApplyOutcome {
        if !self.initialized {
            self.buffer_update(update);
            self.request_snapshot("uninitialized");
            return ApplyOutcome::Buffered;
        }

        if self.breaker_open {
            self.maybe_reset_breaker(now_ms);
            if self.breaker_open {
                self.buffer_update(update);
                return ApplyOutcome::Buffered;
            }
        }

        if self.out_of_sync {
            self.buffer_update(update);
            return ApplyOutcome::Buffered;
        }

        if !self.cfg.disable_sequence_validation {
            // Case 1: stale (u <= last_update_id) — discard silently, counted.
            if update.final_update_id <= self.last_update_id {
                debug!(
                    symbol = %self.symbol,
                    update_u = update.final_update_id,
                    last_id = self.last_update_id,
                    "Discarding stale depth update"
                );
                self.stats.stale_discarded += 1;
                self.record_event(now_ms, true);
                return ApplyOutcome::StaleDiscarded;
            }

            // Case 2: gap (U > last_update_id + 1) — quarantine and recover.
            if update.first_update_id > self.last_update_id + 1 {
                let err = BookError::SequenceGap {
                    expected: self.last_update_id + 1,
                    got: update.first_update_id,
                };
                error!(
                    symbol = %self.symbol,
                    expected = self.last_update_id + 1,
                    received_first = update.first_update_id,
                    received_final = update.final_update_id,
                    error_type = err.error_type(),
                    "Gap in depth updates detected, entering recovery"
                );
                self.stats.gaps_detected += 1;
                self.record_event(now_ms, true);
                self.out_of_sync = true;
                self.buffer_update(update);
                self.request_snapshot("sequence_gap");
                return ApplyOutcome::GapDetected;
            }
        }

        // Case 3: in-sequence — apply every level.
        let outcome = self.apply_levels(&update, now_ms);
        self.last_update_id = update.final_update_id;
        self.last_event_ms = update.event_time_ms.max(self.last_event_ms);
        self.record_event(now_ms, outcome == ApplyOutcome::CrossedDetected);
        if outcome == ApplyOutcome::Applied {
            self.stats.updates_applied += 1;
        }
        self.maybe_prune(now_ms);
        outcome
    }

    /// Apply bid/ask level writes and run the crossed-book check.
    fn apply_levels(&mut self, update: &DepthUpdate, now_ms: i64) -> ApplyOutcome {
        for &(price, qty) in &update.bids {
            self.set_level(price, qty, true, now_ms);
        }
        for &(price, qty) in &update.asks {
            self.set_level(price, qty, false, now_ms);
        }

        if let (Some((bid, _)), Some((ask, _))) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                let err = BookError::CrossedBook {
                    bid_ticks: bid,
                    ask_ticks: ask,
                };
                error!(
                    symbol = %self.symbol,
                    best_bid = bid,
                    best_ask = ask,
                    error_type = err.error_type(),
                    "Crossed book after update, dropping offending bids and requesting snapshot"
                );
                // Drop the crossing portion of the incoming side so reads
                // stay usable while the snapshot is in flight.
                let crossing: Vec<i64> = self
                    .levels
                    .range(ask..)
                    .filter(|(_, l)| l.bid_units > 0)
                    .map(|(p, _)| *p)
                    .collect();
                for p in crossing {
                    if let Some(level) = self.levels.get_mut(&p) {
                        level.bid_units = 0;
                        if level.ask_units == 0 {
                            self.levels.remove(&p);
                        }
                    }
                }
                self.stats.crossed_detected += 1;
                self.out_of_sync = true;
                self.request_snapshot("crossed_book");
                return ApplyOutcome::CrossedDetected;
            }
        }
        ApplyOutcome::Applied
    }

    fn set_level(&mut self, price_ticks: i64, qty_units: i64, is_bid: bool, now_ms: i64) {
        if qty_units == 0 {
            if let Some(level) = self.levels.get_mut(&price_ticks) {
                if is_bid {
                    level.bid_units = 0;
                } else {
                    level.ask_units = 0;
                }
                if level.bid_units == 0 && level.ask_units == 0 {
                    self.levels.remove(&price_ticks);
                }
            }
            return;
        }
        let level = self.levels.entry(price_ticks).or_default();
        if is_bid {
            level.bid_units = qty_units;
            // One side per price: a bid landing on a populated ask level
            // supersedes it; the crossed-book check right after the apply
            // decides whether the whole update was coherent.
            if level.ask_units > 0 {
                level.ask_units = 0;
            }
        } else {
            level.ask_units = qty_units;
            if level.bid_units > 0 {
                level.bid_units = 0;
            }
        }
        level.last_update_ms = now_ms;
    }

    /// Replace the book from a snapshot, then replay buffered updates whose
    /// range lands after the snapshot id. Out-of-range buffers are discarded.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &SnapshotResponse,
        scale: &SymbolScale,
        now_ms: i64,
    ) -> Result<(), ParseError> {
        // Parse everything before touching state: a malformed snapshot must
        // not leave a half-replaced book.
        let mut bids = Vec::with_capacity(snapshot.bids.len());
        for (price, qty) in &snapshot.bids {
            bids.push((scale.parse_price(price)?, scale.parse_qty(qty)?));
        }
        let mut asks = Vec::with_capacity(snapshot.asks.len());
        for (price, qty) in &snapshot.asks {
            asks.push((scale.parse_price(price)?, scale.parse_qty(qty)?));
        }

        self.levels.clear();
        for (price, qty) in bids {
            if qty > 0 {
                self.levels.insert(
                    price,
                    Level {
                        bid_units: qty,
                        ask_units: 0,
                        last_update_ms: now_ms,
                    },
                );
            }
        }
        for (price, qty) in asks {
            if qty > 0 {
                let level = self.levels.entry(price).or_default();
                level.ask_units = qty;
                level.last_update_ms = now_ms;
            }
        }

        self.last_update_id = snapshot.last_update_id;
        self.last_event_ms = now_ms;
        self.initialized = true;
        self.out_of_sync = false;
        self.snapshot_requested = false;
        self.stats.snapshots_applied += 1;

        if self.breaker_open && now_ms - self.breaker_opened_ms >= self.cfg.circuit_cooldown_ms {
            info!(symbol = %self.symbol, "Circuit breaker reset after clean snapshot");
            self.breaker_open = false;
            self.event_log.clear();
        }

        // Replay buffered updates overlapping the snapshot correctly.
        let buffered: Vec<DepthUpdate> = self.buffered.drain(..).collect();
        let mut replayed = 0usize;
        for update in buffered {
            if update.final_update_id <= self.last_update_id {
                self.stats.buffered_dropped += 1;
                continue;
            }
            if update.first_update_id > self.last_update_id + 1 {
                // Beyond the snapshot horizon; replay cannot bridge it.
                self.stats.buffered_dropped += 1;
                continue;
            }
            self.apply_depth_update(update, now_ms);
            replayed += 1;
        }

        info!(
            symbol = %self.symbol,
            update_id = self.last_update_id,
            levels = self.levels.len(),
            replayed,
            "Order book rebuilt from snapshot"
        );
        Ok(())
    }

    fn buffer_update(&mut self, update: DepthUpdate) {
        if self.buffered.len() >= self.cfg.max_buffered_updates {
            self.buffered.pop_front();
            self.stats.buffered_dropped += 1;
        }
        self.buffered.push_back(update);
        self.stats.buffered_updates += 1;
    }

    fn request_snapshot(&mut self, reason: &str) {
        if !self.snapshot_requested {
            warn!(symbol = %self.symbol, reason, "Requesting order book snapshot");
            self.snapshot_requested = true;
        }
    }

    /// Record an event in the rolling error window and open the breaker when
    /// the observed error rate exceeds the configured maximum.
    fn record_event(&mut self, now_ms: i64, was_error: bool) {
        self.event_log.push_back((now_ms, was_error));
        let cutoff = now_ms - self.cfg.error_window_ms;
        while self.event_log.front().is_some_and(|(t, _)| *t < cutoff) {
            self.event_log.pop_front();
        }
        if self.breaker_open || self.event_log.len() < self.cfg.min_events_for_rate {
            return;
        }
        let errors = self.event_log.iter().filter(|(_, e)| *e).count();
        let rate = errors as f64 / self.event_log.len() as f64;
        if rate > self.cfg.max_error_rate {
            error!(
                symbol = %self.symbol,
                error_rate = rate,
                max_error_rate = self.cfg.max_error_rate,
                "Error rate exceeded, opening book circuit breaker"
            );
            self.breaker_open = true;
            self.breaker_opened_ms = now_ms;
            self.request_snapshot("circuit_breaker");
        }
    }

    fn maybe_reset_breaker(&mut self, now_ms: i64) {
        // The breaker only closes via a clean snapshot after the cool-down;
        // see apply_snapshot. Here we just re-arm the snapshot request in
        // case the previous one was lost.
        if now_ms - self.breaker_opened_ms >= self.cfg.circuit_cooldown_ms {
            self.request_snapshot("circuit_breaker_cooldown");
        }
    }

    /// Periodic pruning: distance from mid, staleness, then overall cap.
    fn maybe_prune(&mut self, now_ms: i64) {
        if now_ms - self.last_prune_ms < self.cfg.prune_interval_ms {
            return;
        }
        self.last_prune_ms = now_ms;
        let Some(mid) = self.mid_ticks() else {
            return;
        };

        let stale_cutoff = now_ms - self.cfg.stale_threshold_ms;
        let max_distance = self.cfg.max_price_distance_ticks;
        let before = self.levels.len();
        self.levels.retain(|price, level| {
            (price - mid).abs() <= max_distance && level.last_update_ms >= stale_cutoff
        });

        if self.levels.len() > self.cfg.max_levels {
            let mut by_distance: Vec<(i64, i64)> = self
                .levels
                .keys()
                .map(|p| ((p - mid).abs(), *p))
                .collect();
            by_distance.sort_unstable();
            let evict: Vec<i64> = by_distance
                .split_off(self.cfg.max_levels)
                .into_iter()
                .map(|(_, p)| p)
                .collect();
            for p in evict {
                self.levels.remove(&p);
            }
        }

        let pruned = before.saturating_sub(self.levels.len());
        if pruned > 0 {
            self.stats.levels_pruned += pruned as u64;
            debug!(symbol = %self.symbol, pruned, retained = self.levels.len(), "Pruned book levels");
        }
    }

    // ── Read-only views ──

    pub fn best_bid(&self) -> Option<(i64, i64)> {
        self.levels
            .iter()
            .rev()
            .find(|(_, l)| l.bid_units > 0)
            .map(|(p, l)| (*p, l.bid_units))
    }

    pub fn best_ask(&self) -> Option<(i64, i64)> {
        self.levels
            .iter()
            .find(|(_, l)| l.ask_units > 0)
            .map(|(p, l)| (*p, l.ask_units))
    }

    pub fn spread_ticks(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn mid_ticks(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / 2),
            _ => None,
        }
    }

    pub fn level(&self, price_ticks: i64) -> Option<Level> {
        self.levels.get(&price_ticks).copied()
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Sum passive volume over `center ± band` ticks: `(bid_units, ask_units)`.
    pub fn sum_band(&self, center_ticks: i64, band_ticks: i64) -> (i64, i64) {
        let mut bid = 0i64;
        let mut ask = 0i64;
        for (_, level) in self
            .levels
            .range(center_ticks - band_ticks..=center_ticks + band_ticks)
        {
            bid += level.bid_units;
            ask += level.ask_units;
        }
        (bid, ask)
    }

    pub fn health(&self, now_ms: i64) -> BookHealth {
        let errors = self.event_log.iter().filter(|(_, e)| *e).count();
        let error_rate = if self.event_log.is_empty() {
            0.0
        } else {
            errors as f64 / self.event_log.len() as f64
        };
        BookHealth {
            initialized: self.initialized,
            recovering: self.out_of_sync,
            circuit_breaker_open: self.breaker_open,
            error_rate,
            last_update_age_ms: if self.last_event_ms > 0 {
                now_ms - self.last_event_ms
            } else {
                i64::MAX
            },
        }
    }
}
