//! Signal manager: backpressured queue, priority matrix, conflict
//! resolution, throttling, correlation tracking, and dispatch.
//!
//! Accepts candidates from the detector set, filters by per-kind confidence
//! floors, correlates related signals, resolves contradictions by
//! confidence, and drains a bounded queue in priority order with mild aging
//! so no signal kind is starved under sustained load.

use crate::config::SignalManagerConfig;
use crate::error::SignalError;
use crate::health::{MarketHealth, Recommendation};
use crate::types::{Side, SignalCandidate, SignalKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Volatility regime for priority weighting; classified from the health
/// monitor's canonical volatility ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    HighVolatility,
    LowVolatility,
    Balanced,
}

impl Regime {
    pub fn classify(volatility_ratio: f64, cfg: &SignalManagerConfig) -> Self {
        if volatility_ratio >= cfg.high_volatility_ratio {
            Regime::HighVolatility
        } else if volatility_ratio <= cfg.low_volatility_ratio {
            Regime::LowVolatility
        } else {
            Regime::Balanced
        }
    }
}

/// A candidate accepted into the manager, with its computed priority and
/// correlation links.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedSignal {
    pub candidate: SignalCandidate,
    pub priority: f64,
    pub received_ms: i64,
    pub correlated_with: Vec<Uuid>,
}

/// Admission outcome for one submitted candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Enqueued,
    /// Priority exceeded the bypass threshold; dispatch immediately.
    DispatchedImmediately(Box<ProcessedSignal>),
    Rejected(SignalError),
}

/// Counters; every drop is counted with its reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub received: u64,
    pub confirmed: u64,
    pub bypass_dispatched: u64,
    pub rejected_below_confidence: u64,
    pub dropped_throttle: u64,
    pub dropped_backpressure: u64,
    pub dropped_conflict: u64,
    pub dropped_expired: u64,
    pub dropped_breaker: u64,
    pub dropped_health: u64,
    pub per_kind_received: HashMap<String, u64>,
    pub per_kind_dispatched: HashMap<String, u64>,
    /// EWMA of queue latency at dispatch, milliseconds.
    pub avg_dispatch_latency_ms: f64,
    pub batches_processed: u64,
}

/// Lightweight memory of recently accepted signals for throttle, conflict,
/// and correlation decisions.
#[derive(Debug, Clone)]
struct RecentSignal {
    id: Uuid,
    kind: SignalKind,
    side: Side,
    price_ticks: i64,
    confidence: f64,
    accepted_ms: i64,
}

pub struct SignalManager {
    cfg: SignalManagerConfig,
    queue: Vec<ProcessedSignal>,
    recent: VecDeque<RecentSignal>,
    throttle: HashMap<Side, i64>,
    consecutive_errors: u32,
    breaker_open_until: Option<i64>,
    stats: SignalStats,
}

impl SignalManager {
    pub fn new(cfg: SignalManagerConfig) -> Self {
        Self {
            cfg,
            queue: Vec::new(),
            recent: VecDeque::new(),
            throttle: HashMap::new(),
            consecutive_errors: 0,
            breaker_open_until: None,
            stats: SignalStats::default(),
        }
    }

    pub fn stats(&self) -> &SignalStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn breaker_open(&self, now_ms: i64) -> bool {
        self.breaker_open_until.is_some_and(|until| now_ms < until)
    }

    /// Final priority: static base x regime weight x confidence.
    pub fn priority_for(&self, candidate: &SignalCandidate, regime: Regime) -> f64 {
        let weights = match regime {
            Regime::HighVolatility => &self.cfg.priority_matrix.high_volatility,
            Regime::LowVolatility => &self.cfg.priority_matrix.low_volatility,
            Regime::Balanced => &self.cfg.priority_matrix.balanced,
        };
        candidate.kind.base_priority() * weights.get(candidate.kind) * candidate.confidence
    }

    /// Submit one candidate. Ordering at the queue follows arrival; dispatch
    /// may reorder by priority but never violates per-detector cooldowns
    /// (those were enforced upstream).
    pub fn submit(
        &mut self,
        candidate: SignalCandidate,
        health: &MarketHealth,
        now_ms: i64,
    ) -> SubmitOutcome {
        self.stats.received += 1;
        *self
            .stats
            .per_kind_received
            .entry(candidate.kind.as_str().to_string())
            .or_default() += 1;

        if self.breaker_open(now_ms) {
            let remaining = self.breaker_open_until.unwrap_or(now_ms) - now_ms;
            self.stats.dropped_breaker += 1;
            let err = SignalError::CircuitOpen {
                remaining_ms: remaining,
            };
            warn!(signal_id = %candidate.id, error_type = err.error_type(), "Signal dropped, breaker open");
            return SubmitOutcome::Rejected(err);
        }

        // Degraded market health suppresses momentum-style confirmation;
        // contrarian detectors keep flowing.
        if self.cfg.respect_market_health
            && health.recommendation == Recommendation::Halt
            && candidate.kind == SignalKind::CvdConfirmation
        {
            self.stats.dropped_health += 1;
            debug!(signal_id = %candidate.id, "CVD signal suppressed while market halted");
            return SubmitOutcome::Rejected(SignalError::HealthSuppressed {
                recommendation: "halt",
            });
        }

        let floor = self.cfg.confidence_floors.get(candidate.kind);
        let mut confidence = candidate.confidence;
        if confidence < floor {
            self.stats.rejected_below_confidence += 1;
            let err = SignalError::BelowConfidence {
                kind: candidate.kind.as_str(),
                confidence,
                floor,
            };
            debug!(signal_id = %candidate.id, error_type = err.error_type(), "Signal below confidence floor");
            return SubmitOutcome::Rejected(err);
        }

        // Per-side throttle.
        if let Some(last) = self.throttle.get(&candidate.side) {
            let elapsed = now_ms - last;
            if elapsed < self.cfg.signal_throttle_ms {
                self.stats.dropped_throttle += 1;
                let err = SignalError::Throttled {
                    side: candidate.side.as_str(),
                    elapsed_ms: elapsed,
                    throttle_ms: self.cfg.signal_throttle_ms,
                };
                debug!(signal_id = %candidate.id, error_type = err.error_type(), "Signal throttled");
                return SubmitOutcome::Rejected(err);
            }
        }

        self.evict_recent(now_ms);

        // Conflict resolution: contradictory signals (opposite side, same
        // price within tolerance, inside the separation window) resolve by
        // confidence; the loser is penalized and dropped if it sinks below
        // its floor.
        if self.cfg.conflict.enabled {
            let conflict = self
                .recent
                .iter()
                .filter(|r| {
                    now_ms - r.accepted_ms <= self.cfg.conflict.minimum_separation_ms
                        && r.side == candidate.side.opposite()
                        && (r.price_ticks - candidate.price_ticks).abs()
                            <= self.cfg.conflict.price_tolerance_ticks
                })
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .cloned();
            if let Some(winner) = conflict {
                if winner.confidence >= confidence {
                    confidence *= self.cfg.conflict.contradiction_penalty_factor;
                    if confidence < floor {
                        self.stats.dropped_conflict += 1;
                        let err = SignalError::ConflictLoser {
                            winner_kind: winner.kind.as_str(),
                            winner_confidence: winner.confidence,
                        };
                        debug!(
                            signal_id = %candidate.id,
                            winner_id = %winner.id,
                            error_type = err.error_type(),
                            "Signal lost conflict resolution"
                        );
                        return SubmitOutcome::Rejected(err);
                    }
                } else {
                    // Incoming wins: penalize the queued loser in place and
                    // drop it if it falls below its own floor.
                    self.penalize_queued(winner.id);
                }
            }
        }

        let regime = Regime::classify(health.volatility_ratio, &self.cfg);
        let mut candidate = candidate;
        candidate.confidence = confidence;
        let priority = self.priority_for(&candidate, regime);

        // Correlate with recent same-side signals in the window.
        let correlated_with: Vec<Uuid> = self
            .recent
            .iter()
            .filter(|r| {
                now_ms - r.accepted_ms <= self.cfg.correlation_window_ms
                    && r.side == candidate.side
            })
            .map(|r| r.id)
            .collect();

        self.remember(&candidate, now_ms);
        self.throttle.insert(candidate.side, now_ms);

        let processed = ProcessedSignal {
            candidate,
            priority,
            received_ms: now_ms,
            correlated_with,
        };

        // High-priority bypass skips queue ordering entirely; it already
        // passed throttling and conflict resolution above.
        if priority > self.cfg.high_priority_bypass_threshold {
            self.stats.bypass_dispatched += 1;
            self.stats.confirmed += 1;
            *self
                .stats
                .per_kind_dispatched
                .entry(processed.candidate.kind.as_str().to_string())
                .or_default() += 1;
            info!(
                signal_id = %processed.candidate.id,
                priority,
                "High-priority signal bypassing queue"
            );
            return SubmitOutcome::DispatchedImmediately(Box::new(processed));
        }

        // Bounded queue with backpressure: past the threshold, only signals
        // beating the current minimum get in; at capacity the minimum is
        // evicted to make room.
        if self.queue.len() >= self.cfg.max_queue_size {
            match self.min_priority_index() {
                Some(idx) if self.queue[idx].priority < priority => {
                    let evicted = self.queue.swap_remove(idx);
                    self.stats.dropped_backpressure += 1;
                    debug!(
                        evicted_id = %evicted.candidate.id,
                        evicted_priority = evicted.priority,
                        "Queue full, evicting lowest priority"
                    );
                }
                _ => {
                    self.stats.dropped_backpressure += 1;
                    return SubmitOutcome::Rejected(SignalError::Backpressured { priority });
                }
            }
        } else if self.queue.len() >= self.cfg.backpressure_threshold {
            let min_priority = self
                .queue
                .iter()
                .map(|p| p.priority)
                .fold(f64::INFINITY, f64::min);
            if priority <= min_priority {
                self.stats.dropped_backpressure += 1;
                let err = SignalError::Backpressured { priority };
                debug!(error_type = err.error_type(), priority, "Signal rejected by backpressure");
                return SubmitOutcome::Rejected(err);
            }
        }

        self.queue.push(processed);
        SubmitOutcome::Enqueued
    }

    /// Drain up to one batch in priority order. Aging lifts long-waiting
    /// signals so no kind is starved; expired signals are dropped and
    /// counted.
    pub fn process_batch(&mut self, now_ms: i64) -> Vec<ProcessedSignal> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        let mut batch_size = self.cfg.processing_batch_size.max(1);
        if self.cfg.adaptive_batch_sizing && self.queue.len() > self.cfg.backpressure_threshold {
            let pressure = self.queue.len() / self.cfg.backpressure_threshold.max(1);
            batch_size = (batch_size * (1 + pressure)).min(self.cfg.max_adaptive_batch_size);
        }

        let aging = self.cfg.aging_priority_per_sec;
        self.queue.sort_by(|a, b| {
            let ea = a.priority + aging * (now_ms - a.received_ms) as f64 / 1_000.0;
            let eb = b.priority + aging * (now_ms - b.received_ms) as f64 / 1_000.0;
            eb.total_cmp(&ea)
                .then(a.received_ms.cmp(&b.received_ms))
                .then(a.candidate.id.cmp(&b.candidate.id))
        });

        let mut dispatched = Vec::with_capacity(batch_size);
        let mut kept = Vec::with_capacity(self.queue.len());
        for signal in self.queue.drain(..) {
            let age = now_ms - signal.received_ms;
            if age > self.cfg.signal_timeout_ms {
                self.stats.dropped_expired += 1;
                debug!(
                    signal_id = %signal.candidate.id,
                    age_ms = age,
                    "Queued signal expired"
                );
                continue;
            }
            if dispatched.len() < batch_size {
                dispatched.push(signal);
            } else {
                kept.push(signal);
            }
        }
        self.queue = kept;

        for signal in &dispatched {
            self.stats.confirmed += 1;
            *self
                .stats
                .per_kind_dispatched
                .entry(signal.candidate.kind.as_str().to_string())
                .or_default() += 1;
            let latency = (now_ms - signal.received_ms) as f64;
            self.stats.avg_dispatch_latency_ms =
                0.9 * self.stats.avg_dispatch_latency_ms + 0.1 * latency;
        }
        self.stats.batches_processed += 1;
        dispatched
    }

    /// Report the outcome of dispatching downstream. Consecutive failures
    /// past the threshold open the breaker for the configured reset window.
    pub fn record_dispatch_result(&mut self, ok: bool, now_ms: i64) {
        if ok {
            self.consecutive_errors = 0;
            return;
        }
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.cfg.circuit_breaker_threshold {
            self.breaker_open_until = Some(now_ms + self.cfg.circuit_breaker_reset_ms);
            error!(
                consecutive_errors = self.consecutive_errors,
                reset_ms = self.cfg.circuit_breaker_reset_ms,
                "Signal processing circuit breaker opened"
            );
            self.consecutive_errors = 0;
        }
    }

    fn remember(&mut self, candidate: &SignalCandidate, now_ms: i64) {
        self.recent.push_back(RecentSignal {
            id: candidate.id,
            kind: candidate.kind,
            side: candidate.side,
            price_ticks: candidate.price_ticks,
            confidence: candidate.confidence,
            accepted_ms: now_ms,
        });
    }

    fn evict_recent(&mut self, now_ms: i64) {
        let horizon = self
            .cfg
            .correlation_window_ms
            .max(self.cfg.conflict.minimum_separation_ms);
        while self
            .recent
            .front()
            .is_some_and(|r| now_ms - r.accepted_ms > horizon)
        {
            self.recent.pop_front();
        }
    }

    fn penalize_queued(&mut self, id: Uuid) {
        let factor = self.cfg.conflict.contradiction_penalty_factor;
        let Some(idx) = self.queue.iter().position(|p| p.candidate.id == id) else {
            return;
        };
        let floor = self.cfg.confidence_floors.get(self.queue[idx].candidate.kind);
        self.queue[idx].candidate.confidence *= factor;
        self.queue[idx].priority *= factor;
        if self.queue[idx].candidate.confidence < floor {
            let loser = self.queue.swap_remove(idx);
            self.stats.dropped_conflict += 1;
            debug!(
                signal_id = %loser.candidate.id,
                "Queued signal dropped after losing conflict resolution"
            );
        }
    }

    fn min_priority_index(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.priority.total_cmp(&b.priority))
            .map(|(i, _)| i)
    }
}
