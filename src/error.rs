use thiserror::Error;

/// Errors raised while parsing or validating raw market data.
///
/// A validation failure never partially applies: the offending trade or
/// depth update is dropped whole and counted by the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Invalid price string: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity string: {0}")]
    InvalidQuantity(String),

    #[error("Price {0} is not positive")]
    NonPositivePrice(String),

    #[error("Quantity {0} is negative")]
    NegativeQuantity(String),

    #[error("Price {price} is not aligned to tick size {tick_size}")]
    TickMisaligned { price: String, tick_size: String },

    #[error("Value {value} exceeds {precision} fractional digits")]
    PrecisionExceeded { value: String, precision: u32 },

    #[error("Fixed-point overflow converting {0}")]
    Overflow(String),
}

/// Order book protocol errors.
///
/// These are surfaced through the book's health and recovery path rather
/// than propagated to the data-path caller: a quarantined book keeps
/// accepting trades with degraded enrichment until a snapshot lands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookError {
    #[error("Sequence gap: expected first id <= {expected}, got {got}")]
    SequenceGap { expected: i64, got: i64 },

    #[error("Crossed book after update: best bid {bid_ticks} >= best ask {ask_ticks}")]
    CrossedBook { bid_ticks: i64, ask_ticks: i64 },

    #[error("Book not initialized: snapshot required before depth updates")]
    NotInitialized,

    #[error("Circuit breaker open: updates buffered, not applied")]
    CircuitOpen,

    #[error("Snapshot stale: snapshot id {snapshot_id} <= current id {current_id}")]
    SnapshotStale { snapshot_id: i64, current_id: i64 },
}

impl BookError {
    /// Stable label for counters and log correlation.
    pub fn error_type(&self) -> &'static str {
        match self {
            BookError::SequenceGap { .. } => "sequence_gap",
            BookError::CrossedBook { .. } => "crossed_book",
            BookError::NotInitialized => "not_initialized",
            BookError::CircuitOpen => "circuit_open",
            BookError::SnapshotStale { .. } => "snapshot_stale",
        }
    }

    /// Whether a fresh snapshot is expected to clear the condition.
    pub fn needs_snapshot(&self) -> bool {
        matches!(
            self,
            BookError::SequenceGap { .. }
                | BookError::CrossedBook { .. }
                | BookError::NotInitialized
        )
    }
}

/// Signal manager admission errors. Every rejection is counted; none are
/// fatal to the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("Queue full: priority {priority:.3} below retained minimum")]
    Backpressured { priority: f64 },

    #[error("Throttled: last {side} signal {elapsed_ms}ms ago, minimum {throttle_ms}ms")]
    Throttled {
        side: &'static str,
        elapsed_ms: i64,
        throttle_ms: i64,
    },

    #[error("Confidence {confidence:.3} below floor {floor:.3} for {kind}")]
    BelowConfidence {
        kind: &'static str,
        confidence: f64,
        floor: f64,
    },

    #[error("Dropped by conflict resolution against {winner_kind} ({winner_confidence:.3})")]
    ConflictLoser {
        winner_kind: &'static str,
        winner_confidence: f64,
    },

    #[error("Processing circuit breaker open for another {remaining_ms}ms")]
    CircuitOpen { remaining_ms: i64 },

    #[error("Suppressed while market health recommends {recommendation}")]
    HealthSuppressed { recommendation: &'static str },

    #[error("Signal expired: {age_ms}ms old, timeout {timeout_ms}ms")]
    Expired { age_ms: i64, timeout_ms: i64 },
}

impl SignalError {
    pub fn error_type(&self) -> &'static str {
        match self {
            SignalError::Backpressured { .. } => "backpressure",
            SignalError::Throttled { .. } => "throttle",
            SignalError::BelowConfidence { .. } => "below_confidence",
            SignalError::ConflictLoser { .. } => "conflict",
            SignalError::CircuitOpen { .. } => "circuit_open",
            SignalError::HealthSuppressed { .. } => "health_suppressed",
            SignalError::Expired { .. } => "expired",
        }
    }
}

/// Snapshot recovery failures reported by the exchange collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    #[error("Snapshot request timed out after {deadline_ms}ms")]
    Timeout { deadline_ms: i64 },

    #[error("Snapshot rejected: {0}")]
    Rejected(String),
}

impl RecoveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecoveryError::Timeout { .. })
    }
}
