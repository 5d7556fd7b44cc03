//! Sequenced L2 order book with snapshot recovery and staleness detection.

mod state;

pub use state::{ApplyOutcome, BookHealth, BookStats, DepthUpdate, Level, OrderBookState};
