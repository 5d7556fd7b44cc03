//! Signal admission, prioritization, and dispatch.

mod manager;

pub use manager::{
    ProcessedSignal, Regime, SignalManager, SignalStats, SubmitOutcome,
};
