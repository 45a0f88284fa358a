//! ath-tracker - post-call all-time-high and ROI tracking for DEX pools
//!
//! This crate resolves, for every stored trading call, the highest price the
//! pool reached after the call, using a day -> hour -> minute candle search,
//! and records the resulting ROI.

pub mod types;
pub mod ath;
pub mod cli;

// Re-export main types for convenience
pub use types::{AthResult, CallRecord, Tier};
