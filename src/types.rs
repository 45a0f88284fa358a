//! Core types and data structures for the ATH tracker.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trading call as ingested upstream. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Row identifier in the call store
    pub id: i64,
    /// Network name as ingested (e.g. "ethereum", "solana")
    pub network: String,
    /// Pool address the call refers to
    pub pool_address: String,
    /// Instant the call was made
    pub call_timestamp: DateTime<Utc>,
    /// Price at the moment of the call, always positive
    pub entry_price: Decimal,
}

/// Which refinement tier produced an ATH result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Day,
    Hour,
    Minute,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Day => "day",
            Tier::Hour => "hour",
            Tier::Minute => "minute",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved all-time-high for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthResult {
    /// Highest observed post-call price (may be below the entry price)
    pub price: Decimal,
    /// When that price was observed; never earlier than the call
    pub timestamp: DateTime<Utc>,
    /// Return over the entry price in percent, floored at zero
    pub roi_percent: Decimal,
    /// Tier that produced the answer
    pub tier: Tier,
}
