//! Error taxonomy for candle fetching, resolution and persistence.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Every way resolving one call can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AthError {
    /// Provider answered 429; back off and retry
    #[error("provider rate limit exceeded")]
    RateLimited,

    /// Pool has no usable history
    #[error("no candle data available")]
    NoData,

    /// Timeout, connection reset or 5xx
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Response did not have the expected shape
    #[error("malformed provider response: {0}")]
    Malformed(String),

    /// Writing the result failed
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Provider rejected the credentials (401/403)
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    /// Provider could not be reached at all
    #[error("provider unreachable: {0}")]
    Unreachable(String),
}

impl AthError {
    /// Errors that abort the whole run rather than a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AthError::Unauthorized(_) | AthError::Unreachable(_))
    }

    /// Tally bucket for a per-call failure. `None` for fatal errors.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            AthError::RateLimited => Some(SkipReason::RateLimited),
            AthError::NoData => Some(SkipReason::NoData),
            AthError::Transient(_) => Some(SkipReason::Transient),
            AthError::Malformed(_) => Some(SkipReason::Malformed),
            AthError::PersistenceFailure(_) => Some(SkipReason::Persistence),
            AthError::Unauthorized(_) | AthError::Unreachable(_) => None,
        }
    }
}

/// Why a call was skipped in this run. Skipped calls stay pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoData,
    RateLimited,
    Transient,
    Malformed,
    Persistence,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoData => "no_data",
            SkipReason::RateLimited => "rate_limited",
            SkipReason::Transient => "transient",
            SkipReason::Malformed => "malformed",
            SkipReason::Persistence => "persistence",
        }
    }

    pub fn all() -> [SkipReason; 5] {
        [
            SkipReason::NoData,
            SkipReason::RateLimited,
            SkipReason::Transient,
            SkipReason::Malformed,
            SkipReason::Persistence,
        ]
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
