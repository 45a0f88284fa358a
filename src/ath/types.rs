//! Candle and configuration types for the ATH engine.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Candle bucket width supported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Day,
    Hour,
    Minute,
}

impl Resolution {
    /// Timeframe segment used in the provider URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Day => "day",
            Resolution::Hour => "hour",
            Resolution::Minute => "minute",
        }
    }

    /// Width of one bucket.
    pub fn span(&self) -> Duration {
        match self {
            Resolution::Day => Duration::days(1),
            Resolution::Hour => Duration::hours(1),
            Resolution::Minute => Duration::minutes(1),
        }
    }
}

/// One OHLCV bucket. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub resolution: Resolution,
}

impl Candle {
    /// Instant the bucket closes (exclusive). `None` past the end of time.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.checked_add_signed(self.resolution.span())
    }
}

/// How a pulled batch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One token at a time on the scheduler task
    Sequential,
    /// Bounded pool of `worker_count` concurrent tasks
    Pool,
}

/// Candle provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API root, without trailing slash
    pub base_url: String,
    /// API key sent on every request when present
    pub api_key: Option<String>,
    /// Header carrying the API key
    pub api_key_header: String,
    /// Per-request timeout in seconds
    pub timeout_seconds: u64,
    /// How long fetched candle pages stay cached
    pub cache_ttl_seconds: u64,
    /// Maximum cached candle pages
    pub max_cache_entries: u64,
}

/// Retry and backoff settings shared by every provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts for transient failures (first try included)
    pub max_attempts: usize,
    /// First backoff delay; each further delay doubles
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay
    pub max_backoff_ms: u64,
    /// Shared pause applied after the provider answers 429
    pub rate_limit_pause_seconds: u64,
    /// How many 429 pauses one request may sit through
    pub max_rate_limit_waits: usize,
}

/// Complete configuration for an ATH run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AthConfig {
    /// Concurrent workers in pool mode
    pub worker_count: usize,
    /// Provider request budget shared by all workers
    pub requests_per_minute: u32,
    /// Pending calls pulled per batch
    pub batch_size: u32,
    /// Sequential or pooled execution
    pub execution: ExecutionMode,
    /// Log a progress line every N processed calls
    pub progress_interval: u64,
    /// sqlx connection string of the call store
    pub database_url: String,
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
}

impl AthConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Reject settings that make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow!("worker_count must be at least 1"));
        }
        if self.requests_per_minute == 0 {
            return Err(anyhow!("requests_per_minute must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be at least 1"));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(anyhow!("provider.base_url must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.geckoterminal.com/api/v2".to_string(),
            api_key: None,
            api_key_header: "x-cg-pro-api-key".to_string(),
            timeout_seconds: 10,
            cache_ttl_seconds: 300,
            max_cache_entries: 10_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            max_backoff_ms: 8_000,
            rate_limit_pause_seconds: 60,
            max_rate_limit_waits: 5,
        }
    }
}

impl Default for AthConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            requests_per_minute: 30,
            batch_size: 100,
            execution: ExecutionMode::Pool,
            progress_interval: 25,
            database_url: "sqlite:./calls.db?mode=rwc".to_string(),
            provider: ProviderConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_candle_end_time() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let candle = Candle {
            start_time: start,
            open: dec!(1),
            high: dec!(2),
            low: dec!(0.5),
            close: dec!(1.5),
            volume: dec!(100),
            resolution: Resolution::Hour,
        };

        assert_eq!(candle.end_time(), Some(start + Duration::hours(1)));

        let last = Candle {
            start_time: DateTime::<Utc>::MAX_UTC,
            ..candle
        };
        assert_eq!(last.end_time(), None);
    }

    #[test]
    fn test_config_defaults_are_valid() {
        let config = AthConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.requests_per_minute, 30);
        assert_eq!(config.execution, ExecutionMode::Pool);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        let config = AthConfig {
            worker_count: 0,
            ..AthConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AthConfig = toml::from_str(
            r#"
            worker_count = 8
            execution = "sequential"

            [provider]
            api_key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_count, 8);
        assert_eq!(config.execution, ExecutionMode::Sequential);
        assert_eq!(config.provider.api_key.as_deref(), Some("secret"));
        assert_eq!(config.provider.timeout_seconds, 10);
        assert_eq!(config.batch_size, 100);
    }
}
