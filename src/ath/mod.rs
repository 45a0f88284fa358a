//! ATH engine - tiered all-time-high resolution over candle data.
//!
//! A call's post-call ATH is narrowed day -> hour -> minute by the resolver,
//! fetched through a cached, rate-limited candle source, and written back by
//! the batch scheduler through the call store.

pub mod types;
pub mod error;
pub mod data_sources;
pub mod rate_limit;
pub mod retry;
pub mod cache;
pub mod roi;
pub mod resolver;
pub mod storage;
pub mod metrics;
pub mod scheduler;

// Re-export main public types and the scheduler
pub use scheduler::BatchScheduler;
pub use types::{AthConfig, Candle, ExecutionMode, ProviderConfig, Resolution, RetryConfig};
pub use error::{AthError, SkipReason};

// Re-export other key components for advanced usage
pub use data_sources::{CandleSource, FrozenCandleSource, GeckoTerminalSource};
pub use rate_limit::SharedRateLimiter;
pub use retry::{RetryPolicy, ThrottledSource};
pub use cache::CachedCandleSource;
pub use resolver::TieredAthResolver;
pub use roi::roi_percent;
pub use storage::{CallStore, NewCall, PendingBatch, SqliteCallStore, StoredAth};
pub use metrics::{RunMetrics, RunSummary};

use std::sync::Arc;
use std::time::Duration;

/// Assemble the production candle source: GeckoTerminal behind the shared
/// rate limiter and retry policy, with successful pages cached in front so
/// cache hits cost no rate budget.
pub fn build_candle_source(config: &AthConfig) -> anyhow::Result<Arc<dyn CandleSource>> {
    let http: Arc<dyn CandleSource> = Arc::new(GeckoTerminalSource::new(&config.provider)?);
    let limiter = Arc::new(SharedRateLimiter::new(config.requests_per_minute));
    let throttled: Arc<dyn CandleSource> = Arc::new(ThrottledSource::new(
        http,
        limiter,
        RetryPolicy::from_config(&config.retry),
    ));

    Ok(Arc::new(CachedCandleSource::new(
        throttled,
        Duration::from_secs(config.provider.cache_ttl_seconds),
        config.provider.max_cache_entries,
    )))
}

/// Builder for ATH runs with sensible defaults.
pub struct AthConfigBuilder {
    config: AthConfig,
}

impl AthConfigBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: AthConfig::default(),
        }
    }

    /// Start from an existing configuration, e.g. one loaded from a file.
    pub fn from_config(config: AthConfig) -> Self {
        Self { config }
    }

    /// Set the number of concurrent workers.
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.config.worker_count = worker_count;
        self
    }

    /// Set the shared provider request budget.
    pub fn with_requests_per_minute(mut self, requests_per_minute: u32) -> Self {
        self.config.requests_per_minute = requests_per_minute;
        self
    }

    /// Set how many pending calls are pulled per batch.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.config.execution = execution;
        self
    }

    /// Set the provider API key.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.config.provider.api_key = api_key;
        self
    }

    pub fn with_database_url(mut self, database_url: impl Into<String>) -> Self {
        self.config.database_url = database_url.into();
        self
    }

    /// Build and validate the configuration.
    pub fn build_config(self) -> anyhow::Result<AthConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build a scheduler over `store` using the production candle source.
    pub fn build(self, store: Arc<dyn CallStore>) -> anyhow::Result<BatchScheduler> {
        let config = self.build_config()?;
        let source = build_candle_source(&config)?;
        let resolver = Arc::new(TieredAthResolver::new(source));
        Ok(BatchScheduler::new(store, resolver, &config))
    }
}

impl Default for AthConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
