//! Retry policy for provider calls.
//!
//! One policy governs every candle request: transient failures are retried on
//! an exponential schedule, 429s open the shared pause window on the limiter
//! and are retried once it closes. `ThrottledSource` applies both the limiter
//! and the policy to any `CandleSource`.

use crate::ath::data_sources::CandleSource;
use crate::ath::error::AthError;
use crate::ath::rate_limit::SharedRateLimiter;
use crate::ath::types::{Candle, Resolution, RetryConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

/// Attempts and delays for provider requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts for transient failures, first try included
    pub max_attempts: usize,
    /// Delay before the first retry; later delays double
    pub backoff_base: Duration,
    /// Cap on any single backoff delay
    pub max_backoff: Duration,
    /// Shared pause opened after a 429
    pub rate_limit_pause: Duration,
    /// 429 pauses a single request may sit through before giving up
    pub max_rate_limit_waits: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            rate_limit_pause: Duration::from_secs(config.rate_limit_pause_seconds),
            max_rate_limit_waits: config.max_rate_limit_waits,
        }
    }

    /// Delays between transient retries.
    pub fn backoff_schedule(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.backoff_base.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_backoff)
            .take(self.max_attempts.saturating_sub(1))
    }

    /// Run `operation` under the limiter, retrying per this policy.
    pub async fn execute<T, F, Fut>(
        &self,
        limiter: &SharedRateLimiter,
        mut operation: F,
    ) -> Result<T, AthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AthError>>,
    {
        let mut backoff = self.backoff_schedule();
        let mut rate_limit_waits = 0;

        loop {
            if limiter.is_paused().await {
                debug!("Waiting out the shared rate-limit pause");
            }
            limiter.until_ready().await;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(AthError::RateLimited) if rate_limit_waits < self.max_rate_limit_waits => {
                    rate_limit_waits += 1;
                    limiter.pause_for(self.rate_limit_pause).await;
                }
                Err(AthError::Transient(reason)) => match backoff.next() {
                    Some(delay) => {
                        debug!("Transient provider failure ({}), retrying in {:?}", reason, delay);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(AthError::Transient(reason)),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Candle source wrapped in the shared rate budget and retry policy.
pub struct ThrottledSource {
    inner: Arc<dyn CandleSource>,
    limiter: Arc<SharedRateLimiter>,
    policy: RetryPolicy,
}

impl ThrottledSource {
    pub fn new(
        inner: Arc<dyn CandleSource>,
        limiter: Arc<SharedRateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            limiter,
            policy,
        }
    }
}

#[async_trait]
impl CandleSource for ThrottledSource {
    async fn fetch(
        &self,
        network: &str,
        pool: &str,
        resolution: Resolution,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>, AthError> {
        self.policy
            .execute(&self.limiter, || {
                self.inner.fetch(network, pool, resolution, before, limit)
            })
            .await
    }

    async fn probe(&self) -> Result<(), AthError> {
        self.limiter.until_ready().await;
        self.inner.probe().await
    }
}
