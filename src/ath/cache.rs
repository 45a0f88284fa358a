//! Short-lived cache of candle pages.
//!
//! Many calls point at the same pool, and the day-tier page for a pool is the
//! same for all of them. Caching successful pages for a few minutes keeps those
//! calls from spending the shared rate budget on identical requests; concurrent
//! identical requests are coalesced into a single provider call.

use crate::ath::data_sources::CandleSource;
use crate::ath::error::AthError;
use crate::ath::types::{Candle, Resolution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PageKey {
    network: String,
    pool: String,
    resolution: Resolution,
    before: Option<i64>,
    limit: u32,
}

/// Candle source decorator that caches successful pages.
pub struct CachedCandleSource {
    inner: Arc<dyn CandleSource>,
    pages: Cache<PageKey, Arc<Vec<Candle>>>,
}

impl CachedCandleSource {
    pub fn new(inner: Arc<dyn CandleSource>, ttl: Duration, max_entries: u64) -> Self {
        let pages = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { inner, pages }
    }
}

#[async_trait]
impl CandleSource for CachedCandleSource {
    async fn fetch(
        &self,
        network: &str,
        pool: &str,
        resolution: Resolution,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>, AthError> {
        let key = PageKey {
            network: network.to_string(),
            pool: pool.to_string(),
            resolution,
            before: before.map(|b| b.timestamp()),
            limit,
        };

        let inner = self.inner.clone();
        let (network, pool) = (key.network.clone(), key.pool.clone());
        self.pages
            .try_get_with(key, async move {
                inner
                    .fetch(&network, &pool, resolution, before, limit)
                    .await
                    .map(Arc::new)
            })
            .await
            .map(|page| page.as_ref().clone())
            .map_err(|err| err.as_ref().clone())
    }

    async fn probe(&self) -> Result<(), AthError> {
        self.inner.probe().await
    }
}
