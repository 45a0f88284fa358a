//! Candle sources.
//!
//! All provider-specific translation lives here: network naming, URL shape,
//! authentication header, status-code classification and decoding of the
//! `[ts, open, high, low, close, volume]` rows. Nothing downstream ever sees a
//! vendor quirk, only `Candle`s and `AthError`s.

use crate::ath::error::AthError;
use crate::ath::types::{Candle, ProviderConfig, Resolution};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

/// Largest page the provider serves.
pub const MAX_CANDLE_LIMIT: u32 = 1000;

/// Read-only source of OHLCV candles.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch up to `limit` candles strictly before `before` (or ending now),
    /// newest first. An empty page is reported as `AthError::NoData`.
    async fn fetch(
        &self,
        network: &str,
        pool: &str,
        resolution: Resolution,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>, AthError>;

    /// Cheap reachability and credential check run once before a batch run.
    async fn probe(&self) -> Result<(), AthError> {
        Ok(())
    }
}

/// Map an ingested network name to the provider's identifier.
/// Unknown names pass through unchanged.
pub fn provider_network(network: &str) -> &str {
    match network {
        "ethereum" => "eth",
        "binance-smart-chain" | "bnb" => "bsc",
        "polygon" => "polygon_pos",
        "avalanche" => "avax",
        "fantom" => "ftm",
        "arbitrum-one" => "arbitrum",
        other => other,
    }
}

/// GeckoTerminal-compatible OHLCV client.
pub struct GeckoTerminalSource {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_header: String,
}

impl GeckoTerminalSource {
    /// Create a client from provider settings.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
        })
    }

    fn ohlcv_url(&self, network: &str, pool: &str, resolution: Resolution) -> String {
        format!(
            "{}/networks/{}/pools/{}/ohlcv/{}",
            self.base_url,
            provider_network(network),
            pool,
            resolution.as_str()
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(self.api_key_header.as_str(), key.as_str()),
            None => builder,
        }
    }
}

#[async_trait]
impl CandleSource for GeckoTerminalSource {
    #[instrument(skip(self, resolution), fields(resolution = resolution.as_str()))]
    async fn fetch(
        &self,
        network: &str,
        pool: &str,
        resolution: Resolution,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>, AthError> {
        let mut query = vec![
            ("aggregate", "1".to_string()),
            ("limit", limit.clamp(1, MAX_CANDLE_LIMIT).to_string()),
        ];
        if let Some(before) = before {
            query.push(("before_timestamp", before.timestamp().to_string()));
        }

        let url = self.ohlcv_url(network, pool, resolution);
        let response = self
            .authorized(self.http_client.get(&url).query(&query))
            .send()
            .await
            .map_err(classify_request_error)?;

        check_status(response.status())?;

        let body = response.text().await.map_err(classify_request_error)?;
        let candles = decode_ohlcv(&body, resolution)?;
        if candles.is_empty() {
            return Err(AthError::NoData);
        }

        debug!("Fetched {} {} candles", candles.len(), resolution.as_str());
        Ok(candles)
    }

    #[instrument(skip(self))]
    async fn probe(&self) -> Result<(), AthError> {
        let url = format!("{}/networks", self.base_url);
        let response = self
            .authorized(self.http_client.get(&url).query(&[("page", "1")]))
            .send()
            .await
            .map_err(|e| AthError::Unreachable(e.to_string()))?;

        match check_status(response.status()) {
            Err(AthError::Transient(msg)) => Err(AthError::Unreachable(msg)),
            Err(err @ AthError::Unauthorized(_)) => Err(err),
            // Any other answer proves the provider is up and accepts our key.
            _ => Ok(()),
        }
    }
}

/// Translate an HTTP status into the error taxonomy.
pub fn check_status(status: StatusCode) -> Result<(), AthError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(AthError::RateLimited),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(AthError::Unauthorized(status.to_string()))
        }
        StatusCode::NOT_FOUND => Err(AthError::NoData),
        StatusCode::REQUEST_TIMEOUT => Err(AthError::Transient(status.to_string())),
        s if s.is_server_error() => Err(AthError::Transient(s.to_string())),
        s => Err(AthError::Malformed(format!("unexpected status {}", s))),
    }
}

fn classify_request_error(err: reqwest::Error) -> AthError {
    if err.is_decode() {
        AthError::Malformed(err.to_string())
    } else {
        AthError::Transient(err.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OhlcvEnvelope {
    Wrapped { data: OhlcvData },
    Bare { ohlcv_list: Vec<[f64; 6]> },
}

#[derive(Deserialize)]
struct OhlcvData {
    attributes: OhlcvAttributes,
}

#[derive(Deserialize)]
struct OhlcvAttributes {
    ohlcv_list: Vec<[f64; 6]>,
}

/// Decode a provider body into candles, newest first.
pub fn decode_ohlcv(body: &str, resolution: Resolution) -> Result<Vec<Candle>, AthError> {
    let envelope: OhlcvEnvelope =
        serde_json::from_str(body).map_err(|e| AthError::Malformed(e.to_string()))?;

    let rows = match envelope {
        OhlcvEnvelope::Wrapped { data } => data.attributes.ohlcv_list,
        OhlcvEnvelope::Bare { ohlcv_list } => ohlcv_list,
    };

    let mut candles = rows
        .iter()
        .map(|row| candle_from_row(row, resolution))
        .collect::<Result<Vec<_>, _>>()?;
    candles.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    Ok(candles)
}

fn candle_from_row(row: &[f64; 6], resolution: Resolution) -> Result<Candle, AthError> {
    // Buckets open in the past; allow a day of clock skew.
    let latest_start = Utc::now() + TimeDelta::days(1);
    let start_time = DateTime::from_timestamp(row[0] as i64, 0)
        .filter(|ts| ts.timestamp() >= 0 && *ts <= latest_start)
        .ok_or_else(|| AthError::Malformed(format!("invalid candle timestamp {}", row[0])))?;
    let decimal = |value: f64, field: &str| {
        Decimal::from_f64(value)
            .ok_or_else(|| AthError::Malformed(format!("invalid candle {} {}", field, value)))
    };

    Ok(Candle {
        start_time,
        open: decimal(row[1], "open")?,
        high: decimal(row[2], "high")?,
        low: decimal(row[3], "low")?,
        close: decimal(row[4], "close")?,
        volume: decimal(row[5], "volume")?,
        resolution,
    })
}

/// In-memory replay of previously captured candles.
///
/// Serves pages the way the provider does (strictly before `before`, newest
/// first, at most `limit`), which makes resolution over frozen data exactly
/// repeatable.
#[derive(Default)]
pub struct FrozenCandleSource {
    candles: HashMap<(String, String, Resolution), Vec<Candle>>,
    requests: AtomicUsize,
}

impl FrozenCandleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register candles for a pool; each candle is filed under its own resolution.
    pub fn with_candles(mut self, network: &str, pool: &str, candles: Vec<Candle>) -> Self {
        for candle in candles {
            self.candles
                .entry((network.to_string(), pool.to_string(), candle.resolution))
                .or_default()
                .push(candle);
        }
        self
    }

    /// Number of fetches served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CandleSource for FrozenCandleSource {
    async fn fetch(
        &self,
        network: &str,
        pool: &str,
        resolution: Resolution,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>, AthError> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let key = (network.to_string(), pool.to_string(), resolution);
        let mut page: Vec<Candle> = self
            .candles
            .get(&key)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|c| before.map_or(true, |b| c.start_time < b))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        page.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        page.truncate(limit.min(MAX_CANDLE_LIMIT) as usize);

        if page.is_empty() {
            Err(AthError::NoData)
        } else {
            Ok(page)
        }
    }
}
