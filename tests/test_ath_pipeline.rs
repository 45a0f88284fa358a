//! End-to-end ATH resolution over frozen candle data and an in-memory call store

use async_trait::async_trait;
use ath_tracker::ath::{
    AthConfig, AthError, BatchScheduler, Candle, CandleSource, CallStore, ExecutionMode,
    FrozenCandleSource, NewCall, Resolution, RetryPolicy, SharedRateLimiter, SkipReason,
    SqliteCallStore, ThrottledSource, TieredAthResolver,
};
use ath_tracker::{CallRecord, Tier};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NETWORK: &str = "ethereum";

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, hour, minute, 0).unwrap()
}

fn call_ts() -> DateTime<Utc> {
    at(10, 12, 0)
}

fn candle(start: DateTime<Utc>, resolution: Resolution, open: Decimal, high: Decimal, close: Decimal) -> Candle {
    Candle {
        start_time: start,
        open,
        high,
        low: open.min(close),
        close,
        volume: dec!(5000),
        resolution,
    }
}

/// Day high 0.01, hour high 0.012, minute peak at call + 5min closing at 0.0115.
fn scenario_candles() -> Vec<Candle> {
    vec![
        // the day before the call
        candle(at(9, 0, 0), Resolution::Day, dec!(0.001), dec!(0.05), dec!(0.001)),
        candle(at(10, 0, 0), Resolution::Day, dec!(0.001), dec!(0.01), dec!(0.009)),
        candle(at(11, 0, 0), Resolution::Day, dec!(0.009), dec!(0.008), dec!(0.007)),
        // closed before the call
        candle(at(10, 11, 0), Resolution::Hour, dec!(0.001), dec!(0.02), dec!(0.001)),
        candle(at(10, 12, 0), Resolution::Hour, dec!(0.001), dec!(0.012), dec!(0.01)),
        candle(at(10, 18, 0), Resolution::Hour, dec!(0.009), dec!(0.0095), dec!(0.009)),
        // before the call instant
        candle(at(10, 11, 58), Resolution::Minute, dec!(0.001), dec!(0.03), dec!(0.001)),
        candle(at(10, 12, 5), Resolution::Minute, dec!(0.011), dec!(0.0118), dec!(0.0115)),
        candle(at(10, 12, 30), Resolution::Minute, dec!(0.01), dec!(0.0105), dec!(0.01)),
    ]
}

fn new_call(pool: &str, entry_price: Decimal) -> NewCall {
    NewCall {
        network: NETWORK.to_string(),
        pool_address: pool.to_string(),
        call_timestamp: call_ts(),
        entry_price,
    }
}

fn record(id: i64, pool: &str, entry_price: Decimal) -> CallRecord {
    CallRecord {
        id,
        network: NETWORK.to_string(),
        pool_address: pool.to_string(),
        call_timestamp: call_ts(),
        entry_price,
    }
}

fn scheduler(store: Arc<SqliteCallStore>, source: Arc<dyn CandleSource>, execution: ExecutionMode) -> BatchScheduler {
    let config = AthConfig {
        worker_count: 3,
        batch_size: 2,
        execution,
        ..AthConfig::default()
    };
    BatchScheduler::new(store, Arc::new(TieredAthResolver::new(source)), &config)
}

#[tokio::test]
async fn test_end_to_end_minute_resolution() {
    let store = Arc::new(SqliteCallStore::in_memory().await.unwrap());
    let id = store.insert_call(&new_call("0xpool", dec!(0.001))).await.unwrap();
    let source = Arc::new(FrozenCandleSource::new().with_candles(NETWORK, "0xpool", scenario_candles()));

    let summary = scheduler(store.clone(), source.clone(), ExecutionMode::Sequential)
        .run_until_exhausted()
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    let stored = store.get_ath(id).await.unwrap().expect("ATH should be stored");
    assert_eq!(stored.price, dec!(0.0115));
    assert_eq!(stored.roi_percent, dec!(1050.0));
    assert_eq!(stored.timestamp, at(10, 12, 5));
    // one request per tier
    assert_eq!(source.request_count(), 3);
}

#[tokio::test]
async fn test_minute_price_uses_open_close_not_wick() {
    let candles = vec![
        candle(at(10, 0, 0), Resolution::Day, dec!(0.5), dec!(6.0), dec!(0.8)),
        candle(at(10, 12, 0), Resolution::Hour, dec!(0.5), dec!(5.5), dec!(0.8)),
        Candle {
            start_time: at(10, 12, 10),
            open: dec!(1.0),
            high: dec!(5.0),
            low: dec!(0.9),
            close: dec!(0.8),
            volume: dec!(10),
            resolution: Resolution::Minute,
        },
    ];
    let resolver = TieredAthResolver::new(Arc::new(
        FrozenCandleSource::new().with_candles(NETWORK, "0xwick", candles),
    ));

    let result = resolver.resolve(&record(1, "0xwick", dec!(0.5))).await.unwrap();

    assert_eq!(result.price, dec!(1.0));
    assert_eq!(result.roi_percent, dec!(100));
    assert_eq!(result.tier, Tier::Minute);
}

#[tokio::test]
async fn test_minute_fallback_uses_hour_anchor() {
    let candles = vec![
        candle(at(10, 0, 0), Resolution::Day, dec!(0.001), dec!(0.02), dec!(0.01)),
        candle(at(10, 12, 0), Resolution::Hour, dec!(0.001), dec!(0.011), dec!(0.01)),
        candle(at(10, 14, 0), Resolution::Hour, dec!(0.01), dec!(0.015), dec!(0.012)),
        // only pre-call minute data
        candle(at(10, 11, 50), Resolution::Minute, dec!(0.001), dec!(0.002), dec!(0.001)),
    ];
    let store = Arc::new(SqliteCallStore::in_memory().await.unwrap());
    let id = store.insert_call(&new_call("0xhour", dec!(0.001))).await.unwrap();
    let source = Arc::new(FrozenCandleSource::new().with_candles(NETWORK, "0xhour", candles));

    scheduler(store.clone(), source, ExecutionMode::Sequential)
        .run_until_exhausted()
        .await
        .unwrap();

    let stored = store.get_ath(id).await.unwrap().unwrap();
    assert_eq!(stored.price, dec!(0.015));
    assert_eq!(stored.timestamp, at(10, 14, 0));
}

#[tokio::test]
async fn test_day_no_data_writes_nothing() {
    let store = Arc::new(SqliteCallStore::in_memory().await.unwrap());
    let id = store.insert_call(&new_call("0xempty", dec!(0.001))).await.unwrap();
    let source = Arc::new(FrozenCandleSource::new().with_candles(
        NETWORK,
        "0xempty",
        // only history from before the call day
        vec![candle(at(8, 0, 0), Resolution::Day, dec!(1), dec!(2), dec!(1))],
    ));

    let summary = scheduler(store.clone(), source, ExecutionMode::Sequential)
        .run_until_exhausted()
        .await
        .unwrap();

    assert_eq!(summary.skipped_for(SkipReason::NoData), 1);
    assert!(store.get_ath(id).await.unwrap().is_none());
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_price_only_dropped_keeps_sub_entry_high() {
    let store = Arc::new(SqliteCallStore::in_memory().await.unwrap());
    let id = store.insert_call(&new_call("0xdump", dec!(1.0))).await.unwrap();
    let source = Arc::new(FrozenCandleSource::new().with_candles(
        NETWORK,
        "0xdump",
        vec![
            candle(at(10, 0, 0), Resolution::Day, dec!(0.3), dec!(0.4), dec!(0.2)),
            candle(at(11, 0, 0), Resolution::Day, dec!(0.2), dec!(0.25), dec!(0.1)),
        ],
    ));

    scheduler(store.clone(), source, ExecutionMode::Sequential)
        .run_until_exhausted()
        .await
        .unwrap();

    let stored = store.get_ath(id).await.unwrap().unwrap();
    assert_eq!(stored.price, dec!(0.4));
    assert_eq!(stored.roi_percent, Decimal::ZERO);
    assert!(stored.timestamp >= call_ts());
}

#[tokio::test]
async fn test_resolution_is_idempotent() {
    let resolver = TieredAthResolver::new(Arc::new(
        FrozenCandleSource::new().with_candles(NETWORK, "0xpool", scenario_candles()),
    ));
    let call = record(7, "0xpool", dec!(0.001));

    let first = resolver.resolve(&call).await.unwrap();
    let second = resolver.resolve(&call).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_rerun_skips_resolved_calls() {
    let store = Arc::new(SqliteCallStore::in_memory().await.unwrap());
    store.insert_call(&new_call("0xpool", dec!(0.001))).await.unwrap();
    store.insert_call(&new_call("0xmissing", dec!(0.001))).await.unwrap();
    let source = Arc::new(FrozenCandleSource::new().with_candles(NETWORK, "0xpool", scenario_candles()));

    let first = scheduler(store.clone(), source.clone(), ExecutionMode::Pool)
        .run_until_exhausted()
        .await
        .unwrap();
    let second = scheduler(store.clone(), source, ExecutionMode::Pool)
        .run_until_exhausted()
        .await
        .unwrap();

    assert_eq!(first.succeeded, 1);
    assert_eq!(first.skipped_for(SkipReason::NoData), 1);
    // only the skipped call is pulled again
    assert_eq!(second.processed, 1);
    assert_eq!(second.succeeded, 0);
}

#[tokio::test]
async fn test_pool_and_sequential_agree() {
    let pools = ["0xa", "0xb", "0xc", "0xd", "0xe"];
    let mut results = Vec::new();

    for execution in [ExecutionMode::Sequential, ExecutionMode::Pool] {
        let store = Arc::new(SqliteCallStore::in_memory().await.unwrap());
        let mut source = FrozenCandleSource::new();
        let mut ids = Vec::new();
        for pool in pools {
            ids.push(store.insert_call(&new_call(pool, dec!(0.001))).await.unwrap());
            source = source.with_candles(NETWORK, pool, scenario_candles());
        }

        let summary = scheduler(store.clone(), Arc::new(source), execution)
            .run_until_exhausted()
            .await
            .unwrap();
        assert_eq!(summary.succeeded, pools.len() as u64);

        let mut stored = Vec::new();
        for id in ids {
            stored.push(store.get_ath(id).await.unwrap().unwrap());
        }
        results.push(stored);
    }

    assert_eq!(results[0], results[1]);
}

/// Answers 429 a fixed number of times before delegating.
struct RateLimitedOnce {
    inner: FrozenCandleSource,
    remaining: AtomicUsize,
}

#[async_trait]
impl CandleSource for RateLimitedOnce {
    async fn fetch(
        &self,
        network: &str,
        pool: &str,
        resolution: Resolution,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>, AthError> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AthError::RateLimited);
        }
        self.inner.fetch(network, pool, resolution, before, limit).await
    }
}

#[tokio::test]
async fn test_rate_limited_fetch_pauses_and_retries() {
    let store = Arc::new(SqliteCallStore::in_memory().await.unwrap());
    let id = store.insert_call(&new_call("0xpool", dec!(0.001))).await.unwrap();
    let limiter = Arc::new(SharedRateLimiter::new(60_000));
    let policy = RetryPolicy {
        rate_limit_pause: Duration::from_millis(20),
        ..RetryPolicy::default()
    };
    let source = Arc::new(ThrottledSource::new(
        Arc::new(RateLimitedOnce {
            inner: FrozenCandleSource::new().with_candles(NETWORK, "0xpool", scenario_candles()),
            remaining: AtomicUsize::new(1),
        }),
        limiter.clone(),
        policy,
    ));

    let summary = scheduler(store.clone(), source, ExecutionMode::Pool)
        .run_until_exhausted()
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.total_skipped(), 0);
    assert_eq!(limiter.get_stats().pauses, 1);
    assert_eq!(store.get_ath(id).await.unwrap().unwrap().price, dec!(0.0115));
}
