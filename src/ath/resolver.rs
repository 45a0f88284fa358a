//! Tiered all-time-high resolution.
//!
//! Three coarse-to-fine passes (day, hour, minute), each bounded by the
//! previous pass's winning candle, so a call costs at most three provider
//! requests however old it is. Each pass either narrows the answer or stops
//! with the best answer found so far.

use crate::ath::data_sources::CandleSource;
use crate::ath::error::AthError;
use crate::ath::roi::roi_percent;
use crate::ath::types::{Candle, Resolution};
use crate::types::{AthResult, CallRecord, Tier};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use nonempty::NonEmpty;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Daily candles requested in the first pass.
pub const DAY_LIMIT: u32 = 1000;
/// Hourly candles requested around the day anchor.
pub const HOUR_LIMIT: u32 = 72;
/// Minute candles requested around the hour anchor.
pub const MINUTE_LIMIT: u32 = 120;

/// Resolves the post-call ATH of a call from coarse candle data.
pub struct TieredAthResolver {
    source: Arc<dyn CandleSource>,
}

impl TieredAthResolver {
    pub fn new(source: Arc<dyn CandleSource>) -> Self {
        Self { source }
    }

    /// Check the provider is reachable and accepts our credentials.
    pub async fn probe(&self) -> Result<(), AthError> {
        self.source.probe().await
    }

    /// Resolve one call. `NoData` means the day pass found nothing usable.
    #[instrument(skip(self, call), fields(call_id = call.id, pool = %call.pool_address))]
    pub async fn resolve(&self, call: &CallRecord) -> Result<AthResult, AthError> {
        let call_ts = call.call_timestamp;

        let day_page = self
            .source
            .fetch(&call.network, &call.pool_address, Resolution::Day, None, DAY_LIMIT)
            .await?;
        let day = select_day_anchor(&day_page, call_ts).ok_or(AthError::NoData)?;
        debug!("Day anchor {} high {}", day.start_time, day.high);

        let hour_page = self
            .fetch_tier(call, Resolution::Hour, shift(day.start_time, Duration::hours(36))?, HOUR_LIMIT)
            .await?;
        let Some(hour) = select_hour_anchor(&hour_page, &day, call_ts) else {
            debug!("No qualifying hourly candle, falling back to day anchor");
            return Ok(anchor_result(call, &day, Tier::Day));
        };
        debug!("Hour anchor {} high {}", hour.start_time, hour.high);

        let minute_page = self
            .fetch_tier(call, Resolution::Minute, shift(hour.start_time, Duration::hours(1))?, MINUTE_LIMIT)
            .await?;
        let Some(peak) = select_minute_peak(&minute_page, &hour, call_ts) else {
            debug!("No qualifying minute candle, falling back to hour anchor");
            return Ok(anchor_result(call, &hour, Tier::Hour));
        };

        // open/close rather than high: a one-minute wick is rarely fillable.
        let price = peak.open.max(peak.close);
        debug!("Minute peak {} price {}", peak.start_time, price);
        Ok(build_result(call, price, peak.start_time, Tier::Minute))
    }

    /// Refinement fetch: an empty page narrows nothing, it is not a failure.
    async fn fetch_tier(
        &self,
        call: &CallRecord,
        resolution: Resolution,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Candle>, AthError> {
        match self
            .source
            .fetch(&call.network, &call.pool_address, resolution, Some(before), limit)
            .await
        {
            Err(AthError::NoData) => Ok(Vec::new()),
            other => other,
        }
    }
}

/// Midnight (UTC) of the calendar day containing `ts`.
pub fn start_of_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Best daily candle on or after the call's calendar day.
pub fn select_day_anchor(candles: &[Candle], call_ts: DateTime<Utc>) -> Option<Candle> {
    let day_start = start_of_day(call_ts);
    max_high(
        candles
            .iter()
            .filter(|c| c.start_time >= day_start && c.high > Decimal::ZERO)
            .collect(),
    )
}

/// Best hourly candle within a day of the day anchor that was still open at
/// (or opened after) the call instant.
pub fn select_hour_anchor(candles: &[Candle], day: &Candle, call_ts: DateTime<Utc>) -> Option<Candle> {
    max_high(
        candles
            .iter()
            .filter(|c| within(c.start_time, day.start_time, Duration::hours(24)))
            .filter(|c| c.end_time().map_or(false, |end| end > call_ts))
            .filter(|c| c.high > Decimal::ZERO)
            .collect(),
    )
}

/// Best minute candle within an hour of the hour anchor, opened at or after
/// the exact call instant.
pub fn select_minute_peak(candles: &[Candle], hour: &Candle, call_ts: DateTime<Utc>) -> Option<Candle> {
    max_high(
        candles
            .iter()
            .filter(|c| within(c.start_time, hour.start_time, Duration::hours(1)))
            .filter(|c| c.start_time >= call_ts)
            .filter(|c| c.high > Decimal::ZERO && c.close > Decimal::ZERO)
            .collect(),
    )
}

/// Window bounds saturate at the ends of the representable range.
fn within(ts: DateTime<Utc>, anchor: DateTime<Utc>, radius: Duration) -> bool {
    let after_lower = anchor.checked_sub_signed(radius).map_or(true, |lower| ts >= lower);
    let before_upper = anchor.checked_add_signed(radius).map_or(true, |upper| ts <= upper);
    after_lower && before_upper
}

/// Request boundary derived from an anchor; an anchor at the edge of time is
/// bad provider data.
fn shift(anchor: DateTime<Utc>, offset: Duration) -> Result<DateTime<Utc>, AthError> {
    anchor
        .checked_add_signed(offset)
        .ok_or_else(|| AthError::Malformed(format!("candle timestamp {} out of range", anchor)))
}

/// Highest `high`; ties go to the earliest candle.
fn max_high(candidates: Vec<&Candle>) -> Option<Candle> {
    NonEmpty::from_vec(candidates).map(|candidates| {
        let best = candidates.maximum_by(|a, b| {
            a.high
                .cmp(&b.high)
                .then_with(|| b.start_time.cmp(&a.start_time))
        });
        (*best).clone()
    })
}

/// Fallback answer from an anchor candle. The anchor bucket may contain the
/// call instant, so the timestamp never precedes the call.
fn anchor_result(call: &CallRecord, anchor: &Candle, tier: Tier) -> AthResult {
    build_result(call, anchor.high, anchor.start_time.max(call.call_timestamp), tier)
}

fn build_result(call: &CallRecord, price: Decimal, timestamp: DateTime<Utc>, tier: Tier) -> AthResult {
    AthResult {
        price,
        timestamp,
        roi_percent: roi_percent(call.entry_price, price),
        tier,
    }
}
