//! Shared provider rate budget built on governor.
//!
//! Every worker draws from one `SharedRateLimiter`. Besides pacing requests to
//! the configured requests-per-minute, it holds a shared pause window: when any
//! worker sees a 429, all workers hold off until the window closes.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument};

/// Requests-per-minute limiter with a shared backoff window.
pub struct SharedRateLimiter {
    /// Underlying governor rate limiter
    limiter: DefaultDirectRateLimiter,
    /// Configured budget
    requests_per_minute: u32,
    /// No permits are handed out before this instant
    paused_until: Mutex<Option<Instant>>,
    /// Permits handed out so far
    granted: AtomicU64,
    /// Pause windows opened or extended so far
    pauses: AtomicU64,
}

impl SharedRateLimiter {
    /// Create a limiter that spaces requests evenly over the minute.
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(rpm).allow_burst(NonZeroU32::MIN);

        Self {
            limiter: RateLimiter::direct(quota),
            requests_per_minute: rpm.get(),
            paused_until: Mutex::new(None),
            granted: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
        }
    }

    /// Wait until a request may be sent, honouring any shared pause.
    pub async fn until_ready(&self) {
        loop {
            let paused_until = *self.paused_until.lock().await;
            match paused_until {
                // Re-check after waking: another worker may have extended the window.
                Some(until) if until > Instant::now() => sleep_until(until).await,
                _ => break,
            }
        }

        self.limiter.until_ready().await;
        self.granted.fetch_add(1, Ordering::Relaxed);
    }

    /// Open (or extend) the shared pause window. Never shortens an existing one.
    #[instrument(skip(self))]
    pub async fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut paused_until = self.paused_until.lock().await;

        if paused_until.map_or(true, |current| current < until) {
            *paused_until = Some(until);
            self.pauses.fetch_add(1, Ordering::Relaxed);
            info!("Provider rate limited, pausing all workers for {:.1}s", duration.as_secs_f64());
        } else {
            debug!("Rate limit pause already covers the requested window");
        }
    }

    /// Whether a pause window is currently open.
    pub async fn is_paused(&self) -> bool {
        self.paused_until
            .lock()
            .await
            .map_or(false, |until| until > Instant::now())
    }

    /// Get current rate limiting statistics.
    pub fn get_stats(&self) -> RateLimitStats {
        RateLimitStats {
            requests_per_minute: self.requests_per_minute,
            granted: self.granted.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
        }
    }
}

/// Rate limiting statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    pub requests_per_minute: u32,
    pub granted: u64,
    pub pauses: u64,
}
