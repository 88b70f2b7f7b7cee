//! Rate limiting for request dispatch

use async_trait::async_trait;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigError;

/// Interval between dispatches at `requests_per_minute`
pub(crate) fn dispatch_period(requests_per_minute: f64) -> Result<Duration, ConfigError> {
    if !(requests_per_minute > 0.0 && requests_per_minute.is_finite()) {
        return Err(ConfigError::InvalidRate(format!(
            "rate must be a positive number of requests per minute, got {requests_per_minute}"
        )));
    }

    // The limiter keeps its period in u64 nanoseconds
    Duration::try_from_secs_f64(60.0 / requests_per_minute)
        .ok()
        .filter(|period| u64::try_from(period.as_nanos()).is_ok())
        .ok_or_else(|| {
            ConfigError::InvalidRate(format!("rate {requests_per_minute} rpm is too low"))
        })
}

/// Gate the dispatch loop passes through once per dispatch.
///
/// `enter` suspends until the policy permits one dispatch; `exit` runs when the
/// matching [`RateLimitScope`] is dropped.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Wait until one dispatch is permitted
    async fn enter(&self);

    /// Bookkeeping after the dispatch was launched
    fn exit(&self) {}

    /// Whether this limiter never blocks
    fn is_noop(&self) -> bool {
        false
    }
}

/// Scoped rate limiter permit; calls [`RateLimiter::exit`] on drop
#[must_use = "the permit is released as soon as the scope is dropped"]
pub struct RateLimitScope<'a> {
    limiter: &'a dyn RateLimiter,
}

impl<'a> RateLimitScope<'a> {
    /// Wait for the limiter and open a scope
    pub async fn acquire(limiter: &'a dyn RateLimiter) -> RateLimitScope<'a> {
        limiter.enter().await;
        Self { limiter }
    }
}

impl Drop for RateLimitScope<'_> {
    fn drop(&mut self) {
        self.limiter.exit();
    }
}

/// Limiter that never blocks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRateLimiter;

#[async_trait]
impl RateLimiter for NoRateLimiter {
    async fn enter(&self) {}

    fn is_noop(&self) -> bool {
        true
    }
}

/// Token bucket limiter via the governor crate, configured in requests per minute.
///
/// The bucket holds a single permit so dispatches are spread evenly over the
/// minute instead of arriving in bursts.
pub struct RequestRateLimiter {
    limiter: governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    requests_per_minute: f64,
}

impl RequestRateLimiter {
    /// Create a limiter permitting `requests_per_minute` dispatches per minute
    ///
    /// # Examples
    /// ```
    /// use llm_loadgen_core::dispatch::RequestRateLimiter;
    ///
    /// let limiter = RequestRateLimiter::per_minute(600.0).unwrap();
    /// assert_eq!(limiter.requests_per_minute(), 600.0);
    /// assert!(RequestRateLimiter::per_minute(0.0).is_err());
    /// ```
    pub fn per_minute(requests_per_minute: f64) -> Result<Self, ConfigError> {
        let period = dispatch_period(requests_per_minute)?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                ConfigError::InvalidRate(format!("rate {requests_per_minute} rpm is too high"))
            })?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: governor::RateLimiter::direct(quota),
            requests_per_minute,
        })
    }

    /// Configured rate
    pub fn requests_per_minute(&self) -> f64 {
        self.requests_per_minute
    }

    /// Take a permit without waiting; `false` if none is available
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[async_trait]
impl RateLimiter for RequestRateLimiter {
    async fn enter(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("requests_per_minute", &self.requests_per_minute)
            .finish()
    }
}

/// Limiter for an optional rate: a token bucket when set, otherwise [`NoRateLimiter`]
pub fn rate_limiter_for(rate: Option<f64>) -> Result<Arc<dyn RateLimiter>, ConfigError> {
    match rate {
        Some(rpm) => Ok(Arc::new(RequestRateLimiter::per_minute(rpm)?)),
        None => Ok(Arc::new(NoRateLimiter)),
    }
}
