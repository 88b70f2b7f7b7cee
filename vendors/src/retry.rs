//! Retry policy for throttled and failed attempts

use std::str::FromStr;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Total time a logical request may spend retrying
pub const RETRY_BUDGET: Duration = Duration::from_secs(60);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How throttled and server-error attempts are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Every attempt's result is final
    #[default]
    None,
    /// Retry 429 and 5xx with capped exponential backoff within [`RETRY_BUDGET`]
    Exponential,
}

impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(RetryPolicy::None),
            "exponential" => Ok(RetryPolicy::Exponential),
            other => Err(format!("unknown retry policy '{other}' (expected none or exponential)")),
        }
    }
}

impl RetryPolicy {
    /// Whether an attempt that returned `status` may be retried
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        match self {
            RetryPolicy::None => false,
            RetryPolicy::Exponential => {
                status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }

    /// Delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` is the number of attempts made so far and `spent` the time
    /// since the first one. The server's `retry-after-ms` or `retry-after`
    /// header takes precedence over the computed backoff.
    pub fn next_delay(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        attempt: u32,
        spent: Duration,
    ) -> Option<Duration> {
        if !self.is_retryable(status) {
            return None;
        }

        let delay = retry_after(headers).unwrap_or_else(|| backoff(attempt));
        (spent.saturating_add(delay) <= RETRY_BUDGET).then_some(delay)
    }
}

/// Exponential backoff after `attempt` attempts: 1s, 2s, 4s, ... capped at 30s
fn backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    INITIAL_BACKOFF
        .saturating_mul(1u32 << exponent)
        .min(MAX_BACKOFF)
}

/// Server-requested delay from `retry-after-ms` or `retry-after` (seconds)
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header_f64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };

    // Values too large for a Duration saturate, so the budget check gives up
    let to_duration =
        |secs: f64| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

    header_f64("retry-after-ms")
        .map(|ms| to_duration(ms / 1000.0))
        .or_else(|| header_f64("retry-after").map(to_duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("none".parse::<RetryPolicy>(), Ok(RetryPolicy::None));
        assert_eq!(
            "Exponential".parse::<RetryPolicy>(),
            Ok(RetryPolicy::Exponential)
        );
        assert!("linear".parse::<RetryPolicy>().is_err());
    }

    #[test]
    fn test_retryable_statuses() {
        let policy = RetryPolicy::Exponential;
        assert!(policy.is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(policy.is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!policy.is_retryable(StatusCode::BAD_REQUEST));
        assert!(!policy.is_retryable(StatusCode::OK));
        assert!(!RetryPolicy::None.is_retryable(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(10), MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_retry_after_headers() {
        assert_eq!(
            retry_after(&headers(&[("retry-after-ms", "250")])),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            retry_after(&headers(&[("retry-after", "3")])),
            Some(Duration::from_secs(3))
        );
        // milliseconds win
        assert_eq!(
            retry_after(&headers(&[("retry-after", "3"), ("retry-after-ms", "100")])),
            Some(Duration::from_millis(100))
        );
        assert_eq!(retry_after(&headers(&[("retry-after", "soon")])), None);
    }

    #[test]
    fn test_next_delay_respects_budget() {
        let policy = RetryPolicy::Exponential;
        let empty = HeaderMap::new();

        assert_eq!(
            policy.next_delay(StatusCode::TOO_MANY_REQUESTS, &empty, 1, Duration::ZERO),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            policy.next_delay(
                StatusCode::TOO_MANY_REQUESTS,
                &empty,
                1,
                Duration::from_secs(59) + Duration::from_millis(500)
            ),
            None
        );
        assert_eq!(
            policy.next_delay(StatusCode::BAD_REQUEST, &empty, 1, Duration::ZERO),
            None
        );
    }

    #[test]
    fn test_oversized_retry_after_gives_up() {
        let policy = RetryPolicy::Exponential;

        assert_eq!(
            retry_after(&headers(&[("retry-after", "1e30")])),
            Some(Duration::MAX)
        );
        assert_eq!(
            policy.next_delay(
                StatusCode::TOO_MANY_REQUESTS,
                &headers(&[("retry-after", "1e30")]),
                1,
                Duration::ZERO
            ),
            None
        );
        assert_eq!(
            policy.next_delay(
                StatusCode::SERVICE_UNAVAILABLE,
                &headers(&[("retry-after-ms", "1e300")]),
                1,
                Duration::from_secs(5)
            ),
            None
        );
    }
}
