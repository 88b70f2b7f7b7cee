//! Completed request records and the timing derived from them

use std::time::{Duration, Instant};

/// HTTP status the aggregator treats as success
pub const STATUS_OK: u16 = 200;

/// HTTP status the aggregator counts as throttled
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Outcome of one logical request, produced by a [`RequestExecutor`].
///
/// All timestamps are monotonic. A record is created once per logical request
/// (however many retry attempts that took) and is handed to the stats
/// aggregator exactly once.
///
/// [`RequestExecutor`]: crate::traits::RequestExecutor
#[derive(Debug, Clone)]
pub struct CompletedRequestRecord {
    /// When the first attempt was sent
    pub request_start_time: Instant,

    /// When the response headers of the final attempt arrived
    pub response_time: Instant,

    /// When the first generated token arrived
    pub first_token_time: Instant,

    /// When the response body was fully read
    pub response_end_time: Instant,

    /// Number of attempts made for this logical request
    pub calls: u32,

    /// Status code of the final attempt
    pub response_status_code: u16,

    /// Prompt tokens
    pub context_tokens: u64,

    /// Completion tokens
    pub generated_tokens: u64,

    /// Server-reported deployment utilization in percent, when available
    pub deployment_utilization: Option<f64>,
}

impl CompletedRequestRecord {
    /// Create a record whose timestamps all equal `request_start_time`.
    ///
    /// Executors fill in the remaining timestamps as the response progresses.
    pub fn started_at(request_start_time: Instant) -> Self {
        Self {
            request_start_time,
            response_time: request_start_time,
            first_token_time: request_start_time,
            response_end_time: request_start_time,
            calls: 0,
            response_status_code: 0,
            context_tokens: 0,
            generated_tokens: 0,
            deployment_utilization: None,
        }
    }

    /// Whether the final attempt returned 200
    pub fn is_success(&self) -> bool {
        self.response_status_code == STATUS_OK
    }

    /// Whether the final attempt was rate limited
    pub fn is_throttled(&self) -> bool {
        self.response_status_code == STATUS_TOO_MANY_REQUESTS
    }

    /// End-to-end latency
    pub fn e2e_latency(&self) -> Duration {
        self.response_end_time
            .saturating_duration_since(self.request_start_time)
    }

    /// Time until the response headers arrived
    pub fn time_to_response(&self) -> Duration {
        self.response_time
            .saturating_duration_since(self.request_start_time)
    }

    /// Time to first token
    pub fn ttft(&self) -> Duration {
        self.first_token_time
            .saturating_duration_since(self.request_start_time)
    }

    /// Average time between generated tokens after the first one.
    ///
    /// `None` when no tokens were generated.
    pub fn inter_token_latency(&self) -> Option<Duration> {
        if self.generated_tokens == 0 {
            return None;
        }
        let generation = self
            .response_end_time
            .saturating_duration_since(self.first_token_time);
        Some(generation.div_f64(self.generated_tokens as f64))
    }
}
