//! Load run configuration

use crate::dispatch::{dispatch_period, EndCondition, EndConditionMode};
use crate::stats::{AggregatorConfig, OutputFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Load run configuration
///
/// Defines how a load run is driven (concurrency, end condition, rate) and how
/// its statistics are aggregated. Deserializable from TOML; durations accept
/// humantime strings such as `"60s"` or `"5m"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Maximum number of concurrent in-flight requests
    pub clients: usize,

    /// Number of requests to dispatch; unset means no request bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<u64>,

    /// Maximum run length; unset means no duration bound
    #[serde(
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,

    /// How `requests` and `duration` combine
    pub run_end_condition_mode: EndConditionMode,

    /// Target dispatch rate in requests per minute; unset means as fast as possible
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,

    /// Sliding window over which statistics are aggregated
    #[serde(with = "humantime_serde")]
    pub aggregation_window: Duration,

    /// Interval between snapshots
    #[serde(with = "humantime_serde")]
    pub dump_interval: Duration,

    /// Generated tokens each response is expected to contain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_gen_tokens: Option<u64>,

    /// Snapshot output format
    pub output_format: OutputFormat,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            clients: 20,
            requests: None,
            duration: None,
            run_end_condition_mode: EndConditionMode::default(),
            rate: None,
            aggregation_window: Duration::from_secs(60),
            dump_interval: Duration::from_secs(5),
            expected_gen_tokens: None,
            output_format: OutputFormat::default(),
        }
    }
}

impl LoadConfig {
    /// Create a new config with the given number of clients
    pub fn new(clients: usize) -> Self {
        Self {
            clients,
            ..Default::default()
        }
    }

    /// Set the request bound
    pub fn with_requests(mut self, requests: u64) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Set the duration bound
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set the end condition mode
    pub fn with_end_condition_mode(mut self, mode: EndConditionMode) -> Self {
        self.run_end_condition_mode = mode;
        self
    }

    /// Set the rate limit (requests per minute)
    pub fn with_rate(mut self, rpm: f64) -> Self {
        self.rate = Some(rpm);
        self
    }

    /// Set the aggregation window
    pub fn with_aggregation_window(mut self, window: Duration) -> Self {
        self.aggregation_window = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients == 0 {
            return Err(ConfigError::InvalidClients(
                "clients must be at least 1".into(),
            ));
        }

        if let Some(rpm) = self.rate {
            dispatch_period(rpm)?;
        }

        if self.aggregation_window.is_zero() {
            return Err(ConfigError::InvalidWindow(
                "aggregation window must be positive".into(),
            ));
        }

        if self.dump_interval.is_zero() {
            return Err(ConfigError::InvalidWindow(
                "dump interval must be positive".into(),
            ));
        }

        Ok(())
    }

    /// End condition derived from `requests`, `duration` and the mode
    pub fn end_condition(&self) -> EndCondition {
        EndCondition {
            call_count: self.requests,
            duration: self.duration,
            mode: self.run_end_condition_mode,
        }
    }

    /// Aggregator settings derived from this config
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            clients: self.clients,
            dump_interval: self.dump_interval,
            window: self.aggregation_window,
            expected_gen_tokens: self.expected_gen_tokens,
            output_format: self.output_format,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid client count
    #[error("Invalid clients: {0}")]
    InvalidClients(String),

    /// Invalid rate
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    /// Invalid aggregation window or dump interval
    #[error("Invalid window: {0}")]
    InvalidWindow(String),
}
