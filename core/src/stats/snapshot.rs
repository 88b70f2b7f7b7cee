//! Periodic statistics snapshot and its output formats

use serde::{Serialize, Serializer};
use std::fmt;

/// Placeholder emitted for statistics without enough samples
pub const NOT_AVAILABLE: &str = "n/a";

/// A statistic that may be unavailable.
///
/// Serializes as the bare value, or as the string `"n/a"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat<T> {
    /// Computed value
    Value(T),
    /// Not enough samples
    NotAvailable,
}

impl<T> Stat<T> {
    /// Build from an optional value
    pub fn from_option(value: Option<T>) -> Self {
        value.map_or(Stat::NotAvailable, Stat::Value)
    }

    /// The value, if available
    pub fn value(&self) -> Option<&T> {
        match self {
            Stat::Value(v) => Some(v),
            Stat::NotAvailable => None,
        }
    }

    /// Whether the statistic is missing
    pub fn is_not_available(&self) -> bool {
        matches!(self, Stat::NotAvailable)
    }
}

impl<T: Serialize> Serialize for Stat<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Stat::Value(v) => v.serialize(serializer),
            Stat::NotAvailable => serializer.serialize_str(NOT_AVAILABLE),
        }
    }
}

impl<T: fmt::Display> fmt::Display for Stat<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pad() so column widths in the human line apply to both variants
        match self {
            Stat::Value(v) => f.pad(&v.to_string()),
            Stat::NotAvailable => f.pad(NOT_AVAILABLE),
        }
    }
}

/// Utilization percentage, rendered as `"42.5%"`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percent(pub f64);

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("{}%", self.0))
    }
}

impl Serialize for Percent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Tokens per minute
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenRates {
    /// Context (prompt) tokens per minute
    pub context: Stat<f64>,
    /// Generated tokens per minute
    pub gen: Stat<f64>,
    /// Sum of the available rates
    pub total: f64,
}

/// Average and 95th percentile of a latency series, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Mean
    pub avg: Stat<f64>,
    /// 95th percentile
    #[serde(rename = "95th")]
    pub p95: Stat<f64>,
}

/// Generated tokens per request
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokensPerRequest {
    /// 10th percentile
    #[serde(rename = "10th")]
    pub p10: Stat<u64>,
    /// Mean
    pub avg: Stat<u64>,
    /// 90th percentile
    #[serde(rename = "90th")]
    pub p90: Stat<u64>,
}

/// Deployment utilization
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilizationSummary {
    /// Mean
    pub avg: Stat<Percent>,
    /// 95th percentile
    #[serde(rename = "95th")]
    pub p95: Stat<Percent>,
}

/// One periodic statistics snapshot.
///
/// Field names are part of the output format consumed by log post-processing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Whole seconds since the aggregator started
    pub run_seconds: u64,
    /// Local wall-clock time of the snapshot
    pub timestamp: String,
    /// Successful requests per minute over the window
    pub rpm: Stat<f64>,
    /// In-flight requests, clamped to the client count
    pub processing: u64,
    /// Lifetime completed requests
    pub completed: u64,
    /// Lifetime non-200 responses
    pub failures: u64,
    /// Lifetime 429 responses
    pub throttled: u64,
    /// Same as `completed`
    pub requests: u64,
    /// Token throughput
    pub tpm: TokenRates,
    /// End-to-end latency
    pub e2e: LatencySummary,
    /// Time to first token
    pub ttft: LatencySummary,
    /// Time between tokens
    pub tbt: LatencySummary,
    /// Average context tokens per request
    pub context_tpr_avg: Stat<u64>,
    /// Generated tokens per request
    pub gen_tpr: TokensPerRequest,
    /// Deployment utilization
    pub util: UtilizationSummary,
}

impl Snapshot {
    /// Render as a single JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }

    /// Render as the fixed-column human readable line
    pub fn to_human_line(&self) -> String {
        format!(
            "rpm: {:<5} processing: {:<4} completed: {:<5} failures: {:<4} throttled: {:<4} \
             requests: {:<5} tpm: {:<6} ttft_avg: {:<6} ttft_95th: {:<6} tbt_avg: {:<6} \
             tbt_95th: {:<6} e2e_avg: {:<6} e2e_95th: {:<6} context_tpr_avg {:<4} \
             gen_tpr_10th {:<4} gen_tpr_avg {:<4} gen_tpr_90th {:<4} util_avg: {:<6} \
             util_95th: {:<6}",
            self.rpm,
            self.processing,
            self.completed,
            self.failures,
            self.throttled,
            self.requests,
            self.tpm.total,
            self.ttft.avg,
            self.ttft.p95,
            self.tbt.avg,
            self.tbt.p95,
            self.e2e.avg,
            self.e2e.p95,
            self.context_tpr_avg,
            self.gen_tpr.p10,
            self.gen_tpr.avg,
            self.gen_tpr.p90,
            self.util.avg,
            self.util.p95,
        )
    }
}
