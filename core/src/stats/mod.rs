//! Sliding-window statistics aggregation
//!
//! The [`StatsAggregator`] accepts completed request records from any number of
//! producers, keeps timestamped samples inside a sliding window and emits a
//! [`Snapshot`] to its [`SnapshotSink`] every dump interval.

mod aggregator;
mod samples;
mod sink;
mod snapshot;

pub use aggregator::{AggregatorConfig, AggregatorHandle, Counters, RawSamples, StatsAggregator};
pub use samples::SampleSeries;
pub use sink::{LogSink, OutputFormat, SnapshotSink};
pub use snapshot::{
    LatencySummary, Percent, Snapshot, Stat, TokenRates, TokensPerRequest, UtilizationSummary,
    NOT_AVAILABLE,
};
