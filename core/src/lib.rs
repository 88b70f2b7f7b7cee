//! llm-loadgen-core: dispatch engine and sliding-window statistics
//!
//! This crate provides the load-generation core used by the `loadgen` binary:
//!
//! - The dispatch engine (rate-limited, concurrency-bounded request loop with
//!   two-stage termination)
//! - The stats aggregator (thread-safe sliding-window metrics with periodic
//!   snapshots)
//! - The request executor contract and the completed request record
//! - Run configuration and error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod record;
pub mod stats;
pub mod traits;

pub use config::{ConfigError, LoadConfig};
pub use dispatch::{
    Dispatcher, DispatcherBuilder, EndCondition, EndConditionMode, RateLimiter, RunSummary,
    TerminateFlag,
};
pub use error::{BenchError, BenchResult};
pub use record::CompletedRequestRecord;
pub use stats::{AggregatorConfig, AggregatorHandle, OutputFormat, Snapshot, StatsAggregator};
pub use traits::{ExecutorError, RequestExecutor, Session};
