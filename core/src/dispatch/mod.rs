//! Dispatch engine
//!
//! The [`Dispatcher`] drives a load run:
//! - Acquiring a rate limiter permit per dispatch
//! - Bounding in-flight requests by the concurrency ceiling
//! - Stopping on the end condition or a terminate signal
//! - Draining in-flight requests before returning
//!
//! # Example
//!
//! ```ignore
//! use llm_loadgen_core::dispatch::{DispatcherBuilder, EndCondition};
//!
//! let dispatcher = DispatcherBuilder::new()
//!     .max_concurrency(10)
//!     .end_condition(EndCondition::calls(1000))
//!     .executor(executor)
//!     .build()?;
//!
//! let summary = dispatcher.run().await?;
//! ```

mod builder;
mod end_condition;
mod executor;
mod rate_limiter;
mod shutdown;
mod summary;

pub use builder::DispatcherBuilder;
pub use end_condition::{EndCondition, EndConditionMode};
pub use executor::{Dispatcher, FinishHook};
pub use rate_limiter::{
    rate_limiter_for, NoRateLimiter, RateLimitScope, RateLimiter, RequestRateLimiter,
};
pub use shutdown::{exit_process, Escalation, ForceExitHook, TerminateFlag};
pub use summary::RunSummary;

pub(crate) use rate_limiter::dispatch_period;

#[cfg(test)]
mod tests;
