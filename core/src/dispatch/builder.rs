//! Builder pattern for Dispatcher construction

use std::sync::Arc;

use crate::config::{ConfigError, LoadConfig};
use crate::error::{BenchError, BenchResult};
use crate::stats::StatsAggregator;
use crate::traits::{RequestExecutor, Session};

use super::end_condition::EndCondition;
use super::executor::{Dispatcher, FinishHook};
use super::rate_limiter::{rate_limiter_for, RateLimiter};
use super::shutdown::{exit_process, ForceExitHook, SignalSource, TerminateFlag};

/// Builder for creating a Dispatcher
///
/// # Example
///
/// ```ignore
/// let dispatcher = DispatcherBuilder::new()
///     .config(&load_config)
///     .executor(executor)
///     .aggregator(Arc::clone(handle.aggregator()))
///     .build()?;
///
/// let summary = dispatcher.run().await?;
/// ```
pub struct DispatcherBuilder {
    executor: Option<Arc<dyn RequestExecutor>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    rate: Option<f64>,
    max_concurrency: usize,
    end_condition: EndCondition,
    aggregator: Option<Arc<StatsAggregator>>,
    finish_hook: Option<FinishHook>,
    session: Option<Session>,
    force_exit: Option<ForceExitHook>,
    handle_signals: bool,
}

impl DispatcherBuilder {
    /// Create a builder with one client, no rate limit and no end condition
    pub fn new() -> Self {
        Self {
            executor: None,
            rate_limiter: None,
            rate: None,
            max_concurrency: 1,
            end_condition: EndCondition::unbounded(),
            aggregator: None,
            finish_hook: None,
            session: None,
            force_exit: None,
            handle_signals: true,
        }
    }

    /// Take concurrency, end condition and rate from a load configuration
    pub fn config(mut self, config: &LoadConfig) -> Self {
        self.max_concurrency = config.clients;
        self.end_condition = config.end_condition();
        self.rate = config.rate;
        self
    }

    /// Set the request executor
    pub fn executor(mut self, executor: Arc<dyn RequestExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the rate limiter, overriding any configured rate
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Set the concurrency ceiling
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the end condition
    pub fn end_condition(mut self, end_condition: EndCondition) -> Self {
        self.end_condition = end_condition;
        self
    }

    /// Report every dispatch and completed record to this aggregator
    pub fn aggregator(mut self, aggregator: Arc<StatsAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Run `hook` after the drain
    pub fn on_finish(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.finish_hook = Some(Box::new(hook));
        self
    }

    /// Use an existing transport session instead of creating one
    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Replace the action taken on the second terminate signal
    pub fn force_exit_hook(mut self, hook: ForceExitHook) -> Self {
        self.force_exit = Some(hook);
        self
    }

    /// Whether to listen for SIGINT/SIGTERM during the run (default true)
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Build the dispatcher
    ///
    /// # Errors
    ///
    /// Returns an error if no executor is set, the concurrency ceiling is zero,
    /// or the configured rate is invalid.
    pub fn build(self) -> BenchResult<Dispatcher> {
        let executor = self
            .executor
            .ok_or_else(|| BenchError::missing_config("executor"))?;

        if self.max_concurrency == 0 {
            return Err(
                ConfigError::InvalidClients("clients must be at least 1".into()).into(),
            );
        }

        let rate_limiter = match self.rate_limiter {
            Some(limiter) => limiter,
            None => rate_limiter_for(self.rate)?,
        };

        Ok(Dispatcher {
            executor,
            rate_limiter,
            max_concurrency: self.max_concurrency,
            end_condition: self.end_condition,
            aggregator: self.aggregator,
            finish_hook: self.finish_hook,
            session: self.session,
            terminate: Arc::new(TerminateFlag::new()),
            force_exit: self.force_exit.unwrap_or_else(exit_process),
            handle_signals: self.handle_signals,
            signals: SignalSource::Os,
        })
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
