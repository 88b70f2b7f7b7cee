//! Dispatch loop execution logic

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::error::BenchResult;
use crate::stats::StatsAggregator;
use crate::traits::{ExecutorError, RequestExecutor, Session};

use super::end_condition::EndCondition;
use super::rate_limiter::{RateLimitScope, RateLimiter};
use super::shutdown::{spawn_signal_listener, ForceExitHook, SignalSource, TerminateFlag};
use super::summary::RunSummary;

/// A wait for a free slot longer than this means the rate cannot be sustained
const LAG_THRESHOLD: Duration = Duration::from_secs(1);

/// Run-completion hook, called after the drain and before the session is closed
pub type FinishHook = Box<dyn FnOnce() + Send + Sync>;

/// Per-run dispatch state
struct DispatchState {
    in_flight: JoinSet<Result<(), ExecutorError>>,
    calls_made: u64,
    start: Instant,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            in_flight: JoinSet::new(),
            calls_made: 0,
            start: Instant::now(),
        }
    }

    /// Wait for the first in-flight request to finish
    async fn wait_for_one(&mut self) -> BenchResult<()> {
        if let Some(joined) = self.in_flight.join_next().await {
            joined??;
        }
        Ok(())
    }

    /// Wait for every in-flight request to finish
    async fn drain(&mut self) -> BenchResult<()> {
        while let Some(joined) = self.in_flight.join_next().await {
            joined??;
        }
        Ok(())
    }
}

/// The dispatch engine.
///
/// Launches one executor invocation per loop iteration, bounded by the rate
/// limiter and the concurrency ceiling, until the end condition is met or a
/// terminate signal arrives, then drains the in-flight requests. A dispatcher
/// serves a single run; build it with [`DispatcherBuilder`].
///
/// [`DispatcherBuilder`]: super::DispatcherBuilder
pub struct Dispatcher {
    pub(crate) executor: Arc<dyn RequestExecutor>,
    pub(crate) rate_limiter: Arc<dyn RateLimiter>,
    pub(crate) max_concurrency: usize,
    pub(crate) end_condition: EndCondition,
    pub(crate) aggregator: Option<Arc<StatsAggregator>>,
    pub(crate) finish_hook: Option<FinishHook>,
    pub(crate) session: Option<Session>,
    pub(crate) terminate: Arc<TerminateFlag>,
    pub(crate) force_exit: ForceExitHook,
    pub(crate) handle_signals: bool,
    pub(crate) signals: SignalSource,
}

impl Dispatcher {
    /// Flag that stops the run; raising it once drains, twice forces
    pub fn terminate_handle(&self) -> Arc<TerminateFlag> {
        Arc::clone(&self.terminate)
    }

    /// End condition of this run
    pub fn end_condition(&self) -> &EndCondition {
        &self.end_condition
    }

    /// Concurrency ceiling
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run until the end condition is met or a terminate signal arrives.
    ///
    /// A terminal executor failure aborts every other in-flight request and is
    /// returned as [`BenchError::Executor`](crate::BenchError::Executor).
    pub async fn run(mut self) -> BenchResult<RunSummary> {
        let session = match self.session.take() {
            Some(session) => session,
            None => Session::builder()
                .pool_max_idle_per_host(self.max_concurrency)
                .build()?,
        };

        let listener = self.handle_signals.then(|| {
            spawn_signal_listener(
                Arc::clone(&self.terminate),
                Arc::clone(&self.force_exit),
                std::mem::take(&mut self.signals),
            )
        });

        let result = self.dispatch(&session).await;

        // Signal handling ends with the run
        if let Some(listener) = listener {
            listener.abort();
        }

        let summary = result?;
        if let Some(hook) = self.finish_hook.take() {
            hook();
        }
        drop(session);

        tracing::info!(
            calls_made = summary.calls_made,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            terminated = summary.terminated,
            "Load run completed"
        );
        Ok(summary)
    }

    async fn dispatch(&self, session: &Session) -> BenchResult<RunSummary> {
        let mut state = DispatchState::new();

        tracing::info!(
            executor = self.executor.name(),
            max_concurrency = self.max_concurrency,
            call_count = ?self.end_condition.call_count,
            duration = ?self.end_condition.duration,
            mode = ?self.end_condition.mode,
            "Starting load run"
        );

        loop {
            if self.terminate.is_terminating() {
                break;
            }

            let scope = tokio::select! {
                scope = RateLimitScope::acquire(self.rate_limiter.as_ref()) => scope,
                _ = self.terminate.terminated() => break,
            };

            if state.in_flight.len() > self.max_concurrency {
                let wait_start = Instant::now();
                state.wait_for_one().await?;
                let waited = wait_start.elapsed();
                if waited > LAG_THRESHOLD && !self.rate_limiter.is_noop() {
                    tracing::warn!(
                        "falling behind committed rate by {:.3}s, consider increasing number of clients.",
                        waited.as_secs_f64()
                    );
                }
            }

            self.launch(&mut state, session);
            drop(scope);

            if self
                .end_condition
                .is_met(state.calls_made, state.start.elapsed())
            {
                break;
            }
        }

        if !state.in_flight.is_empty() {
            tracing::info!("waiting for {} requests to drain", state.in_flight.len());
        }
        state.drain().await?;

        Ok(RunSummary {
            calls_made: state.calls_made,
            elapsed: state.start.elapsed(),
            terminated: self.terminate.is_terminating(),
        })
    }

    fn launch(&self, state: &mut DispatchState, session: &Session) {
        if let Some(aggregator) = &self.aggregator {
            aggregator.record_new_request();
        }

        let executor = Arc::clone(&self.executor);
        let aggregator = self.aggregator.clone();
        let session = session.clone();

        state.in_flight.spawn(async move {
            let record = executor.execute(&session).await?;
            if let Some(aggregator) = aggregator {
                aggregator.aggregate_request(&record);
            }
            Ok(())
        });
        state.calls_made += 1;

        tracing::trace!(
            calls_made = state.calls_made,
            in_flight = state.in_flight.len(),
            "Dispatched request"
        );
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("executor", &self.executor.name())
            .field("rate_limiter", &self.rate_limiter)
            .field("max_concurrency", &self.max_concurrency)
            .field("end_condition", &self.end_condition)
            .field("handle_signals", &self.handle_signals)
            .finish()
    }
}
