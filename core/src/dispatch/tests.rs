//! Tests for the dispatch engine

use super::shutdown::SignalSource;
use super::*;
use crate::error::BenchError;
use crate::record::CompletedRequestRecord;
use crate::stats::{AggregatorConfig, Snapshot, SnapshotSink, StatsAggregator};
use crate::traits::{ExecutorError, RequestExecutor, Session};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Mock RequestExecutor
// ============================================================================

struct MockExecutor {
    delay: Duration,
    status: u16,
    fail_on_call: Option<usize>,
    started: AtomicUsize,
    completed: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            status: 200,
            fail_on_call: None,
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    fn with_failure_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, _session: &Session) -> Result<CompletedRequestRecord, ExecutorError> {
        let call = self.started.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on_call == Some(call) {
            return Err(ExecutorError::StreamingError("connection reset".into()));
        }

        let end = Instant::now();
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(CompletedRequestRecord {
            request_start_time: start,
            response_time: end,
            first_token_time: end,
            response_end_time: end,
            calls: 1,
            response_status_code: self.status,
            context_tokens: 10,
            generated_tokens: 5,
            deployment_utilization: None,
        })
    }
}

#[derive(Default)]
struct NullSink;

impl SnapshotSink for NullSink {
    fn emit(&self, _snapshot: &Snapshot) {}
}

fn builder(executor: &Arc<MockExecutor>, clients: usize) -> DispatcherBuilder {
    DispatcherBuilder::new()
        .executor(Arc::clone(executor) as Arc<dyn RequestExecutor>)
        .max_concurrency(clients)
        .handle_signals(false)
}

fn both_bounds(calls: u64, duration: Duration, mode: EndConditionMode) -> EndCondition {
    EndCondition {
        call_count: Some(calls),
        duration: Some(duration),
        mode,
    }
}

// ============================================================================
// End conditions
// ============================================================================

#[tokio::test]
async fn test_stops_after_exact_call_count() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(5)));
    let dispatcher = builder(&executor, 4)
        .end_condition(EndCondition::calls(25))
        .build()
        .unwrap();

    let summary = dispatcher.run().await.unwrap();

    assert_eq!(summary.calls_made, 25);
    assert!(!summary.terminated);
    assert_eq!(executor.started(), 25);
    // drained before returning
    assert_eq!(executor.completed(), 25);
}

#[tokio::test]
async fn test_zero_call_count_dispatches_once() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
    let summary = builder(&executor, 2)
        .end_condition(EndCondition::calls(0))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.calls_made, 1);
}

#[tokio::test]
async fn test_stops_after_duration() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(50)));
    let duration = Duration::from_millis(200);
    let start = Instant::now();

    let summary = builder(&executor, 2)
        .end_condition(EndCondition::duration(duration))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(summary.calls_made >= 1);
    assert!(start.elapsed() >= duration);
    // stops no later than the duration plus one request
    assert!(start.elapsed() < duration + Duration::from_secs(1));
    assert_eq!(executor.completed() as u64, summary.calls_made);
}

#[tokio::test]
async fn test_or_mode_ends_on_first_bound() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(10)));
    let start = Instant::now();

    let summary = builder(&executor, 2)
        .end_condition(both_bounds(
            5,
            Duration::from_secs(30),
            EndConditionMode::Or,
        ))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.calls_made, 5);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_and_mode_waits_for_both_bounds() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(10)));
    let duration = Duration::from_millis(300);
    let start = Instant::now();

    let summary = builder(&executor, 2)
        .end_condition(both_bounds(5, duration, EndConditionMode::And))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(summary.calls_made > 5);
    assert!(start.elapsed() > duration);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_in_flight_never_exceeds_ceiling_plus_one() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(20)));
    let summary = builder(&executor, 3)
        .end_condition(EndCondition::calls(40))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.calls_made, 40);
    assert!(
        executor.max_running() <= 4,
        "max in flight was {}",
        executor.max_running()
    );
    assert!(executor.max_running() >= 2);
}

#[tokio::test]
async fn test_single_client_runs_at_most_two_overlapping() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(10)));
    builder(&executor, 1)
        .end_condition(EndCondition::calls(10))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(executor.max_running() <= 2);
}

// ============================================================================
// Termination
// ============================================================================

#[tokio::test]
async fn test_terminate_drains_in_flight_requests() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(50)));
    let dispatcher = builder(&executor, 4).build().unwrap();
    let flag = dispatcher.terminate_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(flag.escalate(), Escalation::Drain);
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), dispatcher.run())
        .await
        .expect("terminated run should return")
        .unwrap();

    assert!(summary.terminated);
    assert!(summary.calls_made >= 1);
    assert_eq!(executor.started() as u64, summary.calls_made);
    assert_eq!(executor.completed() as u64, summary.calls_made);
}

#[tokio::test]
async fn test_terminate_interrupts_rate_limiter_wait() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
    // one permit per minute: the second dispatch would wait ~60s
    let dispatcher = builder(&executor, 2)
        .rate_limiter(Arc::new(RequestRateLimiter::per_minute(1.0).unwrap()))
        .build()
        .unwrap();
    let flag = dispatcher.terminate_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        flag.escalate();
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), dispatcher.run())
        .await
        .expect("rate limiter wait should be interrupted")
        .unwrap();

    assert!(summary.terminated);
    assert_eq!(summary.calls_made, 1);
}

#[tokio::test]
async fn test_second_signal_during_drain_forces_exit() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(300)));
    let forced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&forced);

    let mut dispatcher = builder(&executor, 2)
        .handle_signals(true)
        .force_exit_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .unwrap();
    let (signals, rx) = tokio::sync::mpsc::unbounded_channel();
    dispatcher.signals = SignalSource::Channel(rx);
    let flag = dispatcher.terminate_handle();

    let run = tokio::spawn(dispatcher.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    signals.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), flag.terminated())
        .await
        .expect("first signal should start the drain");

    // requests launched before the first signal are still in flight
    assert!(executor.completed() < executor.started());
    assert_eq!(forced.load(Ordering::SeqCst), 0);

    signals.send(()).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run should return")
        .unwrap()
        .unwrap();

    assert_eq!(forced.load(Ordering::SeqCst), 1);
    assert!(flag.is_forced());
    assert!(summary.terminated);
}

#[tokio::test]
async fn test_terminate_before_run_dispatches_nothing() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
    let dispatcher = builder(&executor, 2).build().unwrap();
    dispatcher.terminate_handle().escalate();

    let summary = dispatcher.run().await.unwrap();

    assert_eq!(summary.calls_made, 0);
    assert!(summary.terminated);
    assert_eq!(executor.started(), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_executor_failure_propagates() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(10)).with_failure_on_call(3));
    let result = builder(&executor, 2)
        .end_condition(EndCondition::calls(1_000))
        .build()
        .unwrap()
        .run()
        .await;

    let err = result.unwrap_err();
    assert!(err.is_executor_failure(), "unexpected error: {err}");
    assert!(executor.started() < 1_000);
}

#[tokio::test]
async fn test_finish_hook_not_called_on_failure() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)).with_failure_on_call(0));
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let result = builder(&executor, 1)
        .end_condition(EndCondition::calls(3))
        .on_finish(move || flag.store(true, Ordering::SeqCst))
        .build()
        .unwrap()
        .run()
        .await;

    assert!(matches!(result, Err(BenchError::Executor(_))));
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_error_status_is_not_a_dispatch_failure() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)).with_status(500));
    let summary = builder(&executor, 2)
        .end_condition(EndCondition::calls(10))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.calls_made, 10);
}

// ============================================================================
// Aggregator and hooks
// ============================================================================

#[tokio::test]
async fn test_records_flow_into_aggregator() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(5)).with_status(429));
    let aggregator = Arc::new(StatsAggregator::with_sink(
        AggregatorConfig {
            clients: 4,
            ..Default::default()
        },
        Arc::new(NullSink),
    ));
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let summary = builder(&executor, 4)
        .end_condition(EndCondition::calls(20))
        .aggregator(Arc::clone(&aggregator))
        .on_finish(move || flag.store(true, Ordering::SeqCst))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let counters = aggregator.counters();
    assert_eq!(summary.calls_made, 20);
    assert_eq!(counters.total_requests, 20);
    assert_eq!(counters.throttled, 20);
    assert_eq!(counters.processing, 0);
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_finish_hook_runs_after_drain() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(30)));
    let completed_at_finish = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&completed_at_finish);
    let exec = Arc::clone(&executor);

    builder(&executor, 3)
        .end_condition(EndCondition::calls(6))
        .on_finish(move || observed.store(exec.completed(), Ordering::SeqCst))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(completed_at_finish.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_uses_provided_session() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
    let summary = builder(&executor, 1)
        .end_condition(EndCondition::calls(2))
        .session(Session::new())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.calls_made, 2);
}

// ============================================================================
// Builder
// ============================================================================

#[test]
fn test_builder_requires_executor() {
    let result = DispatcherBuilder::new().build();
    assert!(matches!(result, Err(BenchError::MissingConfig("executor"))));
}

#[test]
fn test_builder_rejects_zero_concurrency() {
    let executor = Arc::new(MockExecutor::new(Duration::ZERO));
    let result = builder(&executor, 0).build();
    assert!(matches!(result, Err(BenchError::Config(_))));
}

#[test]
fn test_builder_from_load_config() {
    let executor = Arc::new(MockExecutor::new(Duration::ZERO));
    let config = crate::config::LoadConfig::new(7)
        .with_requests(100)
        .with_rate(120.0);

    let dispatcher = DispatcherBuilder::new()
        .config(&config)
        .executor(executor)
        .build()
        .unwrap();

    assert_eq!(dispatcher.max_concurrency(), 7);
    assert_eq!(dispatcher.end_condition().call_count, Some(100));
    assert!(format!("{dispatcher:?}").contains("120.0"));
}

#[test]
fn test_builder_rejects_invalid_rate() {
    let executor = Arc::new(MockExecutor::new(Duration::ZERO));
    let mut config = crate::config::LoadConfig::new(1);
    config.rate = Some(-1.0);

    let result = DispatcherBuilder::new()
        .config(&config)
        .executor(executor)
        .build();
    assert!(matches!(result, Err(BenchError::Config(_))));
}
