//! Thread-safe sliding-window request statistics

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::metrics::{average, percentile, round_to};
use crate::record::CompletedRequestRecord;

use super::samples::SampleSeries;
use super::sink::{LogSink, OutputFormat, SnapshotSink};
use super::snapshot::{
    LatencySummary, Percent, Snapshot, Stat, TokenRates, TokensPerRequest, UtilizationSummary,
};

/// Cadence, in run seconds, of the generated-token shortfall warning
const SHORTFALL_WARNING_PERIOD_SECS: u64 = 10;

/// Observed/expected generated-token ratio below which the shortfall warning fires
const SHORTFALL_RATIO: f64 = 0.9;

/// Aggregator settings
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Client (concurrency) count; caps the reported in-flight count
    pub clients: usize,

    /// Interval between snapshots
    pub dump_interval: Duration,

    /// Sliding window over which statistics are computed
    pub window: Duration,

    /// Generated tokens each response is expected to contain
    pub expected_gen_tokens: Option<u64>,

    /// Format used by the default log sink
    pub output_format: OutputFormat,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            clients: 1,
            dump_interval: Duration::from_secs(5),
            window: Duration::from_secs(60),
            expected_gen_tokens: None,
            output_format: OutputFormat::default(),
        }
    }
}

/// Lifetime counters (never trimmed)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Requests recorded as started but not yet aggregated
    pub processing: i64,
    /// Requests aggregated
    pub total_requests: u64,
    /// Requests with a non-200 status
    pub total_failed: u64,
    /// Requests with a 429 status
    pub throttled: u64,
}

/// Every windowed sample, as written by [`StatsAggregator::dump_raw_call_stats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawSamples {
    /// Start of each successful request, seconds since the aggregator started
    pub request_timestamps: Vec<f64>,
    /// End-to-end latencies
    pub request_latency: Vec<f64>,
    /// Attempts per request
    pub call_tries: Vec<u32>,
    /// Time to response headers
    pub response_latencies: Vec<f64>,
    /// Time to first token
    pub first_token_latencies: Vec<f64>,
    /// Time between tokens
    pub token_latencies: Vec<f64>,
    /// Context tokens per request
    pub context_tokens: Vec<u64>,
    /// Generated tokens per request
    pub generated_tokens: Vec<u64>,
    /// Deployment utilization samples
    pub utilizations: Vec<f64>,
}

/// State guarded by the aggregator lock
#[derive(Debug)]
struct AggregatorState {
    start_time: Instant,
    stopped: bool,
    counters: Counters,
    last_snapshot: Option<Snapshot>,

    call_tries: SampleSeries<u32>,
    request_timestamps: SampleSeries<f64>,
    request_latency: SampleSeries<f64>,
    response_latencies: SampleSeries<f64>,
    first_token_latencies: SampleSeries<f64>,
    token_latencies: SampleSeries<f64>,
    context_tokens: SampleSeries<f64>,
    generated_tokens: SampleSeries<f64>,
    utilizations: SampleSeries<f64>,
}

impl AggregatorState {
    fn new(start_time: Instant) -> Self {
        Self {
            start_time,
            stopped: false,
            counters: Counters::default(),
            last_snapshot: None,
            call_tries: SampleSeries::new(),
            request_timestamps: SampleSeries::new(),
            request_latency: SampleSeries::new(),
            response_latencies: SampleSeries::new(),
            first_token_latencies: SampleSeries::new(),
            token_latencies: SampleSeries::new(),
            context_tokens: SampleSeries::new(),
            generated_tokens: SampleSeries::new(),
            utilizations: SampleSeries::new(),
        }
    }

    fn slide_window(&mut self, now: Instant, window: Duration) {
        self.call_tries.trim_oldest(now, window);
        self.request_timestamps.trim_oldest(now, window);
        self.request_latency.trim_oldest(now, window);
        self.response_latencies.trim_oldest(now, window);
        self.first_token_latencies.trim_oldest(now, window);
        self.token_latencies.trim_oldest(now, window);
        self.context_tokens.trim_oldest(now, window);
        self.generated_tokens.trim_oldest(now, window);
        self.utilizations.trim_oldest(now, window);
    }

    fn snapshot(&self, now: Instant, config: &AggregatorConfig) -> Snapshot {
        let run_seconds = now
            .saturating_duration_since(self.start_time)
            .as_secs_f64()
            .round() as u64;
        // Until a full window has elapsed, rates are computed over the run so far.
        let dynamic_window = (run_seconds.max(1) as f64).min(config.window.as_secs_f64());

        let per_minute = |series: &SampleSeries<f64>| {
            Stat::from_option(
                (!series.is_empty()).then(|| round_to(60.0 * series.sum() / dynamic_window, 0)),
            )
        };
        let context_per_minute = per_minute(&self.context_tokens);
        let gen_per_minute = per_minute(&self.generated_tokens);
        let tokens_per_minute = context_per_minute.value().copied().unwrap_or(0.0)
            + gen_per_minute.value().copied().unwrap_or(0.0);

        let context_tokens = self.context_tokens.to_f64_vec();
        let generated_tokens = self.generated_tokens.to_f64_vec();
        let utilizations = self.utilizations.to_f64_vec();

        let rpm = Stat::from_option((!self.request_timestamps.is_empty()).then(|| {
            round_to(
                60.0 * self.request_timestamps.len() as f64 / dynamic_window,
                1,
            )
        }));

        let processing = self.counters.processing.clamp(0, config.clients as i64) as u64;

        Snapshot {
            run_seconds,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            rpm,
            processing,
            completed: self.counters.total_requests,
            failures: self.counters.total_failed,
            throttled: self.counters.throttled,
            requests: self.counters.total_requests,
            tpm: TokenRates {
                context: context_per_minute,
                gen: gen_per_minute,
                total: tokens_per_minute,
            },
            e2e: latency_summary(&self.request_latency),
            ttft: latency_summary(&self.first_token_latencies),
            tbt: latency_summary(&self.token_latencies),
            context_tpr_avg: Stat::from_option(average(&context_tokens).map(|v| v as u64)),
            gen_tpr: TokensPerRequest {
                p10: percentile_stat(&generated_tokens, 10.0).map_value(|v| v as u64),
                avg: Stat::from_option(average(&generated_tokens).map(|v| v as u64)),
                p90: percentile_stat(&generated_tokens, 90.0).map_value(|v| v as u64),
            },
            util: UtilizationSummary {
                avg: Stat::from_option(average(&utilizations).map(|v| Percent(round_to(v, 1)))),
                p95: percentile_stat(&utilizations, 95.0).map_value(|v| Percent(round_to(v, 1))),
            },
        }
    }

    fn raw_samples(&self) -> RawSamples {
        let round_all = |series: &SampleSeries<f64>, decimals: u32| -> Vec<f64> {
            series.values().map(|v| round_to(v, decimals)).collect()
        };
        RawSamples {
            request_timestamps: round_all(&self.request_timestamps, 4),
            request_latency: round_all(&self.request_latency, 4),
            call_tries: self.call_tries.values().collect(),
            response_latencies: round_all(&self.response_latencies, 4),
            first_token_latencies: round_all(&self.first_token_latencies, 4),
            token_latencies: round_all(&self.token_latencies, 5),
            context_tokens: self.context_tokens.values().map(|v| v as u64).collect(),
            generated_tokens: self.generated_tokens.values().map(|v| v as u64).collect(),
            utilizations: self.utilizations.values().collect(),
        }
    }
}

impl<T> Stat<T> {
    fn map_value<U>(self, f: impl FnOnce(T) -> U) -> Stat<U> {
        match self {
            Stat::Value(v) => Stat::Value(f(v)),
            Stat::NotAvailable => Stat::NotAvailable,
        }
    }
}

/// Percentiles need at least two samples
fn percentile_stat(values: &[f64], p: f64) -> Stat<f64> {
    if values.len() < 2 {
        return Stat::NotAvailable;
    }
    Stat::from_option(percentile(values, p))
}

fn latency_summary(series: &SampleSeries<f64>) -> LatencySummary {
    let values = series.to_f64_vec();
    LatencySummary {
        avg: Stat::from_option(average(&values).map(|v| round_to(v, 3))),
        p95: percentile_stat(&values, 95.0).map_value(|v| round_to(v, 3)),
    }
}

/// Whether the generated-token shortfall warning should fire for this snapshot
fn generated_tokens_shortfall(snapshot: &Snapshot, expected_gen_tokens: Option<u64>) -> bool {
    let (Some(expected), Stat::Value(avg)) = (expected_gen_tokens, snapshot.gen_tpr.avg) else {
        return false;
    };
    snapshot.run_seconds % SHORTFALL_WARNING_PERIOD_SECS == 0
        && (avg as f64) < SHORTFALL_RATIO * expected as f64
}

/// Aggregates completed requests over a sliding window and periodically emits
/// [`Snapshot`]s.
///
/// Every operation takes the single internal lock for its whole body. Producers
/// share the aggregator through an `Arc`; [`StatsAggregator::start`] runs the
/// periodic dump loop on its own thread.
pub struct StatsAggregator {
    config: AggregatorConfig,
    state: Mutex<AggregatorState>,
    sink: Arc<dyn SnapshotSink>,
}

impl StatsAggregator {
    /// Create an aggregator that logs snapshots in the configured format
    pub fn new(config: AggregatorConfig) -> Self {
        let sink = Arc::new(LogSink::new(config.output_format));
        Self::with_sink(config, sink)
    }

    /// Create an aggregator with a custom snapshot sink
    pub fn with_sink(config: AggregatorConfig, sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            config,
            state: Mutex::new(AggregatorState::new(Instant::now())),
            sink,
        }
    }

    /// Aggregator settings
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// When the current run started
    pub fn start_time(&self) -> Instant {
        self.lock().start_time
    }

    /// Start the periodic dump loop on a background thread.
    ///
    /// Resets the run start time. Use [`AggregatorHandle::stop`] to end the loop.
    pub fn start(self: Arc<Self>) -> io::Result<AggregatorHandle> {
        self.lock().start_time = Instant::now();

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let aggregator = Arc::clone(&self);
        let interval = self.config.dump_interval;

        let join = thread::Builder::new()
            .name("stats-aggregator".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        aggregator.dump();
                        aggregator.slide_window();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        tracing::debug!(
            dump_interval_secs = interval.as_secs_f64(),
            window_secs = self.config.window.as_secs_f64(),
            "Stats aggregator started"
        );

        Ok(AggregatorHandle {
            aggregator: self,
            stop_tx,
            join: Some(join),
        })
    }

    /// Record that a request is about to be dispatched
    pub fn record_new_request(&self) {
        let mut state = self.lock();
        if state.stopped {
            tracing::debug!("Ignoring new request on a stopped aggregator");
            return;
        }
        state.counters.processing += 1;
    }

    /// Fold one completed request into the lifetime counters and windowed series
    pub fn aggregate_request(&self, record: &CompletedRequestRecord) {
        let mut state = self.lock();
        if state.stopped {
            tracing::debug!("Ignoring completed request on a stopped aggregator");
            return;
        }

        state.counters.processing -= 1;
        state.counters.total_requests += 1;

        let ts = record.request_start_time;
        state.call_tries.append(ts, record.calls);

        if !record.is_success() {
            state.counters.total_failed += 1;
            if record.is_throttled() {
                state.counters.throttled += 1;
            }
        } else {
            let e2e = record.e2e_latency();
            if e2e > self.config.window {
                tracing::warn!(
                    "request completed in {:.2} seconds, while aggregation-window is {:.2} seconds, \
                     consider increasing aggregation-window to at least 2x your typical request latency.",
                    e2e.as_secs_f64(),
                    self.config.window.as_secs_f64()
                );
            }

            let since_start = ts.saturating_duration_since(state.start_time).as_secs_f64();
            state.request_latency.append(ts, e2e.as_secs_f64());
            state.request_timestamps.append(ts, since_start);
            state
                .response_latencies
                .append(ts, record.time_to_response().as_secs_f64());
            state
                .first_token_latencies
                .append(ts, record.ttft().as_secs_f64());
            if let Some(itl) = record.inter_token_latency() {
                state.token_latencies.append(ts, itl.as_secs_f64());
            }
            state
                .context_tokens
                .append(ts, record.context_tokens as f64);
            state
                .generated_tokens
                .append(ts, record.generated_tokens as f64);
        }

        if let Some(utilization) = record.deployment_utilization {
            state.utilizations.append(ts, utilization);
        }
    }

    /// Compute and emit a snapshot of the current window
    pub fn dump(&self) -> Snapshot {
        self.dump_at(Instant::now())
    }

    pub(crate) fn dump_at(&self, now: Instant) -> Snapshot {
        let mut state = self.lock();
        let snapshot = state.snapshot(now, &self.config);

        if generated_tokens_shortfall(&snapshot, self.config.expected_gen_tokens) {
            tracing::warn!(
                "average tokens per response is {}, compared to requested max_tokens of {}. \
                 this may mean measured rpm is higher and e2e request latency is faster than in \
                 real-world workloads (tpm, ttft & tbt stats will still be accurate).",
                snapshot.gen_tpr.avg,
                self.config.expected_gen_tokens.unwrap_or_default()
            );
        }

        self.sink.emit(&snapshot);
        state.last_snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Drop samples that fell out of the window
    pub fn slide_window(&self) {
        self.slide_window_at(Instant::now());
    }

    pub(crate) fn slide_window_at(&self, now: Instant) {
        self.lock().slide_window(now, self.config.window);
    }

    /// Log every windowed sample as a single JSON line
    pub fn dump_raw_call_stats(&self) -> RawSamples {
        let samples = self.lock().raw_samples();
        match serde_json::to_string(&samples) {
            Ok(json) => tracing::info!("All data samples: {}", json),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize raw samples"),
        }
        samples
    }

    /// Current lifetime counters
    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// The most recently emitted snapshot
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.lock().last_snapshot.clone()
    }

    /// Whether [`AggregatorHandle::stop`] has run
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still safe to use.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StatsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsAggregator")
            .field("config", &self.config)
            .field("counters", &self.counters())
            .finish()
    }
}

/// Owner of a running aggregator loop
pub struct AggregatorHandle {
    aggregator: Arc<StatsAggregator>,
    stop_tx: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl AggregatorHandle {
    /// The running aggregator
    pub fn aggregator(&self) -> &Arc<StatsAggregator> {
        &self.aggregator
    }

    /// Stop the dump loop and emit one final snapshot covering the tail of the run
    pub fn stop(mut self) -> Snapshot {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("Stats aggregator thread panicked");
            }
        }

        let snapshot = self.aggregator.dump();
        self.aggregator.lock().stopped = true;
        tracing::debug!("Stats aggregator stopped");
        snapshot
    }
}

impl Drop for AggregatorHandle {
    fn drop(&mut self) {
        // Ends the loop if the handle is dropped without stop()
        let _ = self.stop_tx.send(());
    }
}

impl std::fmt::Debug for AggregatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorHandle")
            .field("aggregator", &self.aggregator)
            .field("running", &self.join.is_some())
            .finish()
    }
}
