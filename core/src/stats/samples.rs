//! Timestamped sample series with front trimming

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// An insertion-ordered series of `(timestamp, value)` samples.
///
/// Samples are appended under the aggregator lock, so insertion order is also
/// the order trimming relies on: trimming scans from the front and stops at the
/// first sample young enough to keep.
#[derive(Debug, Clone)]
pub struct SampleSeries<T> {
    samples: VecDeque<(Instant, T)>,
}

impl<T: Copy> SampleSeries<T> {
    /// Create an empty series
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    /// Append a sample
    pub fn append(&mut self, timestamp: Instant, value: T) {
        self.samples.push_back((timestamp, value));
    }

    /// Drop leading samples older than `window` as seen from `now`.
    ///
    /// A sample whose age equals `window` is kept.
    pub fn trim_oldest(&mut self, now: Instant, window: Duration) {
        while let Some((timestamp, _)) = self.samples.front() {
            if now.saturating_duration_since(*timestamp) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Iterate over the value column
    pub fn values(&self) -> impl Iterator<Item = T> + '_ {
        self.samples.iter().map(|(_, value)| *value)
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the series is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl<T: Copy + Into<f64>> SampleSeries<T> {
    /// Values widened to `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.values().map(Into::into).collect()
    }

    /// Sum of all values
    pub fn sum(&self) -> f64 {
        self.values().map(Into::into).sum()
    }
}

impl<T: Copy> Default for SampleSeries<T> {
    fn default() -> Self {
        Self::new()
    }
}
