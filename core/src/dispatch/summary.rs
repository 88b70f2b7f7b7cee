//! Run summary returned by the dispatcher

use std::time::Duration;

/// What one dispatcher run did
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    /// Requests dispatched
    pub calls_made: u64,

    /// Time from the first dispatch to the end of the drain
    pub elapsed: Duration,

    /// Whether the run was ended by a terminate signal rather than its end condition
    pub terminated: bool,
}

impl RunSummary {
    /// Average dispatch rate in requests per minute
    pub fn requests_per_minute(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.calls_made as f64 * 60.0 / secs
        } else {
            0.0
        }
    }
}
