//! Run end conditions

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How the request and duration bounds combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndConditionMode {
    /// Both bounds must be reached; an unset bound counts as reached
    And,
    /// Either set bound ends the run
    #[default]
    Or,
}

impl FromStr for EndConditionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "and" => Ok(EndConditionMode::And),
            "or" => Ok(EndConditionMode::Or),
            other => Err(format!("unknown end condition mode '{other}' (expected and or or)")),
        }
    }
}

/// When a run stops dispatching new requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndCondition {
    /// Maximum number of dispatches
    pub call_count: Option<u64>,
    /// Maximum wall-clock run length
    pub duration: Option<Duration>,
    /// How the two bounds combine
    pub mode: EndConditionMode,
}

impl EndCondition {
    /// End after `call_count` dispatches
    pub fn calls(call_count: u64) -> Self {
        Self {
            call_count: Some(call_count),
            ..Default::default()
        }
    }

    /// End once `duration` has elapsed
    pub fn duration(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..Default::default()
        }
    }

    /// Never end on its own
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Whether neither bound is set
    pub fn is_unbounded(&self) -> bool {
        self.call_count.is_none() && self.duration.is_none()
    }

    /// Whether the run should stop after `calls_made` dispatches and `elapsed` run time
    pub fn is_met(&self, calls_made: u64, elapsed: Duration) -> bool {
        if self.is_unbounded() {
            return false;
        }

        let calls_reached = self.call_count.map(|limit| calls_made >= limit);
        let duration_reached = self.duration.map(|limit| elapsed > limit);

        match self.mode {
            EndConditionMode::Or => {
                calls_reached.unwrap_or(false) || duration_reached.unwrap_or(false)
            }
            EndConditionMode::And => {
                calls_reached.unwrap_or(true) && duration_reached.unwrap_or(true)
            }
        }
    }
}
