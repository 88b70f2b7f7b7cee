//! Snapshot sinks

use super::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How snapshots are written to the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Fixed-column human readable line
    #[default]
    Human,
    /// One JSON object per snapshot
    Jsonl,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(OutputFormat::Human),
            "jsonl" | "json" => Ok(OutputFormat::Jsonl),
            other => Err(format!("unknown output format '{other}' (expected human or jsonl)")),
        }
    }
}

/// Destination for emitted snapshots.
///
/// Called from the aggregator thread while the aggregator lock is held, so
/// implementations must not call back into the aggregator.
pub trait SnapshotSink: Send + Sync {
    /// Receive one snapshot
    fn emit(&self, snapshot: &Snapshot);
}

/// Writes each snapshot as one `info` log line
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink {
    format: OutputFormat,
}

impl LogSink {
    /// Create a sink using the given format
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Render a snapshot in this sink's format
    pub fn render(&self, snapshot: &Snapshot) -> String {
        match self.format {
            OutputFormat::Human => snapshot.to_human_line(),
            OutputFormat::Jsonl => snapshot.to_json(),
        }
    }
}

impl SnapshotSink for LogSink {
    fn emit(&self, snapshot: &Snapshot) {
        tracing::info!("{}", self.render(snapshot));
    }
}
