//! Progress reporting for long fan-out runs

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

/// Snapshot pushed to a [`ProgressSink`] after each completed batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    /// Completion per work category, 0.0 to 100.0
    pub categories: BTreeMap<String, f64>,
    /// Debugger commands completed across all engines
    pub commands_executed: u64,
}

impl Progress {
    pub fn percent(&self, category: &str) -> Option<f64> {
        self.categories.get(category).copied()
    }
}

/// Receiver of progress snapshots
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &Progress);
}

/// Discards every report
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: &Progress) {}
}

/// Logs each report at `info`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, progress: &Progress) {
        let summary = progress
            .categories
            .iter()
            .map(|(category, percent)| format!("{} {:.0}%", category, percent))
            .collect::<Vec<_>>()
            .join(", ");
        info!(commands = progress.commands_executed, "Progress: {}", summary);
    }
}
