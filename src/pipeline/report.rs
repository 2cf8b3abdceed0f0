//! Run summaries.

use crate::storage::StepRecord;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub index: usize,
    pub operator: String,
    pub rows_in: Option<usize>,
    pub rows_out: usize,
    pub duration: Duration,
    pub checkpoint: PathBuf,
}

impl From<&StepRecord> for StepReport {
    fn from(record: &StepRecord) -> Self {
        Self {
            index: record.index,
            operator: record.operator.clone(),
            rows_in: record.rows_in,
            rows_out: record.rows_out,
            duration: Duration::from_millis(record.duration_ms),
            checkpoint: record.checkpoint.clone(),
        }
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub run_id: String,
    /// Steps executed in this invocation
    pub steps: Vec<StepReport>,
    /// Leading steps skipped because a resumed run had already completed them
    pub skipped: usize,
    pub runtime: Duration,
}

impl PipelineReport {
    /// Rows in the last checkpoint written by this invocation.
    pub fn final_rows(&self) -> Option<usize> {
        self.steps.last().map(|s| s.rows_out)
    }

    pub fn final_checkpoint(&self) -> Option<&Path> {
        self.steps.last().map(|s| s.checkpoint.as_path())
    }

    /// Human-readable table for the CLI.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Run:       {}\n", self.run_id));
        if self.skipped > 0 {
            out.push_str(&format!("Resumed:   {} step(s) already complete\n", self.skipped));
        }
        for step in &self.steps {
            let rows_in = step
                .rows_in
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "  [{}] {:<20} {:>8} → {:<8} {:>7.1}s  {}\n",
                step.index,
                step.operator,
                rows_in,
                step.rows_out,
                step.duration.as_secs_f64(),
                step.checkpoint.display()
            ));
        }
        out.push_str(&format!("Runtime:   {:.1}s", self.runtime.as_secs_f64()));
        out
    }
}
