//! Step execution: the batch processor drives one step, the runner
//! sequences steps and decides whether to continue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::AppError;

pub mod processor;
pub mod runner;

pub use processor::BatchProcessor;
pub use runner::{CleanupOutcome, ConfirmDrop, MigrationRunner, RunOutcome, RunPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    /// Requested but never started because the run halted earlier.
    Skipped,
    /// Stopped at a batch boundary on operator request.
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::CompletedWithErrors => "completed_with_errors",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

fn serialize_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Summary of one step within one invocation. Counters cover this invocation
/// only; the checkpoint holds the cumulative totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationResult {
    pub step_name: String,
    pub status: StepStatus,
    pub source_count: u64,
    pub inserted_count: u64,
    pub skipped_duplicates: u64,
    pub skipped_by_transform: u64,
    pub errors: u64,
    /// Errors recorded by earlier runs behind the resume cursor. Those
    /// documents are not rescanned, so the step cannot count as clean.
    pub carried_errors: u64,
    #[serde(rename = "duration_ms", serialize_with = "serialize_ms")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AppError>,
}

impl MigrationResult {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Completed,
            source_count: 0,
            inserted_count: 0,
            skipped_duplicates: 0,
            skipped_by_transform: 0,
            errors: 0,
            carried_errors: 0,
            duration: Duration::ZERO,
            resumed_from: None,
            failure: None,
        }
    }

    pub fn skipped(step_name: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::new(step_name)
        }
    }

    pub(crate) fn absorb(&mut self, batch: &BatchStats) {
        self.source_count += batch.scanned;
        self.inserted_count += batch.inserted;
        self.skipped_duplicates += batch.duplicates;
        self.skipped_by_transform += batch.skipped;
        self.errors += batch.errors;
    }
}

/// Counters for a single batch, reported to observers after it commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub step_name: String,
    pub batch_index: u64,
    pub scanned: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub errors: u64,
    pub cursor: Option<String>,
    pub elapsed_ms: u64,
    pub dry_run: bool,
}

pub type BatchObserver = Arc<dyn Fn(&BatchStats) + Send + Sync>;

/// Cooperative stop flag checked between batches.
#[derive(Clone, Default, Debug)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
