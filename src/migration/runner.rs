use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use super::{BatchObserver, BatchProcessor, MigrationResult, RunControl, StepStatus};
use crate::checkpoint::CheckpointStore;
use crate::config::RunOptions;
use crate::db::Connection;
use crate::steps::StepRegistry;
use crate::store;
use crate::{AppError, AppResult};

/// Asked once, with the collections about to be dropped, before cleanup.
pub type ConfirmDrop = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

/// What to run and how.
#[derive(Default)]
pub struct RunPlan {
    /// Step names in run order. Empty means the whole registry.
    pub steps: Vec<String>,
    pub options: RunOptions,
    /// Delete the requested steps' checkpoints before running.
    pub reset_checkpoints: bool,
    /// Drop legacy collections after a fully successful run.
    pub drop_old: bool,
    /// Required for `drop_old` to take effect.
    pub confirm_drop: Option<ConfirmDrop>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CleanupOutcome {
    NotRequested,
    /// Cleanup was requested but the run did not qualify.
    Ineligible { reason: String },
    Declined,
    Dropped { collections: Vec<String> },
    Failed {
        dropped: Vec<String>,
        error: AppError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub dry_run: bool,
    pub results: Vec<MigrationResult>,
    /// Step whose result stopped the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<String>,
    pub cleanup: CleanupOutcome,
}

impl RunOutcome {
    pub fn all_completed(&self) -> bool {
        self.results
            .iter()
            .all(|result| result.status == StepStatus::Completed)
    }

    pub fn was_cancelled(&self) -> bool {
        self.results
            .iter()
            .any(|result| result.status == StepStatus::Cancelled)
    }

    /// 0 when every step completed cleanly, 130 after an interrupt, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.was_cancelled() {
            return 130;
        }
        if !self.all_completed() || matches!(self.cleanup, CleanupOutcome::Failed { .. }) {
            return 1;
        }
        0
    }
}

/// Sequences registry steps through the batch processor.
pub struct MigrationRunner<'a> {
    conn: &'a Connection,
    registry: &'a StepRegistry,
    control: Option<RunControl>,
    observer: Option<BatchObserver>,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(conn: &'a Connection, registry: &'a StepRegistry) -> Self {
        Self {
            conn,
            registry,
            control: None,
            observer: None,
        }
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_observer(mut self, observer: BatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run the plan's steps in order.
    ///
    /// Returns `Err` only for problems found before the first step starts
    /// (bad options, unknown step names, a failed checkpoint reset). Step
    /// failures are reported in the outcome.
    pub async fn run(&self, plan: RunPlan) -> AppResult<RunOutcome> {
        let RunPlan {
            steps: requested,
            options,
            reset_checkpoints,
            drop_old,
            confirm_drop,
        } = plan;
        options.validate()?;

        let steps = if requested.is_empty() {
            self.registry.select(None)?
        } else {
            self.registry.resolve(&requested)?
        };

        let checkpoints = CheckpointStore::new(self.conn);
        if reset_checkpoints && !options.dry_run {
            for step in &steps {
                checkpoints.reset(step.name()).await?;
            }
        }
        let mut stored = checkpoints.load().await;
        if reset_checkpoints && options.dry_run {
            // Leave the stored rows alone but start from scratch, as the live run would.
            for step in &steps {
                stored.remove(step.name());
            }
            info!(
                target: "legacy_migrate",
                event = "checkpoint_reset_simulated",
                steps = steps.len()
            );
        }

        let started = Instant::now();
        let names: Vec<&str> = steps.iter().map(|step| step.name()).collect();
        info!(
            target: "legacy_migrate",
            event = "run_start",
            steps = %names.join(","),
            dry_run = options.dry_run,
            resume = options.resume,
            batch_size = options.batch_size
        );

        let processor = BatchProcessor::new(self.conn, &checkpoints)
            .with_control(self.control.clone())
            .with_observer(self.observer.clone());

        let mut results = Vec::with_capacity(steps.len());
        let mut halted_at: Option<String> = None;
        for step in &steps {
            if halted_at.is_some() {
                results.push(MigrationResult::skipped(step.name()));
                continue;
            }

            let prior = stored.remove(step.name());
            if prior.is_some() && !options.resume {
                info!(
                    target: "legacy_migrate",
                    event = "checkpoint_ignored",
                    step = step.name(),
                    reason = "resume_not_requested"
                );
            }

            let result = processor.run(&**step, &options, prior).await;
            let halt = match result.status {
                StepStatus::Failed => !options.dry_run,
                StepStatus::Cancelled => true,
                _ => false,
            };
            if halt {
                warn!(
                    target: "legacy_migrate",
                    event = "run_halted",
                    step = step.name(),
                    status = result.status.as_str()
                );
                halted_at = Some(step.name().to_string());
            }
            results.push(result);
        }

        let mut outcome = RunOutcome {
            dry_run: options.dry_run,
            results,
            halted_at,
            cleanup: CleanupOutcome::NotRequested,
        };

        if drop_old {
            let legacy = legacy_collections(&steps);
            outcome.cleanup = self
                .cleanup(&outcome, &legacy, confirm_drop.as_ref())
                .await;
        }

        info!(
            target: "legacy_migrate",
            event = "run_finished",
            elapsed_ms = started.elapsed().as_millis() as u64,
            all_completed = outcome.all_completed(),
            halted = outcome.halted_at.is_some()
        );
        Ok(outcome)
    }

    async fn cleanup(
        &self,
        outcome: &RunOutcome,
        legacy: &[String],
        confirm: Option<&ConfirmDrop>,
    ) -> CleanupOutcome {
        if outcome.dry_run {
            return CleanupOutcome::Ineligible {
                reason: "dry run".into(),
            };
        }
        if !outcome.all_completed() {
            return CleanupOutcome::Ineligible {
                reason: "not every requested step completed without errors".into(),
            };
        }
        let confirmed = confirm.map(|ask| ask(legacy)).unwrap_or(false);
        if !confirmed {
            info!(target: "legacy_migrate", event = "cleanup_declined");
            return CleanupOutcome::Declined;
        }

        let mut dropped = Vec::with_capacity(legacy.len());
        for collection in legacy {
            match store::drop_collection(self.conn.pool(), collection).await {
                Ok(()) => {
                    warn!(
                        target: "legacy_migrate",
                        event = "cleanup_drop",
                        collection = %collection
                    );
                    dropped.push(collection.clone());
                }
                Err(err) => {
                    error!(
                        target: "legacy_migrate",
                        event = "cleanup_failed",
                        collection = %collection,
                        error = %err
                    );
                    return CleanupOutcome::Failed {
                        dropped,
                        error: err.with_context("collection", collection.clone()),
                    };
                }
            }
        }
        CleanupOutcome::Dropped {
            collections: dropped,
        }
    }
}

fn legacy_collections(steps: &[crate::steps::StepRef]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for step in steps {
        for collection in step.legacy_collections() {
            if !out.contains(&collection) {
                out.push(collection);
            }
        }
    }
    out
}
