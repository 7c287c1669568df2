use std::collections::HashSet;
use std::time::Instant;

use sqlx::SqliteConnection;
use tracing::{error, info, warn};

use super::{BatchObserver, BatchStats, MigrationResult, RunControl, StepStatus};
use crate::checkpoint::{self, Checkpoint, CheckpointStore};
use crate::config::RunOptions;
use crate::db::Connection;
use crate::error::codes;
use crate::steps::{MigrationStep, SourceDocument};
use crate::store::{self, StoredDocument};
use crate::time::{from_ms, now_ms};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocOutcome {
    Inserted,
    Duplicate,
    Skipped,
    Failed,
}

/// Where a step's scan starts.
struct StartPoint {
    cursor: Option<String>,
    checkpoint: Checkpoint,
}

/// Drives a single step: pages the source, transforms, inserts idempotently,
/// and commits each batch together with its checkpoint.
pub struct BatchProcessor<'a> {
    conn: &'a Connection,
    checkpoints: &'a CheckpointStore,
    control: Option<RunControl>,
    observer: Option<BatchObserver>,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(conn: &'a Connection, checkpoints: &'a CheckpointStore) -> Self {
        Self {
            conn,
            checkpoints,
            control: None,
            observer: None,
        }
    }

    pub fn with_control(mut self, control: Option<RunControl>) -> Self {
        self.control = control;
        self
    }

    pub fn with_observer(mut self, observer: Option<BatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run `step` to completion, cancellation, or a step-level failure.
    ///
    /// `prior` is the step's stored checkpoint; it is only honoured when
    /// `options.resume` is set. Step-level failures never escape as `Err`:
    /// they come back as a result with `status = failed`.
    pub async fn run(
        &self,
        step: &dyn MigrationStep,
        options: &RunOptions,
        prior: Option<Checkpoint>,
    ) -> MigrationResult {
        let started = Instant::now();
        let mut result = MigrationResult::new(step.name());

        info!(
            target: "legacy_migrate",
            event = "step_start",
            step = step.name(),
            source = step.source_collection(),
            target_collection = step.target_collection(),
            batch_size = options.batch_size,
            dry_run = options.dry_run,
            resume = options.resume
        );

        match self.run_inner(step, options, prior, &mut result).await {
            Ok(status) => result.status = status,
            Err(err) => {
                error!(
                    target: "legacy_migrate",
                    event = "step_failed",
                    step = step.name(),
                    error = %err
                );
                result.status = StepStatus::Failed;
                result.failure = Some(err);
            }
        }
        result.duration = started.elapsed();

        info!(
            target: "legacy_migrate",
            event = "step_finished",
            step = step.name(),
            status = result.status.as_str(),
            source_count = result.source_count,
            inserted = result.inserted_count,
            duplicates = result.skipped_duplicates,
            skipped = result.skipped_by_transform,
            errors = result.errors,
            elapsed_ms = result.duration.as_millis() as u64
        );
        result
    }

    async fn run_inner(
        &self,
        step: &dyn MigrationStep,
        options: &RunOptions,
        prior: Option<Checkpoint>,
        result: &mut MigrationResult,
    ) -> AppResult<StepStatus> {
        let pool = self.conn.pool();
        let source = store::validate_collection(step.source_collection())?;
        let target = store::validate_collection(step.target_collection())?;

        if !store::collection_exists(pool, source).await? {
            return Err(AppError::new(
                codes::STEP_SOURCE_MISSING,
                "Source collection does not exist.",
            )
            .with_context("step", step.name().to_string())
            .with_context("collection", source.to_string()));
        }

        let target_exists = store::collection_exists(pool, target).await?;
        if !options.dry_run {
            self.checkpoints.ensure_schema().await?;
            if !target_exists {
                store::ensure_collection(pool, target).await?;
            }
        }

        let StartPoint {
            mut cursor,
            mut checkpoint,
        } = start_point(step.name(), options, prior);
        result.resumed_from = cursor.clone();
        result.carried_errors = checkpoint.errors;
        if result.carried_errors > 0 {
            warn!(
                target: "legacy_migrate",
                event = "step_carried_errors",
                step = step.name(),
                errors = result.carried_errors
            );
        }

        // Dry runs insert nothing, so keys "inserted" earlier in the run are
        // tracked here to count later repeats as duplicates.
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut batch_index = 0u64;

        loop {
            if self
                .control
                .as_ref()
                .map(RunControl::is_cancelled)
                .unwrap_or(false)
            {
                warn!(
                    target: "legacy_migrate",
                    event = "step_cancelled",
                    step = step.name(),
                    cursor = cursor.as_deref().unwrap_or("")
                );
                return Ok(StepStatus::Cancelled);
            }

            let page = store::fetch_page(pool, source, cursor.as_deref(), options.batch_size)
                .await
                .map_err(|err| {
                    AppError::new(codes::STEP_BATCH_FETCH, "Failed to read the next batch.")
                        .with_context("step", step.name().to_string())
                        .with_context("cursor", cursor.clone().unwrap_or_default())
                        .with_cause(err)
                })?;
            let Some(last) = page.last() else {
                break;
            };
            let next_cursor = last.id.clone();

            let batch_started = Instant::now();
            let mut stats = BatchStats {
                step_name: step.name().to_string(),
                batch_index,
                cursor: Some(next_cursor.clone()),
                dry_run: options.dry_run,
                ..BatchStats::default()
            };

            if options.dry_run {
                let mut db = pool.acquire().await.map_err(|err| {
                    batch_error(codes::STEP_BATCH_FETCH, step.name(), &next_cursor, err)
                })?;
                for doc in &page {
                    let outcome =
                        simulate_document(step, doc, target_exists, &mut *db, &mut seen_keys)
                            .await;
                    record(&mut stats, outcome);
                }
            } else {
                let mut tx = pool.begin().await.map_err(|err| {
                    batch_error(codes::STEP_BATCH_COMMIT, step.name(), &next_cursor, err)
                })?;
                for doc in &page {
                    let outcome = apply_document(step, doc, &mut *tx).await;
                    record(&mut stats, outcome);
                }

                let mut next = checkpoint.clone();
                next.last_cursor = Some(next_cursor.clone());
                next.source_count += stats.scanned;
                next.inserted_count += stats.inserted;
                next.skipped_duplicates += stats.duplicates;
                next.skipped_by_transform += stats.skipped;
                next.errors += stats.errors;
                next.updated_at = from_ms(now_ms());

                checkpoint::save_in(&mut *tx, &next).await.map_err(|err| {
                    batch_error(codes::STEP_BATCH_COMMIT, step.name(), &next_cursor, err)
                })?;
                tx.commit().await.map_err(|err| {
                    batch_error(codes::STEP_BATCH_COMMIT, step.name(), &next_cursor, err)
                })?;
                checkpoint = next;
            }

            stats.elapsed_ms = batch_started.elapsed().as_millis() as u64;
            result.absorb(&stats);
            let event = if options.dry_run {
                "batch_simulated"
            } else {
                "batch_committed"
            };
            info!(
                target: "legacy_migrate",
                event,
                step = step.name(),
                batch = batch_index,
                scanned = stats.scanned,
                inserted = stats.inserted,
                duplicates = stats.duplicates,
                skipped = stats.skipped,
                errors = stats.errors,
                cursor = %next_cursor,
                elapsed_ms = stats.elapsed_ms
            );
            if let Some(observer) = &self.observer {
                observer(&stats);
            }

            let exhausted = page.len() < options.batch_size;
            cursor = Some(next_cursor);
            batch_index += 1;
            if exhausted {
                break;
            }
        }

        Ok(if result.errors == 0 && result.carried_errors == 0 {
            StepStatus::Completed
        } else {
            StepStatus::CompletedWithErrors
        })
    }
}

fn start_point(step_name: &str, options: &RunOptions, prior: Option<Checkpoint>) -> StartPoint {
    match prior {
        Some(checkpoint) if options.resume => {
            info!(
                target: "legacy_migrate",
                event = "step_resume",
                step = step_name,
                cursor = checkpoint.last_cursor.as_deref().unwrap_or(""),
                inserted_so_far = checkpoint.inserted_count
            );
            StartPoint {
                cursor: checkpoint.last_cursor.clone(),
                checkpoint,
            }
        }
        _ => StartPoint {
            cursor: None,
            checkpoint: Checkpoint::new(step_name),
        },
    }
}

fn batch_error(code: &str, step: &str, cursor: &str, err: impl Into<AppError>) -> AppError {
    AppError::new(code, "Batch could not be committed; the checkpoint was not advanced.")
        .with_context("step", step.to_string())
        .with_context("batch_last_id", cursor.to_string())
        .with_cause(err)
}

fn record(stats: &mut BatchStats, outcome: DocOutcome) {
    stats.scanned += 1;
    match outcome {
        DocOutcome::Inserted => stats.inserted += 1,
        DocOutcome::Duplicate => stats.duplicates += 1,
        DocOutcome::Skipped => stats.skipped += 1,
        DocOutcome::Failed => stats.errors += 1,
    }
}

fn log_document_error(
    step: &dyn MigrationStep,
    doc: &StoredDocument,
    phase: &str,
    err: &dyn std::fmt::Display,
) {
    warn!(
        target: "legacy_migrate",
        event = "document_error",
        step = step.name(),
        source_collection = step.source_collection(),
        source_id = %doc.id,
        phase,
        error = %err
    );
}

/// Decode, transform and key a document. `Err` carries the outcome to record.
fn prepare(
    step: &dyn MigrationStep,
    doc: &StoredDocument,
) -> Result<(String, serde_json::Value), DocOutcome> {
    let body = doc.decode().map_err(|err| {
        log_document_error(step, doc, "decode", &err);
        DocOutcome::Failed
    })?;
    let source = SourceDocument::new(doc.id.clone(), body);
    let record = match step.transform(&source) {
        Ok(Some(record)) => record,
        Ok(None) => return Err(DocOutcome::Skipped),
        Err(err) => {
            log_document_error(step, doc, "transform", &err);
            return Err(DocOutcome::Failed);
        }
    };
    let key = step.natural_key(&source).map_err(|err| {
        log_document_error(step, doc, "natural_key", &err);
        DocOutcome::Failed
    })?;
    Ok((key, record))
}

async fn apply_document(
    step: &dyn MigrationStep,
    doc: &StoredDocument,
    db: &mut SqliteConnection,
) -> DocOutcome {
    let (key, record) = match prepare(step, doc) {
        Ok(prepared) => prepared,
        Err(outcome) => return outcome,
    };
    let target = step.target_collection();
    match store::contains(&mut *db, target, &key).await {
        Ok(true) => return DocOutcome::Duplicate,
        Ok(false) => {}
        Err(err) => {
            log_document_error(step, doc, "duplicate_lookup", &err);
            return DocOutcome::Failed;
        }
    }
    match store::insert(&mut *db, target, &key, &record).await {
        Ok(()) => DocOutcome::Inserted,
        Err(err) => {
            log_document_error(step, doc, "insert", &err);
            DocOutcome::Failed
        }
    }
}

async fn simulate_document(
    step: &dyn MigrationStep,
    doc: &StoredDocument,
    target_exists: bool,
    db: &mut SqliteConnection,
    seen_keys: &mut HashSet<String>,
) -> DocOutcome {
    let (key, _record) = match prepare(step, doc) {
        Ok(prepared) => prepared,
        Err(outcome) => return outcome,
    };
    if seen_keys.contains(&key) {
        return DocOutcome::Duplicate;
    }
    if target_exists {
        match store::contains(&mut *db, step.target_collection(), &key).await {
            Ok(true) => return DocOutcome::Duplicate,
            Ok(false) => {}
            Err(err) => {
                log_document_error(step, doc, "duplicate_lookup", &err);
                return DocOutcome::Failed;
            }
        }
    }
    seen_keys.insert(key);
    DocOutcome::Inserted
}
