#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use legacy_migrate::checkpoint::CheckpointStore;
use legacy_migrate::config::RunOptions;
use legacy_migrate::error::codes;
use legacy_migrate::migration::{
    BatchProcessor, BatchStats, CleanupOutcome, MigrationRunner, RunControl, RunPlan, StepStatus,
};
use legacy_migrate::steps::{
    FieldMapStep, MigrationStep, SourceDocument, StepRegistry, TransformError,
};
use legacy_migrate::store;
use serde_json::{json, Value};

mod util;
use util::{checkpoints, ids, seed, users, TestDb};

fn users_step() -> FieldMapStep {
    FieldMapStep::new("users", "users_legacy", "users")
        .rename("username", "display_name")
        .require("email")
        .skip_when("deleted", json!(true))
}

fn registry_of(steps: Vec<Arc<dyn MigrationStep>>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for step in steps {
        registry.register_arc(step).unwrap();
    }
    registry
}

fn options(batch_size: usize) -> RunOptions {
    RunOptions {
        batch_size,
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn empty_source_completes_with_zero_counts() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(&conn, "users_legacy", &[]).await;

    let tracker = CheckpointStore::new(&conn);
    let result = BatchProcessor::new(&conn, &tracker)
        .run(&users_step(), &options(10), None)
        .await;

    assert_eq!(result.status, StepStatus::Completed);
    assert_eq!(result.source_count, 0);
    assert_eq!(result.inserted_count, 0);
    assert_eq!(result.skipped_duplicates, 0);
    assert_eq!(result.errors, 0);
    assert!(store::collection_exists(conn.pool(), "users").await.unwrap());
}

#[tokio::test]
async fn transform_skip_is_not_an_error() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(
        &conn,
        "users_legacy",
        &[
            ("u1".into(), json!({"username": "a", "email": "a@x"})),
            ("u2".into(), json!({"username": "b", "email": "b@x", "deleted": true})),
            ("u3".into(), json!({"username": "c", "email": "c@x"})),
        ],
    )
    .await;

    let tracker = CheckpointStore::new(&conn);
    let result = BatchProcessor::new(&conn, &tracker)
        .run(&users_step(), &options(500), None)
        .await;

    assert_eq!(result.status, StepStatus::Completed);
    assert_eq!(result.source_count, 3);
    assert_eq!(result.inserted_count, 2);
    assert_eq!(result.skipped_by_transform, 1);
    assert_eq!(ids(&conn, "users").await, vec!["users:u1", "users:u3"]);

    let migrated = store::get(conn.pool(), "users", "users:u1").await.unwrap().unwrap();
    assert_eq!(migrated["display_name"], "a");
    assert_eq!(migrated["legacy_id"], "u1");
}

#[tokio::test]
async fn second_run_without_resume_only_finds_duplicates() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(&conn, "users_legacy", &users(10)).await;
    let tracker = CheckpointStore::new(&conn);
    let processor = BatchProcessor::new(&conn, &tracker);

    let first = processor.run(&users_step(), &options(3), None).await;
    assert_eq!(first.inserted_count, 10);
    assert_eq!(first.status, StepStatus::Completed);

    let prior = tracker.get("users").await.unwrap();
    assert!(prior.is_some());
    let second = processor.run(&users_step(), &options(3), prior).await;
    assert_eq!(second.status, StepStatus::Completed);
    assert_eq!(second.source_count, 10);
    assert_eq!(second.inserted_count, 0);
    assert_eq!(second.skipped_duplicates, 10);
    assert_eq!(second.resumed_from, None);
    assert_eq!(ids(&conn, "users").await.len(), 10);
}

#[tokio::test]
async fn interrupted_run_resumes_after_last_committed_batch() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(&conn, "users_legacy", &users(5)).await;
    let registry = registry_of(vec![Arc::new(users_step())]);

    let control = RunControl::new();
    let stop = control.clone();
    let first = MigrationRunner::new(&conn, &registry)
        .with_control(control)
        .with_observer(Arc::new(move |batch: &BatchStats| {
            if batch.batch_index == 1 {
                stop.cancel();
            }
        }))
        .run(RunPlan {
            options: options(2),
            ..RunPlan::default()
        })
        .await
        .unwrap();

    assert_eq!(first.results[0].status, StepStatus::Cancelled);
    assert_eq!(first.results[0].inserted_count, 4);
    assert_eq!(first.exit_code(), 130);
    let saved = checkpoints(&conn).await.remove("users").unwrap();
    assert_eq!(saved.last_cursor.as_deref(), Some("u003"));
    assert_eq!(saved.inserted_count, 4);

    let second = MigrationRunner::new(&conn, &registry)
        .run(RunPlan {
            options: RunOptions {
                resume: true,
                ..options(2)
            },
            ..RunPlan::default()
        })
        .await
        .unwrap();

    let result = &second.results[0];
    assert_eq!(result.status, StepStatus::Completed);
    assert_eq!(result.resumed_from.as_deref(), Some("u003"));
    assert_eq!(result.source_count, 1);
    assert_eq!(result.inserted_count, 1);
    assert_eq!(result.skipped_duplicates, 0);

    let saved = checkpoints(&conn).await.remove("users").unwrap();
    assert_eq!(saved.inserted_count, 5);
    assert_eq!(saved.source_count, 5);
    assert_eq!(saved.last_cursor.as_deref(), Some("u004"));
    assert_eq!(ids(&conn, "users").await.len(), 5);
}

#[tokio::test]
async fn reset_checkpoint_starts_from_the_beginning() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(&conn, "users_legacy", &users(4)).await;
    let registry = registry_of(vec![Arc::new(users_step())]);
    let runner = MigrationRunner::new(&conn, &registry);

    runner.run(RunPlan::default()).await.unwrap();
    let outcome = runner
        .run(RunPlan {
            options: RunOptions {
                resume: true,
                ..RunOptions::default()
            },
            reset_checkpoints: true,
            ..RunPlan::default()
        })
        .await
        .unwrap();

    let result = &outcome.results[0];
    assert_eq!(result.resumed_from, None);
    assert_eq!(result.source_count, 4);
    assert_eq!(result.skipped_duplicates, 4);
    let saved = checkpoints(&conn).await.remove("users").unwrap();
    assert_eq!(saved.inserted_count, 0);
    assert_eq!(saved.skipped_duplicates, 4);
}

#[tokio::test]
async fn bad_documents_are_counted_and_the_run_continues() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(
        &conn,
        "users_legacy",
        &[
            ("u1".into(), json!({"username": "a", "email": "a@x"})),
            ("u2".into(), json!({"username": "no-email"})),
            ("u3".into(), json!("not an object")),
        ],
    )
    .await;
    util::seed_raw(&conn, "users_legacy", "u4", "{broken").await;
    let registry = registry_of(vec![Arc::new(users_step())]);

    let outcome = MigrationRunner::new(&conn, &registry)
        .run(RunPlan {
            drop_old: true,
            confirm_drop: Some(Box::new(|_: &[String]| true)),
            ..RunPlan::default()
        })
        .await
        .unwrap();

    let result = &outcome.results[0];
    assert_eq!(result.status, StepStatus::CompletedWithErrors);
    assert_eq!(result.source_count, 4);
    assert_eq!(result.inserted_count, 1);
    assert_eq!(result.errors, 3);
    assert_eq!(outcome.exit_code(), 1);
    assert!(matches!(outcome.cleanup, CleanupOutcome::Ineligible { .. }));
    assert!(store::collection_exists(conn.pool(), "users_legacy").await.unwrap());
}

/// Counts how often its transform runs.
struct Counting {
    calls: Arc<AtomicUsize>,
}

impl MigrationStep for Counting {
    fn name(&self) -> &str {
        "plants"
    }

    fn source_collection(&self) -> &str {
        "plants_legacy"
    }

    fn target_collection(&self) -> &str {
        "plants"
    }

    fn natural_key(&self, doc: &SourceDocument) -> Result<String, TransformError> {
        Ok(doc.id.clone())
    }

    fn transform(&self, doc: &SourceDocument) -> Result<Option<Value>, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(doc.body.clone()))
    }
}

#[tokio::test]
async fn failed_step_halts_later_steps() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    // users_legacy is deliberately absent.
    seed(&conn, "plants_legacy", &[("p1".into(), json!({"owner": "u1"}))]).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry_of(vec![
        Arc::new(users_step()),
        Arc::new(Counting {
            calls: calls.clone(),
        }),
    ]);

    let outcome = MigrationRunner::new(&conn, &registry)
        .run(RunPlan::default())
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.results[0].status, StepStatus::Failed);
    assert_eq!(
        outcome.results[0].failure.as_ref().map(|err| err.code()),
        Some(codes::STEP_SOURCE_MISSING)
    );
    assert_eq!(outcome.results[1].status, StepStatus::Skipped);
    assert_eq!(outcome.halted_at.as_deref(), Some("users"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!store::collection_exists(conn.pool(), "plants").await.unwrap());
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn dry_run_reports_failure_but_keeps_going() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(&conn, "plants_legacy", &[("p1".into(), json!({"owner": "u1"}))]).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry_of(vec![
        Arc::new(users_step()),
        Arc::new(Counting {
            calls: calls.clone(),
        }),
    ]);

    let outcome = MigrationRunner::new(&conn, &registry)
        .run(RunPlan {
            options: RunOptions {
                dry_run: true,
                ..RunOptions::default()
            },
            ..RunPlan::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.results[0].status, StepStatus::Failed);
    assert_eq!(outcome.results[1].status, StepStatus::Completed);
    assert_eq!(outcome.results[1].inserted_count, 1);
    assert_eq!(outcome.halted_at, None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!store::collection_exists(conn.pool(), "plants").await.unwrap());
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn selected_steps_run_in_requested_order() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(&conn, "users_legacy", &users(2)).await;
    seed(&conn, "plants_legacy", &[("p1".into(), json!({"owner": "u1"}))]).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry_of(vec![
        Arc::new(users_step()),
        Arc::new(Counting {
            calls: calls.clone(),
        }),
    ]);

    let outcome = MigrationRunner::new(&conn, &registry)
        .run(RunPlan {
            steps: vec!["plants".into()],
            ..RunPlan::default()
        })
        .await
        .unwrap();

    let names: Vec<_> = outcome.results.iter().map(|r| r.step_name.as_str()).collect();
    assert_eq!(names, vec!["plants"]);
    assert!(!store::collection_exists(conn.pool(), "users").await.unwrap());
    assert!(!checkpoints(&conn).await.contains_key("users"));
}

#[tokio::test]
async fn cleanup_drops_every_legacy_collection_once() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(&conn, "users_legacy", &users(2)).await;
    seed(&conn, "sessions_legacy", &[("s1".into(), json!({}))]).await;
    let registry = registry_of(vec![Arc::new(users_step().also_drop("sessions_legacy"))]);

    let outcome = MigrationRunner::new(&conn, &registry)
        .run(RunPlan {
            drop_old: true,
            confirm_drop: Some(Box::new(|_: &[String]| true)),
            ..RunPlan::default()
        })
        .await
        .unwrap();

    assert_eq!(
        outcome.cleanup,
        CleanupOutcome::Dropped {
            collections: vec!["users_legacy".into(), "sessions_legacy".into()]
        }
    );
    assert_eq!(
        store::list_collections(conn.pool()).await.unwrap(),
        vec!["users".to_string()]
    );
}

#[tokio::test]
async fn always_skipping_step_inserts_nothing() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(
        &conn,
        "users_legacy",
        &[
            ("u1".into(), json!({"email": "a@x", "deleted": true})),
            ("u2".into(), json!({"email": "b@x", "deleted": true})),
        ],
    )
    .await;

    let tracker = CheckpointStore::new(&conn);
    let result = BatchProcessor::new(&conn, &tracker)
        .run(&users_step(), &options(1), None)
        .await;

    assert_eq!(result.status, StepStatus::Completed);
    assert_eq!(result.source_count, 2);
    assert_eq!(result.inserted_count, 0);
    assert_eq!(result.skipped_by_transform, 2);
    assert!(ids(&conn, "users").await.is_empty());
}

#[tokio::test]
async fn resumed_step_keeps_errors_from_earlier_runs() {
    let db = TestDb::new().await;
    let conn = db.connect().await;
    seed(
        &conn,
        "users_legacy",
        &[
            ("u1".into(), json!({"email": "a@x"})),
            ("u2".into(), json!({"username": "no-email"})),
            ("u3".into(), json!({"email": "c@x"})),
        ],
    )
    .await;
    let registry = registry_of(vec![Arc::new(users_step())]);
    let runner = MigrationRunner::new(&conn, &registry);

    let first = runner.run(RunPlan::default()).await.unwrap();
    assert_eq!(first.results[0].status, StepStatus::CompletedWithErrors);

    let second = runner
        .run(RunPlan {
            options: RunOptions {
                resume: true,
                ..RunOptions::default()
            },
            drop_old: true,
            confirm_drop: Some(Box::new(|_: &[String]| true)),
            ..RunPlan::default()
        })
        .await
        .unwrap();

    let result = &second.results[0];
    assert_eq!(result.resumed_from.as_deref(), Some("u3"));
    assert_eq!(result.source_count, 0);
    assert_eq!(result.errors, 0);
    assert_eq!(result.carried_errors, 1);
    assert_eq!(result.status, StepStatus::CompletedWithErrors);
    assert_eq!(second.exit_code(), 1);
    assert!(matches!(second.cleanup, CleanupOutcome::Ineligible { .. }));
    assert!(store::collection_exists(conn.pool(), "users_legacy").await.unwrap());
    assert_eq!(ids(&conn, "users").await.len(), 2);
}
