use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use tracing::{info, warn};

use crate::db::Connection;
use crate::time::{from_ms, now_ms};
use crate::AppResult;

pub const CHECKPOINT_TABLE: &str = "_migration_checkpoints";

/// Durable progress marker for one step.
///
/// `last_cursor` is the id of the last source document in the most recent
/// committed batch. Counters are cumulative across resumed runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub step_name: String,
    pub last_cursor: Option<String>,
    pub source_count: u64,
    pub inserted_count: u64,
    pub skipped_duplicates: u64,
    pub skipped_by_transform: u64,
    pub errors: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            last_cursor: None,
            source_count: 0,
            inserted_count: 0,
            skipped_duplicates: 0,
            skipped_by_transform: 0,
            errors: 0,
            updated_at: from_ms(now_ms()),
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let counter = |name: &str| -> Result<u64, sqlx::Error> {
            Ok(row.try_get::<i64, _>(name)?.max(0) as u64)
        };
        Ok(Self {
            step_name: row.try_get("step_name")?,
            last_cursor: row.try_get("last_cursor")?,
            source_count: counter("source_count")?,
            inserted_count: counter("inserted_count")?,
            skipped_duplicates: counter("skipped_duplicates")?,
            skipped_by_transform: counter("skipped_by_transform")?,
            errors: counter("errors")?,
            updated_at: from_ms(row.try_get("updated_at")?),
        })
    }
}

/// Per-step checkpoints kept in a dedicated table next to the migrated data.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(conn: &Connection) -> Self {
        Self {
            pool: conn.pool().clone(),
        }
    }

    /// Create the checkpoint table. Not called on dry runs.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        self.pool
            .execute(
                "CREATE TABLE IF NOT EXISTS _migration_checkpoints (\
                   step_name TEXT PRIMARY KEY,\
                   last_cursor TEXT,\
                   source_count INTEGER NOT NULL DEFAULT 0,\
                   inserted_count INTEGER NOT NULL DEFAULT 0,\
                   skipped_duplicates INTEGER NOT NULL DEFAULT 0,\
                   skipped_by_transform INTEGER NOT NULL DEFAULT 0,\
                   errors INTEGER NOT NULL DEFAULT 0,\
                   updated_at INTEGER NOT NULL\
                 )",
            )
            .await?;
        Ok(())
    }

    async fn table_exists(&self) -> AppResult<bool> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?")
                .bind(CHECKPOINT_TABLE)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }

    /// All checkpoints keyed by step name.
    ///
    /// Never fails: an unreadable store is logged and treated as empty, which
    /// means every step starts from the beginning and relies on duplicate
    /// detection.
    pub async fn load(&self) -> HashMap<String, Checkpoint> {
        match self.try_load().await {
            Ok(map) => map,
            Err(err) => {
                warn!(
                    target: "legacy_migrate",
                    event = "checkpoint_load_failed",
                    error = %err
                );
                HashMap::new()
            }
        }
    }

    async fn try_load(&self) -> AppResult<HashMap<String, Checkpoint>> {
        if !self.table_exists().await? {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT * FROM _migration_checkpoints")
            .fetch_all(&self.pool)
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let checkpoint = Checkpoint::from_row(&row)?;
            map.insert(checkpoint.step_name.clone(), checkpoint);
        }
        Ok(map)
    }

    pub async fn get(&self, step_name: &str) -> AppResult<Option<Checkpoint>> {
        if !self.table_exists().await? {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM _migration_checkpoints WHERE step_name = ?")
            .bind(step_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Checkpoint::from_row).transpose()?)
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> AppResult<()> {
        save_in(&self.pool, checkpoint).await
    }

    /// Delete the checkpoint for `step_name`. Returns whether one existed.
    pub async fn reset(&self, step_name: &str) -> AppResult<bool> {
        if !self.table_exists().await? {
            return Ok(false);
        }
        let done = sqlx::query("DELETE FROM _migration_checkpoints WHERE step_name = ?")
            .bind(step_name)
            .execute(&self.pool)
            .await?;
        let removed = done.rows_affected() > 0;
        info!(
            target: "legacy_migrate",
            event = "checkpoint_reset",
            step = step_name,
            removed
        );
        Ok(removed)
    }
}

/// Upsert `checkpoint` through `executor`, typically the batch transaction so
/// the cursor commits together with the records it covers.
pub async fn save_in<'e, E>(executor: E, checkpoint: &Checkpoint) -> AppResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO _migration_checkpoints \
           (step_name, last_cursor, source_count, inserted_count, skipped_duplicates, skipped_by_transform, errors, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(step_name) DO UPDATE SET \
           last_cursor = excluded.last_cursor,\
           source_count = excluded.source_count,\
           inserted_count = excluded.inserted_count,\
           skipped_duplicates = excluded.skipped_duplicates,\
           skipped_by_transform = excluded.skipped_by_transform,\
           errors = excluded.errors,\
           updated_at = excluded.updated_at",
    )
    .bind(&checkpoint.step_name)
    .bind(checkpoint.last_cursor.as_deref())
    .bind(checkpoint.source_count as i64)
    .bind(checkpoint.inserted_count as i64)
    .bind(checkpoint.skipped_duplicates as i64)
    .bind(checkpoint.skipped_by_transform as i64)
    .bind(checkpoint.errors as i64)
    .bind(checkpoint.updated_at.timestamp_millis())
    .execute(executor)
    .await?;
    Ok(())
}
