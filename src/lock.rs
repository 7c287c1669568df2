use chrono::{DateTime, Utc};
use sqlx::{Executor, Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Connection;
use crate::error::codes;
use crate::time::{from_ms, now_ms};
use crate::{AppError, AppResult};

/// Holder of the advisory lock, as recorded in `_migration_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Single-row advisory lock that keeps two runners off the same database.
///
/// The row survives a killed process; `force_clear` exists for that case.
#[derive(Debug)]
pub struct RunLock {
    pool: SqlitePool,
    holder: String,
}

async fn ensure_table(pool: &SqlitePool) -> AppResult<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS _migration_lock (\
           id INTEGER PRIMARY KEY CHECK (id = 1),\
           holder TEXT NOT NULL,\
           pid INTEGER NOT NULL,\
           acquired_at INTEGER NOT NULL\
         )",
    )
    .await?;
    Ok(())
}

impl RunLock {
    pub async fn acquire(conn: &Connection) -> AppResult<Self> {
        let pool = conn.pool().clone();
        ensure_table(&pool).await?;

        let holder = Uuid::new_v4().to_string();
        let done = sqlx::query(
            "INSERT INTO _migration_lock (id, holder, pid, acquired_at) VALUES (1, ?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&holder)
        .bind(i64::from(std::process::id()))
        .bind(now_ms())
        .execute(&pool)
        .await?;

        if done.rows_affected() == 0 {
            let mut err = AppError::new(
                codes::LOCK_HELD,
                "Another migration run holds the lock. If that process is gone, rerun with --force-unlock.",
            );
            if let Some(current) = Self::current(conn).await? {
                err = err
                    .with_context("holder", current.holder)
                    .with_context("pid", current.pid.to_string())
                    .with_context("acquired_at", current.acquired_at.to_rfc3339());
            }
            return Err(err);
        }

        info!(target: "legacy_migrate", event = "lock_acquired", holder = %holder);
        Ok(Self { pool, holder })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Drop the lock row if this runner still owns it.
    pub async fn release(self) -> AppResult<()> {
        if self.pool.is_closed() {
            warn!(
                target: "legacy_migrate",
                event = "lock_release_skipped",
                holder = %self.holder,
                reason = "pool_closed"
            );
            return Ok(());
        }
        let done = sqlx::query("DELETE FROM _migration_lock WHERE id = 1 AND holder = ?")
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            warn!(
                target: "legacy_migrate",
                event = "lock_lost",
                holder = %self.holder
            );
        } else {
            info!(target: "legacy_migrate", event = "lock_released", holder = %self.holder);
        }
        Ok(())
    }

    pub async fn current(conn: &Connection) -> AppResult<Option<LockInfo>> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='_migration_lock'",
        )
        .fetch_optional(conn.pool())
        .await?;
        if exists.is_none() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT holder, pid, acquired_at FROM _migration_lock WHERE id = 1")
            .fetch_optional(conn.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LockInfo {
            holder: row.try_get("holder")?,
            pid: row.try_get::<i64, _>("pid")?.clamp(0, i64::from(u32::MAX)) as u32,
            acquired_at: from_ms(row.try_get("acquired_at")?),
        }))
    }

    /// Remove whatever lock row exists. Returns whether one was removed.
    pub async fn force_clear(conn: &Connection) -> AppResult<bool> {
        let previous = Self::current(conn).await?;
        let Some(previous) = previous else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM _migration_lock WHERE id = 1")
            .execute(conn.pool())
            .await?;
        warn!(
            target: "legacy_migrate",
            event = "lock_force_cleared",
            holder = %previous.holder,
            pid = previous.pid,
            acquired_at = %previous.acquired_at.to_rfc3339()
        );
        Ok(true)
    }
}
