use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Sqlite, SqlitePool};
use tracing::{info, warn};

use crate::config::{DatabaseUrl, MigrateConfig, DEFAULT_BUSY_TIMEOUT_MS};
use crate::error::codes;
use crate::{AppError, AppResult};

/// Scoped handle on the target database.
///
/// Constructed explicitly by the caller and passed to every component that
/// needs it; nothing in the crate keeps a process-wide connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pool: SqlitePool,
    url: DatabaseUrl,
}

impl Connection {
    /// Open the database named by `config`.
    ///
    /// The database must already exist: a migration reads legacy collections,
    /// so a missing file means the URL points somewhere unexpected.
    pub async fn connect(config: &MigrateConfig) -> AppResult<Self> {
        let url = config.database_url.clone();
        let base = match &url {
            DatabaseUrl::Memory => SqliteConnectOptions::from_str("sqlite::memory:")?,
            DatabaseUrl::File(path) => {
                if !path.exists() {
                    return Err(AppError::new(
                        codes::CONNECTION_UNREACHABLE,
                        "Database file does not exist.",
                    )
                    .with_context("url", url.to_string()));
                }
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(false)
                    .journal_mode(SqliteJournalMode::Wal)
            }
        };
        let opts = base
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .log_statements(log::LevelFilter::Off);

        // An in-memory database lives and dies with its single connection.
        let pool_opts = match &url {
            DatabaseUrl::Memory => SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            DatabaseUrl::File(_) => SqlitePoolOptions::new().max_connections(4),
        };

        let pool = pool_opts
            .acquire_timeout(config.acquire_timeout)
            .connect_with(opts)
            .await
            .map_err(|err| {
                AppError::new(codes::CONNECTION_UNREACHABLE, "Could not open the database.")
                    .with_context("url", url.to_string())
                    .with_cause(err)
            })?;

        log_effective_pragmas(&pool).await;
        info!(target: "legacy_migrate", event = "db_connect", url = %url);

        Ok(Self { pool, url })
    }

    /// Wrap an existing pool, e.g. one a test harness has already seeded.
    pub fn from_pool(pool: SqlitePool, url: DatabaseUrl) -> Self {
        Self { pool, url }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close every pooled connection. Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.pool.close().await;
        info!(target: "legacy_migrate", event = "db_disconnect", url = %self.url);
    }
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "legacy_migrate",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") && !jm.0.eq_ignore_ascii_case("memory") {
        warn!(
            target: "legacy_migrate",
            event = "db_open_warning",
            msg = "journal_mode != WAL; batch commits run with reduced crash safety"
        );
    }
}
