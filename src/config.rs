use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::codes;
use crate::{AppError, AppResult};

pub const DATABASE_URL_ENV: &str = "MIGRATE_DATABASE_URL";
pub const LOG_FILTER_ENV: &str = "MIGRATE_LOG";
pub const DEFAULT_LOG_FILTER: &str = "legacy_migrate=info,sqlx=warn";

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 10_000;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Location of the target database, parsed from a `sqlite:` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    Memory,
    File(PathBuf),
}

impl DatabaseUrl {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        DatabaseUrl::File(path.into())
    }
}

impl FromStr for DatabaseUrl {
    type Err = AppError;

    fn from_str(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| {
            AppError::new(codes::CONFIG_INVALID_URL, reason.to_string())
                .with_context("url", trimmed.to_string())
        };

        let rest = trimmed
            .strip_prefix("sqlite:")
            .ok_or_else(|| invalid("Connection string must start with `sqlite:`."))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let path = rest.split('?').next().unwrap_or_default();

        if path.is_empty() {
            return Err(invalid("Connection string does not name a database."));
        }
        if path == ":memory:" {
            return Ok(DatabaseUrl::Memory);
        }
        Ok(DatabaseUrl::File(PathBuf::from(path)))
    }
}

impl fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseUrl::Memory => write!(f, "sqlite::memory:"),
            DatabaseUrl::File(path) => write!(f, "sqlite://{}", path.display()),
        }
    }
}

/// Process configuration resolved before any connection attempt.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub database_url: DatabaseUrl,
    pub acquire_timeout: Duration,
}

impl MigrateConfig {
    pub fn new(database_url: DatabaseUrl) -> Self {
        Self {
            database_url,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(DATABASE_URL_ENV)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                AppError::new(
                    codes::CONFIG_MISSING_URL,
                    format!("{DATABASE_URL_ENV} is not set. Point it at the target database, e.g. sqlite://data/app.sqlite3."),
                )
            })?;
        Ok(Self::new(raw.parse()?))
    }
}

/// Per-run knobs shared by the runner and the batch processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub batch_size: usize,
    pub dry_run: bool,
    pub resume: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            resume: false,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> AppResult<()> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(AppError::new(
                codes::CONFIG_INVALID_BATCH,
                format!("Batch size must be between {MIN_BATCH_SIZE} and {MAX_BATCH_SIZE} documents."),
            )
            .with_context("batch_size", self.batch_size.to_string()));
        }
        Ok(())
    }
}
