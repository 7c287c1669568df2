//! Collection-level access to the document database.
//!
//! Every collection is a table of `(id TEXT PRIMARY KEY, body TEXT)` rows where
//! `body` holds the JSON document. Source collections are paged by ascending
//! `id`, which gives the deterministic, resumable order the batch processor
//! relies on. Target collections store each record under its natural key.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

use crate::error::codes;
use crate::{AppError, AppResult};

/// Prefix reserved for the engine's own bookkeeping tables.
pub const RESERVED_PREFIX: &str = "_migration";

static COLLECTION_NAME: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap()
});

/// A document as read from a collection, before its body is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: String,
    pub body: String,
}

impl StoredDocument {
    pub fn decode(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Reject anything that is not a plain identifier before it reaches SQL text.
pub fn validate_collection(name: &str) -> AppResult<&str> {
    let lower = name.to_ascii_lowercase();
    if !COLLECTION_NAME.is_match(name)
        || lower.starts_with(RESERVED_PREFIX)
        || lower.starts_with("sqlite_")
    {
        return Err(AppError::new(
            codes::STORE_INVALID_COLLECTION,
            "Collection name must be a plain identifier and not a reserved name.",
        )
        .with_context("collection", name.to_string()));
    }
    Ok(name)
}

pub async fn collection_exists(pool: &SqlitePool, name: &str) -> AppResult<bool> {
    let name = validate_collection(name)?;
    let exists: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(exists.is_some())
}

/// User collections, excluding the engine's bookkeeping tables.
pub async fn list_collections(pool: &SqlitePool) -> AppResult<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    Ok(names
        .into_iter()
        .filter(|name| !name.to_ascii_lowercase().starts_with(RESERVED_PREFIX))
        .collect())
}

pub async fn ensure_collection<'e, E>(executor: E, name: &str) -> AppResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let name = validate_collection(name)?;
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS \"{name}\" (id TEXT PRIMARY KEY, body TEXT NOT NULL)"
    );
    executor.execute(sql.as_str()).await?;
    Ok(())
}

pub async fn drop_collection(pool: &SqlitePool, name: &str) -> AppResult<()> {
    let name = validate_collection(name)?;
    let sql = format!("DROP TABLE IF EXISTS \"{name}\"");
    pool.execute(sql.as_str()).await?;
    Ok(())
}

pub async fn count<'e, E>(executor: E, name: &str) -> AppResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let name = validate_collection(name)?;
    let sql = format!("SELECT COUNT(*) FROM \"{name}\"");
    let total: i64 = sqlx::query_scalar(&sql).fetch_one(executor).await?;
    Ok(total.max(0) as u64)
}

/// Fetch up to `limit` documents with `id` strictly greater than `after`.
pub async fn fetch_page<'e, E>(
    executor: E,
    name: &str,
    after: Option<&str>,
    limit: usize,
) -> AppResult<Vec<StoredDocument>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let name = validate_collection(name)?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = match after {
        Some(cursor) => {
            let sql = format!(
                "SELECT id, body FROM \"{name}\" WHERE id > ? ORDER BY id ASC LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(cursor)
                .bind(limit)
                .fetch_all(executor)
                .await?
        }
        None => {
            let sql = format!("SELECT id, body FROM \"{name}\" ORDER BY id ASC LIMIT ?");
            sqlx::query(&sql).bind(limit).fetch_all(executor).await?
        }
    };

    let mut page = Vec::with_capacity(rows.len());
    for row in rows {
        page.push(StoredDocument {
            id: row.try_get("id")?,
            body: row.try_get("body")?,
        });
    }
    Ok(page)
}

pub async fn contains<'e, E>(executor: E, name: &str, id: &str) -> AppResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let name = validate_collection(name)?;
    let sql = format!("SELECT 1 FROM \"{name}\" WHERE id = ?");
    let hit: Option<i64> = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(hit.is_some())
}

pub async fn get<'e, E>(executor: E, name: &str, id: &str) -> AppResult<Option<Value>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let name = validate_collection(name)?;
    let sql = format!("SELECT body FROM \"{name}\" WHERE id = ?");
    let body: Option<String> = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    body.map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
        .transpose()
}

pub async fn insert<'e, E>(executor: E, name: &str, id: &str, body: &Value) -> AppResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let name = validate_collection(name)?;
    let sql = format!("INSERT INTO \"{name}\" (id, body) VALUES (?, ?)");
    sqlx::query(&sql)
        .bind(id)
        .bind(body.to_string())
        .execute(executor)
        .await?;
    Ok(())
}
