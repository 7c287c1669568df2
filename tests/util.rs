#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use legacy_migrate::checkpoint::{Checkpoint, CheckpointStore};
use legacy_migrate::config::{DatabaseUrl, MigrateConfig};
use legacy_migrate::db::Connection;
use legacy_migrate::store;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection as _};
use tempfile::{tempdir, TempDir};

/// A file-backed database in its own temporary directory.
pub struct TestDb {
    _dir: TempDir,
    pub path: PathBuf,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("app.sqlite3");
        let conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .connect()
            .await
            .expect("create database file");
        conn.close().await.expect("close bootstrap connection");
        Self { _dir: dir, path }
    }

    pub fn url(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    pub async fn connect(&self) -> Connection {
        Connection::connect(&MigrateConfig::new(DatabaseUrl::file(&self.path)))
            .await
            .expect("connect test database")
    }
}

/// `n` user documents `u000..`, ids zero padded so id order is insertion order.
pub fn users(n: usize) -> Vec<(String, Value)> {
    (0..n)
        .map(|i| {
            (
                format!("u{i:03}"),
                json!({"_id": format!("u{i:03}"), "username": format!("user{i}"), "email": format!("user{i}@example.com")}),
            )
        })
        .collect()
}

pub async fn seed(conn: &Connection, collection: &str, docs: &[(String, Value)]) {
    store::ensure_collection(conn.pool(), collection).await.unwrap();
    for (id, body) in docs {
        store::insert(conn.pool(), collection, id, body).await.unwrap();
    }
}

/// Insert a body that is not valid JSON.
pub async fn seed_raw(conn: &Connection, collection: &str, id: &str, body: &str) {
    store::ensure_collection(conn.pool(), collection).await.unwrap();
    let sql = format!("INSERT INTO \"{collection}\" (id, body) VALUES (?, ?)");
    sqlx::query(&sql)
        .bind(id)
        .bind(body)
        .execute(conn.pool())
        .await
        .unwrap();
}

/// Every legacy collection the default catalogue reads, with a few valid
/// documents each.
pub async fn seed_catalogue(conn: &Connection) {
    seed(conn, "users_legacy", &users(3)).await;
    seed(
        conn,
        "plants_legacy",
        &[
            ("p1".into(), json!({"owner": "u000", "nickname": "Fern"})),
            ("p2".into(), json!({"owner": "u001", "nickname": "Cactus", "archived": true})),
        ],
    )
    .await;
    seed(
        conn,
        "forum_posts_legacy",
        &[("f1".into(), json!({"author": "u000", "text": "hello"}))],
    )
    .await;
    seed(
        conn,
        "forum_comments_legacy",
        &[("c1".into(), json!({"post": "f1", "author": "u001", "text": "hi"}))],
    )
    .await;
    seed(conn, "notifications_legacy", &[]).await;
    seed(
        conn,
        "sessions_legacy",
        &[("s1".into(), json!({"user": "u000"}))],
    )
    .await;
}

pub async fn ids(conn: &Connection, collection: &str) -> Vec<String> {
    store::fetch_page(conn.pool(), collection, None, 100_000)
        .await
        .unwrap()
        .into_iter()
        .map(|doc| doc.id)
        .collect()
}

pub async fn checkpoints(conn: &Connection) -> HashMap<String, Checkpoint> {
    CheckpointStore::new(conn).load().await
}

/// Logical contents of the database: every collection's documents plus the
/// checkpoint rows.
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub collections: BTreeMap<String, Vec<(String, String)>>,
    pub checkpoints: BTreeMap<String, Checkpoint>,
}

pub async fn snapshot(conn: &Connection) -> Snapshot {
    let mut collections = BTreeMap::new();
    for name in store::list_collections(conn.pool()).await.unwrap() {
        let docs = store::fetch_page(conn.pool(), &name, None, 100_000)
            .await
            .unwrap()
            .into_iter()
            .map(|doc| (doc.id, doc.body))
            .collect();
        collections.insert(name, docs);
    }
    Snapshot {
        collections,
        checkpoints: checkpoints(conn).await.into_iter().collect(),
    }
}
