#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use serde_json::{json, Value};
use sofadb::{DbConfig, GetOptions, SofaDB};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a `RUST_LOG`-driven subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn create_temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// A file-backed database in a fresh temp dir. Keep the dir alive.
pub async fn file_db(name: &str) -> (SofaDB, tempfile::TempDir) {
    init_tracing();
    let (dir, path) = create_temp_db_path(name);
    let db = SofaDB::open(&path).await.expect("open database");
    (db, dir)
}

pub async fn memory_db() -> SofaDB {
    init_tracing();
    SofaDB::open_in_memory().await.expect("open in-memory database")
}

pub async fn memory_db_with(config: DbConfig) -> SofaDB {
    init_tracing();
    SofaDB::builder().config(config).open().await.expect("open in-memory database")
}

pub async fn get(db: &SofaDB, id: &str) -> Value {
    db.get(id, GetOptions::default()).await.expect("get document")
}

pub async fn put(db: &SofaDB, doc: Value) -> String {
    db.put(doc).await.expect("put document").rev
}

/// A replicated revision with the given ancestry (newest hash first).
pub fn replicated(id: &str, start: u64, hashes: &[&str], body: Value) -> Value {
    let mut doc = body;
    doc["_id"] = json!(id);
    doc["_rev"] = json!(format!("{start}-{}", hashes[0]));
    doc["_revisions"] = json!({"start": start, "ids": hashes});
    doc
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
