//! Persistent view index storage.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ view_meta   signature PK │ ddoc_id │ view_name │ last_seq           │
//! │ view_rows   (signature, doc_id, idx) PK │ key JSON │ value JSON     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A view is identified by its signature (digest of its map and reduce
//! source), so editing a function starts a fresh index and identical
//! definitions in different design docs share one.
//!
//! Each update batch runs in one transaction: retract the batch's documents'
//! old rows, insert their new emissions, advance `last_seq`. A batch built
//! from a stale `since` is discarded.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::check_nesting;
use crate::error::{Error, Result};
use crate::reader::ChangeRow;
use crate::script::{Capabilities, Evaluator, Invocation, Outcome};
use crate::types::{DocId, Seq};

const CREATE_VIEW_META: &str = r#"
CREATE TABLE IF NOT EXISTS view_meta (
    signature TEXT PRIMARY KEY,
    ddoc_id TEXT NOT NULL,
    view_name TEXT NOT NULL,
    last_seq INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_VIEW_ROWS: &str = r#"
CREATE TABLE IF NOT EXISTS view_rows (
    signature TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    idx INTEGER NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (signature, doc_id, idx)
)
"#;

/// One stored emission.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub key: Value,
    pub id: String,
    pub value: Value,
}

/// New emissions for one document (empty to retract).
#[derive(Debug, Clone, PartialEq)]
pub struct DocEmissions {
    pub id: DocId,
    pub rows: Vec<(Value, Value)>,
}

/// SQLite-backed view storage.
#[derive(Debug)]
pub struct ViewStore {
    conn: Connection,
}

impl ViewStore {
    /// Opens (creating if needed) an index file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    /// An index that lives as long as the process.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_VIEW_META)?;
        conn.execute_batch(CREATE_VIEW_ROWS)?;
        Ok(Self { conn })
    }

    /// Registers a view if it is new.
    pub fn ensure_view(&self, signature: &str, ddoc_id: &str, view_name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO view_meta (signature, ddoc_id, view_name, last_seq) VALUES (?1, ?2, ?3, 0)",
            params![signature, ddoc_id, view_name],
        )?;
        Ok(())
    }

    /// Sequence the index is current to (zero for unknown views).
    pub fn last_seq(&self, signature: &str) -> Result<Seq> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_seq FROM view_meta WHERE signature = ?1",
                [signature],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Seq::from_raw(seq.unwrap_or(0).max(0) as u64))
    }

    /// Applies one update batch if the index is still at `since`.
    ///
    /// Returns `false` (and changes nothing) if another updater moved the
    /// index first.
    pub fn apply_batch(&mut self, signature: &str, since: Seq, docs: &[DocEmissions], last_seq: Seq) -> Result<bool> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: i64 = tx
            .query_row(
                "SELECT last_seq FROM view_meta WHERE signature = ?1",
                [signature],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(-1);
        if current != since.as_raw() as i64 {
            debug!(signature, current, since = %since, "index moved, discarding batch");
            return Ok(false);
        }
        {
            let mut retract = tx.prepare_cached("DELETE FROM view_rows WHERE signature = ?1 AND doc_id = ?2")?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO view_rows (signature, doc_id, idx, key, value) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for doc in docs {
                retract.execute(params![signature, doc.id.as_str()])?;
                for (idx, (key, value)) in doc.rows.iter().enumerate() {
                    insert.execute(params![
                        signature,
                        doc.id.as_str(),
                        idx as i64,
                        serde_json::to_string(key)?,
                        serde_json::to_string(value)?,
                    ])?;
                }
            }
        }
        tx.execute(
            "UPDATE view_meta SET last_seq = ?2 WHERE signature = ?1",
            params![signature, last_seq.as_raw() as i64],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Every row of a view, unordered.
    pub fn rows(&self, signature: &str) -> Result<Vec<IndexRow>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, doc_id, value FROM view_rows WHERE signature = ?1")?;
        let raw = stmt.query_map([signature], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut rows = Vec::new();
        for entry in raw {
            let (key, id, value) = entry?;
            rows.push(IndexRow {
                key: serde_json::from_str(&key)?,
                id,
                value: serde_json::from_str(&value)?,
            });
        }
        Ok(rows)
    }

    /// Signatures of every stored view.
    pub fn signatures(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached("SELECT signature FROM view_meta ORDER BY signature")?;
        let signatures: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(signatures)
    }

    /// Deletes a view's rows and metadata.
    pub fn drop_view(&mut self, signature: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM view_rows WHERE signature = ?1", [signature])?;
        tx.execute("DELETE FROM view_meta WHERE signature = ?1", [signature])?;
        tx.commit()?;
        Ok(())
    }
}

fn too_deep(rows: &[(Value, Value)]) -> Option<Error> {
    rows.iter()
        .flat_map(|(key, value)| [key, value])
        .find_map(|v| check_nesting(v).err())
}

/// Runs the map function over a page of changes.
///
/// Ids starting with `_` are skipped. Deleted documents, documents whose map
/// call fails and documents emitting over-nested keys or values emit nothing
/// (retracting earlier rows).
pub fn map_rows(evaluator: &dyn Evaluator, map_source: &str, rows: &[ChangeRow]) -> Vec<DocEmissions> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let id = &row.doc.id;
        if id.as_str().starts_with('_') {
            continue;
        }
        let emitted = match (&row.body, row.doc.deleted) {
            (Some(body), false) => {
                let doc = Value::Object(body.clone());
                match evaluator.run(map_source, Capabilities::MAP, Invocation::Map { doc: &doc }) {
                    Ok(Outcome::Emitted(rows)) => match too_deep(&rows) {
                        Some(e) => {
                            warn!(id = %id, error = %e, "map emitted an unstorable row, document not indexed");
                            Vec::new()
                        }
                        None => rows,
                    },
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        warn!(id = %id, error = %e, "map function failed, document not indexed");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };
        out.push(DocEmissions { id: id.clone(), rows: emitted });
    }
    out
}
