//! # SQLite Schema for SofaDB
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  doc_store                 rev_bodies                attach_store       │
//! │  ┌─────────────────┐       ┌─────────────────┐       ┌──────────────┐   │
//! │  │ doc_id (PK)     │◄──────│ doc_id          │       │ digest (PK)  │   │
//! │  │ rev_tree (JSON) │       │ rev             │──────►│ data BLOB    │   │
//! │  │ winning_rev     │       │ deleted         │ stubs │ length       │   │
//! │  │ deleted         │       │ body (JSON)     │       └──────────────┘   │
//! │  │ seq (UNIQUE)    │       └─────────────────┘                          │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  local_store               sofadb_metadata                              │
//! │  ┌─────────────────┐       ┌─────────────────┐                          │
//! │  │ doc_id (PK)     │       │ key (PK)        │  schema_version,         │
//! │  │ rev ("0-N")     │       │ value           │  instance_id, doc_count  │
//! │  │ body (JSON)     │       └─────────────────┘                          │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### One row per document in `doc_store`
//!
//! The change feed only ever reports the latest state of a document, so the
//! row's `seq` is overwritten on every write. `ORDER BY seq` over the unique
//! index yields the feed directly; an id moves to the tail each time it changes.
//!
//! ### Content-addressed attachments
//!
//! Bodies carry only stubs. Bytes live once per digest in `attach_store`, so
//! unchanged attachments cost nothing across revisions.

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// Table Definitions
// =============================================================================

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS sofadb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Latest state of each document: its full revision tree and winner.
const CREATE_DOC_STORE: &str = r#"
CREATE TABLE IF NOT EXISTS doc_store (
    doc_id      TEXT PRIMARY KEY,
    rev_tree    TEXT NOT NULL,
    winning_rev TEXT NOT NULL,
    deleted     INTEGER NOT NULL,
    seq         INTEGER NOT NULL
)
"#;

const CREATE_DOC_STORE_SEQ_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS doc_store_seq ON doc_store(seq)
"#;

/// Stored revision bodies (leaves, plus ancestors not yet stemmed).
const CREATE_REV_BODIES: &str = r#"
CREATE TABLE IF NOT EXISTS rev_bodies (
    doc_id  TEXT NOT NULL,
    rev     TEXT NOT NULL,
    deleted INTEGER NOT NULL,
    body    TEXT NOT NULL,
    PRIMARY KEY (doc_id, rev)
) WITHOUT ROWID
"#;

const CREATE_ATTACH_STORE: &str = r#"
CREATE TABLE IF NOT EXISTS attach_store (
    digest TEXT PRIMARY KEY,
    data   BLOB NOT NULL,
    length INTEGER NOT NULL
)
"#;

const CREATE_LOCAL_STORE: &str = r#"
CREATE TABLE IF NOT EXISTS local_store (
    doc_id TEXT PRIMARY KEY,
    rev    TEXT NOT NULL,
    body   TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the SofaDB schema applied.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens or creates a database file, applying the schema.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(true)?;
        Ok(db)
    }

    /// Creates an in-memory database (tests, ephemeral peers).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(false)?;
        Ok(db)
    }

    fn initialize(&mut self, wal: bool) -> Result<()> {
        // WAL lets the reader pool see committed data while the writer works.
        if wal {
            self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        }
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_DOC_STORE)?;
        self.conn.execute_batch(CREATE_DOC_STORE_SEQ_INDEX)?;
        self.conn.execute_batch(CREATE_REV_BODIES)?;
        self.conn.execute_batch(CREATE_ATTACH_STORE)?;
        self.conn.execute_batch(CREATE_LOCAL_STORE)?;

        self.verify_or_set_version()?;
        self.ensure_instance_id()?;
        Ok(())
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing = read_meta(&self.conn, "schema_version")?;
        match existing {
            None => {
                write_meta(&self.conn, "schema_version", &SCHEMA_VERSION.to_string())?;
                Ok(())
            }
            Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => Ok(()),
            Some(v) => Err(Error::Schema(format!(
                "schema version mismatch: database has {}, expected {}",
                v, SCHEMA_VERSION
            ))),
        }
    }

    /// Every database gets a stable random id; replication ids are derived from it.
    fn ensure_instance_id(&mut self) -> Result<()> {
        if read_meta(&self.conn, "instance_id")?.is_none() {
            let id = uuid::Uuid::new_v4().simple().to_string();
            write_meta(&self.conn, "instance_id", &id)?;
        }
        Ok(())
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper, returning the connection (for the writer thread).
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Metadata Helpers
// =============================================================================

/// Reads a metadata value.
pub fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM sofadb_metadata WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Inserts or replaces a metadata value.
pub fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sofadb_metadata (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}
