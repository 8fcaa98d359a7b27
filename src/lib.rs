//! # SofaDB - Document Revision Store
//!
//! SofaDB is a local-first document database built on SQLite, modeled on the
//! CouchDB replication protocol. It provides:
//!
//! - **Revision trees**: every edit is a node; concurrent edits become
//!   conflicts with a deterministic winner
//! - **Replication**: revs-diff, open-revs and checkpoints that survive
//!   divergent histories
//! - **Map/reduce views**: incremental secondary indexes built by sandboxed
//!   user scripts or native reducers
//! - **Change feeds**: filtered by predicates, selectors, design-doc filters
//!   or views, one-shot or live
//! - **Attachments**: content-addressed by md5 digest
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │     (put, bulk_docs, get, changes, subscribe, query, replicate) │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌───────────────────────────────┐  ┌───────────────────────────────┐
//! │         Batch Writer          │  │        Reader Pool            │
//! │  (single thread, group commit)│  │  (read-only connections)      │
//! │                               │  │                               │
//! │  processor ─► rev_tree merge  │  │  docs, open revs, changes,    │
//! │  SAVEPOINT per request        │  │  revs_diff, attachments       │
//! └──────────────┬────────────────┘  └──────────────┬────────────────┘
//!                │ notices after COMMIT             │
//!                ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SQLite (WAL)                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One writer**: all writes for all ids pass through one thread, so no
//!    revision tree is ever merged concurrently
//! 2. **Deterministic winner**: not deleted, then highest generation, then
//!    greatest hash
//! 3. **Monotonic sequence**: every committed write gets the next sequence,
//!    never reused
//! 4. **Committed reads**: feeds, views and replication observe only
//!    committed state
//! 5. **Isolated scripts**: user code sees only the intrinsics injected for
//!    the call and always terminates
//!
//! ## Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use sofadb::{QueryOptions, SofaDB, ViewSpec};
//!
//! let db = SofaDB::open("app.db").await?;
//! db.put(json!({"_id": "a", "type": "post"})).await?;
//! db.put(json!({
//!     "_id": "_design/app",
//!     "views": {"by_type": {"map": "function (doc) { emit(doc.type, 1); }", "reduce": "_count"}}
//! })).await?;
//! let counts = db.query(ViewSpec::Named("app/by_type".into()), QueryOptions::default()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for SofaDB operations.
pub mod error;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Domain types: document ids, revision ids, sequences.
pub mod types;

/// Database configuration (TOML).
pub mod config;

/// Revision trees: merge, stemming, winner selection.
pub mod rev_tree;

/// Document parsing and validation.
pub mod document;

/// Attachment decoding and digesting.
pub mod attachments;

/// The keyed store contract the document processor writes through.
pub mod store;

/// Stored-shape encoding (trees and bodies as JSON text).
pub mod codec;

/// Batch processing of document writes.
pub mod processor;

/// Read operations using direct SQL queries.
pub mod reader;

/// Batch writer with group commit.
///
/// Requests are collected over a configurable window (default 10ms) and
/// committed in one transaction, each inside its own SAVEPOINT so that a
/// failing request never affects its neighbours.
pub mod writer;

/// Live change notifications and continuous feeds.
pub mod subscription;

/// Change feed events and filters.
pub mod changes;

/// Declarative document matching for `_selector` filters.
pub mod selector;

/// Sandboxed evaluation of map, reduce and filter scripts.
pub mod script;

/// Map/reduce views.
pub mod view;

/// Replication checkpoints.
pub mod checkpoint;

/// One-shot replication.
pub mod replicate;

/// Async API. The main entry point is [`SofaDB`](api::SofaDB).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{DbBuilder, SofaDB};
pub use attachments::{Attachment, AttachmentData};
pub use changes::{ChangeEvent, ChangeFilter, ChangesOptions, ChangesResponse, ChangesStyle};
pub use checkpoint::{CheckpointDoc, CheckpointOptions, CheckpointPeer, Checkpointer};
pub use config::DbConfig;
pub use error::{Error, Result};
pub use reader::{DbInfo, GetOptions, OpenRevResult, OpenRevs, RevsDiffEntry};
pub use replicate::{replicate, ReplicationOptions, ReplicationPeer, ReplicationResult};
pub use schema::Database;
pub use script::{Capabilities, Evaluator, Invocation, Outcome, ScriptEvaluator};
pub use subscription::ChangesSubscription;
pub use types::{Cancellation, DocId, DocWriteResult, RevId, Seq};
pub use view::builtin::ReduceRegistry;
pub use view::{QueryOptions, ViewDef, ViewResponse, ViewRow, ViewSpec};
pub use writer::{BulkResults, WriterConfig};
