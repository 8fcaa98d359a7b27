//! # Batch Writer with Group Commit
//!
//! Every document write in a database goes through one writer thread. It
//! collects bulk-write requests over a short window and applies them in a
//! single SQLite transaction, one SAVEPOINT per request.
//!
//! ## Why Group Commit?
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ req1 → BEGIN → COMMIT    │     │ BEGIN IMMEDIATE          │
//! │ req2 → BEGIN → COMMIT    │     │   SAVEPOINT req_0        │
//! │ req3 → BEGIN → COMMIT    │     │   SAVEPOINT req_1        │
//! │ ...                      │     │   SAVEPOINT req_2        │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Per-Document Serialization
//!
//! The writer is the only mutator, and requests are applied in arrival order,
//! so two writers racing on one id are always serialized: the second sees
//! the tree left by the first and gets a `RevConflict` if its parent is stale.
//!
//! ## Staged vs Committed State
//!
//! The next sequence, the visible-document count and the change notices are
//! staged while a batch runs. A failed request restores the snapshot taken
//! at its SAVEPOINT; a failed COMMIT discards the whole stage. Notices are
//! published to subscribers only after COMMIT.
//!
//! ## Invariants
//!
//! - Memory never leads disk (staged/committed separation)
//! - Sequences strictly increase, no gaps
//! - Requests are processed in order within a batch

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{encode_body, encode_tree};
use crate::error::{Error, Result};
use crate::processor::{process_batch, BatchDoc, WriteOptions};
use crate::reader::{self, ReadRequest};
use crate::schema::write_meta;
use crate::store::{DocStore, DocWrite, LocalDoc, StoredDoc};
use crate::subscription::{ChangeNotice, SubscriptionManager};
use crate::types::{DocId, DocWriteResult, RevId, Seq};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Requests are collected for up to this duration before being executed.
/// Shorter = lower latency, longer = higher throughput.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Maximum requests per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Size of the request channel.
const COMMAND_CHANNEL_SIZE: usize = 4096;

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for requests before executing a batch.
    pub batch_timeout: Duration,

    /// Maximum requests per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// Per-document outcomes of one bulk write.
pub type BulkResults = Vec<Result<DocWriteResult>>;

/// A request sent to the writer thread.
pub enum WriteRequest {
    /// Apply prepared documents.
    BulkDocs {
        docs: Vec<Result<BatchDoc>>,
        opts: WriteOptions,
        response: oneshot::Sender<Result<BulkResults>>,
    },

    /// A read answered by the writer's own connection (in-memory databases).
    Read(ReadRequest),

    /// Shutdown the writer.
    Shutdown,
}

struct PendingBulk {
    docs: Vec<Result<BatchDoc>>,
    opts: WriteOptions,
    response: oneshot::Sender<Result<BulkResults>>,
}

// =============================================================================
// Staged State
// =============================================================================

/// Batch-local state not yet known to be on disk.
#[derive(Debug, Clone)]
struct StagedState {
    /// Last assigned sequence.
    last_seq: Seq,
    /// Visible documents.
    doc_count: i64,
    /// Notices for writes made in this batch.
    notices: Vec<ChangeNotice>,
}

impl StagedState {
    fn new(last_seq: Seq, doc_count: i64) -> Self {
        Self {
            last_seq,
            doc_count,
            notices: Vec::new(),
        }
    }
}

// =============================================================================
// SQLite Store
// =============================================================================

/// The [`DocStore`] the processor writes through inside a SAVEPOINT.
struct SqliteStore<'a> {
    conn: &'a Connection,
    staged: &'a mut StagedState,
}

impl DocStore for SqliteStore<'_> {
    fn get_doc(&self, id: &DocId) -> Result<Option<StoredDoc>> {
        reader::read_stored_doc(self.conn, id)
    }

    fn get_body(&self, id: &DocId, rev: &RevId) -> Result<Option<(bool, Map<String, Value>)>> {
        reader::read_body(self.conn, id, rev)
    }

    fn has_attachment(&self, digest: &str) -> Result<bool> {
        reader::has_attachment(self.conn, digest)
    }

    fn write_doc(&mut self, write: DocWrite) -> Result<Seq> {
        let seq = self.staged.last_seq.next();

        for (digest, bytes) in &write.attachments {
            self.conn.execute(
                "INSERT OR IGNORE INTO attach_store (digest, data, length) VALUES (?1, ?2, ?3)",
                params![digest, bytes, bytes.len() as i64],
            )?;
        }
        for rev in &write.stemmed_revs {
            self.conn.execute(
                "DELETE FROM rev_bodies WHERE doc_id = ?1 AND rev = ?2",
                params![write.id.as_str(), rev.to_string()],
            )?;
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO rev_bodies (doc_id, rev, deleted, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                write.id.as_str(),
                write.rev.to_string(),
                write.rev_deleted,
                encode_body(&write.body)?,
            ],
        )?;
        self.conn.execute(
            "INSERT INTO doc_store (doc_id, rev_tree, winning_rev, deleted, seq)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(doc_id) DO UPDATE SET
                 rev_tree = excluded.rev_tree,
                 winning_rev = excluded.winning_rev,
                 deleted = excluded.deleted,
                 seq = excluded.seq",
            params![
                write.id.as_str(),
                encode_tree(&write.rev_tree)?,
                write.winning_rev.to_string(),
                write.winning_deleted,
                seq.as_raw() as i64,
            ],
        )?;

        if write.doc_count_delta != 0 {
            self.staged.doc_count += write.doc_count_delta;
            write_meta(self.conn, "doc_count", &self.staged.doc_count.to_string())?;
        }
        self.staged.last_seq = seq;
        self.staged.notices.push(ChangeNotice {
            seq,
            id: write.id,
            rev: write.winning_rev,
            deleted: write.winning_deleted,
        });
        Ok(seq)
    }

    fn changes_since(&self, since: Seq, limit: usize) -> Result<Vec<StoredDoc>> {
        reader::read_changes(self.conn, since, limit)
    }

    fn get_local(&self, id: &DocId) -> Result<Option<LocalDoc>> {
        reader::read_local(self.conn, id)
    }

    fn put_local(&mut self, doc: LocalDoc) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO local_store (doc_id, rev, body) VALUES (?1, ?2, ?3)",
            params![doc.id.as_str(), doc.rev, encode_body(&doc.body)?],
        )?;
        Ok(())
    }

    fn remove_local(&mut self, id: &DocId) -> Result<()> {
        self.conn
            .execute("DELETE FROM local_store WHERE doc_id = ?1", [id.as_str()])?;
        Ok(())
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The writer that owns the database connection and runs group commit.
///
/// Runs on a dedicated thread; use [`BatchWriterHandle`] from async code.
pub struct BatchWriter {
    /// SQLite connection (owned, single writer).
    conn: Connection,

    /// Last committed sequence.
    committed_seq: Seq,

    /// Committed visible-document count.
    committed_doc_count: i64,

    /// Batch-local overlay.
    staged: StagedState,

    /// Receives notices after each commit.
    subscriptions: Arc<SubscriptionManager>,
}

impl BatchWriter {
    /// Creates a writer over an initialized connection.
    pub fn new(conn: Connection, subscriptions: Arc<SubscriptionManager>) -> Result<Self> {
        let committed_seq = reader::read_update_seq(&conn)?;
        let committed_doc_count = reader::read_doc_count(&conn)?;
        Ok(Self {
            conn,
            committed_seq,
            committed_doc_count,
            staged: StagedState::new(committed_seq, committed_doc_count),
            subscriptions,
        })
    }

    /// Last committed sequence.
    pub fn committed_seq(&self) -> Seq {
        self.committed_seq
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes a batch of requests.
    ///
    /// 1. Begin outer transaction
    /// 2. Each request runs in its own SAVEPOINT
    /// 3. A request whose storage write fails is rolled back; others continue
    /// 4. Commit, publish notices, send responses
    fn execute_batch(&mut self, items: Vec<PendingBulk>) {
        if items.is_empty() {
            return;
        }

        self.staged = StagedState::new(self.committed_seq, self.committed_doc_count);

        let mut responses = Vec::with_capacity(items.len());
        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            responses.push(item.response);
            requests.push((item.docs, item.opts));
        }

        match self.execute_batch_inner(requests) {
            Ok(results) => {
                self.committed_seq = self.staged.last_seq;
                self.committed_doc_count = self.staged.doc_count;
                let notices = std::mem::take(&mut self.staged.notices);
                debug!(
                    requests = responses.len(),
                    writes = notices.len(),
                    seq = %self.committed_seq,
                    "batch committed"
                );
                self.subscriptions.publish(notices);

                for (response, result) in responses.into_iter().zip(results) {
                    let _ = response.send(result);
                }
            }
            Err(e) => {
                warn!(error = %e, "batch commit failed");
                let err_msg = format!("batch commit failed: {e}");
                for response in responses {
                    let _ = response.send(Err(Error::Schema(err_msg.clone())));
                }
                self.staged = StagedState::new(self.committed_seq, self.committed_doc_count);
            }
        }
    }

    fn execute_batch_inner(
        &mut self,
        requests: Vec<(Vec<Result<BatchDoc>>, WriteOptions)>,
    ) -> Result<Vec<Result<BulkResults>>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;

        let mut results = Vec::with_capacity(requests.len());
        for (idx, (docs, opts)) in requests.into_iter().enumerate() {
            results.push(self.execute_in_savepoint(idx, docs, &opts));
        }

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(results),
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    fn execute_in_savepoint(
        &mut self,
        idx: usize,
        docs: Vec<Result<BatchDoc>>,
        opts: &WriteOptions,
    ) -> Result<BulkResults> {
        let sp_name = format!("req_{idx}");
        self.conn.execute_batch(&format!("SAVEPOINT {sp_name}"))?;
        let snapshot = self.staged.clone();

        let outcome = {
            let mut store = SqliteStore {
                conn: &self.conn,
                staged: &mut self.staged,
            };
            process_batch(&mut store, docs, opts)
        };

        match outcome {
            Ok(results) => {
                self.conn.execute_batch(&format!("RELEASE {sp_name}"))?;
                Ok(results)
            }
            Err(e) => {
                warn!(error = %e, "bulk write rolled back");
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {sp_name}; RELEASE {sp_name}"))?;
                self.staged = snapshot;
                Err(e)
            }
        }
    }

    /// Answers a read on the writer's connection.
    fn execute_read(&self, request: ReadRequest) {
        reader::handle_read(&self.conn, request);
    }
}

// =============================================================================
// Batch Writer Handle (Async Interface)
// =============================================================================

/// Async handle to the batch writer.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl BatchWriterHandle {
    /// Applies prepared documents, returning one outcome per input.
    pub async fn bulk_docs(&self, docs: Vec<Result<BatchDoc>>, opts: WriteOptions) -> Result<BulkResults> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest::BulkDocs {
                docs,
                opts,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Schema("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Schema("writer dropped response".to_string()))?
    }

    /// Sends a read to the writer thread.
    pub async fn read(&self, request: ReadRequest) -> Result<()> {
        self.tx
            .send(WriteRequest::Read(request))
            .await
            .map_err(|_| Error::Schema("writer has shut down".to_string()))
    }

    /// Flushes pending work and stops the thread.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the batch writer loop.
pub async fn run_batch_writer(mut writer: BatchWriter, mut rx: mpsc::Receiver<WriteRequest>, config: WriterConfig) {
    let mut batch: Vec<PendingBulk> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            None => Duration::from_secs(3600),
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(WriteRequest::BulkDocs { docs, opts, response })) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }
                batch.push(PendingBulk { docs, opts, response });

                if batch.len() >= config.batch_max_size {
                    writer.execute_batch(std::mem::take(&mut batch));
                    batch_start = None;
                }
            }
            Ok(Some(WriteRequest::Read(request))) => {
                // Reads see only committed state.
                writer.execute_read(request);
            }
            Ok(Some(WriteRequest::Shutdown)) | Ok(None) => {
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
            Err(_) => {
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
            }
        }
    }
}

/// Spawns the batch writer on a dedicated thread.
pub fn spawn_batch_writer(
    conn: Connection,
    subscriptions: Arc<SubscriptionManager>,
    config: WriterConfig,
) -> Result<BatchWriterHandle> {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let writer = BatchWriter::new(conn, subscriptions)?;

    std::thread::Builder::new()
        .name("sofadb-batch-writer".to_string())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt.block_on(run_batch_writer(writer, rx, config)),
                Err(e) => warn!(error = %e, "failed to create writer runtime"),
            }
        })
        .map_err(|e| Error::Schema(format!("failed to spawn writer thread: {e}")))?;

    Ok(BatchWriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ParseOptions;
    use crate::processor::prepare_batch;
    use crate::reader::GetOptions;
    use crate::schema::Database;
    use serde_json::json;

    fn spawn_with(config: WriterConfig) -> (BatchWriterHandle, Arc<SubscriptionManager>) {
        let db = Database::open_in_memory().unwrap();
        let subs = Arc::new(SubscriptionManager::new(64, Seq::ZERO));
        let handle = spawn_batch_writer(db.into_connection(), Arc::clone(&subs), config).unwrap();
        (handle, subs)
    }

    fn spawn() -> (BatchWriterHandle, Arc<SubscriptionManager>) {
        spawn_with(WriterConfig::default())
    }

    async fn put(handle: &BatchWriterHandle, doc: Value) -> Result<DocWriteResult> {
        let opts = WriteOptions::default();
        let docs = prepare_batch(vec![doc], opts.new_edits, ParseOptions::default());
        handle.bulk_docs(docs, opts).await.unwrap().remove(0)
    }

    async fn get(handle: &BatchWriterHandle, id: &str) -> Result<Value> {
        let (response, answer) = oneshot::channel();
        handle
            .read(ReadRequest::Get {
                id: DocId::new(id),
                opts: GetOptions::default(),
                response,
            })
            .await
            .unwrap();
        answer.await.unwrap()
    }

    #[test]
    fn test_writer_starts_from_disk_state() {
        let db = Database::open_in_memory().unwrap();
        let subs = Arc::new(SubscriptionManager::new(8, Seq::ZERO));
        let writer = BatchWriter::new(db.into_connection(), subs).unwrap();
        assert_eq!(writer.committed_seq(), Seq::ZERO);
        assert_eq!(writer.committed_doc_count, 0);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (handle, subs) = spawn();
        let mut rx = subs.subscribe();

        let res = put(&handle, json!({"_id": "a", "n": 1})).await.unwrap();
        let doc = get(&handle, "a").await.unwrap();
        assert_eq!(doc["_rev"], json!(res.rev));
        assert_eq!(doc["n"], 1);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.seq.as_raw(), 1);
        assert_eq!(notice.id.as_str(), "a");
        assert_eq!(subs.head_seq().as_raw(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_same_id_serialize() {
        let (handle, _subs) = spawn();
        let first = put(&handle, json!({"_id": "a"})).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let handle = handle.clone();
            let rev = first.rev.clone();
            tasks.push(tokio::spawn(async move {
                put(&handle, json!({"_id": "a", "_rev": rev, "i": i})).await
            }));
        }
        let mut ok = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::RevConflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_failed_document_leaves_others_alone() {
        let (handle, _subs) = spawn();
        // A stub for unknown content fails per-document, not per-request.
        let bad = put(&handle, json!({"_id": "s", "_attachments": {"f": {"stub": true, "digest": "md5-x"}}})).await;
        assert!(matches!(bad, Err(Error::MissingStub(_))));
        put(&handle, json!({"_id": "t"})).await.unwrap();
        assert!(get(&handle, "t").await.is_ok());
        assert!(get(&handle, "s").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_batch() {
        // Batches only flush on shutdown.
        let (handle, subs) = spawn_with(WriterConfig {
            batch_timeout: Duration::from_secs(3600),
            batch_max_size: 100,
        });
        let mut rx = subs.subscribe();
        let opts = WriteOptions::default();
        let docs = prepare_batch(vec![json!({"_id": "late"})], true, ParseOptions::default());
        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.bulk_docs(docs, opts).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;
        assert!(pending.await.unwrap().unwrap()[0].is_ok());
        assert_eq!(rx.recv().await.unwrap().id.as_str(), "late");
    }
}
