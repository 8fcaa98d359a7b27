//! # Async API for SofaDB
//!
//! [`SofaDB`] is the public handle. It wraps the synchronous SQLite layer in
//! dedicated threads and talks to them over Tokio channels, so callers never
//! block the async runtime:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Tokio Runtime                            │
//! │   put / bulk_docs ──────┐         ┌────── get / changes     │
//! │                         │         │                         │
//! │   query ── spawn_blocking (view index) ── map / reduce      │
//! └─────────────────────────┼─────────┼─────────────────────────┘
//!                           ▼         ▼
//!              ┌────────────────┐  ┌──────────────────────┐
//!              │ Batch writer   │  │ Reader pool          │
//!              │ (1 thread,     │  │ (N threads, own      │
//!              │  group commit) │  │  read-only conns)    │
//!              └───────┬────────┘  └──────────┬───────────┘
//!                      │   broadcast notices  │
//!                      ▼                      ▼
//!                   SQLite (WAL)  ◄───────────┘
//! ```
//!
//! ## Read Path
//!
//! File databases serve reads from a pool of read-only connections; WAL mode
//! guarantees they see every committed batch. In-memory databases have a
//! single connection, so their reads are answered by the writer thread
//! between batches.
//!
//! ## Views
//!
//! View indexes live in a separate SQLite file next to the database
//! (`<path>.views`). Index maintenance and queries are blocking work and run
//! on Tokio's blocking pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};

use futures_util::future::{try_join_all, BoxFuture};
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::attachments::{preprocess, Attachment, AttachmentEncoding};
use crate::changes::{filter_page, plan_filter, ChangesFilter, ChangesOptions, ChangesResponse};
use crate::checkpoint::{CheckpointDoc, CheckpointOptions, CheckpointPeer};
use crate::config::DbConfig;
use crate::document::ParseOptions;
use crate::error::{Error, Result};
use crate::processor::{prepare_batch, BatchDoc, WriteOptions};
use crate::reader::{
    self, ChangeRow, DbInfo, GetOptions, OpenRevResult, OpenRevs, ReadRequest, RevsDiffEntry,
};
use crate::replicate::{replicate, ReplicationOptions, ReplicationPeer, ReplicationResult};
use crate::schema::Database;
use crate::script::{Evaluator, ScriptEvaluator};
use crate::subscription::{ChangesSubscription, PageReader, SubscriptionManager};
use crate::types::{Cancellation, DocId, DocWriteResult, RevId, Seq};
use crate::view::builtin::ReduceRegistry;
use crate::view::index::ViewStore;
use crate::view::{live_signatures, QueryOptions, ViewDef, ViewEngine, ViewHandle, ViewResponse, ViewSpec};
use crate::writer::{spawn_batch_writer, BatchWriterHandle, BulkResults};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Schema(format!("blocking task failed: {err}"))
}

/// Runs blocking work on the blocking pool.
async fn blocking<R, F>(work: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(join_error)?
}

// =============================================================================
// Builder
// =============================================================================

/// Opens a [`SofaDB`] with non-default collaborators.
///
/// ```rust,ignore
/// let mut reducers = ReduceRegistry::default();
/// reducers.register("_max", my_max);
/// let db = SofaDB::builder().path("app.db").reducers(reducers).open().await?;
/// ```
#[must_use]
pub struct DbBuilder {
    path: Option<PathBuf>,
    config: DbConfig,
    reducers: ReduceRegistry,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl DbBuilder {
    fn new() -> Self {
        Self {
            path: None,
            config: DbConfig::default(),
            reducers: ReduceRegistry::default(),
            evaluator: None,
        }
    }

    /// Database file. Without one the database lives in memory.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn config(mut self, config: DbConfig) -> Self {
        self.config = config;
        self
    }

    /// Native reducers available to views.
    pub fn reducers(mut self, reducers: ReduceRegistry) -> Self {
        self.reducers = reducers;
        self
    }

    /// Replaces the built-in script evaluator.
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub async fn open(self) -> Result<SofaDB> {
        self.config.validate()?;
        let evaluator: Arc<dyn Evaluator> = match self.evaluator {
            Some(evaluator) => evaluator,
            None => Arc::new(ScriptEvaluator::new(
                self.config.script_step_limit,
                self.config.script_cache_size,
            )),
        };
        match self.path {
            Some(path) => SofaDB::open_file(path, self.config, self.reducers, evaluator),
            None => SofaDB::open_memory(self.config, self.reducers, evaluator),
        }
    }
}

// =============================================================================
// SofaDB - The Main Async Handle
// =============================================================================

/// The main async handle.
///
/// `SofaDB` is `Clone`, `Send` and `Sync`; all clones share the same threads
/// and storage.
///
/// # Example
///
/// ```rust,ignore
/// use serde_json::json;
/// use sofadb::{GetOptions, SofaDB};
///
/// #[tokio::main]
/// async fn main() -> sofadb::Result<()> {
///     let db = SofaDB::open("notes.db").await?;
///     let res = db.put(json!({"_id": "note-1", "text": "hello"})).await?;
///     let doc = db.get("note-1", GetOptions::default()).await?;
///     assert_eq!(doc["_rev"], json!(res.rev));
///     db.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SofaDB {
    /// Batch writer handle for write operations with group commit.
    writer: BatchWriterHandle,

    /// Reader pool channel; `None` when reads go through the writer.
    read_tx: Option<mpsc::Sender<ReadRequest>>,

    /// Handles to the reader threads (for shutdown).
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,

    /// Number of reader threads in the pool.
    reader_count: usize,

    subscriptions: Arc<SubscriptionManager>,
    views: Arc<ViewEngine>,
    evaluator: Arc<dyn Evaluator>,
    config: Arc<DbConfig>,
}

impl std::fmt::Debug for SofaDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SofaDB")
            .field("reader_count", &self.reader_count)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SofaDB {
    /// Opens or creates a database file with the default configuration.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open().await
    }

    /// Opens or creates a database file.
    pub async fn open_with_config<P: AsRef<Path>>(path: P, config: DbConfig) -> Result<Self> {
        Self::builder().path(path).config(config).open().await
    }

    /// Creates an in-memory database (tests, ephemeral peers).
    pub async fn open_in_memory() -> Result<Self> {
        Self::builder().open().await
    }

    pub fn builder() -> DbBuilder {
        DbBuilder::new()
    }

    fn open_file(
        path: PathBuf,
        config: DbConfig,
        reducers: ReduceRegistry,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self> {
        let db = Database::open(&path)?;
        let head = reader::read_update_seq(db.connection())?;
        let subscriptions = Arc::new(SubscriptionManager::new(config.broadcast_capacity, head));
        let writer = spawn_batch_writer(db.into_connection(), Arc::clone(&subscriptions), config.writer_config())?;

        let reader_count = available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_READ_THREADS)
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        // Threads compete to receive from the shared channel.
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let read_rx = Arc::new(Mutex::new(read_rx));
        let mut reader_handles = Vec::with_capacity(reader_count);
        for i in 0..reader_count {
            let rx = Arc::clone(&read_rx);
            let reader_path = path.clone();
            let handle = thread::Builder::new()
                .name(format!("sofadb-reader-{i}"))
                .spawn(move || {
                    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                        Ok(rt) => rt,
                        Err(e) => {
                            warn!(error = %e, "failed to create reader runtime");
                            return;
                        }
                    };
                    let conn = match Connection::open_with_flags(
                        &reader_path,
                        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                    ) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to open read-only connection");
                            return;
                        }
                    };
                    rt.block_on(reader::run_reader_pooled(conn, rx));
                })
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {e}")))?;
            reader_handles.push(handle);
        }

        let mut view_path = path.into_os_string();
        view_path.push(".views");
        let views = ViewEngine::new(ViewStore::open(PathBuf::from(view_path))?, Arc::clone(&evaluator), reducers);

        Ok(Self {
            writer,
            read_tx: Some(read_tx),
            reader_handles: Arc::new(Mutex::new(reader_handles)),
            reader_count,
            subscriptions,
            views: Arc::new(views),
            evaluator,
            config: Arc::new(config),
        })
    }

    fn open_memory(config: DbConfig, reducers: ReduceRegistry, evaluator: Arc<dyn Evaluator>) -> Result<Self> {
        let db = Database::open_in_memory()?;
        let subscriptions = Arc::new(SubscriptionManager::new(config.broadcast_capacity, Seq::ZERO));
        let writer = spawn_batch_writer(db.into_connection(), Arc::clone(&subscriptions), config.writer_config())?;
        let views = ViewEngine::new(ViewStore::open_in_memory()?, Arc::clone(&evaluator), reducers);
        Ok(Self {
            writer,
            read_tx: None,
            reader_handles: Arc::new(Mutex::new(Vec::new())),
            reader_count: 0,
            subscriptions,
            views: Arc::new(views),
            evaluator,
            config: Arc::new(config),
        })
    }

    /// Returns the number of reader threads in the pool (0 for in-memory).
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    // =========================================================================
    // Request Plumbing
    // =========================================================================

    async fn read<R>(&self, make: impl FnOnce(oneshot::Sender<Result<R>>) -> ReadRequest) -> Result<R> {
        let (response, answer) = oneshot::channel();
        let request = make(response);
        match &self.read_tx {
            Some(tx) => tx
                .send(request)
                .await
                .map_err(|_| Error::Schema("reader pool has shut down".to_string()))?,
            None => self.writer.read(request).await?,
        }
        answer
            .await
            .map_err(|_| Error::Schema("reader dropped response".to_string()))?
    }

    fn write_options(&self, new_edits: bool, was_delete: bool) -> WriteOptions {
        WriteOptions {
            new_edits,
            was_delete,
            rev_limit: self.config.rev_limit,
            parse: ParseOptions {
                deterministic_revs: self.config.deterministic_revs,
            },
        }
    }

    async fn write(&self, docs: Vec<Value>, opts: WriteOptions) -> Result<BulkResults> {
        let prepared = prepare_batch(docs, opts.new_edits, opts.parse);
        let prepared = preprocess_attachments(prepared).await?;
        self.writer.bulk_docs(prepared, opts).await
    }

    async fn write_one(&self, doc: Value, opts: WriteOptions) -> Result<DocWriteResult> {
        self.write(vec![doc], opts)
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(Error::Schema("empty write result".to_string())))
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Creates or updates a document. Updates must carry the current `_rev`.
    ///
    /// # Errors
    ///
    /// - `MissingId` without an `_id`
    /// - `RevConflict` if `_rev` is not a current leaf
    /// - `DocValidation` / `InvalidRev` / `ReservedId` for malformed input
    /// - `BadArg` for an undecodable attachment
    pub async fn put(&self, doc: Value) -> Result<DocWriteResult> {
        if doc.get("_id").and_then(Value::as_str).is_none() {
            return Err(Error::MissingId);
        }
        self.write_one(doc, self.write_options(true, false)).await
    }

    /// Creates a document, generating an id if it has none.
    pub async fn post(&self, doc: Value) -> Result<DocWriteResult> {
        self.write_one(doc, self.write_options(true, false)).await
    }

    /// Deletes a revision by writing a tombstone on top of it.
    pub async fn remove(&self, id: &str, rev: &str) -> Result<DocWriteResult> {
        let doc = json!({"_id": id, "_rev": rev, "_deleted": true});
        self.write_one(doc, self.write_options(true, true)).await
    }

    /// Writes many documents at once, one outcome per input in input order.
    ///
    /// With `new_edits = false` the documents are replicated revisions: their
    /// `_rev` and `_revisions` are stored as given and never conflict.
    ///
    /// The outer `Err` means nothing was written (a bad attachment, or the
    /// writer is gone).
    pub async fn bulk_docs(&self, docs: Vec<Value>, new_edits: bool) -> Result<BulkResults> {
        self.write(docs, self.write_options(new_edits, false)).await
    }

    /// Reads a document (the winner, unless `opts.rev` says otherwise).
    pub async fn get(&self, id: &str, opts: GetOptions) -> Result<Value> {
        let id = DocId::new(id);
        self.read(|response| ReadRequest::Get { id, opts, response }).await
    }

    /// Reads several leaves of a document with their `_revisions`.
    pub async fn get_open_revs(&self, id: &str, revs: OpenRevs) -> Result<Vec<OpenRevResult>> {
        let id = DocId::new(id);
        self.read(|response| ReadRequest::OpenRevs { id, revs, response }).await
    }

    /// For each id, the given revisions this database lacks.
    pub async fn revs_diff(&self, revs: BTreeMap<String, Vec<RevId>>) -> Result<BTreeMap<String, RevsDiffEntry>> {
        self.read(|response| ReadRequest::RevsDiff { revs, response }).await
    }

    /// Database counters.
    pub async fn info(&self) -> Result<DbInfo> {
        self.read(|response| ReadRequest::Info { response }).await
    }

    // =========================================================================
    // Local Documents
    // =========================================================================

    /// Reads a `_local/` document.
    pub async fn get_local(&self, id: &str) -> Result<Value> {
        let id = DocId::new(id);
        self.read(|response| ReadRequest::Local { id, response })
            .await?
            .map(|doc| doc.to_json())
            .ok_or_else(|| Error::MissingDoc("missing".to_string()))
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    /// Adds or replaces one attachment, creating the document if needed.
    ///
    /// `rev` must be the current revision of an existing document.
    pub async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: Option<&str>,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<DocWriteResult> {
        let opts = GetOptions {
            rev: rev.map(RevId::parse).transpose()?,
            ..GetOptions::default()
        };
        let mut doc = match self.get(id, opts).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() && rev.is_none() => json!({"_id": id}),
            Err(e) => return Err(e),
        };
        let attachment = serde_json::to_value(Attachment::from_bytes(content_type, data))?;
        let Some(body) = doc.as_object_mut() else {
            return Err(Error::Schema(format!("stored document {id} is not an object")));
        };
        let atts = body.entry("_attachments").or_insert_with(|| Value::Object(Map::new()));
        if !atts.is_object() {
            *atts = Value::Object(Map::new());
        }
        if let Value::Object(atts) = atts {
            atts.insert(name.to_string(), attachment);
        }
        self.put(doc).await
    }

    /// Reads one attachment's metadata and bytes.
    pub async fn get_attachment(&self, id: &str, name: &str, rev: Option<&str>) -> Result<(Attachment, Vec<u8>)> {
        let id = DocId::new(id);
        let name = name.to_string();
        let rev = rev.map(RevId::parse).transpose()?;
        self.read(|response| ReadRequest::Attachment { id, name, rev, response }).await
    }

    // =========================================================================
    // Changes
    // =========================================================================

    async fn change_rows(&self, since: Seq, limit: usize, bodies: bool) -> Result<Vec<ChangeRow>> {
        self.read(|response| ReadRequest::Changes { since, limit, bodies, response }).await
    }

    async fn resolve_filter(&self, opts: &ChangesOptions) -> Result<ChangesFilter> {
        let plan = plan_filter(opts)?;
        let ddoc = match plan.design_doc_id() {
            Some(ddoc_id) => match self.get(&ddoc_id, GetOptions::default()).await {
                Ok(doc) => Some(doc),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        plan.resolve(opts, ddoc.as_ref())
    }

    /// Reads one storage batch after `since` and filters it. Returns the page
    /// and how many rows were read.
    async fn filtered_page(
        &self,
        since: Seq,
        opts: &ChangesOptions,
        filter: &ChangesFilter,
        limit: Option<usize>,
    ) -> Result<(ChangesResponse, usize)> {
        let bodies = opts.include_docs || filter.needs_body();
        let rows = self.change_rows(since, self.config.changes_batch_size, bodies).await?;
        let read = rows.len();
        let page = filter_page(rows, since, opts, filter, self.evaluator.as_ref(), limit);
        Ok((page, read))
    }

    /// Changes after `opts.since`, up to `opts.limit` matching events.
    ///
    /// # Errors
    ///
    /// `BadRequest` / `MissingDoc` for filters that cannot be resolved.
    pub async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        let filter = self.resolve_filter(&opts).await?;
        let mut since = opts.since;
        let mut results = Vec::new();
        loop {
            let remaining = opts.limit.map(|limit| limit.saturating_sub(results.len()));
            if remaining == Some(0) {
                break;
            }
            let (page, read) = self.filtered_page(since, &opts, &filter, remaining).await?;
            since = page.last_seq;
            results.extend(page.results);
            if read < self.config.changes_batch_size {
                break;
            }
        }
        Ok(ChangesResponse { results, last_seq: since })
    }

    /// A live feed: everything after `opts.since`, then each new commit.
    pub async fn subscribe(&self, opts: ChangesOptions) -> Result<ChangesSubscription> {
        let filter = self.resolve_filter(&opts).await?;
        // Subscribe before the first read so no commit falls in between.
        let receiver = self.subscriptions.subscribe();

        let db = self.clone();
        let page_opts = opts.clone();
        let read_page: PageReader = Box::new(move |since| -> BoxFuture<'static, Result<ChangesResponse>> {
            let db = db.clone();
            let opts = page_opts.clone();
            let filter = filter.clone();
            Box::pin(async move {
                let (page, _) = db.filtered_page(since, &opts, &filter, None).await?;
                Ok(page)
            })
        });
        Ok(ChangesSubscription::new(
            receiver,
            opts.since,
            opts.limit,
            read_page,
            Cancellation::new(),
        ))
    }

    // =========================================================================
    // Views
    // =========================================================================

    async fn view_handle(&self, spec: &ViewSpec) -> Result<ViewHandle> {
        match spec {
            ViewSpec::Named(name) => {
                let (ddoc_id, view) = ViewSpec::parse_name(name)?;
                let ddoc = self.get(&ddoc_id, GetOptions::default()).await?;
                let def = ViewDef::from_design_doc(&ddoc, &view)?;
                Ok(ViewHandle::named(ddoc_id, view, def))
            }
            ViewSpec::Temp(def) => Ok(ViewHandle::temp(def.clone())),
        }
    }

    /// Brings a view's index up to the current update sequence.
    async fn update_view(&self, view: &ViewHandle) -> Result<()> {
        loop {
            let engine = Arc::clone(&self.views);
            let handle = view.clone();
            let since = blocking(move || engine.last_seq(&handle)).await?;

            let rows = self.change_rows(since, self.config.view_batch_size, true).await?;
            if rows.is_empty() {
                return Ok(());
            }

            let engine = Arc::clone(&self.views);
            let handle = view.clone();
            if !blocking(move || engine.index_batch(&handle, since, &rows)).await? {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Queries a map/reduce view, indexing pending changes first.
    ///
    /// # Errors
    ///
    /// - `MissingDoc` if the design doc or view does not exist
    /// - `BadRequest` for inconsistent options or an unknown built-in reduce
    pub async fn query(&self, spec: ViewSpec, opts: QueryOptions) -> Result<ViewResponse> {
        let view = self.view_handle(&spec).await?;
        self.views.validate(&view.def)?;

        let outcome = self.query_view(&view, opts).await;
        if matches!(spec, ViewSpec::Temp(_)) {
            let engine = Arc::clone(&self.views);
            let handle = view.clone();
            if let Err(e) = blocking(move || engine.drop_view(&handle)).await {
                warn!(error = %e, "failed to drop temporary view");
            }
        }
        outcome
    }

    async fn query_view(&self, view: &ViewHandle, opts: QueryOptions) -> Result<ViewResponse> {
        self.update_view(view).await?;

        let include_docs = opts.include_docs;
        let engine = Arc::clone(&self.views);
        let handle = view.clone();
        let mut response = blocking(move || engine.query(&handle, &opts)).await?;

        if include_docs {
            for row in &mut response.rows {
                // A value with an `_id` links another document.
                let linked = row.value.get("_id").and_then(Value::as_str).map(str::to_string);
                let Some(id) = linked.or_else(|| row.id.clone()) else {
                    continue;
                };
                row.doc = Some(match self.get(&id, GetOptions::default()).await {
                    Ok(doc) => doc,
                    Err(e) if e.is_not_found() => Value::Null,
                    Err(e) => return Err(e),
                });
            }
        }
        Ok(response)
    }

    /// Deletes indexes whose view definitions no longer exist. Returns how
    /// many were removed.
    pub async fn view_cleanup(&self) -> Result<usize> {
        let design_docs = self.read(|response| ReadRequest::DesignDocs { response }).await?;
        let live = live_signatures(&design_docs);
        let engine = Arc::clone(&self.views);
        let removed = blocking(move || engine.cleanup(&live)).await?;
        debug!(removed, "view cleanup finished");
        Ok(removed)
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Default replication options, with checkpoint retries taken from the
    /// configuration.
    pub fn replication_options(&self) -> ReplicationOptions {
        ReplicationOptions {
            checkpoint: CheckpointOptions {
                max_retries: self.config.checkpoint_max_retries,
                ..CheckpointOptions::default()
            },
            ..ReplicationOptions::default()
        }
    }

    /// Replicates this database into `target`.
    pub async fn replicate_to<T: ReplicationPeer>(&self, target: &T, opts: ReplicationOptions) -> Result<ReplicationResult> {
        replicate(self, target, opts).await
    }

    /// Replicates `source` into this database.
    pub async fn replicate_from<S: ReplicationPeer>(&self, source: &S, opts: ReplicationOptions) -> Result<ReplicationResult> {
        replicate(source, self, opts).await
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Shuts down the database gracefully.
    ///
    /// Pending writes are committed, reader threads finish their current
    /// request and exit. Other clones fail every operation afterwards.
    pub async fn shutdown(self) {
        if let Some(tx) = &self.read_tx {
            for _ in 0..self.reader_count {
                let _ = tx.send(ReadRequest::Shutdown).await;
            }
        }

        let handles = std::mem::take(&mut *self.reader_handles.lock().await);
        for handle in handles {
            let _ = handle.join();
        }

        self.writer.shutdown().await;
    }
}

/// Decodes and digests inline attachments, one blocking task per document.
/// The first bad payload fails the whole batch.
async fn preprocess_attachments(docs: Vec<Result<BatchDoc>>) -> Result<Vec<Result<BatchDoc>>> {
    let tasks = docs.into_iter().map(|doc| async move {
        match doc {
            Ok(BatchDoc::Revisioned(mut parsed))
                if parsed
                    .attachments
                    .as_ref()
                    .is_some_and(|atts| atts.values().any(|att| !att.stub)) =>
            {
                let parsed = blocking(move || {
                    if let Some(atts) = parsed.attachments.as_mut() {
                        preprocess(atts, AttachmentEncoding::Binary)?;
                    }
                    Ok(parsed)
                })
                .await?;
                Ok(Ok(BatchDoc::Revisioned(parsed)))
            }
            other => Ok(other),
        }
    });
    try_join_all(tasks).await
}

// =============================================================================
// Replication Peer
// =============================================================================

impl CheckpointPeer for SofaDB {
    async fn get_checkpoint(&self, id: &str) -> Result<Option<CheckpointDoc>> {
        match self.get_local(id).await {
            Ok(doc) => Ok(Some(serde_json::from_value(doc)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_checkpoint(&self, doc: &CheckpointDoc) -> Result<()> {
        self.put(serde_json::to_value(doc)?).await.map(|_| ())
    }
}

impl ReplicationPeer for SofaDB {
    async fn peer_id(&self) -> Result<String> {
        Ok(self.info().await?.instance_id)
    }

    async fn changes_page(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        self.changes(opts).await
    }

    async fn revs_diff(&self, revs: BTreeMap<String, Vec<RevId>>) -> Result<BTreeMap<String, RevsDiffEntry>> {
        SofaDB::revs_diff(self, revs).await
    }

    async fn open_revs(&self, id: &str, revs: Vec<RevId>) -> Result<Vec<OpenRevResult>> {
        self.get_open_revs(id, OpenRevs::Revs(revs)).await
    }

    async fn write_replicated(&self, docs: Vec<Value>) -> Result<BulkResults> {
        self.bulk_docs(docs, false).await
    }
}

// =============================================================================
// Tests
// =============================================================================
