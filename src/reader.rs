//! # Document Reader
//!
//! Read operations for SofaDB. Every read is a direct SQL query against
//! committed data, so file-backed readers always see the writer's latest
//! commit through WAL mode.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                               │
//! │                                                                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐             │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │             │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │             │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘             │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                   Read-only SQLite connections                  │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    ┌─────────────┐
//!                    │ SQLite (WAL)│
//!                    └─────────────┘
//! ```
//!
//! In-memory databases cannot share a connection across threads, so their
//! reads travel to the writer thread instead and are answered between
//! batches by the same [`handle_read`].

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::attachments::{Attachment, AttachmentData, AttachmentEncoding};
use crate::codec::{assemble_doc, decode_body, decode_tree};
use crate::error::{Error, Result};
use crate::schema::read_meta;
use crate::store::{LocalDoc, StoredDoc};
use crate::types::{DocId, RevId, Seq, DESIGN_PREFIX};

// =============================================================================
// Request Types
// =============================================================================

/// Options for reading one document.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Read this revision instead of the winner.
    pub rev: Option<RevId>,
    /// Include `_revisions`.
    pub revs: bool,
    /// Include `_revs_info`.
    pub revs_info: bool,
    /// Include `_conflicts`.
    pub conflicts: bool,
    /// Include `_deleted_conflicts`.
    pub deleted_conflicts: bool,
    /// Inline attachment data instead of stubs.
    pub attachments: bool,
    /// With `rev`: return the leaf that revision leads to.
    pub latest: bool,
    /// Include `_local_seq`.
    pub local_seq: bool,
}

/// Which leaves an open-revs read returns.
#[derive(Debug, Clone)]
pub enum OpenRevs {
    /// Every leaf.
    All,
    /// These revisions.
    Revs(Vec<RevId>),
}

/// One entry of an open-revs read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenRevResult {
    /// The revision with `_revisions`.
    Ok(Value),
    /// The revision is unknown or its body is gone.
    Missing(String),
}

/// `revs_diff` answer for one id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevsDiffEntry {
    /// Requested revisions this database lacks.
    pub missing: Vec<String>,
}

/// Database-wide counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbInfo {
    /// Documents whose winner is not deleted.
    pub doc_count: u64,
    /// Last committed sequence.
    pub update_seq: Seq,
    /// Stable random id of this database.
    pub instance_id: String,
}

/// One change-feed row with (optionally) the winner's assembled body.
#[derive(Debug, Clone)]
pub struct ChangeRow {
    /// Latest state of the document.
    pub doc: StoredDoc,
    /// Winning revision as `{_id, _rev, ...}`, if requested and available.
    pub body: Option<Map<String, Value>>,
}

/// Request type for read operations.
pub enum ReadRequest {
    /// Read a document.
    Get {
        id: DocId,
        opts: GetOptions,
        response: oneshot::Sender<Result<Value>>,
    },
    /// Read several leaves of a document.
    OpenRevs {
        id: DocId,
        revs: OpenRevs,
        response: oneshot::Sender<Result<Vec<OpenRevResult>>>,
    },
    /// Read changed documents after a sequence.
    Changes {
        since: Seq,
        limit: usize,
        bodies: bool,
        response: oneshot::Sender<Result<Vec<ChangeRow>>>,
    },
    /// Read a local document.
    Local {
        id: DocId,
        response: oneshot::Sender<Result<Option<LocalDoc>>>,
    },
    /// Which of the given revisions are unknown.
    RevsDiff {
        revs: BTreeMap<String, Vec<RevId>>,
        response: oneshot::Sender<Result<BTreeMap<String, RevsDiffEntry>>>,
    },
    /// Read one attachment's metadata and bytes.
    Attachment {
        id: DocId,
        name: String,
        rev: Option<RevId>,
        response: oneshot::Sender<Result<(Attachment, Vec<u8>)>>,
    },
    /// Database counters.
    Info {
        response: oneshot::Sender<Result<DbInfo>>,
    },
    /// Every live design document.
    DesignDocs {
        response: oneshot::Sender<Result<Vec<Value>>>,
    },
    /// Shutdown the reader.
    Shutdown,
}

fn missing() -> Error {
    Error::MissingDoc("missing".to_string())
}

// =============================================================================
// Row Reads
// =============================================================================

/// Reads the latest state of a document.
pub fn read_stored_doc(conn: &Connection, id: &DocId) -> Result<Option<StoredDoc>> {
    let row = conn
        .query_row(
            "SELECT rev_tree, winning_rev, deleted, seq FROM doc_store WHERE doc_id = ?1",
            [id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(tree, winner, deleted, seq)| stored_doc(id.as_str().to_string(), &tree, &winner, deleted, seq))
        .transpose()
}

fn stored_doc(id: String, tree: &str, winner: &str, deleted: bool, seq: i64) -> Result<StoredDoc> {
    Ok(StoredDoc {
        id: DocId::new(id),
        rev_tree: decode_tree(tree)?,
        winning_rev: RevId::parse(winner)?,
        deleted,
        seq: Seq::from_raw(seq as u64),
    })
}

/// Reads one stored revision body with its tombstone flag.
pub fn read_body(conn: &Connection, id: &DocId, rev: &RevId) -> Result<Option<(bool, Map<String, Value>)>> {
    let row = conn
        .query_row(
            "SELECT deleted, body FROM rev_bodies WHERE doc_id = ?1 AND rev = ?2",
            params![id.as_str(), rev.to_string()],
            |row| Ok((row.get::<_, bool>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    row.map(|(deleted, body)| Ok((deleted, decode_body(&body)?))).transpose()
}

/// True if bytes for `digest` are stored.
pub fn has_attachment(conn: &Connection, digest: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM attach_store WHERE digest = ?1", [digest], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Reads attachment bytes by digest.
pub fn read_attachment_data(conn: &Connection, digest: &str) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row("SELECT data FROM attach_store WHERE digest = ?1", [digest], |row| row.get(0))
        .optional()?)
}

/// Documents changed after `since`, in sequence order.
pub fn read_changes(conn: &Connection, since: Seq, limit: usize) -> Result<Vec<StoredDoc>> {
    let mut stmt = conn.prepare_cached(
        "SELECT doc_id, rev_tree, winning_rev, deleted, seq FROM doc_store
         WHERE seq > ?1 ORDER BY seq LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![since.as_raw() as i64, limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (id, tree, winner, deleted, seq) = row?;
        docs.push(stored_doc(id, &tree, &winner, deleted, seq)?);
    }
    Ok(docs)
}

/// Change rows, optionally with the winner's assembled body.
pub fn read_change_rows(conn: &Connection, since: Seq, limit: usize, bodies: bool) -> Result<Vec<ChangeRow>> {
    read_changes(conn, since, limit)?
        .into_iter()
        .map(|doc| {
            let body = if bodies {
                read_body(conn, &doc.id, &doc.winning_rev)?
                    .map(|(deleted, body)| assemble_doc(doc.id.as_str(), &doc.winning_rev, deleted, body))
            } else {
                None
            };
            Ok(ChangeRow { doc, body })
        })
        .collect()
}

/// Reads a local document.
pub fn read_local(conn: &Connection, id: &DocId) -> Result<Option<LocalDoc>> {
    let row = conn
        .query_row(
            "SELECT rev, body FROM local_store WHERE doc_id = ?1",
            [id.as_str()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    row.map(|(rev, body)| {
        Ok(LocalDoc {
            id: id.clone(),
            rev,
            body: decode_body(&body)?,
        })
    })
    .transpose()
}

/// Last committed sequence (0 for an empty database).
pub fn read_update_seq(conn: &Connection) -> Result<Seq> {
    let max: Option<i64> = conn.query_row("SELECT MAX(seq) FROM doc_store", [], |row| row.get(0))?;
    Ok(Seq::from_raw(max.unwrap_or(0).max(0) as u64))
}

/// Persisted count of visible documents.
pub fn read_doc_count(conn: &Connection) -> Result<i64> {
    Ok(read_meta(conn, "doc_count")?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

// =============================================================================
// Document Reads
// =============================================================================

/// Reads a document the way `get` returns it.
///
/// # Errors
///
/// - `MissingDoc("missing")` for an unknown id or revision
/// - `MissingDoc("deleted")` when the winner is a tombstone and no `rev` was asked for
pub fn read_doc(conn: &Connection, id: &DocId, opts: &GetOptions) -> Result<Value> {
    if id.is_local() {
        return read_local(conn, id)?.map(|doc| doc.to_json()).ok_or_else(missing);
    }

    let stored = read_stored_doc(conn, id)?.ok_or_else(missing)?;
    let rev = match &opts.rev {
        Some(rev) if opts.latest => stored.rev_tree.latest(rev).ok_or_else(missing)?,
        Some(rev) => rev.clone(),
        None if stored.deleted => return Err(Error::MissingDoc("deleted".to_string())),
        None => stored.winning_rev.clone(),
    };
    let (deleted, body) = read_body(conn, id, &rev)?.ok_or_else(missing)?;
    let mut doc = assemble_doc(id.as_str(), &rev, deleted, body);

    if opts.revs {
        if let Some(revisions) = stored.rev_tree.ancestry(&rev) {
            doc.insert("_revisions".to_string(), serde_json::to_value(revisions)?);
        }
    }
    if opts.revs_info {
        doc.insert("_revs_info".to_string(), revs_info(conn, &stored, &rev)?);
    }
    if opts.conflicts {
        let conflicts = stored.rev_tree.conflicts();
        if !conflicts.is_empty() {
            doc.insert("_conflicts".to_string(), serde_json::to_value(conflicts)?);
        }
    }
    if opts.deleted_conflicts {
        let deleted = stored.rev_tree.deleted_conflicts();
        if !deleted.is_empty() {
            doc.insert("_deleted_conflicts".to_string(), serde_json::to_value(deleted)?);
        }
    }
    if opts.local_seq {
        doc.insert("_local_seq".to_string(), Value::from(stored.seq.as_raw()));
    }
    if opts.attachments {
        inline_attachments(conn, &mut doc)?;
    }
    Ok(Value::Object(doc))
}

fn revs_info(conn: &Connection, stored: &StoredDoc, rev: &RevId) -> Result<Value> {
    let Some(history) = stored.rev_tree.ancestry(rev) else {
        return Ok(Value::Array(Vec::new()));
    };
    let mut info = Vec::with_capacity(history.ids.len());
    for (i, hash) in history.ids.iter().enumerate() {
        let ancestor = RevId::new(history.start - i as u64, hash.clone());
        let status = if stored.rev_tree.is_deleted(&ancestor) == Some(true) {
            "deleted"
        } else if read_body(conn, &stored.id, &ancestor)?.is_some() {
            "available"
        } else {
            "missing"
        };
        info.push(serde_json::json!({"rev": ancestor.to_string(), "status": status}));
    }
    Ok(Value::Array(info))
}

/// Replaces attachment stubs with inline base64 data.
fn inline_attachments(conn: &Connection, doc: &mut Map<String, Value>) -> Result<()> {
    let Some(Value::Object(atts)) = doc.get_mut("_attachments") else {
        return Ok(());
    };
    for (name, entry) in atts.iter_mut() {
        let mut att: Attachment = serde_json::from_value(entry.clone())?;
        let digest = att.digest.clone().ok_or_else(|| Error::MissingStub(name.clone()))?;
        let bytes = read_attachment_data(conn, &digest)?.ok_or_else(|| Error::MissingStub(digest))?;
        att.data = Some(AttachmentData::encode(bytes, AttachmentEncoding::Base64));
        att.stub = false;
        *entry = serde_json::to_value(att)?;
    }
    Ok(())
}

/// Reads leaves with their `_revisions`, for replication.
pub fn read_open_revs(conn: &Connection, id: &DocId, revs: &OpenRevs) -> Result<Vec<OpenRevResult>> {
    let stored = read_stored_doc(conn, id)?;
    let wanted: Vec<RevId> = match (revs, &stored) {
        (OpenRevs::All, Some(stored)) => stored.rev_tree.leaves().into_iter().map(|l| l.rev).collect(),
        (OpenRevs::All, None) => return Err(missing()),
        (OpenRevs::Revs(revs), _) => revs.clone(),
    };

    let opts = GetOptions {
        revs: true,
        attachments: true,
        ..GetOptions::default()
    };
    let mut results = Vec::with_capacity(wanted.len());
    for rev in wanted {
        let known = stored.as_ref().map(|s| s.rev_tree.contains(&rev)).unwrap_or(false);
        if !known {
            results.push(OpenRevResult::Missing(rev.to_string()));
            continue;
        }
        let opts = GetOptions {
            rev: Some(rev.clone()),
            ..opts.clone()
        };
        match read_doc(conn, id, &opts) {
            Ok(doc) => results.push(OpenRevResult::Ok(doc)),
            Err(Error::MissingDoc(_)) => results.push(OpenRevResult::Missing(rev.to_string())),
            Err(e) => return Err(e),
        }
    }
    Ok(results)
}

/// For each id, the requested revisions this database does not hold.
///
/// Ids with nothing missing are left out of the answer.
pub fn revs_diff(conn: &Connection, revs: &BTreeMap<String, Vec<RevId>>) -> Result<BTreeMap<String, RevsDiffEntry>> {
    let mut diff = BTreeMap::new();
    for (id, wanted) in revs {
        let missing = match read_stored_doc(conn, &DocId::new(id.as_str()))? {
            Some(stored) => stored.rev_tree.missing_revs(wanted),
            None => wanted.clone(),
        };
        if !missing.is_empty() {
            diff.insert(
                id.clone(),
                RevsDiffEntry {
                    missing: missing.iter().map(RevId::to_string).collect(),
                },
            );
        }
    }
    Ok(diff)
}

/// Reads one attachment of a revision (the winner by default).
pub fn read_attachment(
    conn: &Connection,
    id: &DocId,
    name: &str,
    rev: Option<&RevId>,
) -> Result<(Attachment, Vec<u8>)> {
    let opts = GetOptions {
        rev: rev.cloned(),
        ..GetOptions::default()
    };
    let doc = read_doc(conn, id, &opts)?;
    let entry = doc
        .get("_attachments")
        .and_then(|atts| atts.get(name))
        .cloned()
        .ok_or_else(missing)?;
    let att: Attachment = serde_json::from_value(entry)?;
    let digest = att.digest.clone().ok_or_else(missing)?;
    let bytes = read_attachment_data(conn, &digest)?.ok_or_else(missing)?;
    Ok((att, bytes))
}

/// Database counters.
pub fn read_info(conn: &Connection) -> Result<DbInfo> {
    Ok(DbInfo {
        doc_count: read_doc_count(conn)?.max(0) as u64,
        update_seq: read_update_seq(conn)?,
        instance_id: read_meta(conn, "instance_id")?.unwrap_or_default(),
    })
}

/// Winning bodies of every non-deleted design document.
pub fn read_design_docs(conn: &Connection) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare_cached(
        "SELECT doc_id FROM doc_store WHERE deleted = 0 AND doc_id >= ?1 AND doc_id < ?2 ORDER BY doc_id",
    )?;
    // '/' + 1 == '0': every id with the prefix sorts inside the range.
    let upper = format!("{}0", DESIGN_PREFIX.trim_end_matches('/'));
    let ids: Vec<String> = stmt
        .query_map(params![DESIGN_PREFIX, upper], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut docs = Vec::with_capacity(ids.len());
    for id in ids {
        docs.push(read_doc(conn, &DocId::new(id), &GetOptions::default())?);
    }
    Ok(docs)
}

// =============================================================================
// Request Dispatch
// =============================================================================

/// Answers one request. Returns `false` on `Shutdown`.
pub fn handle_read(conn: &Connection, request: ReadRequest) -> bool {
    match request {
        ReadRequest::Get { id, opts, response } => {
            let _ = response.send(read_doc(conn, &id, &opts));
        }
        ReadRequest::OpenRevs { id, revs, response } => {
            let _ = response.send(read_open_revs(conn, &id, &revs));
        }
        ReadRequest::Changes {
            since,
            limit,
            bodies,
            response,
        } => {
            let _ = response.send(read_change_rows(conn, since, limit, bodies));
        }
        ReadRequest::Local { id, response } => {
            let _ = response.send(read_local(conn, &id));
        }
        ReadRequest::RevsDiff { revs, response } => {
            let _ = response.send(revs_diff(conn, &revs));
        }
        ReadRequest::Attachment {
            id,
            name,
            rev,
            response,
        } => {
            let _ = response.send(read_attachment(conn, &id, &name, rev.as_ref()));
        }
        ReadRequest::Info { response } => {
            let _ = response.send(read_info(conn));
        }
        ReadRequest::DesignDocs { response } => {
            let _ = response.send(read_design_docs(conn));
        }
        ReadRequest::Shutdown => return false,
    }
    true
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Pooled reader loop.
///
/// Threads share the channel through an async mutex; whichever thread is free
/// takes the next request. Each thread owns its read-only connection.
pub async fn run_reader_pooled(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        match request {
            Some(request) => {
                if !handle_read(&conn, request) {
                    break;
                }
            }
            None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_body, encode_tree};
    use crate::rev_tree::{RevNode, RevPath, RevStatus, RevTree};
    use crate::schema::Database;
    use serde_json::json;

    fn setup() -> Connection {
        Database::open_in_memory().unwrap().into_connection()
    }

    /// Inserts a document with a linear history; every revision keeps a body.
    fn insert_linear(conn: &Connection, id: &str, hashes: &[&str], deleted_leaf: bool, seq: i64) -> RevId {
        let n = hashes.len();
        let nodes = hashes
            .iter()
            .enumerate()
            .map(|(i, h)| RevNode::new(*h, RevStatus::Available, deleted_leaf && i + 1 == n))
            .collect();
        let tree = RevTree::from_paths(vec![RevPath::linear(1, nodes).unwrap()]);
        for (i, h) in hashes.iter().enumerate() {
            let body = json!({"v": i}).as_object().cloned().unwrap();
            conn.execute(
                "INSERT INTO rev_bodies (doc_id, rev, deleted, body) VALUES (?1, ?2, ?3, ?4)",
                params![id, format!("{}-{}", i + 1, h), deleted_leaf && i + 1 == n, encode_body(&body).unwrap()],
            )
            .unwrap();
        }
        let winner = RevId::new(n as u64, hashes[n - 1]);
        conn.execute(
            "INSERT INTO doc_store (doc_id, rev_tree, winning_rev, deleted, seq) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, encode_tree(&tree).unwrap(), winner.to_string(), deleted_leaf, seq],
        )
        .unwrap();
        winner
    }

    #[test]
    fn test_read_doc_winner_and_revisions() {
        let conn = setup();
        insert_linear(&conn, "a", &["x", "y"], false, 1);
        let opts = GetOptions {
            revs: true,
            local_seq: true,
            ..GetOptions::default()
        };
        let doc = read_doc(&conn, &DocId::new("a"), &opts).unwrap();
        assert_eq!(doc["_rev"], "2-y");
        assert_eq!(doc["v"], 1);
        assert_eq!(doc["_revisions"], json!({"start": 2, "ids": ["y", "x"]}));
        assert_eq!(doc["_local_seq"], 1);
    }

    #[test]
    fn test_read_doc_missing_and_deleted() {
        let conn = setup();
        insert_linear(&conn, "gone", &["x", "y"], true, 1);
        match read_doc(&conn, &DocId::new("gone"), &GetOptions::default()) {
            Err(Error::MissingDoc(reason)) => assert_eq!(reason, "deleted"),
            other => panic!("unexpected: {other:?}"),
        }
        match read_doc(&conn, &DocId::new("nobody"), &GetOptions::default()) {
            Err(Error::MissingDoc(reason)) => assert_eq!(reason, "missing"),
            other => panic!("unexpected: {other:?}"),
        }
        // An explicit rev still reads the tombstone.
        let opts = GetOptions {
            rev: Some(RevId::new(2, "y")),
            ..GetOptions::default()
        };
        let doc = read_doc(&conn, &DocId::new("gone"), &opts).unwrap();
        assert_eq!(doc["_deleted"], true);
    }

    #[test]
    fn test_read_changes_in_seq_order() {
        let conn = setup();
        insert_linear(&conn, "b", &["x"], false, 2);
        insert_linear(&conn, "a", &["x"], false, 1);
        insert_linear(&conn, "c", &["x"], false, 3);
        let ids: Vec<String> = read_changes(&conn, Seq::from_raw(1), 10)
            .unwrap()
            .into_iter()
            .map(|d| d.id.into_string())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(read_update_seq(&conn).unwrap().as_raw(), 3);

        let rows = read_change_rows(&conn, Seq::ZERO, 1, true).unwrap();
        assert_eq!(rows[0].body.as_ref().unwrap()["_id"], "a");
    }

    #[test]
    fn test_revs_diff_and_open_revs() {
        let conn = setup();
        insert_linear(&conn, "a", &["x", "y"], false, 1);
        let mut wanted = BTreeMap::new();
        wanted.insert("a".to_string(), vec![RevId::new(2, "y"), RevId::new(3, "z")]);
        wanted.insert("b".to_string(), vec![RevId::new(1, "q")]);
        let diff = revs_diff(&conn, &wanted).unwrap();
        assert_eq!(diff["a"].missing, vec!["3-z".to_string()]);
        assert_eq!(diff["b"].missing, vec!["1-q".to_string()]);

        let open = read_open_revs(&conn, &DocId::new("a"), &OpenRevs::Revs(vec![RevId::new(2, "y"), RevId::new(9, "n")]))
            .unwrap();
        match &open[0] {
            OpenRevResult::Ok(doc) => assert_eq!(doc["_revisions"]["start"], 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(open[1], OpenRevResult::Missing("9-n".to_string()));
    }

    #[test]
    fn test_design_docs_range() {
        let conn = setup();
        insert_linear(&conn, "_design/app", &["x"], false, 1);
        insert_linear(&conn, "_design0", &["x"], false, 2);
        insert_linear(&conn, "_design/old", &["x"], true, 3);
        insert_linear(&conn, "plain", &["x"], false, 4);
        let docs = read_design_docs(&conn).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_id"], "_design/app");
    }

    #[tokio::test]
    async fn test_pooled_reader_answers_and_stops() {
        let (tx, rx) = mpsc::channel(4);
        let rx = Arc::new(Mutex::new(rx));
        let task = tokio::spawn(run_reader_pooled(setup(), rx));

        let (response, answer) = oneshot::channel();
        tx.send(ReadRequest::Info { response }).await.unwrap();
        let info = answer.await.unwrap().unwrap();
        assert_eq!(info.doc_count, 0);
        assert_eq!(info.instance_id.len(), 32);

        tx.send(ReadRequest::Shutdown).await.unwrap();
        task.await.unwrap();
    }
}
