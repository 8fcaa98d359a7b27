//! # Document Processor
//!
//! Applies a batch of parsed writes to a [`DocStore`], one slot per input, in
//! input order.
//!
//! ## Per-Document Flow
//!
//! ```text
//!            ┌──────────────┐  no   ┌──────────────────────────────┐
//!  write ───►│ id in store? │──────►│ insert: was_delete? forged   │──► write
//!            └──────┬───────┘       │ ancestor? else delta +1 / 0  │
//!                   │ yes           └──────────────────────────────┘
//!                   ▼
//!   known rev + replicated? ──► ok, nothing written
//!                   │
//!                   ▼
//!   resurrect? (deleted winner, new edit, generation 1) ──► re-root on winner
//!                   │
//!                   ▼
//!   merge ──► conflict rule (new edits only) ──► winner, delta ──► write
//! ```
//!
//! ## Conflict Rule
//!
//! A new edit is rejected with [`Error::RevConflict`] when
//!
//! ```text
//! (prev_deleted == deleted  && merge != NewLeaf)
//! (!prev_deleted            && merge != NewLeaf)
//! (!prev_deleted && deleted && merge == NewBranch)
//! ```
//!
//! so the only edit allowed off a leaf is one reviving a deleted document: it
//! may fork from any ancestor of the tombstone.
//!
//! Replicated edits (`new_edits = false`) are never rejected for conflict;
//! they become additional leaves and the deterministic winner decides.
//!
//! ## Local Documents
//!
//! `_local/` ids skip the revision tree. The stored body is simply replaced
//! (no history, no sequence, never replicated), but each write bumps a `0-N`
//! counter and an update must name the current value. Checkpoint writes rely
//! on that check to notice a concurrent writer and retry.
//!
//! ## Ordering
//!
//! Inputs are grouped by id and each group is applied strictly in order, so the
//! second write to an id in a batch sees the tree left by the first. Different
//! groups touch disjoint trees. The caller (the single writer thread) is the
//! only mutator of the store, which is what makes this safe.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::attachments::{md5_digest, AttachmentMap};
use crate::codec::check_body_nesting;
use crate::document::{parse_document, ParseOptions, ParsedDoc};
use crate::error::{Error, Result};
use crate::rev_tree::{MergeConflict, RevPath, RevStatus, RevTree};
use crate::store::{DocStore, DocWrite, LocalDoc, StoredDoc};
use crate::types::{DocId, DocWriteResult, RevId, LOCAL_PREFIX};

// =============================================================================
// Options and Inputs
// =============================================================================

/// Options for one batch.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// `true` for client edits, `false` for replicated revisions.
    pub new_edits: bool,
    /// The batch is a delete issued through `remove`: deleting an unknown id fails.
    pub was_delete: bool,
    /// Stemming depth.
    pub rev_limit: usize,
    /// Revision id generation (used again when resurrecting).
    pub parse: ParseOptions,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            new_edits: true,
            was_delete: false,
            rev_limit: 1000,
            parse: ParseOptions::default(),
        }
    }
}

/// One prepared input of a batch.
#[derive(Debug, Clone)]
pub enum BatchDoc {
    /// A document with a revision tree.
    Revisioned(ParsedDoc),
    /// A `_local/` document, written as-is.
    Local(Map<String, Value>),
}

impl BatchDoc {
    fn id(&self) -> Option<&str> {
        match self {
            BatchDoc::Revisioned(doc) => Some(doc.id.as_str()),
            BatchDoc::Local(doc) => doc.get("_id").and_then(Value::as_str),
        }
    }
}

/// Parses raw inputs. Local documents skip revision parsing entirely.
pub fn prepare_batch(docs: Vec<Value>, new_edits: bool, opts: ParseOptions) -> Vec<Result<BatchDoc>> {
    docs.into_iter()
        .map(|raw| {
            let is_local = raw
                .get("_id")
                .and_then(Value::as_str)
                .map(|id| id.starts_with(LOCAL_PREFIX))
                .unwrap_or(false);
            match raw {
                Value::Object(map) if is_local => {
                    check_body_nesting(&map)?;
                    Ok(BatchDoc::Local(map))
                }
                raw => parse_document(raw, new_edits, opts).map(BatchDoc::Revisioned),
            }
        })
        .collect()
}

fn is_fatal(err: &Error) -> bool {
    matches!(err, Error::Sqlite(_) | Error::Schema(_))
}

// =============================================================================
// Batch Processing
// =============================================================================

/// Applies a prepared batch.
///
/// The outer `Result` fails only on storage errors, in which case the caller
/// must discard everything written so far. Per-document failures are reported
/// in their slot.
pub fn process_batch<S: DocStore>(
    store: &mut S,
    docs: Vec<Result<BatchDoc>>,
    opts: &WriteOptions,
) -> Result<Vec<Result<DocWriteResult>>> {
    let mut results: Vec<Option<Result<DocWriteResult>>> = Vec::with_capacity(docs.len());
    let mut groups: Vec<Vec<(usize, BatchDoc)>> = Vec::new();
    let mut group_of: HashMap<String, usize> = HashMap::new();

    for (idx, doc) in docs.into_iter().enumerate() {
        match doc {
            Err(err) => results.push(Some(Err(err))),
            Ok(doc) => {
                results.push(None);
                let key = doc.id().unwrap_or_default().to_string();
                let group = *group_of.entry(key).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[group].push((idx, doc));
            }
        }
    }

    for group in groups {
        for (idx, doc) in group {
            let outcome = match doc {
                BatchDoc::Local(doc) => write_local(store, doc),
                BatchDoc::Revisioned(doc) => write_revisioned(store, doc, opts),
            };
            match outcome {
                Err(err) if is_fatal(&err) => return Err(err),
                outcome => results[idx] = Some(outcome),
            }
        }
    }

    Ok(results
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(Error::Schema("unprocessed batch slot".to_string()))))
        .collect())
}

fn write_revisioned<S: DocStore>(store: &mut S, doc: ParsedDoc, opts: &WriteOptions) -> Result<DocWriteResult> {
    match store.get_doc(&doc.id)? {
        None => insert_doc(store, doc, opts),
        Some(prev) => update_doc(store, prev, doc, opts),
    }
}

// =============================================================================
// Insert / Update
// =============================================================================

/// First write of an id.
fn insert_doc<S: DocStore>(store: &mut S, doc: ParsedDoc, opts: &WriteOptions) -> Result<DocWriteResult> {
    let merged = RevTree::new().merge(first_path(&doc.rev_tree)?, opts.rev_limit);
    let deleted = merged.tree.winning_is_deleted();

    if opts.was_delete && deleted {
        return Err(Error::MissingDoc("deleted".to_string()));
    }

    // A new edit naming a parent this store never saw cannot be trusted.
    let root_missing = doc
        .rev_tree
        .paths()
        .first()
        .map(|p| p.root.status == RevStatus::Missing)
        .unwrap_or(false);
    if opts.new_edits && root_missing {
        return Err(Error::RevConflict(doc.id.to_string()));
    }

    let delta = if deleted { 0 } else { 1 };
    write_accepted(store, doc, merged.tree, merged.stemmed_revs, delta, AttachmentMap::new())
}

/// Subsequent write of an existing id.
fn update_doc<S: DocStore>(
    store: &mut S,
    prev: StoredDoc,
    mut doc: ParsedDoc,
    opts: &WriteOptions,
) -> Result<DocWriteResult> {
    if !opts.new_edits && prev.rev_tree.contains(&doc.rev) {
        debug!(id = %doc.id, rev = %doc.rev, "replicated revision already known");
        return Ok(DocWriteResult {
            id: doc.id.into_string(),
            rev: doc.rev.to_string(),
        });
    }

    let prev_deleted = prev.deleted;
    let deleted = doc.deleted;

    if prev_deleted && !deleted && opts.new_edits && doc.rev.generation == 1 {
        doc = reroot_on(doc, &prev.winning_rev, opts.parse)?;
    }

    let merged = prev.rev_tree.merge(first_path(&doc.rev_tree)?, opts.rev_limit);
    let conflicts = merged.conflicts;

    let in_conflict = opts.new_edits
        && ((prev_deleted == deleted && conflicts != MergeConflict::NewLeaf)
            || (!prev_deleted && conflicts != MergeConflict::NewLeaf)
            || (!prev_deleted && deleted && conflicts == MergeConflict::NewBranch));
    if in_conflict {
        return Err(Error::RevConflict(doc.id.to_string()));
    }

    let winning_deleted = merged.tree.winning_is_deleted();
    let delta = match (prev_deleted, winning_deleted) {
        (a, b) if a == b => 0,
        (false, true) => -1,
        _ => 1,
    };

    let prev_attachments = previous_attachments(store, &prev)?;
    write_accepted(store, doc, merged.tree, merged.stemmed_revs, delta, prev_attachments)
}

fn first_path(tree: &RevTree) -> Result<RevPath> {
    tree.paths()
        .first()
        .cloned()
        .ok_or_else(|| Error::InvalidRev("document has no revision".to_string()))
}

/// Rebuilds a generation-1 edit as a child of `winner` (reviving a tombstone).
fn reroot_on(doc: ParsedDoc, winner: &RevId, parse: ParseOptions) -> Result<ParsedDoc> {
    let mut raw = doc.data.clone();
    if let Some(atts) = &doc.attachments {
        raw.insert("_attachments".to_string(), serde_json::to_value(atts)?);
    }
    raw.insert("_id".to_string(), Value::String(doc.id.to_string()));
    raw.insert("_rev".to_string(), Value::String(winner.to_string()));
    let mut reparsed = parse_document(Value::Object(raw), true, parse)?;
    reparsed.attachments = doc.attachments;
    Ok(reparsed)
}

fn previous_attachments<S: DocStore>(store: &S, prev: &StoredDoc) -> Result<AttachmentMap> {
    let Some((_, body)) = store.get_body(&prev.id, &prev.winning_rev)? else {
        return Ok(AttachmentMap::new());
    };
    match body.get("_attachments") {
        Some(atts) => Ok(serde_json::from_value(atts.clone()).unwrap_or_default()),
        None => Ok(AttachmentMap::new()),
    }
}

/// Resolves attachments to stubs and persists the accepted write.
fn write_accepted<S: DocStore>(
    store: &mut S,
    doc: ParsedDoc,
    rev_tree: RevTree,
    stemmed_revs: Vec<RevId>,
    doc_count_delta: i64,
    prev_attachments: AttachmentMap,
) -> Result<DocWriteResult> {
    let winner = rev_tree
        .winning_leaf()
        .ok_or_else(|| Error::Schema("merged tree has no leaves".to_string()))?;
    let rev_deleted = rev_tree.is_deleted(&doc.rev).unwrap_or(doc.deleted);

    let mut body = doc.data;
    let mut new_bytes = Vec::new();
    if let Some(attachments) = doc.attachments {
        let mut stubs = AttachmentMap::new();
        for (name, att) in attachments {
            if att.stub {
                let mut stub = att;
                if stub.digest.is_none() {
                    if let Some(previous) = prev_attachments.get(&name) {
                        stub.digest = previous.digest.clone();
                        stub.length = stub.length.or(previous.length);
                        stub.revpos = stub.revpos.or(previous.revpos);
                        stub.content_type = stub.content_type.or_else(|| previous.content_type.clone());
                    }
                }
                let digest = stub.digest.clone().ok_or_else(|| Error::MissingStub(name.clone()))?;
                if !store.has_attachment(&digest)? {
                    return Err(Error::MissingStub(digest));
                }
                stubs.insert(name, stub);
            } else {
                let bytes = att
                    .data
                    .as_ref()
                    .ok_or_else(|| Error::BadArg(format!("attachment '{name}' has no data")))?
                    .to_bytes()?;
                let mut att = att;
                if att.digest.is_none() {
                    att.digest = Some(md5_digest(&bytes));
                    att.length = Some(bytes.len() as u64);
                }
                let stub = att.to_stub(doc.rev.generation);
                if let Some(digest) = &stub.digest {
                    new_bytes.push((digest.clone(), bytes));
                }
                stubs.insert(name, stub);
            }
        }
        body.insert("_attachments".to_string(), serde_json::to_value(&stubs)?);
    }

    let result = DocWriteResult {
        id: doc.id.to_string(),
        rev: doc.rev.to_string(),
    };
    let seq = store.write_doc(DocWrite {
        id: doc.id,
        rev_tree,
        winning_rev: winner.rev,
        winning_deleted: winner.deleted,
        doc_count_delta,
        rev: doc.rev,
        rev_deleted,
        body,
        attachments: new_bytes,
        stemmed_revs,
    })?;
    debug!(id = %result.id, rev = %result.rev, %seq, "document written");
    Ok(result)
}

// =============================================================================
// Local Documents
// =============================================================================

fn local_rev_number(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

/// Routes a `_local/` input to put or remove.
fn write_local<S: DocStore>(store: &mut S, mut doc: Map<String, Value>) -> Result<DocWriteResult> {
    let id = doc
        .remove("_id")
        .and_then(|v| v.as_str().map(DocId::from))
        .ok_or(Error::MissingId)?;
    let rev = doc.remove("_rev").and_then(|v| v.as_str().map(str::to_string));
    let deleted = matches!(doc.remove("_deleted"), Some(Value::Bool(true)));
    if deleted {
        remove_local_doc(store, &id, rev.as_deref())
    } else {
        put_local_doc(store, id, rev.as_deref(), doc)
    }
}

/// Writes a local document, checking `expected_rev` against the stored one.
///
/// Creating requires no `_rev`; updating requires the current one.
pub fn put_local_doc<S: DocStore>(
    store: &mut S,
    id: DocId,
    expected_rev: Option<&str>,
    body: Map<String, Value>,
) -> Result<DocWriteResult> {
    let existing = store.get_local(&id)?;
    let matches = match (expected_rev, &existing) {
        (None, None) => true,
        (Some(expected), Some(current)) => expected == current.rev,
        _ => false,
    };
    if !matches {
        return Err(Error::RevConflict(id.to_string()));
    }
    let next = existing.map(|d| local_rev_number(&d.rev)).unwrap_or(0) + 1;
    let rev = format!("0-{next}");
    store.put_local(LocalDoc {
        id: id.clone(),
        rev: rev.clone(),
        body,
    })?;
    Ok(DocWriteResult {
        id: id.into_string(),
        rev,
    })
}

/// Deletes a local document. Returns rev `0-0`.
pub fn remove_local_doc<S: DocStore>(store: &mut S, id: &DocId, rev: Option<&str>) -> Result<DocWriteResult> {
    let existing = store
        .get_local(id)?
        .ok_or_else(|| Error::MissingDoc("missing".to_string()))?;
    if rev != Some(existing.rev.as_str()) {
        return Err(Error::RevConflict(id.to_string()));
    }
    store.remove_local(id)?;
    Ok(DocWriteResult {
        id: id.to_string(),
        rev: "0-0".to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn write(store: &mut MemoryStore, docs: Vec<Value>, opts: WriteOptions) -> Vec<Result<DocWriteResult>> {
        let prepared = prepare_batch(docs, opts.new_edits, opts.parse);
        process_batch(store, prepared, &opts).unwrap()
    }

    fn put(store: &mut MemoryStore, doc: Value) -> Result<DocWriteResult> {
        write(store, vec![doc], WriteOptions::default()).remove(0)
    }

    fn replicate(store: &mut MemoryStore, doc: Value) -> Result<DocWriteResult> {
        let opts = WriteOptions { new_edits: false, ..WriteOptions::default() };
        write(store, vec![doc], opts).remove(0)
    }

    fn tree(store: &MemoryStore, id: &str) -> RevTree {
        store.get_doc(&DocId::new(id)).unwrap().unwrap().rev_tree
    }

    #[test]
    fn test_insert_then_update() {
        let mut store = MemoryStore::new();
        let first = put(&mut store, json!({"_id": "a", "v": 1})).unwrap();
        assert!(first.rev.starts_with("1-"));
        assert_eq!(store.doc_count(), 1);

        let second = put(&mut store, json!({"_id": "a", "_rev": first.rev, "v": 2})).unwrap();
        assert!(second.rev.starts_with("2-"));
        assert_eq!(store.doc_count(), 1);
        assert_eq!(store.update_seq().as_raw(), 2);
    }

    #[test]
    fn test_stale_update_conflicts() {
        let mut store = MemoryStore::new();
        let first = put(&mut store, json!({"_id": "a", "v": 1})).unwrap();
        put(&mut store, json!({"_id": "a", "_rev": first.rev.clone(), "v": 2})).unwrap();
        let err = put(&mut store, json!({"_id": "a", "_rev": first.rev, "v": 3})).unwrap_err();
        assert!(matches!(err, Error::RevConflict(_)));
    }

    #[test]
    fn test_update_without_rev_conflicts() {
        let mut store = MemoryStore::new();
        put(&mut store, json!({"_id": "a", "v": 1})).unwrap();
        let err = put(&mut store, json!({"_id": "a", "v": 2})).unwrap_err();
        assert!(matches!(err, Error::RevConflict(_)));
    }

    #[test]
    fn test_new_edit_fork_conflicts_but_replicated_fork_is_accepted() {
        let mut store = MemoryStore::new();
        replicate(&mut store, json!({"_id": "d", "_rev": "2-b", "_revisions": {"start": 2, "ids": ["b", "a"]}}))
            .unwrap();

        let err = put(&mut store, json!({"_id": "d", "_rev": "1-a", "x": 1})).unwrap_err();
        assert!(matches!(err, Error::RevConflict(_)));

        replicate(&mut store, json!({"_id": "d", "_rev": "2-c", "_revisions": {"start": 2, "ids": ["c", "a"]}}))
            .unwrap();
        let leaves: Vec<String> = tree(&store, "d").leaves().iter().map(|l| l.rev.to_string()).collect();
        assert_eq!(leaves.len(), 2);
        assert!(leaves.contains(&"2-b".to_string()));
        assert!(leaves.contains(&"2-c".to_string()));
        let stored = store.get_doc(&DocId::new("d")).unwrap().unwrap();
        assert_eq!(stored.winning_rev.to_string(), "2-c");
        assert_eq!(store.doc_count(), 1);
    }

    #[test]
    fn test_replicated_known_revision_is_a_noop() {
        let mut store = MemoryStore::new();
        let doc = json!({"_id": "a", "_rev": "1-x"});
        replicate(&mut store, doc.clone()).unwrap();
        let seq = store.update_seq();
        let again = replicate(&mut store, doc).unwrap();
        assert_eq!(again.rev, "1-x");
        assert_eq!(store.update_seq(), seq);
    }

    #[test]
    fn test_first_write_with_unknown_parent_conflicts() {
        let mut store = MemoryStore::new();
        let err = put(&mut store, json!({"_id": "a", "_rev": "3-zzz"})).unwrap_err();
        assert!(matches!(err, Error::RevConflict(_)));
    }

    #[test]
    fn test_was_delete_of_unknown_doc() {
        let mut store = MemoryStore::new();
        let opts = WriteOptions { was_delete: true, ..WriteOptions::default() };
        let result = write(&mut store, vec![json!({"_id": "ghost", "_deleted": true})], opts).remove(0);
        match result {
            Err(Error::MissingDoc(reason)) => assert_eq!(reason, "deleted"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_delete_and_resurrect() {
        let mut store = MemoryStore::new();
        let first = put(&mut store, json!({"_id": "a", "v": 1})).unwrap();
        let deleted = put(&mut store, json!({"_id": "a", "_rev": first.rev, "_deleted": true})).unwrap();
        assert!(deleted.rev.starts_with("2-"));
        assert_eq!(store.doc_count(), 0);
        assert!(store.get_doc(&DocId::new("a")).unwrap().unwrap().deleted);

        // No _rev on a deleted document: the edit is grafted onto the tombstone.
        let revived = put(&mut store, json!({"_id": "a", "v": 2})).unwrap();
        assert!(revived.rev.starts_with("3-"), "got {}", revived.rev);
        assert_eq!(store.doc_count(), 1);
        assert_eq!(tree(&store, "a").leaves().len(), 1);
    }

    #[test]
    fn test_revive_may_fork_below_the_tombstone() {
        let mut store = MemoryStore::new();
        let first = put(&mut store, json!({"_id": "a", "v": 1})).unwrap();
        let tombstone = put(&mut store, json!({"_id": "a", "_rev": first.rev.clone(), "_deleted": true})).unwrap();

        // 1-a -> 2-b (deleted); a live edit of 1-a forks a second leaf.
        let revived = put(&mut store, json!({"_id": "a", "_rev": first.rev.clone(), "v": 2})).unwrap();
        assert!(revived.rev.starts_with("2-"));
        assert_ne!(revived.rev, tombstone.rev);

        let stored = store.get_doc(&DocId::new("a")).unwrap().unwrap();
        assert!(!stored.deleted);
        assert_eq!(stored.winning_rev.to_string(), revived.rev);
        assert_eq!(stored.rev_tree.deleted_conflicts().len(), 1);
        assert_eq!(store.doc_count(), 1);

        // A live document still rejects the same fork.
        let err = put(&mut store, json!({"_id": "a", "_rev": first.rev, "v": 3})).unwrap_err();
        assert!(matches!(err, Error::RevConflict(_)));
    }

    #[test]
    fn test_deleting_twice_conflicts() {
        let mut store = MemoryStore::new();
        let first = put(&mut store, json!({"_id": "a"})).unwrap();
        put(&mut store, json!({"_id": "a", "_rev": first.rev.clone(), "_deleted": true})).unwrap();
        let err = put(&mut store, json!({"_id": "a", "_rev": first.rev, "_deleted": true})).unwrap_err();
        assert!(matches!(err, Error::RevConflict(_)));
    }

    #[test]
    fn test_same_id_in_one_batch_is_sequential() {
        let mut store = MemoryStore::new();
        let results = write(
            &mut store,
            vec![json!({"_id": "a", "v": 1}), json!({"_id": "b"}), json!({"_id": "a", "v": 2})],
            WriteOptions::default(),
        );
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(Error::RevConflict(_))));
        assert_eq!(store.doc_count(), 2);
    }

    #[test]
    fn test_parse_errors_keep_their_slot() {
        let mut store = MemoryStore::new();
        let results = write(
            &mut store,
            vec![json!({"_id": "a"}), json!({"_id": "b", "_bogus": 1}), json!({"_id": "c"})],
            WriteOptions::default(),
        );
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::DocValidation(_))));
        assert_eq!(results[2].as_ref().unwrap().id, "c");
    }

    #[test]
    fn test_stemming_drops_old_bodies() {
        let mut store = MemoryStore::new();
        let opts = WriteOptions { rev_limit: 2, ..WriteOptions::default() };
        let mut rev: Option<String> = None;
        let mut revs = Vec::new();
        for v in 0..4 {
            let mut doc = json!({"_id": "a", "v": v});
            if let Some(r) = &rev {
                doc["_rev"] = json!(r);
            }
            let res = write(&mut store, vec![doc], opts).remove(0).unwrap();
            revs.push(RevId::parse(&res.rev).unwrap());
            rev = Some(res.rev);
        }
        let t = tree(&store, "a");
        assert_eq!(t.paths()[0].pos, 3);
        assert_eq!(t.winning_rev().as_ref(), revs.last());
        assert!(store.get_body(&DocId::new("a"), &revs[0]).unwrap().is_none());
        assert!(store.get_body(&DocId::new("a"), &revs[3]).unwrap().is_some());
    }

    #[test]
    fn test_attachments_become_stubs() {
        let mut store = MemoryStore::new();
        let res = put(
            &mut store,
            json!({"_id": "a", "_attachments": {"f.txt": {"content_type": "text/plain", "data": "aGVsbG8="}}}),
        )
        .unwrap();
        let rev = RevId::parse(&res.rev).unwrap();
        let (_, body) = store.get_body(&DocId::new("a"), &rev).unwrap().unwrap();
        let stub = &body["_attachments"]["f.txt"];
        assert_eq!(stub["stub"], json!(true));
        assert_eq!(stub["revpos"], json!(1));
        assert_eq!(stub["length"], json!(5));
        let digest = stub["digest"].as_str().unwrap();
        assert_eq!(store.attachment(digest), Some(&b"hello"[..]));

        // A bare stub on the next revision resolves through the previous body.
        let next = put(
            &mut store,
            json!({"_id": "a", "_rev": res.rev, "_attachments": {"f.txt": {"stub": true}}}),
        )
        .unwrap();
        let rev = RevId::parse(&next.rev).unwrap();
        let (_, body) = store.get_body(&DocId::new("a"), &rev).unwrap().unwrap();
        assert_eq!(body["_attachments"]["f.txt"]["digest"].as_str(), Some(digest));
        assert_eq!(body["_attachments"]["f.txt"]["revpos"], json!(1));
    }

    #[test]
    fn test_unknown_stub_is_rejected() {
        let mut store = MemoryStore::new();
        let err = put(
            &mut store,
            json!({"_id": "a", "_attachments": {"f": {"stub": true, "digest": "md5-nothere"}}}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingStub(_)));
    }

    #[test]
    fn test_local_documents() {
        let mut store = MemoryStore::new();
        let created = put(&mut store, json!({"_id": "_local/cp", "last_seq": 1})).unwrap();
        assert_eq!(created.rev, "0-1");
        assert!(store.get_doc(&DocId::new("_local/cp")).unwrap().is_none());

        let err = put(&mut store, json!({"_id": "_local/cp", "last_seq": 2})).unwrap_err();
        assert!(matches!(err, Error::RevConflict(_)));

        let updated = put(&mut store, json!({"_id": "_local/cp", "_rev": "0-1", "last_seq": 2})).unwrap();
        assert_eq!(updated.rev, "0-2");
        let local = store.get_local(&DocId::new("_local/cp")).unwrap().unwrap();
        assert_eq!(local.body["last_seq"], json!(2));

        let removed = put(&mut store, json!({"_id": "_local/cp", "_rev": "0-2", "_deleted": true})).unwrap();
        assert_eq!(removed.rev, "0-0");
        let missing = put(&mut store, json!({"_id": "_local/cp", "_rev": "0-2", "_deleted": true})).unwrap_err();
        assert!(matches!(missing, Error::MissingDoc(_)));
        assert_eq!(store.update_seq().as_raw(), 0);
    }
}
