//! # Storage Contract
//!
//! The document processor never talks to SQLite directly. It works against
//! [`DocStore`], the small keyed-store contract it needs:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `get_doc` | Latest tree and winner for an id |
//! | `get_body` | Stored body of one revision |
//! | `write_doc` / `batch_write` | Persist a merged tree, a body and new attachment bytes; advance the sequence |
//! | `changes_since` | Ordered, restartable change stream |
//! | `get_local` / `put_local` / `remove_local` | History-free local documents |
//!
//! Two implementations exist: the SQLite store used by the writer thread
//! (see [`crate::writer`]) and [`MemoryStore`], a plain in-process map that
//! makes the processor testable without a database.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::error::Result;
use crate::rev_tree::RevTree;
use crate::types::{DocId, RevId, Seq};

// =============================================================================
// Stored Shapes
// =============================================================================

/// The latest known state of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDoc {
    /// Document id.
    pub id: DocId,
    /// Every known revision.
    pub rev_tree: RevTree,
    /// Current winner.
    pub winning_rev: RevId,
    /// True if the winner is a tombstone.
    pub deleted: bool,
    /// Sequence of the last write to this document.
    pub seq: Seq,
}

/// One accepted document write, ready to persist atomically.
#[derive(Debug, Clone)]
pub struct DocWrite {
    /// Document id.
    pub id: DocId,
    /// Merged (and stemmed) tree.
    pub rev_tree: RevTree,
    /// Winner of the merged tree.
    pub winning_rev: RevId,
    /// True if the winner is a tombstone.
    pub winning_deleted: bool,
    /// +1 if the document became visible, -1 if it became hidden, else 0.
    pub doc_count_delta: i64,
    /// Revision whose body is being stored.
    pub rev: RevId,
    /// Tombstone flag of `rev`.
    pub rev_deleted: bool,
    /// Body of `rev` (attachments reduced to stubs).
    pub body: Map<String, Value>,
    /// New attachment bytes keyed by digest.
    pub attachments: Vec<(String, Vec<u8>)>,
    /// Revisions stemmed away; their bodies can be dropped.
    pub stemmed_revs: Vec<RevId>,
}

/// A local document: one version, no tree, never replicated.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDoc {
    /// Full id including the `_local/` prefix.
    pub id: DocId,
    /// `0-N` revision.
    pub rev: String,
    /// Body without `_id` / `_rev`.
    pub body: Map<String, Value>,
}

impl LocalDoc {
    /// The document as returned to callers.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::with_capacity(self.body.len() + 2);
        doc.insert("_id".to_string(), Value::String(self.id.to_string()));
        doc.insert("_rev".to_string(), Value::String(self.rev.clone()));
        doc.extend(self.body.clone());
        Value::Object(doc)
    }
}

// =============================================================================
// Store Contract
// =============================================================================

/// The keyed store the document processor writes through.
pub trait DocStore {
    /// Latest state of `id`, or `None` if never written.
    fn get_doc(&self, id: &DocId) -> Result<Option<StoredDoc>>;

    /// Body of one revision, with its tombstone flag.
    fn get_body(&self, id: &DocId, rev: &RevId) -> Result<Option<(bool, Map<String, Value>)>>;

    /// True if attachment bytes with `digest` are stored.
    fn has_attachment(&self, digest: &str) -> Result<bool>;

    /// Persists one accepted write, returning its sequence.
    fn write_doc(&mut self, write: DocWrite) -> Result<Seq>;

    /// Persists several writes in order.
    fn batch_write(&mut self, writes: Vec<DocWrite>) -> Result<Vec<Seq>> {
        writes.into_iter().map(|w| self.write_doc(w)).collect()
    }

    /// Documents changed after `since`, ordered by sequence.
    fn changes_since(&self, since: Seq, limit: usize) -> Result<Vec<StoredDoc>>;

    /// Reads a local document.
    fn get_local(&self, id: &DocId) -> Result<Option<LocalDoc>>;

    /// Inserts or replaces a local document.
    fn put_local(&mut self, doc: LocalDoc) -> Result<()>;

    /// Deletes a local document.
    fn remove_local(&mut self, id: &DocId) -> Result<()>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// A [`DocStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: BTreeMap<DocId, StoredDoc>,
    bodies: HashMap<(DocId, RevId), (bool, Map<String, Value>)>,
    attachments: HashMap<String, Vec<u8>>,
    locals: BTreeMap<DocId, LocalDoc>,
    update_seq: Seq,
    doc_count: i64,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents whose winner is not deleted.
    pub fn doc_count(&self) -> i64 {
        self.doc_count
    }

    /// Sequence of the last write.
    pub fn update_seq(&self) -> Seq {
        self.update_seq
    }

    /// Stored attachment bytes.
    pub fn attachment(&self, digest: &str) -> Option<&[u8]> {
        self.attachments.get(digest).map(Vec::as_slice)
    }
}

impl DocStore for MemoryStore {
    fn get_doc(&self, id: &DocId) -> Result<Option<StoredDoc>> {
        Ok(self.docs.get(id).cloned())
    }

    fn get_body(&self, id: &DocId, rev: &RevId) -> Result<Option<(bool, Map<String, Value>)>> {
        Ok(self.bodies.get(&(id.clone(), rev.clone())).cloned())
    }

    fn has_attachment(&self, digest: &str) -> Result<bool> {
        Ok(self.attachments.contains_key(digest))
    }

    fn write_doc(&mut self, write: DocWrite) -> Result<Seq> {
        let seq = self.update_seq.next();
        for (digest, bytes) in write.attachments {
            self.attachments.entry(digest).or_insert(bytes);
        }
        for rev in &write.stemmed_revs {
            self.bodies.remove(&(write.id.clone(), rev.clone()));
        }
        self.bodies
            .insert((write.id.clone(), write.rev), (write.rev_deleted, write.body));
        self.docs.insert(
            write.id.clone(),
            StoredDoc {
                id: write.id,
                rev_tree: write.rev_tree,
                winning_rev: write.winning_rev,
                deleted: write.winning_deleted,
                seq,
            },
        );
        self.doc_count += write.doc_count_delta;
        self.update_seq = seq;
        Ok(seq)
    }

    fn changes_since(&self, since: Seq, limit: usize) -> Result<Vec<StoredDoc>> {
        let mut changed: Vec<StoredDoc> = self
            .docs
            .values()
            .filter(|d| d.seq > since)
            .cloned()
            .collect();
        changed.sort_by_key(|d| d.seq);
        changed.truncate(limit);
        Ok(changed)
    }

    fn get_local(&self, id: &DocId) -> Result<Option<LocalDoc>> {
        Ok(self.locals.get(id).cloned())
    }

    fn put_local(&mut self, doc: LocalDoc) -> Result<()> {
        self.locals.insert(doc.id.clone(), doc);
        Ok(())
    }

    fn remove_local(&mut self, id: &DocId) -> Result<()> {
        self.locals.remove(id);
        Ok(())
    }
}
