//! # Document Parsing
//!
//! Turns a raw JSON write into a [`ParsedDoc`]: validated id, the revision
//! being written, a one-branch [`RevTree`] describing where that revision sits,
//! and the body split from its reserved metadata.
//!
//! ## New Edits vs Replicated Edits
//!
//! ```text
//! new edit  {_id, _rev: "2-b", ...}       replicated {_id, _revisions: {start: 3, ids: [c, b, a]}}
//!
//!   2-b (missing) ──► 3-<new>               1-a (missing) ──► 2-b (missing) ──► 3-c
//! ```
//!
//! A new edit derives its own revision id: the md5 of the document's canonical
//! JSON when `deterministic_revs` is on, a random uuid otherwise. A replicated
//! edit is trusted to carry its own id and history.
//!
//! ## Reserved Members
//!
//! Members starting with `_` must be known. Most become metadata; `_attachments`,
//! `_access` and the `_replication_*` family stay with the body.

use md5::{Digest, Md5};
use serde_json::{Map, Value};

use crate::attachments::AttachmentMap;
use crate::codec::{check_nesting, MAX_NESTING_DEPTH};
use crate::error::{Error, Result};
use crate::rev_tree::{RevNode, RevPath, RevStatus, RevTree, Revisions};
use crate::types::{DocId, RevId, DESIGN_PREFIX, LOCAL_PREFIX};

/// Members allowed to start with `_`.
pub const RESERVED_WORDS: &[&str] = &[
    "_id",
    "_rev",
    "_access",
    "_attachments",
    "_deleted",
    "_revisions",
    "_revs_info",
    "_conflicts",
    "_deleted_conflicts",
    "_local_seq",
    "_rev_tree",
    "_replication_id",
    "_replication_state",
    "_replication_state_time",
    "_replication_state_reason",
    "_replication_stats",
    "_removed",
];

/// Reserved members kept with the body rather than the metadata.
pub const DATA_WORDS: &[&str] = &[
    "_access",
    "_attachments",
    "_replication_id",
    "_replication_state",
    "_replication_state_time",
    "_replication_state_reason",
    "_replication_stats",
];

/// Options affecting revision id generation.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Derive revision hashes from content instead of at random.
    pub deterministic_revs: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            deterministic_revs: true,
        }
    }
}

/// A validated, normalized document write.
#[derive(Debug, Clone)]
pub struct ParsedDoc {
    /// Document id (generated for new edits without one).
    pub id: DocId,
    /// Revision this write introduces.
    pub rev: RevId,
    /// Single-branch tree placing `rev` after its known ancestors.
    pub rev_tree: RevTree,
    /// Tombstone flag.
    pub deleted: bool,
    /// User members (without `_attachments`).
    pub data: Map<String, Value>,
    /// Parsed `_attachments`, if any.
    pub attachments: Option<AttachmentMap>,
    /// Other reserved members, keyed without their leading underscore.
    pub metadata: Map<String, Value>,
}

impl ParsedDoc {
    /// The `_rev` the caller supplied on a new edit, if any.
    pub fn prev_rev(&self) -> Option<RevId> {
        let path = self.rev_tree.paths().first()?;
        if path.root.hash == self.rev.hash && path.pos == self.rev.generation {
            return None;
        }
        Some(RevId::new(path.pos, path.root.hash.clone()))
    }
}

// =============================================================================
// Id Validation
// =============================================================================

/// Rejects missing ids and `_`-prefixed ids other than design/local docs.
pub fn validate_id(id: Option<&str>) -> Result<DocId> {
    let id = match id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(Error::MissingId),
    };
    if id.starts_with('_') && !id.starts_with(DESIGN_PREFIX) && !id.starts_with(LOCAL_PREFIX) {
        return Err(Error::ReservedId(id.to_string()));
    }
    Ok(DocId::new(id))
}

// =============================================================================
// Revision Ids
// =============================================================================

/// Computes the revision hash for a new edit.
///
/// Deterministic hashes are the md5 hex of the document's JSON with sorted
/// keys (`serde_json::Map` is ordered), excluding `_rev_tree`.
pub fn new_rev_hash(doc: &Map<String, Value>, deterministic: bool) -> Result<String> {
    if !deterministic {
        return Ok(uuid::Uuid::new_v4().simple().to_string());
    }
    let mut canonical = doc.clone();
    canonical.remove("_rev_tree");
    let json = serde_json::to_string(&canonical)?;
    let mut hasher = Md5::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Builds the single branch described by `_revisions` (newest first).
pub fn tree_from_revisions(revisions: &Revisions, deleted: bool) -> Result<RevTree> {
    let count = revisions.ids.len() as u64;
    if count == 0 || revisions.start < count {
        return Err(Error::InvalidRev(format!(
            "_revisions start {} with {} ids",
            revisions.start, count
        )));
    }
    let pos = revisions.start - count + 1;
    let nodes = revisions
        .ids
        .iter()
        .rev()
        .enumerate()
        .map(|(i, hash)| {
            if i as u64 + 1 == count {
                RevNode::new(hash.clone(), RevStatus::Available, deleted)
            } else {
                RevNode::new(hash.clone(), RevStatus::Missing, false)
            }
        })
        .collect();
    let path = RevPath::linear(pos, nodes)
        .ok_or_else(|| Error::InvalidRev("empty _revisions".to_string()))?;
    Ok(RevTree::from_paths(vec![path]))
}

fn rev_member(doc: &Map<String, Value>) -> Result<Option<RevId>> {
    match doc.get("_rev") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => RevId::parse(s).map(Some),
        Some(other) => Err(Error::InvalidRev(other.to_string())),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Validates and normalizes one document write.
///
/// # Errors
///
/// - [`Error::BadRequest`] if `raw` is not a JSON object
/// - [`Error::InvalidRev`] for malformed `_rev` / `_revisions`
/// - [`Error::MissingId`] / [`Error::ReservedId`] for bad ids
/// - [`Error::DocValidation`] for unknown `_` members, malformed attachments
///   or nesting deeper than [`MAX_NESTING_DEPTH`]
pub fn parse_document(raw: Value, new_edits: bool, opts: ParseOptions) -> Result<ParsedDoc> {
    check_nesting(&raw)?;
    let Value::Object(mut doc) = raw else {
        return Err(Error::BadRequest("document must be a JSON object".to_string()));
    };

    let deleted = truthy(doc.get("_deleted"));
    let leaf_status = RevStatus::Available;

    let (rev, rev_tree) = if new_edits {
        if !matches!(doc.get("_id"), Some(Value::String(s)) if !s.is_empty()) {
            doc.insert(
                "_id".to_string(),
                Value::String(uuid::Uuid::new_v4().simple().to_string()),
            );
        }
        let prev = rev_member(&doc)?;
        let hash = new_rev_hash(&doc, opts.deterministic_revs)?;
        let leaf = RevNode::new(hash.clone(), leaf_status, deleted);
        match prev {
            Some(prev) => {
                let generation = prev
                    .generation
                    .checked_add(1)
                    .ok_or_else(|| Error::InvalidRev(prev.to_string()))?;
                let mut root = RevNode::new(prev.hash.clone(), RevStatus::Missing, false);
                root.children.push(leaf);
                let rev = RevId::new(generation, hash);
                (rev, RevTree::from_paths(vec![RevPath { pos: prev.generation, root }]))
            }
            None => (
                RevId::new(1, hash),
                RevTree::from_paths(vec![RevPath { pos: 1, root: leaf }]),
            ),
        }
    } else if let Some(revisions) = doc.get("_revisions") {
        let revisions: Revisions = serde_json::from_value(revisions.clone())
            .map_err(|e| Error::InvalidRev(format!("bad _revisions: {e}")))?;
        let tree = tree_from_revisions(&revisions, deleted)?;
        let rev = RevId::new(revisions.start, revisions.ids[0].clone());
        (rev, tree)
    } else {
        let rev = rev_member(&doc)?.ok_or_else(|| Error::InvalidRev("missing _rev".to_string()))?;
        let leaf = RevNode::new(rev.hash.clone(), leaf_status, deleted);
        let tree = RevTree::from_paths(vec![RevPath { pos: rev.generation, root: leaf }]);
        (rev, tree)
    };

    let id = validate_id(doc.get("_id").and_then(Value::as_str))?;

    let mut data = Map::new();
    let mut metadata = Map::new();
    let mut attachments = None;

    for (key, value) in doc {
        if !key.starts_with('_') {
            data.insert(key, value);
            continue;
        }
        if !RESERVED_WORDS.contains(&key.as_str()) {
            return Err(Error::DocValidation(format!("Bad special document member: {key}")));
        }
        if key == "_attachments" {
            if !value.is_null() {
                let parsed: AttachmentMap = serde_json::from_value(value)
                    .map_err(|e| Error::DocValidation(format!("bad _attachments: {e}")))?;
                attachments = Some(parsed);
            }
        } else if DATA_WORDS.contains(&key.as_str()) {
            data.insert(key, value);
        } else {
            metadata.insert(key[1..].to_string(), value);
        }
    }

    Ok(ParsedDoc {
        id,
        rev,
        rev_tree,
        deleted,
        data,
        attachments,
        metadata,
    })
}
