//! # Row Encoding and Decoding
//!
//! Revision trees and bodies are stored as JSON text. This module owns the
//! conversions between those columns and in-memory values, plus assembly of
//! the document shape handed back to readers:
//!
//! ```text
//! stored body                      returned document
//! {"name": "x",            ──►     {"_id": "a", "_rev": "2-b",
//!  "_attachments": {...}}           "name": "x", "_attachments": {...}}
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::rev_tree::RevTree;
use crate::types::RevId;

// =============================================================================
// Column Codecs
// =============================================================================

/// Serializes a revision tree for the `rev_tree` column.
pub fn encode_tree(tree: &RevTree) -> Result<String> {
    Ok(serde_json::to_string(tree)?)
}

/// Parses a `rev_tree` column.
pub fn decode_tree(text: &str) -> Result<RevTree> {
    Ok(serde_json::from_str(text)?)
}

/// Serializes a body for the `body` column.
pub fn encode_body(body: &Map<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(body)?)
}

/// Parses a `body` column.
pub fn decode_body(text: &str) -> Result<Map<String, Value>> {
    Ok(serde_json::from_str(text)?)
}

// =============================================================================
// Nesting Limit
// =============================================================================

/// Deepest array/object nesting a stored JSON value may have.
///
/// Column reads go through `serde_json`, which refuses input nested deeper
/// than 128 levels, so anything written must stay below that.
pub const MAX_NESTING_DEPTH: usize = 100;

/// Array/object nesting depth of `value`; scalars are 0.
pub fn nesting_depth(value: &Value) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(value, 0usize)];
    while let Some((value, depth)) = stack.pop() {
        match value {
            Value::Array(items) => {
                deepest = deepest.max(depth + 1);
                stack.extend(items.iter().map(|v| (v, depth + 1)));
            }
            Value::Object(map) => {
                deepest = deepest.max(depth + 1);
                stack.extend(map.values().map(|v| (v, depth + 1)));
            }
            _ => {}
        }
    }
    deepest
}

/// Rejects values that could be written but never read back.
pub fn check_nesting(value: &Value) -> Result<()> {
    let depth = nesting_depth(value);
    if depth > MAX_NESTING_DEPTH {
        return Err(Error::DocValidation(format!(
            "nested {depth} levels deep, limit is {MAX_NESTING_DEPTH}"
        )));
    }
    Ok(())
}

/// [`check_nesting`] for a body held as a map.
pub fn check_body_nesting(body: &Map<String, Value>) -> Result<()> {
    body.values().try_for_each(|value| {
        if nesting_depth(value) >= MAX_NESTING_DEPTH {
            return Err(Error::DocValidation(format!(
                "nested deeper than {MAX_NESTING_DEPTH} levels"
            )));
        }
        Ok(())
    })
}

// =============================================================================
// Document Assembly
// =============================================================================

/// Builds the reader-facing document: `_id`, `_rev`, optional `_deleted`, body.
pub fn assemble_doc(id: &str, rev: &RevId, deleted: bool, body: Map<String, Value>) -> Map<String, Value> {
    let mut doc = Map::with_capacity(body.len() + 3);
    doc.insert("_id".to_string(), Value::String(id.to_string()));
    doc.insert("_rev".to_string(), Value::String(rev.to_string()));
    if deleted {
        doc.insert("_deleted".to_string(), Value::Bool(true));
    }
    doc.extend(body);
    doc
}

/// Returns the current time in milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
