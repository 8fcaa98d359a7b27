//! # Map/Reduce Views
//!
//! Secondary indexes built by running design-document map functions over
//! every document, optionally aggregated by a reduce function.
//!
//! ## Query Flow
//!
//! ```text
//!  query("app/by_type")
//!       │
//!       ▼
//!  ┌────────────────┐   design doc   ┌─────────────────┐
//!  │ resolve ViewDef│ ─────────────► │ signature (md5) │
//!  └────────────────┘                └────────┬────────┘
//!                                             ▼
//!                ┌──────────────────────────────────────────────┐
//!                │ catch up: changes since index last_seq,      │
//!                │ view_batch_size at a time, map + apply_batch │
//!                └──────────────────────┬───────────────────────┘
//!                                       ▼
//!                ┌──────────────────────────────────────────────┐
//!                │ load rows, collate, select range / keys,     │
//!                │ reduce (grouped), skip + limit               │
//!                └──────────────────────────────────────────────┘
//! ```
//!
//! Catching up happens inside every query, so results always reflect every
//! write committed before the query started.
//!
//! ## Reduce
//!
//! `reduce` is either script source or the name of a native reducer from a
//! [`builtin::ReduceRegistry`] (`_sum`, `_count`, `_stats`). A group whose
//! reduction fails is dropped from the result and logged.

pub mod builtin;
pub mod collate;
pub mod index;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::attachments::md5_digest;
use crate::error::{Error, Result};
use crate::reader::ChangeRow;
use crate::script::{Capabilities, Evaluator, Invocation, Outcome};
use crate::types::{Seq, DESIGN_PREFIX};
use builtin::ReduceRegistry;
use collate::{collate, collate_eq};
use index::{map_rows, IndexRow, ViewStore};

// =============================================================================
// Definitions
// =============================================================================

/// A view's functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDef {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

impl ViewDef {
    pub fn new(map: impl Into<String>, reduce: Option<String>) -> Self {
        Self { map: map.into(), reduce }
    }

    /// Identity of the index this definition produces.
    pub fn signature(&self) -> String {
        let text = format!("{}\u{0}{}", self.map, self.reduce.as_deref().unwrap_or(""));
        md5_digest(text.as_bytes())
    }

    /// Reads `views.<name>` from a design document.
    pub fn from_design_doc(ddoc: &Value, name: &str) -> Result<Self> {
        let view = ddoc
            .get("views")
            .and_then(|views| views.get(name))
            .ok_or_else(|| Error::MissingDoc(format!("missing json key: {name}")))?;
        serde_json::from_value(view.clone())
            .map_err(|e| Error::BadRequest(format!("invalid view {name}: {e}")))
    }
}

/// Which view to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewSpec {
    /// `"ddoc/view"` (the `_design/` prefix is optional).
    Named(String),
    /// An inline definition, indexed for one query and then dropped.
    Temp(ViewDef),
}

impl ViewSpec {
    /// Splits a named view into `(design doc id, view name)`.
    pub fn parse_name(name: &str) -> Result<(String, String)> {
        let name = name.strip_prefix(DESIGN_PREFIX).unwrap_or(name);
        match name.split_once('/') {
            Some((ddoc, view)) if !ddoc.is_empty() && !view.is_empty() => {
                Ok((format!("{DESIGN_PREFIX}{ddoc}"), view.to_string()))
            }
            _ => Err(Error::BadRequest(format!("view name must be ddoc/view, got {name:?}"))),
        }
    }
}

/// A resolved view: where its index lives and what builds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewHandle {
    pub signature: String,
    pub ddoc_id: String,
    pub name: String,
    pub def: ViewDef,
}

impl ViewHandle {
    pub fn named(ddoc_id: impl Into<String>, name: impl Into<String>, def: ViewDef) -> Self {
        Self {
            signature: def.signature(),
            ddoc_id: ddoc_id.into(),
            name: name.into(),
            def,
        }
    }

    /// A throwaway index with a unique signature.
    pub fn temp(def: ViewDef) -> Self {
        Self {
            signature: format!("temp-{}", uuid::Uuid::new_v4().simple()),
            ddoc_id: "_temp".to_string(),
            name: "_temp".to_string(),
            def,
        }
    }
}

/// Signatures of every view defined by `design_docs`.
pub fn live_signatures(design_docs: &[Value]) -> HashSet<String> {
    let mut live = HashSet::new();
    for ddoc in design_docs {
        let Some(views) = ddoc.get("views").and_then(Value::as_object) else {
            continue;
        };
        for (name, view) in views {
            match serde_json::from_value::<ViewDef>(view.clone()) {
                Ok(def) => {
                    live.insert(def.signature());
                }
                Err(e) => debug!(view = %name, error = %e, "ignoring malformed view"),
            }
        }
    }
    live
}

// =============================================================================
// Query Options and Results
// =============================================================================

/// Options for [`ViewEngine::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub key: Option<Value>,
    pub keys: Option<Vec<Value>>,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    /// Include rows equal to `end_key` (default true).
    pub inclusive_end: bool,
    pub descending: bool,
    pub skip: usize,
    pub limit: Option<usize>,
    pub include_docs: bool,
    /// `None` reduces whenever the view has a reduce function.
    pub reduce: Option<bool>,
    pub group: bool,
    pub group_level: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            key: None,
            keys: None,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            descending: false,
            skip: 0,
            limit: None,
            include_docs: false,
            reduce: None,
            group: false,
            group_level: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    /// Source document (absent on reduced rows).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: Value,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewResponse {
    /// Rows in the whole index (map queries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<usize>,
    /// Rows preceding the first returned one (map queries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    pub rows: Vec<ViewRow>,
}

// =============================================================================
// Engine
// =============================================================================

/// Index maintenance and querying. All methods block; async callers run
/// them on the blocking pool.
pub struct ViewEngine {
    store: Mutex<ViewStore>,
    evaluator: Arc<dyn Evaluator>,
    reducers: ReduceRegistry,
}

impl std::fmt::Debug for ViewEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewEngine").field("reducers", &self.reducers).finish_non_exhaustive()
    }
}

impl ViewEngine {
    pub fn new(store: ViewStore, evaluator: Arc<dyn Evaluator>, reducers: ReduceRegistry) -> Self {
        Self {
            store: Mutex::new(store),
            evaluator,
            reducers,
        }
    }

    fn store(&self) -> MutexGuard<'_, ViewStore> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Rejects definitions that can never be queried.
    pub fn validate(&self, def: &ViewDef) -> Result<()> {
        match &def.reduce {
            Some(reduce) if ReduceRegistry::is_builtin_name(reduce) => self.reducers.resolve(reduce).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Sequence the view's index is current to.
    pub fn last_seq(&self, view: &ViewHandle) -> Result<Seq> {
        self.store().last_seq(&view.signature)
    }

    /// Maps one page of changes read after `since` and stores the result.
    ///
    /// Returns `false` if another query advanced the index concurrently.
    pub fn index_batch(&self, view: &ViewHandle, since: Seq, rows: &[ChangeRow]) -> Result<bool> {
        let emissions = map_rows(self.evaluator.as_ref(), &view.def.map, rows);
        let last_seq = rows.last().map(|row| row.doc.seq).unwrap_or(since);
        let mut store = self.store();
        store.ensure_view(&view.signature, &view.ddoc_id, &view.name)?;
        let applied = store.apply_batch(&view.signature, since, &emissions, last_seq)?;
        if applied {
            debug!(view = %view.name, docs = rows.len(), last_seq = %last_seq, "view index advanced");
        }
        Ok(applied)
    }

    /// Answers a query from the stored index. Documents are not attached;
    /// `include_docs` is the caller's job.
    pub fn query(&self, view: &ViewHandle, opts: &QueryOptions) -> Result<ViewResponse> {
        let grouping = opts.group || opts.group_level.is_some();
        let reducing = match (opts.reduce, &view.def.reduce) {
            (Some(true), None) => {
                return Err(Error::BadRequest("reduce is invalid for map-only views".to_string()))
            }
            (Some(false), _) | (None, None) => false,
            (_, Some(_)) => true,
        };
        if reducing && opts.include_docs {
            return Err(Error::BadRequest("include_docs is invalid for reduce".to_string()));
        }
        if !reducing && grouping {
            return Err(Error::BadRequest("grouping requires a reduce function".to_string()));
        }
        if reducing && opts.keys.is_some() && !grouping {
            return Err(Error::BadRequest(
                "multi-key fetches for reduce views must use group".to_string(),
            ));
        }

        let mut rows = self.store().rows(&view.signature)?;
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        let total_rows = rows.len();
        if opts.descending {
            rows.reverse();
        }
        let (selected, offset) = select_rows(rows, opts);

        if reducing {
            let reduce = view.def.reduce.as_deref().unwrap_or_default();
            let reduced = self.reduce_rows(&view.name, reduce, selected, opts);
            return Ok(ViewResponse {
                total_rows: None,
                offset: None,
                rows: page(reduced, opts),
            });
        }

        let rows = selected
            .into_iter()
            .map(|row| ViewRow { id: Some(row.id), key: row.key, value: row.value, doc: None })
            .collect();
        Ok(ViewResponse {
            total_rows: Some(total_rows),
            offset: Some(offset + opts.skip),
            rows: page(rows, opts),
        })
    }

    fn reduce_rows(&self, view_name: &str, reduce: &str, rows: Vec<IndexRow>, opts: &QueryOptions) -> Vec<ViewRow> {
        let level = match (opts.group_level, opts.group) {
            (Some(level), _) => Some(Some(level)),
            (None, true) => Some(None),
            (None, false) => None,
        };

        let mut groups: Vec<(Value, Vec<IndexRow>)> = Vec::new();
        match level {
            None if rows.is_empty() => {}
            None => groups.push((Value::Null, rows)),
            Some(level) => {
                for row in rows {
                    let key = group_key(&row.key, level);
                    match groups.last_mut() {
                        Some((current, members)) if collate_eq(current, &key) => members.push(row),
                        _ => groups.push((key, vec![row])),
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            match self.reduce_group(reduce, members) {
                Ok(value) => out.push(ViewRow { id: None, key, value, doc: None }),
                Err(e) => warn!(view = %view_name, key = %key, error = %e, "reduce failed, group dropped"),
            }
        }
        out
    }

    fn reduce_group(&self, reduce: &str, rows: Vec<IndexRow>) -> Result<Value> {
        let mut keys = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(Value::Array(vec![row.key, Value::String(row.id)]));
            values.push(row.value);
        }
        if ReduceRegistry::is_builtin_name(reduce) {
            let reducer = self.reducers.resolve(reduce)?;
            return reducer(&values, false);
        }
        let invocation = Invocation::Reduce { keys: &keys, values: &values, rereduce: false };
        match self.evaluator.run(reduce, Capabilities::REDUCE, invocation)? {
            Outcome::Reduced(value) => Ok(value),
            _ => Err(Error::Eval("reduce function produced no value".to_string())),
        }
    }

    /// Deletes a view's index.
    pub fn drop_view(&self, view: &ViewHandle) -> Result<()> {
        self.store().drop_view(&view.signature)
    }

    /// Deletes every index whose signature is not in `live`. Returns how many
    /// were removed.
    pub fn cleanup(&self, live: &HashSet<String>) -> Result<usize> {
        let mut store = self.store();
        let mut removed = 0;
        for signature in store.signatures()? {
            if signature.starts_with("temp-") || live.contains(&signature) {
                continue;
            }
            store.drop_view(&signature)?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Applies `key` / `keys` / `start_key` / `end_key` to ordered rows.
/// Returns the selection and how many rows precede it.
fn select_rows(rows: Vec<IndexRow>, opts: &QueryOptions) -> (Vec<IndexRow>, usize) {
    if let Some(keys) = &opts.keys {
        let mut out = Vec::new();
        for key in keys {
            out.extend(rows.iter().filter(|row| collate_eq(&row.key, key)).cloned());
        }
        return (out, 0);
    }

    let mut before = 0;
    let mut out = Vec::new();
    for row in rows {
        if let Some(start) = &opts.start_key {
            let ord = collate(&row.key, start);
            if (opts.descending && ord.is_gt()) || (!opts.descending && ord.is_lt()) {
                before += 1;
                continue;
            }
        }
        if let Some(end) = &opts.end_key {
            let ord = collate(&row.key, end);
            let past = match (opts.descending, opts.inclusive_end) {
                (false, true) => ord.is_gt(),
                (false, false) => ord.is_ge(),
                (true, true) => ord.is_lt(),
                (true, false) => ord.is_le(),
            };
            if past {
                break;
            }
        }
        if let Some(key) = &opts.key {
            if !collate_eq(&row.key, key) {
                if out.is_empty() {
                    before += 1;
                }
                continue;
            }
        }
        out.push(row);
    }
    (out, before)
}

fn group_key(key: &Value, level: Option<usize>) -> Value {
    match (level, key) {
        (None, _) => key.clone(),
        (Some(0), _) => Value::Null,
        (Some(n), Value::Array(items)) => Value::Array(items.iter().take(n).cloned().collect()),
        (Some(_), other) => other.clone(),
    }
}

fn page(rows: Vec<ViewRow>, opts: &QueryOptions) -> Vec<ViewRow> {
    let rows = rows.into_iter().skip(opts.skip);
    match opts.limit {
        Some(limit) => rows.take(limit).collect(),
        None => rows.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rev_tree::{RevNode, RevPath, RevStatus, RevTree};
    use crate::script::ScriptEvaluator;
    use crate::store::StoredDoc;
    use crate::types::{DocId, RevId};
    use serde_json::json;

    fn engine() -> ViewEngine {
        ViewEngine::new(
            ViewStore::open_in_memory().unwrap(),
            Arc::new(ScriptEvaluator::new(10_000, 8)),
            ReduceRegistry::default(),
        )
    }

    fn change(id: &str, seq: u64, deleted: bool, body: Value) -> ChangeRow {
        let path = RevPath::linear(1, vec![RevNode::new("a", RevStatus::Available, deleted)]).unwrap();
        let mut map = body.as_object().cloned().unwrap_or_default();
        map.insert("_id".into(), json!(id));
        ChangeRow {
            doc: StoredDoc {
                id: DocId::new(id),
                rev_tree: RevTree::from_paths(vec![path]),
                winning_rev: RevId::new(1, "a"),
                deleted,
                seq: Seq::from_raw(seq),
            },
            body: Some(map),
        }
    }

    fn indexed(reduce: Option<&str>) -> (ViewEngine, ViewHandle) {
        let engine = engine();
        let def = ViewDef::new(
            "function (doc) { emit([doc.type, doc.n], doc.n); }",
            reduce.map(str::to_string),
        );
        let view = ViewHandle::named("_design/app", "by_type", def);
        let rows = vec![
            change("a", 1, false, json!({"type": "post", "n": 1})),
            change("b", 2, false, json!({"type": "post", "n": 2})),
            change("c", 3, false, json!({"type": "page", "n": 3})),
            change("_design/app", 4, false, json!({})),
            change("d", 5, true, json!({"type": "post", "n": 9})),
        ];
        assert!(engine.index_batch(&view, Seq::ZERO, &rows).unwrap());
        (engine, view)
    }

    fn keys(response: &ViewResponse) -> Vec<Value> {
        response.rows.iter().map(|r| r.key.clone()).collect()
    }

    #[test]
    fn test_map_query_ordering_and_ranges() {
        let (engine, view) = indexed(None);
        assert_eq!(engine.last_seq(&view).unwrap(), Seq::from_raw(5));

        let all = engine.query(&view, &QueryOptions::default()).unwrap();
        assert_eq!(all.total_rows, Some(3));
        assert_eq!(keys(&all), vec![json!(["page", 3]), json!(["post", 1]), json!(["post", 2])]);

        let opts = QueryOptions {
            start_key: Some(json!(["post"])),
            end_key: Some(json!(["post", {}])),
            ..Default::default()
        };
        let posts = engine.query(&view, &opts).unwrap();
        assert_eq!(posts.rows.len(), 2);
        assert_eq!(posts.offset, Some(1));

        let opts = QueryOptions { descending: true, limit: Some(1), ..Default::default() };
        let last = engine.query(&view, &opts).unwrap();
        assert_eq!(keys(&last), vec![json!(["post", 2])]);

        let opts = QueryOptions {
            end_key: Some(json!(["post", 1])),
            inclusive_end: false,
            ..Default::default()
        };
        assert_eq!(engine.query(&view, &opts).unwrap().rows.len(), 1);

        let opts = QueryOptions { keys: Some(vec![json!(["post", 2]), json!(["page", 3])]), ..Default::default() };
        assert_eq!(keys(&engine.query(&view, &opts).unwrap()), vec![json!(["post", 2]), json!(["page", 3])]);
    }

    #[test]
    fn test_builtin_reduce_and_grouping() {
        let (engine, view) = indexed(Some("_sum"));
        let total = engine.query(&view, &QueryOptions::default()).unwrap();
        assert_eq!(total.rows, vec![ViewRow { id: None, key: json!(null), value: json!(6), doc: None }]);

        let opts = QueryOptions { group_level: Some(1), ..Default::default() };
        let grouped = engine.query(&view, &opts).unwrap();
        let pairs: Vec<_> = grouped.rows.iter().map(|r| (r.key.clone(), r.value.clone())).collect();
        assert_eq!(pairs, vec![(json!(["page"]), json!(3)), (json!(["post"]), json!(3))]);

        let opts = QueryOptions { reduce: Some(false), ..Default::default() };
        assert_eq!(engine.query(&view, &opts).unwrap().rows.len(), 3);
    }

    #[test]
    fn test_script_reduce() {
        let (engine, view) = indexed(Some("function (keys, values) { return values.length; }"));
        let opts = QueryOptions { group: true, ..Default::default() };
        let grouped = engine.query(&view, &opts).unwrap();
        assert_eq!(grouped.rows.len(), 3);
        assert!(grouped.rows.iter().all(|r| r.value == json!(1)));
    }

    #[test]
    fn test_failing_builtin_reduce_drops_group() {
        let engine = engine();
        let def = ViewDef::new("function (doc) { emit(doc.k, doc.v); }", Some("_sum".into()));
        let view = ViewHandle::named("_design/app", "mixed", def);
        let rows = vec![
            change("a", 1, false, json!({"k": "x", "v": 1})),
            change("b", 2, false, json!({"k": "x", "v": [3, 4]})),
            change("c", 3, false, json!({"k": "y", "v": 2})),
        ];
        engine.index_batch(&view, Seq::ZERO, &rows).unwrap();
        let grouped = engine.query(&view, &QueryOptions { group: true, ..Default::default() }).unwrap();
        assert_eq!(grouped.rows, vec![ViewRow { id: None, key: json!("y"), value: json!(2), doc: None }]);
    }

    #[test]
    fn test_invalid_query_combinations() {
        let (engine, view) = indexed(None);
        let opts = QueryOptions { reduce: Some(true), ..Default::default() };
        assert!(matches!(engine.query(&view, &opts), Err(Error::BadRequest(_))));
        let opts = QueryOptions { group: true, ..Default::default() };
        assert!(matches!(engine.query(&view, &opts), Err(Error::BadRequest(_))));

        let bad = ViewDef::new("function (doc) {}", Some("_median".into()));
        assert!(matches!(engine.validate(&bad), Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_cleanup_keeps_live_views() {
        let (engine, view) = indexed(None);
        let other = ViewHandle::named("_design/old", "gone", ViewDef::new("function (doc) {}", None));
        engine.index_batch(&other, Seq::ZERO, &[]).unwrap();

        let ddoc = json!({"_id": "_design/app", "views": {"by_type": view.def.clone()}});
        let live = live_signatures(&[ddoc]);
        assert_eq!(engine.cleanup(&live).unwrap(), 1);
        assert_eq!(engine.query(&view, &QueryOptions::default()).unwrap().rows.len(), 3);
    }

    #[test]
    fn test_view_names() {
        assert_eq!(
            ViewSpec::parse_name("app/by_type").unwrap(),
            ("_design/app".to_string(), "by_type".to_string())
        );
        assert_eq!(
            ViewSpec::parse_name("_design/app/by_type").unwrap(),
            ("_design/app".to_string(), "by_type".to_string())
        );
        assert!(matches!(ViewSpec::parse_name("nope"), Err(Error::BadRequest(_))));
    }
}
