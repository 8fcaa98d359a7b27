//! # Change Feed
//!
//! Turns rows of the sequence index into change events and decides which of
//! them a caller sees.
//!
//! ```text
//! ChangesOptions ──plan_filter──► FilterPlan ──(design doc?)──► ChangesFilter
//!                                                                    │
//! ChangeRow page ──────────────────────────────► filter_page ◄───────┘
//!                                                     │
//!                                                     ▼
//!                                    ChangesResponse { results, last_seq }
//! ```
//!
//! Filter resolution:
//!
//! | Given | Filter used |
//! |-------|-------------|
//! | `view` and no `filter` | `_view` |
//! | `selector` and no `filter` | `_selector` |
//! | `selector` and another `filter` | bad request |
//! | `doc_ids` and no `filter` | `_doc_ids` |
//! | `_view` without `view` | bad request |
//! | `"ddoc/name"` | `filters.name` of `_design/ddoc` |
//!
//! User filter functions that fail are treated as "not matched".

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::reader::ChangeRow;
use crate::script::{Capabilities, Evaluator, Invocation, Outcome};
use crate::selector::Selector;
use crate::types::Seq;

// =============================================================================
// Events
// =============================================================================

/// One revision listed in a change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// A document's latest state at a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub seq: Seq,
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// One page of the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeEvent>,
    /// Sequence of the last row examined (matching or not).
    pub last_seq: Seq,
}

/// Which revisions each event lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesStyle {
    /// Only the winning revision.
    #[default]
    MainOnly,
    /// Every leaf, winner first.
    AllDocs,
}

// =============================================================================
// Options
// =============================================================================

/// A caller-supplied filter.
#[derive(Clone)]
pub enum ChangeFilter {
    /// `_doc_ids`, `_selector`, `_view` or `"ddoc/name"`.
    Named(String),
    /// An in-process predicate over the document body.
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeFilter::Named(name) => f.debug_tuple("Named").field(name).finish(),
            ChangeFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Options for `changes` and `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// Only changes after this sequence.
    pub since: Seq,
    /// Stop after this many matching events.
    pub limit: Option<usize>,
    pub include_docs: bool,
    /// Add `_conflicts` to included docs.
    pub conflicts: bool,
    pub style: ChangesStyle,
    pub doc_ids: Option<Vec<String>>,
    pub filter: Option<ChangeFilter>,
    /// `"ddoc/view"` for the `_view` filter.
    pub view: Option<String>,
    pub selector: Option<Value>,
    /// Passed to filter functions as `req.query`.
    pub query_params: Map<String, Value>,
}

// =============================================================================
// Filter Resolution
// =============================================================================

/// What kind of filter the options ask for, before any design doc is read.
#[derive(Clone)]
pub enum FilterPlan {
    All,
    DocIds,
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
    Selector(Selector),
    Design { ddoc: String, name: String },
    View { ddoc: String, name: String },
}

impl fmt::Debug for FilterPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterPlan::All => f.write_str("All"),
            FilterPlan::DocIds => f.write_str("DocIds"),
            FilterPlan::Predicate(_) => f.write_str("Predicate(..)"),
            FilterPlan::Selector(s) => f.debug_tuple("Selector").field(s).finish(),
            FilterPlan::Design { ddoc, name } => write!(f, "Design({ddoc}/{name})"),
            FilterPlan::View { ddoc, name } => write!(f, "View({ddoc}/{name})"),
        }
    }
}

fn split_ddoc_name(text: &str, what: &str) -> Result<(String, String)> {
    match text.split_once('/') {
        Some((ddoc, name)) if !ddoc.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ddoc.to_string(), name.to_string()))
        }
        _ => Err(Error::BadRequest(format!("{what} must be of the form ddoc/name, got {text:?}"))),
    }
}

/// Decides which filter applies.
pub fn plan_filter(opts: &ChangesOptions) -> Result<FilterPlan> {
    let mut filter = opts.filter.clone();
    if filter.is_none() && opts.view.is_some() {
        filter = Some(ChangeFilter::Named("_view".to_string()));
    }
    if opts.selector.is_some() {
        match &filter {
            None => filter = Some(ChangeFilter::Named("_selector".to_string())),
            Some(ChangeFilter::Named(name)) if name == "_selector" => {}
            Some(_) => {
                return Err(Error::BadRequest(
                    "selector can only be used with the _selector filter".to_string(),
                ))
            }
        }
    }
    if filter.is_none() && opts.doc_ids.is_some() {
        filter = Some(ChangeFilter::Named("_doc_ids".to_string()));
    }

    match filter {
        None => Ok(FilterPlan::All),
        Some(ChangeFilter::Predicate(f)) => Ok(FilterPlan::Predicate(f)),
        Some(ChangeFilter::Named(name)) => match name.as_str() {
            "_doc_ids" => {
                if opts.doc_ids.is_none() {
                    return Err(Error::BadRequest("_doc_ids filter requires doc_ids".to_string()));
                }
                Ok(FilterPlan::DocIds)
            }
            "_selector" => match &opts.selector {
                Some(selector) => Ok(FilterPlan::Selector(Selector::new(selector.clone())?)),
                None => Err(Error::BadRequest("_selector filter requires a selector".to_string())),
            },
            "_view" => match &opts.view {
                Some(view) => {
                    let (ddoc, name) = split_ddoc_name(view, "view")?;
                    Ok(FilterPlan::View { ddoc, name })
                }
                None => Err(Error::BadRequest("`view` filter parameter not found".to_string())),
            },
            other => {
                let (ddoc, name) = split_ddoc_name(other, "filter")?;
                Ok(FilterPlan::Design { ddoc, name })
            }
        },
    }
}

impl FilterPlan {
    /// Id of the design document the plan needs, if any.
    pub fn design_doc_id(&self) -> Option<String> {
        match self {
            FilterPlan::Design { ddoc, .. } | FilterPlan::View { ddoc, .. } => Some(format!("_design/{ddoc}")),
            _ => None,
        }
    }

    /// Completes the plan with the fetched design document.
    ///
    /// # Errors
    ///
    /// `MissingDoc` if the design doc or the named function is absent.
    pub fn resolve(self, opts: &ChangesOptions, ddoc: Option<&Value>) -> Result<ChangesFilter> {
        let doc_ids = opts
            .doc_ids
            .as_ref()
            .map(|ids| ids.iter().cloned().collect::<HashSet<_>>());
        let spec = match self {
            FilterPlan::All | FilterPlan::DocIds => FilterSpec::All,
            FilterPlan::Predicate(f) => FilterSpec::Predicate(f),
            FilterPlan::Selector(s) => FilterSpec::Selector(s),
            FilterPlan::Design { ddoc: ddoc_name, name } => {
                let ddoc = ddoc.ok_or_else(|| Error::MissingDoc("missing".to_string()))?;
                let source = ddoc
                    .get("filters")
                    .ok_or_else(|| Error::MissingDoc("missing json key: filters".to_string()))?
                    .get(&name)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::MissingDoc(format!("missing json key: {name} in _design/{ddoc_name}")))?;
                FilterSpec::Design { source: source.to_string() }
            }
            FilterPlan::View { ddoc: ddoc_name, name } => {
                let ddoc = ddoc.ok_or_else(|| Error::MissingDoc("missing".to_string()))?;
                let source = ddoc
                    .get("views")
                    .and_then(|views| views.get(&name))
                    .and_then(|view| view.get("map"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::MissingDoc(format!("missing json key: {name} in _design/{ddoc_name}")))?;
                FilterSpec::View { source: source.to_string() }
            }
        };
        Ok(ChangesFilter {
            doc_ids,
            spec,
            req: json!({ "query": Value::Object(opts.query_params.clone()) }),
        })
    }
}

/// A resolved filter.
#[derive(Clone)]
pub enum FilterSpec {
    All,
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
    Selector(Selector),
    /// A `filters` function: `function (doc, req)`.
    Design { source: String },
    /// A view's map function; passes if it emits anything.
    View { source: String },
}

/// Everything needed to judge one change.
#[derive(Clone)]
pub struct ChangesFilter {
    doc_ids: Option<HashSet<String>>,
    spec: FilterSpec,
    req: Value,
}

impl fmt::Debug for ChangesFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.spec {
            FilterSpec::All => "all",
            FilterSpec::Predicate(_) => "predicate",
            FilterSpec::Selector(_) => "selector",
            FilterSpec::Design { .. } => "design",
            FilterSpec::View { .. } => "view",
        };
        f.debug_struct("ChangesFilter")
            .field("doc_ids", &self.doc_ids)
            .field("spec", &kind)
            .finish()
    }
}

impl ChangesFilter {
    /// Passes everything.
    pub fn all() -> Self {
        Self { doc_ids: None, spec: FilterSpec::All, req: json!({ "query": {} }) }
    }

    /// True if judging a change requires the document body.
    pub fn needs_body(&self) -> bool {
        !matches!(self.spec, FilterSpec::All)
    }

    /// Decides whether `event` is delivered. `doc` is the winning revision's
    /// body (required unless [`ChangesFilter::needs_body`] is false).
    pub fn should_emit(&self, event: &ChangeEvent, doc: Option<&Value>, evaluator: &dyn Evaluator) -> bool {
        if let Some(ids) = &self.doc_ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        let doc = match (&self.spec, doc) {
            (FilterSpec::All, _) => return true,
            (_, Some(doc)) => doc,
            (_, None) => return false,
        };
        match &self.spec {
            FilterSpec::All => true,
            FilterSpec::Predicate(f) => f(doc),
            FilterSpec::Selector(selector) => selector.matches(doc),
            FilterSpec::Design { source } => {
                match evaluator.run(source, Capabilities::FILTER, Invocation::Filter { doc, req: &self.req }) {
                    Ok(Outcome::Matched(passed)) => passed,
                    Ok(_) => false,
                    Err(e) => {
                        debug!(id = %event.id, error = %e, "filter function failed, change skipped");
                        false
                    }
                }
            }
            FilterSpec::View { source } => match evaluator.run(source, Capabilities::MAP, Invocation::Map { doc }) {
                Ok(Outcome::Emitted(rows)) => !rows.is_empty(),
                Ok(_) => false,
                Err(e) => {
                    debug!(id = %event.id, error = %e, "view filter failed, change skipped");
                    false
                }
            },
        }
    }
}

// =============================================================================
// Pages
// =============================================================================

/// Builds the event for one row. `body` is the winner's assembled body.
pub fn change_event(row: &ChangeRow, opts: &ChangesOptions) -> ChangeEvent {
    let doc = &row.doc;
    let mut changes = vec![ChangeRev { rev: doc.winning_rev.to_string() }];
    if opts.style == ChangesStyle::AllDocs {
        changes.extend(
            doc.rev_tree
                .leaves()
                .into_iter()
                .filter(|leaf| leaf.rev != doc.winning_rev)
                .map(|leaf| ChangeRev { rev: leaf.rev.to_string() }),
        );
    }

    let included = if opts.include_docs {
        row.body.clone().map(|mut body| {
            if opts.conflicts {
                let conflicts = doc.rev_tree.conflicts();
                if !conflicts.is_empty() {
                    body.insert(
                        "_conflicts".to_string(),
                        Value::Array(conflicts.iter().map(|r| Value::String(r.to_string())).collect()),
                    );
                }
            }
            Value::Object(body)
        })
    } else {
        None
    };

    ChangeEvent {
        id: doc.id.to_string(),
        seq: doc.seq,
        changes,
        deleted: doc.deleted,
        doc: included,
    }
}

/// Filters one page of rows, stopping after `limit` matches.
///
/// `last_seq` is the sequence of the last row examined, so the next page
/// starts right after it.
pub fn filter_page(
    rows: Vec<ChangeRow>,
    since: Seq,
    opts: &ChangesOptions,
    filter: &ChangesFilter,
    evaluator: &dyn Evaluator,
    limit: Option<usize>,
) -> ChangesResponse {
    let mut results = Vec::new();
    let mut last_seq = since;
    for row in rows {
        if limit.is_some_and(|limit| results.len() >= limit) {
            break;
        }
        last_seq = row.doc.seq;
        let event = change_event(&row, opts);
        let body = row.body.map(Value::Object);
        if filter.should_emit(&event, body.as_ref(), evaluator) {
            results.push(event);
        }
    }
    ChangesResponse { results, last_seq }
}
