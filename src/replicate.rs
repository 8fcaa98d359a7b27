//! One-shot replication between two peers.
//!
//! ```text
//!  checkpoint ──► changes(since, all_docs) ──► revs_diff(target)
//!      ▲                                            │ missing revs
//!      │                                            ▼
//!  write checkpoint ◄── bulk_docs(new_edits=false) ◄── open_revs(source)
//! ```
//!
//! Each page of changes is copied completely before its last sequence is
//! checkpointed, so an interrupted run resumes without losing revisions.
//! Copying a revision the target already has is harmless: replicated writes
//! merge into the revision tree and never conflict.

use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::changes::{ChangeFilter, ChangesOptions, ChangesResponse, ChangesStyle};
use crate::checkpoint::{replication_id, CheckpointOptions, CheckpointPeer, Checkpointer};
use crate::error::{Error, Result};
use crate::reader::{OpenRevResult, RevsDiffEntry};
use crate::types::{Cancellation, RevId, Seq};
use crate::writer::BulkResults;

/// Default changes fetched per replication round.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A database replication can read from and write to.
pub trait ReplicationPeer: CheckpointPeer {
    /// Stable identity, used to name checkpoints.
    fn peer_id(&self) -> impl Future<Output = Result<String>> + Send;

    /// Up to `opts.limit` matching changes after `opts.since`.
    fn changes_page(&self, opts: ChangesOptions) -> impl Future<Output = Result<ChangesResponse>> + Send;

    fn revs_diff(
        &self,
        revs: BTreeMap<String, Vec<RevId>>,
    ) -> impl Future<Output = Result<BTreeMap<String, RevsDiffEntry>>> + Send;

    /// The given revisions with `_revisions` and inline attachments.
    fn open_revs(&self, id: &str, revs: Vec<RevId>) -> impl Future<Output = Result<Vec<OpenRevResult>>> + Send;

    /// Stores revisions as they are (`new_edits = false`).
    fn write_replicated(&self, docs: Vec<Value>) -> impl Future<Output = Result<BulkResults>> + Send;
}

/// What to replicate and how.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub batch_size: usize,
    pub filter: Option<ChangeFilter>,
    pub query_params: Map<String, Value>,
    pub view: Option<String>,
    pub selector: Option<Value>,
    pub doc_ids: Option<Vec<String>>,
    pub checkpoint: CheckpointOptions,
    pub cancel: Cancellation,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            filter: None,
            query_params: Map::new(),
            view: None,
            selector: None,
            doc_ids: None,
            checkpoint: CheckpointOptions::default(),
            cancel: Cancellation::new(),
        }
    }
}

impl ReplicationOptions {
    /// Everything that narrows the replicated set, as one string.
    ///
    /// Predicate filters cannot be identified, so they all share one key.
    fn filter_key(&self) -> String {
        let filter = match &self.filter {
            None => String::new(),
            Some(ChangeFilter::Named(name)) => name.clone(),
            Some(ChangeFilter::Predicate(_)) => "<predicate>".to_string(),
        };
        let json = |value: Option<Value>| value.map(|v| v.to_string()).unwrap_or_default();
        let query = if self.query_params.is_empty() {
            String::new()
        } else {
            Value::Object(self.query_params.clone()).to_string()
        };
        format!(
            "{filter}{query}{}{}{}",
            self.view.as_deref().unwrap_or_default(),
            json(self.selector.clone()),
            json(self.doc_ids.as_ref().map(|ids| Value::from(ids.clone()))),
        )
    }

    fn changes_options(&self, since: Seq) -> ChangesOptions {
        ChangesOptions {
            since,
            limit: Some(self.batch_size.max(1)),
            style: ChangesStyle::AllDocs,
            doc_ids: self.doc_ids.clone(),
            filter: self.filter.clone(),
            view: self.view.clone(),
            selector: self.selector.clone(),
            query_params: self.query_params.clone(),
            ..ChangesOptions::default()
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationResult {
    /// False if any revision failed to write.
    pub ok: bool,
    pub session_id: String,
    /// Sequence the run resumed after.
    pub start_seq: Seq,
    /// Last source sequence fully copied.
    pub last_seq: Seq,
    /// Revisions fetched from the source.
    pub docs_read: usize,
    pub docs_written: usize,
    pub doc_write_failures: usize,
    pub cancelled: bool,
}

/// Copies every revision the target lacks, resuming from the last checkpoint.
///
/// # Errors
///
/// Peer failures abort the run; revisions copied so far stay copied and the
/// last written checkpoint stays valid. Individual document write failures
/// are only counted.
pub async fn replicate<S, T>(source: &S, target: &T, opts: ReplicationOptions) -> Result<ReplicationResult>
where
    S: ReplicationPeer + ?Sized,
    T: ReplicationPeer + ?Sized,
{
    let source_id = source.peer_id().await?;
    let target_id = target.peer_id().await?;
    let rep_id = replication_id(&source_id, &target_id, &opts.filter_key());
    let session_id = uuid::Uuid::new_v4().simple().to_string();

    let mut checkpointer =
        Checkpointer::new(source, target, rep_id, session_id.clone(), opts.checkpoint, opts.cancel.clone());
    let mut result = ReplicationResult {
        ok: true,
        session_id,
        start_seq: Seq::ZERO,
        last_seq: Seq::ZERO,
        docs_read: 0,
        docs_written: 0,
        doc_write_failures: 0,
        cancelled: false,
    };

    let start_seq = match checkpointer.get_checkpoint().await {
        Ok(seq) => seq,
        Err(Error::Cancelled) => {
            result.cancelled = true;
            return Ok(result);
        }
        Err(e) => return Err(e),
    };
    result.start_seq = start_seq;
    result.last_seq = start_seq;
    info!(id = %checkpointer.id(), since = %start_seq, "replication started");

    let mut since = start_seq;
    loop {
        if opts.cancel.is_cancelled() {
            result.cancelled = true;
            break;
        }

        let page = source.changes_page(opts.changes_options(since)).await?;
        if !page.results.is_empty() {
            copy_page(source, target, &page, &opts.cancel, &mut result).await?;
            if result.cancelled {
                break;
            }
        }
        if page.last_seq <= since {
            break;
        }

        match checkpointer.write_checkpoint(page.last_seq).await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                result.cancelled = true;
                break;
            }
            Err(e) => return Err(e),
        }
        since = page.last_seq;
        result.last_seq = since;
        debug!(id = %checkpointer.id(), last_seq = %since, "replication checkpointed");

        if page.results.is_empty() {
            break;
        }
    }

    result.ok = result.doc_write_failures == 0;
    info!(
        last_seq = %result.last_seq,
        docs_written = result.docs_written,
        failures = result.doc_write_failures,
        cancelled = result.cancelled,
        "replication finished"
    );
    Ok(result)
}

/// Copies the revisions of one page the target lacks.
async fn copy_page<S, T>(
    source: &S,
    target: &T,
    page: &ChangesResponse,
    cancel: &Cancellation,
    result: &mut ReplicationResult,
) -> Result<()>
where
    S: ReplicationPeer + ?Sized,
    T: ReplicationPeer + ?Sized,
{
    let mut wanted: BTreeMap<String, Vec<RevId>> = BTreeMap::new();
    for event in &page.results {
        let revs = wanted.entry(event.id.clone()).or_default();
        for change in &event.changes {
            revs.push(RevId::parse(&change.rev)?);
        }
    }

    let diff = target.revs_diff(wanted).await?;
    let mut docs = Vec::new();
    for (id, entry) in diff {
        if cancel.is_cancelled() {
            result.cancelled = true;
            return Ok(());
        }
        let revs = entry
            .missing
            .iter()
            .map(|rev| RevId::parse(rev))
            .collect::<Result<Vec<_>>>()?;
        for found in source.open_revs(&id, revs).await? {
            match found {
                OpenRevResult::Ok(doc) => docs.push(doc),
                OpenRevResult::Missing(rev) => debug!(id = %id, rev = %rev, "revision vanished from source"),
            }
        }
    }
    result.docs_read += docs.len();
    if docs.is_empty() {
        return Ok(());
    }
    if cancel.is_cancelled() {
        result.cancelled = true;
        return Ok(());
    }

    for outcome in target.write_replicated(docs).await? {
        match outcome {
            Ok(_) => result.docs_written += 1,
            Err(e) => {
                warn!(error = %e, "replicated write failed");
                result.doc_write_failures += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_filter_key_tracks_narrowing_options() {
        let plain = ReplicationOptions::default();
        assert_eq!(plain.filter_key(), "");

        let named = ReplicationOptions {
            filter: Some(ChangeFilter::Named("app/mine".into())),
            ..Default::default()
        };
        let ids = ReplicationOptions {
            doc_ids: Some(vec!["a".into()]),
            ..Default::default()
        };
        let predicate = ReplicationOptions {
            filter: Some(ChangeFilter::Predicate(Arc::new(|_: &Value| true))),
            ..Default::default()
        };
        assert_eq!(named.filter_key(), "app/mine");
        assert_eq!(ids.filter_key(), r#"["a"]"#);
        assert_ne!(predicate.filter_key(), plain.filter_key());
    }

    #[test]
    fn test_changes_options_use_all_leaves() {
        let opts = ReplicationOptions { batch_size: 7, ..Default::default() };
        let changes = opts.changes_options(Seq::from_raw(3));
        assert_eq!(changes.since, Seq::from_raw(3));
        assert_eq!(changes.limit, Some(7));
        assert_eq!(changes.style, ChangesStyle::AllDocs);
        assert!(!changes.include_docs);
    }
}
