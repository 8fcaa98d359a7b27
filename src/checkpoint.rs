//! # Replication Checkpoints
//!
//! A replication records how far it got in a `_local/` document on both
//! peers. On restart the two records are compared to find a sequence both
//! sides agree on:
//!
//! ```text
//!   Uninitialized ──► ReadTarget ──► ReadSource ──► Compare ──► Resolved(seq)
//!                        │ 404          │ 404
//!                        ▼              ▼
//!                   Resolved(0)    seed source with 0
//!                                  (4xx: trust target, stop writing source)
//! ```
//!
//! ## Comparing Records
//!
//! - different `version` → 0
//! - no `version` (legacy) → the shared `last_seq` if both agree, else 0
//! - same `session_id` → the source's `last_seq`
//! - otherwise walk both `history` lists (newest first): if the source's
//!   newest session appears anywhere in the target's history, use the source
//!   entry; if the target's newest session appears in the rest of the source
//!   history, use the target entry; else drop both heads and repeat. Running
//!   out of history means 0.
//!
//! ```text
//!   source history: [{10, S2}, {5, S1}]
//!   target history: [{5, S1}]
//!   S2 not in target; S1 in source rest  ──►  resume at 5
//! ```
//!
//! ## Writing
//!
//! Each write re-reads the peer's record, skips unchanged sequences, drops
//! older entries of this session, prepends `{last_seq, session_id}` and keeps
//! [`MAX_HISTORY`] entries. A `409` restarts the read-modify-write, up to
//! `max_retries` times. The target is written first; any other `4xx` from the
//! source turns source checkpointing off for the rest of the session.

use std::future::Future;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{Cancellation, Seq, LOCAL_PREFIX};

/// Format version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

/// History entries kept per checkpoint.
pub const MAX_HISTORY: usize = 5;

/// Value of the `replicator` field.
pub const REPLICATOR_TAG: &str = "sofadb";

/// Conflict retries before a checkpoint write gives up.
pub const DEFAULT_MAX_RETRIES: usize = 16;

// =============================================================================
// Checkpoint Document
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub last_seq: Seq,
    pub session_id: String,
}

/// The persisted record, stored as a local document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_seq: Seq,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicator: Option<String>,
}

impl CheckpointDoc {
    /// A record that has never been written.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            session_id: None,
            last_seq: Seq::ZERO,
            history: Vec::new(),
            version: None,
            replicator: None,
        }
    }

    /// Applies one progress update for `session_id`.
    pub fn record(&mut self, last_seq: Seq, session_id: &str) {
        self.history.retain(|entry| entry.session_id != session_id);
        self.history.insert(
            0,
            HistoryEntry {
                last_seq,
                session_id: session_id.to_string(),
            },
        );
        self.history.truncate(MAX_HISTORY);
        self.session_id = Some(session_id.to_string());
        self.last_seq = last_seq;
        self.version = Some(CHECKPOINT_VERSION);
        self.replicator = Some(REPLICATOR_TAG.to_string());
    }
}

/// A database that can hold checkpoint records.
///
/// `put_checkpoint` must apply the optimistic `_rev` check and report a lost
/// race as a `409` error (for example [`Error::RevConflict`]).
pub trait CheckpointPeer: Send + Sync {
    /// The record, or `None` if absent. A `404` error means the same.
    fn get_checkpoint(&self, id: &str) -> impl Future<Output = Result<Option<CheckpointDoc>>> + Send;

    /// Stores the record.
    fn put_checkpoint(&self, doc: &CheckpointDoc) -> impl Future<Output = Result<()>> + Send;
}

async fn fetch<P: CheckpointPeer + ?Sized>(peer: &P, id: &str) -> Result<Option<CheckpointDoc>> {
    match peer.get_checkpoint(id).await {
        Ok(doc) => Ok(doc),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// A peer that refuses writes for good (not a lost race).
fn refuses(err: &Error) -> bool {
    err.is_client_error() && !err.is_conflict()
}

// =============================================================================
// Comparison
// =============================================================================

/// The sequence both records agree on.
pub fn compare_checkpoints(source: &CheckpointDoc, target: &CheckpointDoc) -> Seq {
    if source.version != target.version {
        return Seq::ZERO;
    }
    match target.version {
        None if source.last_seq == target.last_seq => source.last_seq,
        None => Seq::ZERO,
        Some(CHECKPOINT_VERSION) => {
            if source.session_id.is_some() && source.session_id == target.session_id {
                source.last_seq
            } else {
                compare_history(&source.history, &target.history)
            }
        }
        Some(_) => Seq::ZERO,
    }
}

/// Finds the newest point both histories share.
pub fn compare_history(source: &[HistoryEntry], target: &[HistoryEntry]) -> Seq {
    let (mut source, mut target) = (source, target);
    loop {
        let (Some((s, source_rest)), Some((t, target_rest))) = (source.split_first(), target.split_first())
        else {
            return Seq::ZERO;
        };
        if target.iter().any(|entry| entry.session_id == s.session_id) {
            return s.last_seq;
        }
        if source_rest.iter().any(|entry| entry.session_id == t.session_id) {
            return t.last_seq;
        }
        source = source_rest;
        target = target_rest;
    }
}

/// `_local/` id naming one replication.
///
/// Built from both peers' ids and everything that narrows the replicated
/// set, so a changed filter starts a fresh checkpoint.
pub fn replication_id(source_id: &str, target_id: &str, filter_key: &str) -> String {
    let digest = Md5::digest(format!("{source_id}{target_id}{filter_key}").as_bytes());
    let encoded = STANDARD.encode(digest).replace('/', ".").replace('+', "_");
    format!("{LOCAL_PREFIX}{encoded}")
}

// =============================================================================
// Checkpointer
// =============================================================================

/// Where negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Uninitialized,
    ReadTarget,
    ReadSource,
    Compare,
    Resolved(Seq),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOptions {
    /// Keep a record on the source.
    pub write_source: bool,
    /// Keep a record on the target.
    pub write_target: bool,
    /// `409` retries per write.
    pub max_retries: usize,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            write_source: true,
            write_target: true,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Negotiates and records progress of one replication session.
pub struct Checkpointer<'a, S: ?Sized, T: ?Sized> {
    source: &'a S,
    target: &'a T,
    id: String,
    session_id: String,
    opts: CheckpointOptions,
    state: CheckpointState,
    cancel: Cancellation,
}

impl<'a, S, T> Checkpointer<'a, S, T>
where
    S: CheckpointPeer + ?Sized,
    T: CheckpointPeer + ?Sized,
{
    pub fn new(
        source: &'a S,
        target: &'a T,
        id: impl Into<String>,
        session_id: impl Into<String>,
        opts: CheckpointOptions,
        cancel: Cancellation,
    ) -> Self {
        Self {
            source,
            target,
            id: id.into(),
            session_id: session_id.into(),
            opts,
            state: CheckpointState::Uninitialized,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    /// False once the source refused a write.
    pub fn writes_source(&self) -> bool {
        self.opts.write_source
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn resolve(&mut self, seq: Seq) -> Result<Seq> {
        self.state = CheckpointState::Resolved(seq);
        debug!(id = %self.id, seq = %seq, "checkpoint resolved");
        Ok(seq)
    }

    /// The sequence replication should resume after.
    pub async fn get_checkpoint(&mut self) -> Result<Seq> {
        self.check_cancelled()?;

        if !self.opts.write_source {
            self.state = CheckpointState::ReadTarget;
            let seq = fetch(self.target, &self.id).await?.map(|doc| doc.last_seq).unwrap_or_default();
            return self.resolve(seq);
        }
        if !self.opts.write_target {
            self.state = CheckpointState::ReadSource;
            let seq = fetch(self.source, &self.id).await?.map(|doc| doc.last_seq).unwrap_or_default();
            return self.resolve(seq);
        }

        self.state = CheckpointState::ReadTarget;
        let Some(target_doc) = fetch(self.target, &self.id).await? else {
            return self.resolve(Seq::ZERO);
        };
        self.check_cancelled()?;

        self.state = CheckpointState::ReadSource;
        let source_doc = match fetch(self.source, &self.id).await? {
            Some(doc) => doc,
            None if target_doc.last_seq == Seq::ZERO => return self.resolve(Seq::ZERO),
            None => {
                self.check_cancelled()?;
                return match self.source.put_checkpoint(&CheckpointDoc::new(self.id.clone())).await {
                    Ok(()) => self.resolve(Seq::ZERO),
                    Err(e) if refuses(&e) => {
                        warn!(id = %self.id, error = %e, "source refused checkpoint, using target record");
                        self.opts.write_source = false;
                        self.resolve(target_doc.last_seq)
                    }
                    Err(e) => {
                        debug!(id = %self.id, error = %e, "seeding source checkpoint failed");
                        self.resolve(Seq::ZERO)
                    }
                };
            }
        };

        self.state = CheckpointState::Compare;
        let seq = compare_checkpoints(&source_doc, &target_doc);
        self.resolve(seq)
    }

    /// Records that everything up to `seq` has been replicated.
    pub async fn write_checkpoint(&mut self, seq: Seq) -> Result<()> {
        if self.opts.write_target {
            update_checkpoint(self.target, &self.id, &self.session_id, seq, self.opts.max_retries, &self.cancel)
                .await?;
        }
        if self.opts.write_source {
            match update_checkpoint(self.source, &self.id, &self.session_id, seq, self.opts.max_retries, &self.cancel)
                .await
            {
                Ok(_) => {}
                Err(e) if refuses(&e) => {
                    warn!(id = %self.id, error = %e, "source refused checkpoint, disabling source checkpoints");
                    self.opts.write_source = false;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// One read-modify-write of a peer's record. Returns `false` if the record
/// already held `seq`.
async fn update_checkpoint<P: CheckpointPeer + ?Sized>(
    peer: &P,
    id: &str,
    session_id: &str,
    seq: Seq,
    max_retries: usize,
    cancel: &Cancellation,
) -> Result<bool> {
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let existing = fetch(peer, id).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if existing.as_ref().is_some_and(|doc| doc.last_seq == seq) {
            return Ok(false);
        }
        let mut doc = existing.unwrap_or_else(|| CheckpointDoc::new(id));
        doc.record(seq, session_id);

        match peer.put_checkpoint(&doc).await {
            Ok(()) => return Ok(true),
            Err(e) if e.is_conflict() && attempts < max_retries => {
                attempts += 1;
                debug!(id, attempts, "checkpoint write conflicted, retrying");
            }
            Err(e) => {
                if e.is_conflict() {
                    info!(id, attempts, "checkpoint write still conflicting, giving up");
                }
                return Err(e);
            }
        }
    }
}
