//! # Domain Types for SofaDB
//!
//! Core identifiers shared by every layer: document ids, revision ids, and
//! change-feed sequence numbers.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Primitive values are wrapped in single-field structs so that a [`Seq`]
//! cannot be passed where a generation number is expected, and so that
//! validation (for example revision-string parsing) happens once, at the edge.
//!
//! ## Invariants
//!
//! - [`Seq`]: strictly increasing across all committed writes, never reused
//! - [`RevId`]: `"<generation>-<hash>"`, generation increases along a branch
//! - [`DocId`]: immutable; `_local/` ids bypass revision trees, `_design/` ids
//!   hold view and filter definitions

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{Error, Result};

// =============================================================================
// Reserved Id Prefixes
// =============================================================================

/// Prefix of local (non-replicated, history-free) documents.
pub const LOCAL_PREFIX: &str = "_local/";

/// Prefix of design documents (views, filters).
pub const DESIGN_PREFIX: &str = "_design/";

// =============================================================================
// Document Identification
// =============================================================================

/// Identifier of a document.
///
/// Ids are opaque strings. Two prefixes are special: [`LOCAL_PREFIX`] and
/// [`DESIGN_PREFIX`]. Any other id starting with `_` is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Creates a document id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the inner string.
    pub fn into_string(self) -> String {
        self.0
    }

    /// True for `_local/...` ids.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    /// True for `_design/...` ids.
    pub fn is_design(&self) -> bool {
        self.0.starts_with(DESIGN_PREFIX)
    }

    /// True for any id beginning with an underscore.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with('_')
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Revision Identification
// =============================================================================

/// A revision id: `"<generation>-<hash>"`.
///
/// Parsing rejects anything that does not start with a decimal generation
/// followed by `-` and a non-empty token.
///
/// # Example
///
/// ```rust
/// use sofadb::types::RevId;
///
/// let rev: RevId = "3-abc".parse()?;
/// assert_eq!(rev.generation, 3);
/// assert_eq!(rev.hash, "abc");
/// assert_eq!(rev.to_string(), "3-abc");
/// # Ok::<(), sofadb::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevId {
    /// Position of the revision along its branch, starting at 1.
    pub generation: u64,
    /// Content-derived or random token.
    pub hash: String,
}

impl RevId {
    /// Builds a revision id from its parts.
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }

    /// Parses `"<int>-<token>"` with a positive generation, failing with
    /// [`Error::InvalidRev`].
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRev(s.to_string());
        let (prefix, hash) = s.split_once('-').ok_or_else(invalid)?;
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) || hash.is_empty() {
            return Err(invalid());
        }
        let generation = prefix.parse::<u64>().map_err(|_| invalid())?;
        if generation == 0 {
            return Err(invalid());
        }
        Ok(Self::new(generation, hash))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RevId> for String {
    fn from(rev: RevId) -> Self {
        rev.to_string()
    }
}

// =============================================================================
// Change Sequence
// =============================================================================

/// Position in the change feed.
///
/// Every committed document write is assigned the next sequence. `Seq::ZERO`
/// means "before the first change" and is what replication starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
    /// The position before any change.
    pub const ZERO: Seq = Seq(0);

    /// Creates a sequence from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the following sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Write Results
// =============================================================================

/// Successful outcome of a single document write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocWriteResult {
    /// The document id (generated for `post`).
    pub id: String,
    /// The revision now current for the write (`0-N` for local docs).
    pub rev: String,
}

// =============================================================================
// Cancellation
// =============================================================================

/// A shared stop signal for long-running work (live feeds, replication,
/// checkpoint negotiation). Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// A fresh, un-cancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and wakes every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once [`Cancellation::cancel`] has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Completes when the flag is raised.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rev_parse_and_display() {
        let rev = RevId::parse("12-deadbeef").unwrap();
        assert_eq!(rev.generation, 12);
        assert_eq!(rev.hash, "deadbeef");
        assert_eq!(rev.to_string(), "12-deadbeef");
    }

    #[test]
    fn test_rev_parse_keeps_dashes_in_hash() {
        let rev = RevId::parse("2-a-b").unwrap();
        assert_eq!(rev.hash, "a-b");
    }

    #[test]
    fn test_rev_parse_rejects_malformed() {
        for bad in ["", "abc", "-x", "1-", "x-1", " 1-a", "1a-b", "0-abc", "00-abc"] {
            assert!(
                matches!(RevId::parse(bad), Err(Error::InvalidRev(_))),
                "expected InvalidRev for {bad:?}"
            );
        }
    }

    #[test]
    fn test_rev_serde_as_string() {
        let rev = RevId::new(3, "abc");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"3-abc\"");
        let back: RevId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
        assert!(serde_json::from_str::<RevId>("\"nope\"").is_err());
    }

    #[test]
    fn test_doc_id_prefixes() {
        assert!(DocId::new("_local/x").is_local());
        assert!(DocId::new("_design/x").is_design());
        assert!(DocId::new("_foo").is_reserved());
        assert!(!DocId::new("foo").is_reserved());
    }

    #[test]
    fn test_seq_ordering() {
        let a = Seq::ZERO;
        let b = a.next();
        assert!(b > a);
        assert_eq!(b.as_raw(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_wakes_waiter() {
        let flag = Cancellation::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(!flag.is_cancelled());
        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());
    }
}
