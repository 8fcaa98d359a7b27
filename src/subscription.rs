//! # Live Change Subscriptions
//!
//! Subscribers receive every change committed after their `since` sequence,
//! first from storage, then as commits happen.
//!
//! ## The Catch-Up + Live Pattern
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Subscription Timeline                            │
//! │                                                                         │
//! │  subscribe(since = 100)                      head = 500                 │
//! │       │                                          │                      │
//! │       ▼                                          ▼                      │
//! │  ┌────────────────────────────────┐  ┌──────────────────────────────┐   │
//! │  │     Catch-up                   │  │     Live                     │   │
//! │  │     read changes 101..500      │  │     each commit notice wakes │   │
//! │  │     page by page               │  │     a re-read past last_seq  │   │
//! │  └────────────────────────────────┘  └──────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The broadcast receiver is created *before* the first catch-up read, so a
//! commit racing the hand-off is either in the read or announced afterwards.
//! Notices only say "something past sequence N exists"; the actual rows
//! (filtered, with bodies) always come from storage. That makes lag harmless:
//! a receiver that fell behind simply re-reads from its last sequence.
//!
//! ## Backpressure
//!
//! The broadcast channel is bounded. `RecvError::Lagged` is logged and turned
//! into a re-read instead of an error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::changes::{ChangeEvent, ChangesResponse};
use crate::error::Result;
use crate::types::{Cancellation, DocId, RevId, Seq};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity for the broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

// =============================================================================
// Commit Notices
// =============================================================================

/// Published by the writer for every committed document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Sequence assigned to the write.
    pub seq: Seq,
    /// Document written.
    pub id: DocId,
    /// Winning revision after the write.
    pub rev: RevId,
    /// True if the winner is a tombstone.
    pub deleted: bool,
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Owns the broadcast channel and the committed head sequence.
///
/// Shared (behind an `Arc`) between the writer thread, which publishes after
/// each commit, and the async API, which hands out receivers.
#[derive(Debug)]
pub struct SubscriptionManager {
    broadcast_tx: broadcast::Sender<ChangeNotice>,
    head_seq: AtomicU64,
}

impl SubscriptionManager {
    /// Creates a manager whose head starts at `head`.
    pub fn new(capacity: usize, head: Seq) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            broadcast_tx,
            head_seq: AtomicU64::new(head.as_raw()),
        }
    }

    /// Returns a new broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.broadcast_tx.subscribe()
    }

    /// Last committed sequence.
    pub fn head_seq(&self) -> Seq {
        Seq::from_raw(self.head_seq.load(Ordering::SeqCst))
    }

    /// Advances the head and broadcasts. Called only after COMMIT.
    pub fn publish(&self, notices: Vec<ChangeNotice>) {
        for notice in notices {
            self.head_seq.fetch_max(notice.seq.as_raw(), Ordering::SeqCst);
            // No receivers is not an error.
            let _ = self.broadcast_tx.send(notice);
        }
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }
}

// =============================================================================
// Changes Subscription
// =============================================================================

/// Reads one page of (already filtered) changes after a sequence.
pub type PageReader = Box<dyn FnMut(Seq) -> BoxFuture<'static, Result<ChangesResponse>> + Send>;

/// A continuous changes feed: catch-up from `since`, then live.
///
/// ```rust,ignore
/// let mut sub = db.subscribe(ChangesOptions::default()).await?;
/// while let Some(change) = sub.next().await {
///     let change = change?;
///     println!("{} -> {}", change.seq, change.id);
/// }
/// ```
pub struct ChangesSubscription {
    receiver: broadcast::Receiver<ChangeNotice>,
    read_page: PageReader,
    last_seq: Seq,
    buffer: VecDeque<ChangeEvent>,
    /// Storage may hold rows past `last_seq` that have not been read.
    stale: bool,
    remaining: Option<usize>,
    cancel: Cancellation,
    ended: bool,
}

impl ChangesSubscription {
    /// Creates a subscription. `receiver` must be obtained before the first
    /// page is read.
    pub fn new(
        receiver: broadcast::Receiver<ChangeNotice>,
        since: Seq,
        limit: Option<usize>,
        read_page: PageReader,
        cancel: Cancellation,
    ) -> Self {
        Self {
            receiver,
            read_page,
            last_seq: since,
            buffer: VecDeque::new(),
            stale: true,
            remaining: limit,
            cancel,
            ended: false,
        }
    }

    /// Sequence of the last storage row examined.
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    /// Stops the feed; `next` returns `None` from now on.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the next matching change.
    ///
    /// Returns `None` once cancelled, once `limit` changes were delivered, or
    /// when the database shuts down.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            if self.ended || self.cancel.is_cancelled() || self.remaining == Some(0) {
                self.ended = true;
                return None;
            }

            if let Some(event) = self.buffer.pop_front() {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(Ok(event));
            }

            if self.stale {
                match (self.read_page)(self.last_seq).await {
                    Ok(page) => {
                        // No progress means storage is drained up to the head.
                        self.stale = page.last_seq > self.last_seq;
                        self.last_seq = self.last_seq.max(page.last_seq);
                        self.buffer.extend(page.results);
                    }
                    Err(e) => {
                        self.ended = true;
                        return Some(Err(e));
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.ended = true;
                }
                notice = self.receiver.recv() => match notice {
                    Ok(notice) => {
                        if notice.seq > self.last_seq {
                            self.stale = true;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, last_seq = %self.last_seq, "subscriber lagged, re-reading");
                        self.stale = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("change broadcast closed");
                        self.ended = true;
                    }
                },
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
