//! # Error Handling for SofaDB
//!
//! A single error enum ([`Error`]) covers every failure mode in the crate, from
//! document validation through checkpoint negotiation to SQLite failures.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `Display` from the `#[error(...)]` attributes and `From`
//! from the `#[from]` attributes, so `?` converts storage and JSON errors into
//! [`Error`] automatically.
//!
//! ## Error Categories
//!
//! Every variant maps to an HTTP-style status code via [`Error::status`]. The
//! replication layer relies on these codes: a `409` from a checkpoint write means
//! "re-read and retry", any other `4xx` from the source means "stop writing
//! checkpoints there".
//!
//! | Category | Variants | Status | Typical Response |
//! |----------|----------|--------|------------------|
//! | Validation | `DocValidation`, `InvalidRev`, `ReservedId`, `BadRequest` | 400 | Fix the input |
//! | Precondition | `MissingId`, `MissingStub` | 412 | Fix the input |
//! | Conflict | `RevConflict` | 409 | Re-read and retry |
//! | Absence | `MissingDoc` | 404 | Surface to caller |
//! | Permission | `Forbidden` | 403 | Disable the side effect |
//! | Internal | `BadArg`, `BuiltIn`, `Eval`, `Sqlite`, `Json`, `Schema` | 500 | Log and investigate |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SofaDB operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Document Validation
    // =========================================================================

    /// A document carried an unknown `_`-prefixed member, or was otherwise
    /// structurally invalid. Never retried.
    #[error("doc validation: {0}")]
    DocValidation(String),

    /// A revision string did not match `<int>-<token>`.
    #[error("invalid rev format: {0}")]
    InvalidRev(String),

    /// A replicated write arrived without an `_id`.
    #[error("_id is required for puts")]
    MissingId,

    /// A document id starts with `_` but is neither a design nor a local doc.
    #[error("only reserved document ids may start with underscore: {0}")]
    ReservedId(String),

    /// An attachment stub references content this store does not hold.
    #[error("unknown stub attachment with digest {0}")]
    MissingStub(String),

    // =========================================================================
    // Concurrency
    // =========================================================================

    /// A new edit lost the conflict check against the current revision tree.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the document to learn the current winning revision
    /// 2. Re-apply the change on top of it
    /// 3. Retry the write with the fresh `_rev`
    #[error("document update conflict on '{0}'")]
    RevConflict(String),

    // =========================================================================
    // Lookup
    // =========================================================================

    /// The requested document, revision, design function or attachment is absent.
    ///
    /// The payload is the reason: `missing`, `deleted`, or a more specific
    /// `missing json key: ...` for design-document lookups.
    #[error("not found: {0}")]
    MissingDoc(String),

    // =========================================================================
    // Request Shape
    // =========================================================================

    /// Malformed attachment payload (invalid base64). Aborts the owning batch.
    #[error("bad argument: {0}")]
    BadArg(String),

    /// A query or feed was configured inconsistently.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A peer refused the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    // =========================================================================
    // User Code
    // =========================================================================

    /// A built-in reduce (`_sum`, `_stats`) received values it cannot combine.
    #[error("builtin reduce error: {0}")]
    BuiltIn(String),

    /// A user-supplied map, reduce or filter script failed to parse or run.
    #[error("script error: {0}")]
    Eval(String),

    // =========================================================================
    // Replication Peers
    // =========================================================================

    /// A replication peer answered with a non-success status.
    #[error("peer error {status}: {reason}")]
    Peer {
        /// HTTP-style status code reported by the peer
        status: u16,
        /// Human readable reason
        reason: String,
    },

    /// The operation was cancelled before it touched either peer.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored or supplied JSON value could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch, configuration problem, or a dead worker thread.
    #[error("schema error: {0}")]
    Schema(String),
}

impl Error {
    /// HTTP-style status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            Error::DocValidation(_)
            | Error::InvalidRev(_)
            | Error::ReservedId(_)
            | Error::BadRequest(_) => 400,
            Error::Forbidden(_) => 403,
            Error::MissingDoc(_) => 404,
            Error::RevConflict(_) => 409,
            Error::MissingId | Error::MissingStub(_) => 412,
            Error::Peer { status, .. } => *status,
            Error::BadArg(_)
            | Error::BuiltIn(_)
            | Error::Eval(_)
            | Error::Cancelled
            | Error::Sqlite(_)
            | Error::Json(_)
            | Error::Schema(_) => 500,
        }
    }

    /// Short machine-readable name, as reported in per-document write results.
    pub fn name(&self) -> &'static str {
        match self {
            Error::DocValidation(_) => "doc_validation",
            Error::InvalidRev(_) | Error::BadRequest(_) | Error::ReservedId(_) => "bad_request",
            Error::MissingId => "missing_id",
            Error::MissingStub(_) => "missing_stub",
            Error::RevConflict(_) => "conflict",
            Error::MissingDoc(_) => "not_found",
            Error::BadArg(_) => "badarg",
            Error::Forbidden(_) => "forbidden",
            Error::BuiltIn(_) => "builtin_reduce_error",
            Error::Eval(_) => "evaluation_error",
            Error::Peer { .. } => "peer_error",
            Error::Cancelled => "cancelled",
            Error::Sqlite(_) | Error::Json(_) | Error::Schema(_) => "internal_error",
        }
    }

    /// True for `409` responses, which checkpoint writes retry.
    pub fn is_conflict(&self) -> bool {
        self.status() == 409
    }

    /// True for `404` responses.
    pub fn is_not_found(&self) -> bool {
        self.status() == 404
    }

    /// True for any `4xx` response.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
