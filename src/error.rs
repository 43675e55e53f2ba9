//! # Error Handling for eventide
//!
//! A single crate-wide error enum ([`Error`]) covers every failure a caller can
//! observe from reads, configuration and the notifier. Appends are different:
//! they never return `Err`, they return an
//! [`AppendResult`](crate::types::AppendResult) whose aborted variants carry the
//! underlying error.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Configuration | Missing table name, bad JSON | Fail fast at startup |
//! | Validation | Revision with a symbol outside the alphabet | Fix the caller |
//! | Serialization | Payload does not match the requested type | Fix the caller |
//! | Store | SQLite failure, store thread gone | Log and surface |
//!
//! Backing-store failures are classified once, at the adapter boundary, into
//! [`StoreError`]. Nothing above the adapter inspects SQLite error codes.

use thiserror::Error;

use crate::store::StoreError;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in eventide operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The store descriptor or store options are invalid.
    ///
    /// Raised by [`StoreConfig::parse`](crate::config::StoreConfig::parse) and
    /// when opening a store. Not retryable: the process should refuse to start.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A string that is not a well-formed revision.
    #[error("invalid revision '{0}'")]
    InvalidRevision(String),

    /// An event payload could not be encoded or decoded.
    ///
    /// Payloads are validated at the serialization boundary: writing a value
    /// that has no JSON representation, or reading events into a type that
    /// does not match what was stored, ends up here.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
