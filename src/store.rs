//! # Backing Store Contract
//!
//! The engine never talks to a database directly. Everything it needs from the
//! substrate is expressed by [`BackingStore`]: two partitioned tables, two
//! secondary indexes on the events table, all-or-nothing conditional
//! transactions with an optional idempotency token, and a change feed.
//!
//! ```text
//!   events table                         metadata table
//!   ┌──────────┬────────────┐            ┌─────────┬─────────┬──────────┐
//!   │ key (pk) │ revision   │            │ pk      │ sk      │ revision │
//!   │          │ (sort)     │            ├─────────┼─────────┼──────────┤
//!   │ slice ───┼─► slice idx│            │ <key>   │ "head"  │ 01JB8... │
//!   │ category ┼─► cat. idx │            │ "slice" │ 01JB8   │   -      │
//!   │ doc      │ (JSON)     │            └─────────┴─────────┴──────────┘
//!   └──────────┴────────────┘
//! ```
//!
//! Failures are classified once, here, into [`StoreError`]. Callers above this
//! module match on [`StoreError::ConditionFailed`] and never on driver codes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::filter::CompiledFilter;
use crate::range::Direction;
use crate::revision::Revision;
use crate::slice::Slice;

/// Sort key of a stream's head row in the metadata table.
pub const HEAD_SORT_KEY: &str = "head";

// =============================================================================
// Errors
// =============================================================================

/// A classified backing-store failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The condition attached to operation `index` of a transaction did not
    /// hold; nothing was written.
    #[error("condition failed on operation {index}")]
    ConditionFailed { index: usize },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store has shut down.
    #[error("store is closed")]
    Closed,

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

// =============================================================================
// Rows
// =============================================================================

/// One event as stored. Serializes to the document that filters address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub key: String,
    pub revision: Revision,
    #[serde(rename = "type")]
    pub event_type: String,
    pub committed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub data: Value,
}

impl EventRow {
    /// Partition of the slice index this row belongs to.
    pub fn slice(&self) -> Slice {
        Slice::of(&self.revision)
    }
}

/// A row of the metadata table: a stream head or a slice directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    pub pk: String,
    pub sk: String,
    pub revision: Option<Revision>,
}

impl MetadataRow {
    pub fn head(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            pk: key.into(),
            sk: HEAD_SORT_KEY.to_string(),
            revision: Some(revision),
        }
    }

    pub fn slice(slice: &Slice) -> Self {
        Self {
            pk: crate::slice::SLICE_PARTITION.to_string(),
            sk: slice.as_str().to_string(),
            revision: None,
        }
    }
}

// =============================================================================
// Writes
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Put {
    Event(EventRow),
    Metadata(MetadataRow),
}

/// Precondition of a single put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Always write, replacing any existing row.
    None,
    /// Fail the transaction if the row exists.
    NotExists,
    /// Leave an existing row untouched without failing.
    SkipIfExists,
    /// Fail unless the existing row holds this revision.
    RevisionEquals(Revision),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub put: Put,
    pub condition: Condition,
}

/// An all-or-nothing group of writes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransactRequest {
    pub ops: Vec<WriteOp>,
    /// Client token; a token seen within its retention window makes the
    /// whole request a no-op.
    pub token: Option<String>,
}

/// Result of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactOutcome {
    /// Rows written. Zero with a token means the token was already consumed.
    pub writes: usize,
}

// =============================================================================
// Queries
// =============================================================================

/// Which ordered partition of the events table to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    Key(String),
    Slice(Slice),
    Category(String),
}

/// One page request against the events table or one of its indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub partition: Partition,
    /// Inclusive revision bounds.
    pub start: Revision,
    pub end: Revision,
    pub direction: Direction,
    /// Maximum matching rows returned.
    pub page_size: usize,
    pub filter: Option<CompiledFilter>,
    /// Resume after this sort key.
    pub exclusive_start: Option<String>,
}

/// One page request against a metadata partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataQuery {
    pub pk: String,
    /// Inclusive sort key bounds.
    pub start: String,
    pub end: String,
    pub direction: Direction,
    pub page_size: usize,
    pub exclusive_start: Option<String>,
}

/// A page of results. `last_evaluated` is set when more rows may follow.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub last_evaluated: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            last_evaluated: None,
        }
    }
}

// =============================================================================
// Change Feed
// =============================================================================

/// A committed event as seen by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub key: String,
    pub revision: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
}

impl From<&EventRow> for ChangeRecord {
    fn from(row: &EventRow) -> Self {
        Self {
            key: row.key.clone(),
            revision: row.revision.clone(),
            category: row.category.clone(),
            event_type: row.event_type.clone(),
        }
    }
}

/// Receiver of committed batches, one message per transaction.
pub type ChangeFeed = broadcast::Receiver<Vec<ChangeRecord>>;

// =============================================================================
// Trait
// =============================================================================

/// The substrate an [`EventStore`](crate::EventStore) runs on.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Point lookup in the metadata table.
    async fn get_metadata(&self, pk: &str, sk: &str) -> Result<Option<MetadataRow>, StoreError>;

    /// One page of event rows in sort order.
    async fn query_events(&self, query: EventQuery) -> Result<Page<EventRow>, StoreError>;

    /// One page of metadata rows in sort order.
    async fn query_metadata(&self, query: MetadataQuery) -> Result<Page<MetadataRow>, StoreError>;

    /// Applies every op or none of them.
    async fn transact_write(&self, request: TransactRequest) -> Result<TransactOutcome, StoreError>;

    /// Subscribes to committed batches from now on.
    fn changes(&self) -> ChangeFeed;
}
