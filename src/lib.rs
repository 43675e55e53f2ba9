//! # eventide - Event Store Engine
//!
//! eventide is an append-only, per-key ordered event log built on a
//! transactional, partition-oriented store. It provides:
//!
//! - **Append with optimistic concurrency**: every append names the head it
//!   expects, and exactly one of two racing appends wins
//! - **Idempotent retries**: an append carrying an already-used idempotency
//!   key is a no-op
//! - **Ordered reads**: of one stream, of one category, or of the whole store
//! - **Change notifications**: coarse "something was appended up to revision
//!   r" messages for downstream subscribers
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     EventStore (async API)                       │
//! │        append · head · read · read_all · read_category           │
//! └───────────────┬───────────────────────────────┬─────────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │ Writer                        │ │ Readers                       │
//! │ revisions · head condition ·  │ │ range normalization · slice   │
//! │ slice registration · token    │ │ directory · filter compiler   │
//! └───────────────┬───────────────┘ └───────────────┬───────────────┘
//!                 └───────────────┬─────────────────┘
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            BackingStore (SqliteStore: dedicated thread)          │
//! │   events table + slice/category indexes · metadata · tokens      │
//! └────────────────────────────────┬────────────────────────────────┘
//!                                  │ change feed
//!                                  ▼
//!                 Notifier ──► EventBus ──► Subscriber (read_all catch-up)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Total order**: revisions compare as strings in commit order and never
//!    repeat
//! 2. **Atomic appends**: events, head and slice registrations of one append
//!    are written together or not at all
//! 3. **Head discipline**: a stream's head only moves inside its append
//!    transaction
//! 4. **Complete whole-store reads**: every slice holding an event is listed
//!    in the slice directory
//! 5. **Watermarked notifications**: a notification's revision is the maximum
//!    of its batch
//!
//! ## Module Organization
//!
//! - [`revision`]: Revision codec, sentinels and generator
//! - [`range`]: Read options and their normalization
//! - [`slice`]: Slice prefixes and the slice directory
//! - [`filter`]: Filter predicates and their compiler
//! - [`store`]: The backing store contract
//! - [`sqlite`]: SQLite backing store
//! - [`writer`]: Transactional append
//! - [`reader`]: Lazy readers
//! - [`api`]: [`EventStore`] (main entry point)
//! - [`notify`]: Change-feed notifier
//! - [`bus`]: Event bus and in-process broadcast bus
//! - [`subscription`]: Catch-up subscribers
//! - [`config`], [`logging`], [`error`]

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;

pub mod config;

pub mod logging;

/// Revision identifiers: codec, sentinels and monotonic generation.
pub mod revision;

pub mod range;

pub mod slice;

/// Predicate trees over event documents, compiled to SQLite expressions.
pub mod filter;

/// Domain types: pending and committed events, append options and outcomes.
pub mod types;

/// The contract between the engine and its substrate.
pub mod store;

pub mod sqlite;

pub mod writer;

pub mod reader;

/// Async API for eventide.
///
/// The main entry point is [`EventStore`](api::EventStore).
pub mod api;

pub mod notify;

pub mod bus;

pub mod subscription;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::EventStore;
pub use config::{SqliteOptions, StoreConfig};
pub use error::{Error, Result};
pub use filter::{Comparator, Filter};
pub use range::{Direction, InclusiveRange, ReadOptions};
pub use reader::EventStream;
pub use revision::{Revision, RevisionGenerator};
pub use slice::Slice;
pub use sqlite::SqliteStore;
pub use store::{BackingStore, ChangeFeed, ChangeRecord, StoreError};
pub use types::{AppendOptions, AppendResult, CommittedEvent, PendingEvent};

pub use bus::{BroadcastBus, BusMessage, BusSubscription, EventBus};
pub use notify::{Notification, Notifier};
pub use subscription::Subscriber;
