//! # Async API for eventide
//!
//! [`EventStore`] is the entry point: one value per configured store, cheap to
//! clone, safe to share between tasks. It holds no global state; the backing
//! store and revision generator are handed in (or built by
//! [`EventStore::open_sqlite`]) and shared by `Arc`.
//!
//! ```text
//!  ┌───────────────────────── EventStore (Clone) ─────────────────────────┐
//!  │  config: StoreConfig                                                  │
//!  │  store: Arc<dyn BackingStore> ───────► SqliteStore / any substrate    │
//!  │  generator: Arc<RevisionGenerator>     (one clock, strictly rising)   │
//!  └──────────────────────────────────────────────────────────────────────┘
//!        │ append                │ read / read_all / read_category
//!        ▼                       ▼
//!   writer::append          reader::* (lazy EventStream)
//! ```
//!
//! Every clone shares the generator, so revisions handed out by one process
//! are strictly increasing no matter which clone appends. Clones also share an
//! append lock held from revision generation until the backing store answers,
//! so appends commit in the order their revisions were generated.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventide::{AppendOptions, EventStore, PendingEvent, ReadOptions, SqliteOptions, StoreConfig};
//! use futures::TryStreamExt;
//! use serde_json::json;
//!
//! # async fn example() -> eventide::Result<()> {
//! let store = EventStore::open_sqlite(StoreConfig::new("orders"), SqliteOptions::file("orders.db"))?;
//!
//! let result = store
//!     .append("order/42", vec![PendingEvent::new("placed", json!({ "total": 3 }))], AppendOptions::default())
//!     .await;
//! assert!(result.is_appended());
//!
//! let events: Vec<eventide::CommittedEvent> = store.read("order/42", &ReadOptions::new()).try_collect().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::bus::EventBus;
use crate::config::{SqliteOptions, StoreConfig};
use crate::error::Result;
use crate::notify::Notifier;
use crate::range::ReadOptions;
use crate::reader::{self, EventStream, DEFAULT_PAGE_SIZE};
use crate::revision::{Revision, RevisionGenerator};
use crate::sqlite::SqliteStore;
use crate::store::{BackingStore, ChangeFeed};
use crate::types::{AppendOptions, AppendResult, CommittedEvent, PendingEvent};
use crate::writer;

/// Handle to one event store.
#[derive(Clone)]
pub struct EventStore {
    config: Arc<StoreConfig>,
    store: Arc<dyn BackingStore>,
    generator: Arc<RevisionGenerator>,
    append_lock: Arc<Mutex<()>>,
    page_size: usize,
}

impl EventStore {
    /// Wraps a backing store. `config` names the store in notifications.
    pub fn new(config: StoreConfig, store: Arc<dyn BackingStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            generator: Arc::new(RevisionGenerator::new()),
            append_lock: Arc::new(Mutex::new(())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Opens a SQLite-backed store.
    pub fn open_sqlite(config: StoreConfig, options: SqliteOptions) -> Result<Self> {
        let store = SqliteStore::open(&config, options)?;
        Ok(Self::new(config, Arc::new(store)))
    }

    /// Replaces the revision generator, e.g. to inject a clock.
    pub fn with_generator(mut self, generator: RevisionGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    /// Rows requested per page by readers.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backing_store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends `events` to the stream `key` in one transaction.
    pub async fn append<D: Serialize>(
        &self,
        key: &str,
        events: Vec<PendingEvent<D>>,
        options: AppendOptions,
    ) -> AppendResult {
        let _sequenced = self.append_lock.lock().await;
        writer::append(self.store.as_ref(), &self.generator, key, events, options).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current head of `key`; [`Revision::start`] if the key was never written.
    pub async fn head(&self, key: &str) -> Result<Revision> {
        reader::head(self.store.as_ref(), key).await
    }

    pub fn read<D>(&self, key: &str, options: &ReadOptions) -> EventStream<D>
    where
        D: DeserializeOwned + Send + 'static,
    {
        reader::read(self.store.clone(), key, options, self.page_size)
    }

    pub fn read_all<D>(&self, options: &ReadOptions) -> EventStream<D>
    where
        D: DeserializeOwned + Send + 'static,
    {
        reader::read_all(self.store.clone(), options, self.page_size)
    }

    pub fn read_category<D>(&self, category: &str, options: &ReadOptions) -> EventStream<D>
    where
        D: DeserializeOwned + Send + 'static,
    {
        reader::read_category(self.store.clone(), category, options, self.page_size)
    }

    /// Head of `key` plus its history up to that head, for deciding the next
    /// append. Pass the returned revision as the expected revision.
    pub async fn read_for_append<D>(
        &self,
        key: &str,
        options: &ReadOptions,
    ) -> Result<(Revision, EventStream<D>)>
    where
        D: DeserializeOwned + Send + 'static,
    {
        reader::read_for_append(self.store.clone(), key, options, self.page_size).await
    }

    pub async fn latest<D>(&self, key: &str) -> Result<Option<CommittedEvent<D>>>
    where
        D: DeserializeOwned + Send + 'static,
    {
        reader::latest(self.store.clone(), key).await
    }

    // =========================================================================
    // Change Feed
    // =========================================================================

    /// Committed batches from now on.
    pub fn changes(&self) -> ChangeFeed {
        self.store.changes()
    }

    /// A notifier publishing this store's batches on `bus`.
    pub fn notifier(&self, bus: Arc<dyn EventBus>) -> Notifier {
        Notifier::new(self.config.as_ref().clone(), bus)
    }

    /// Starts a task notifying `bus` of every batch committed from now on.
    pub fn spawn_notifier(&self, bus: Arc<dyn EventBus>) -> tokio::task::JoinHandle<()> {
        let feed = self.changes();
        tokio::spawn(self.notifier(bus).run(feed))
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("config", &self.config)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}
