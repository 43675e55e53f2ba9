#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventide::store::{
    EventQuery, EventRow, MetadataQuery, MetadataRow, Page, TransactOutcome, TransactRequest,
};
use eventide::{
    AppendOptions, BackingStore, ChangeFeed, EventStore, EventStream, PendingEvent, Revision,
    RevisionGenerator, SqliteOptions, SqliteStore, StoreConfig, StoreError,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub const KEY: &str = "counter/1";

pub fn config() -> StoreConfig {
    StoreConfig::new("test")
}

pub fn memory_store() -> EventStore {
    EventStore::open_sqlite(config(), SqliteOptions::in_memory()).expect("open in-memory store")
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn open_file_store(path: &Path) -> EventStore {
    EventStore::open_sqlite(config(), SqliteOptions::file(path)).expect("open file store")
}

pub fn counted(value: i64) -> PendingEvent {
    PendingEvent::new("counted", json!({ "value": value }))
}

/// Appends one event per value, each in its own transaction.
pub async fn append_values(store: &EventStore, key: &str, values: &[i64]) -> Vec<Revision> {
    let mut revisions = Vec::with_capacity(values.len());
    for &value in values {
        let result = store
            .append(key, vec![counted(value)], AppendOptions::default())
            .await;
        revisions.push(result.revision().cloned().expect("append succeeded"));
    }
    revisions
}

pub async fn collect_values(stream: EventStream<Value>) -> Vec<i64> {
    stream
        .map(|event| {
            event.expect("read succeeded").data["value"]
                .as_i64()
                .expect("numeric value")
        })
        .collect()
        .await
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Clocks
// =============================================================================

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn at(ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(ms)))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn generator(&self) -> RevisionGenerator {
        let inner = Arc::clone(&self.0);
        RevisionGenerator::with_clock(move || inner.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Instrumented Stores
// =============================================================================

/// Counts requests before delegating to an inner store.
pub struct CountingStore {
    inner: Arc<dyn BackingStore>,
    pub event_queries: AtomicUsize,
    pub metadata_queries: AtomicUsize,
    pub page_sizes: std::sync::Mutex<Vec<usize>>,
}

impl CountingStore {
    pub fn wrap(inner: Arc<dyn BackingStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            event_queries: AtomicUsize::new(0),
            metadata_queries: AtomicUsize::new(0),
            page_sizes: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn event_queries(&self) -> usize {
        self.event_queries.load(Ordering::SeqCst)
    }

    pub fn metadata_queries(&self) -> usize {
        self.metadata_queries.load(Ordering::SeqCst)
    }

    pub fn page_sizes(&self) -> Vec<usize> {
        self.page_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackingStore for CountingStore {
    async fn get_metadata(&self, pk: &str, sk: &str) -> Result<Option<MetadataRow>, StoreError> {
        self.inner.get_metadata(pk, sk).await
    }

    async fn query_events(&self, query: EventQuery) -> Result<Page<EventRow>, StoreError> {
        self.event_queries.fetch_add(1, Ordering::SeqCst);
        self.page_sizes.lock().unwrap().push(query.page_size);
        self.inner.query_events(query).await
    }

    async fn query_metadata(&self, query: MetadataQuery) -> Result<Page<MetadataRow>, StoreError> {
        self.metadata_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query_metadata(query).await
    }

    async fn transact_write(&self, request: TransactRequest) -> Result<TransactOutcome, StoreError> {
        self.inner.transact_write(request).await
    }

    fn changes(&self) -> ChangeFeed {
        self.inner.changes()
    }
}

/// A store whose every request fails as if the substrate were gone.
pub struct FailingStore {
    feed: broadcast::Sender<Vec<eventide::ChangeRecord>>,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        let (feed, _) = broadcast::channel(1);
        Arc::new(Self { feed })
    }
}

#[async_trait]
impl BackingStore for FailingStore {
    async fn get_metadata(&self, _pk: &str, _sk: &str) -> Result<Option<MetadataRow>, StoreError> {
        Err(StoreError::Closed)
    }

    async fn query_events(&self, _query: EventQuery) -> Result<Page<EventRow>, StoreError> {
        Err(StoreError::Closed)
    }

    async fn query_metadata(&self, _query: MetadataQuery) -> Result<Page<MetadataRow>, StoreError> {
        Err(StoreError::Closed)
    }

    async fn transact_write(&self, _request: TransactRequest) -> Result<TransactOutcome, StoreError> {
        Err(StoreError::Closed)
    }

    fn changes(&self) -> ChangeFeed {
        self.feed.subscribe()
    }
}

/// Opens a bare SQLite backing store, for wrapping.
pub fn sqlite_backing() -> Arc<dyn BackingStore> {
    Arc::new(SqliteStore::open_in_memory(&config()).expect("open sqlite store"))
}
