//! # SQLite Backing Store
//!
//! [`SqliteStore`] implements [`BackingStore`] on a single SQLite connection.
//! `Connection` is `!Sync`, so it lives on a dedicated thread and every
//! request travels there over a channel:
//!
//! ```text
//!   async tasks                         dedicated OS thread
//!  ┌────────────┐   mpsc::Request      ┌──────────────────────────┐
//!  │ store.get  ├──────────────────────►│  StoreActor              │
//!  │ store.query├──────────────────────►│   owns Connection        │
//!  │ store.txn  ├──────────────────────►│   runs one request at a  │
//!  └─────▲──────┘                       │   time, in arrival order │
//!        │        oneshot::Response     └────────────┬─────────────┘
//!        └───────────────────────────────────────────┘
//!                                                    │ after COMMIT
//!                                   broadcast::Sender<Vec<ChangeRecord>>
//! ```
//!
//! Because requests are handled one at a time, each transaction sees the
//! effects of every transaction before it. Two appends racing on the same
//! head are decided here: the first one's condition holds, the second one's
//! fails.
//!
//! ## Schema
//!
//! Table and index names come from the [`StoreConfig`] and are always quoted.
//! The events table keeps the row's JSON document in `doc`; filters are
//! evaluated against it with SQLite's JSON functions.
//!
//! ## Idempotency Tokens
//!
//! Tokens live in `<metadata table>_tokens` with the time they were consumed.
//! Expired tokens are purged at the start of every tokened transaction, then
//! the token is inserted inside the same SQL transaction as the writes. A
//! token that is still present turns the request into a no-op that reports
//! zero writes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{SqliteOptions, StoreConfig};
use crate::error::{Error, Result};
use crate::filter::DOCUMENT_COLUMN;
use crate::range::Direction;
use crate::revision::{system_clock_ms, Revision};
use crate::store::{
    BackingStore, ChangeFeed, ChangeRecord, Condition, EventQuery, EventRow, MetadataQuery,
    MetadataRow, Page, Partition, Put, StoreError, TransactOutcome, TransactRequest, WriteOp,
};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

type StoreResult<T> = std::result::Result<T, StoreError>;

// =============================================================================
// Schema
// =============================================================================

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Quoted object names for one configured store.
#[derive(Debug)]
struct Names {
    events: String,
    metadata: String,
    tokens: String,
    slice_index: String,
    category_index: String,
    token_index: String,
}

impl Names {
    fn new(config: &StoreConfig) -> Self {
        Self {
            events: quote(&config.events_table),
            metadata: quote(&config.metadata_table),
            tokens: quote(&format!("{}_tokens", config.metadata_table)),
            slice_index: quote(&config.slice_index),
            category_index: quote(&config.category_index),
            token_index: quote(&format!("{}_tokens_created", config.metadata_table)),
        }
    }

    fn schema(&self) -> String {
        let Names {
            events,
            metadata,
            tokens,
            slice_index,
            category_index,
            token_index,
        } = self;

        format!(
            r#"
CREATE TABLE IF NOT EXISTS {events} (
    key            TEXT NOT NULL,
    revision       TEXT NOT NULL,
    slice          TEXT NOT NULL,
    category       TEXT,
    type           TEXT NOT NULL,
    committed_at   TEXT NOT NULL,
    correlation_id TEXT,
    {DOCUMENT_COLUMN} TEXT NOT NULL,
    PRIMARY KEY (key, revision)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS {slice_index} ON {events}(slice, revision);

CREATE INDEX IF NOT EXISTS {category_index} ON {events}(category, revision);

CREATE TABLE IF NOT EXISTS {metadata} (
    pk       TEXT NOT NULL,
    sk       TEXT NOT NULL,
    revision TEXT,
    PRIMARY KEY (pk, sk)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS {tokens} (
    token      TEXT PRIMARY KEY,
    created_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS {token_index} ON {tokens}(created_ms);
"#
        )
    }
}

// =============================================================================
// Requests
// =============================================================================

enum Request {
    GetMetadata {
        pk: String,
        sk: String,
        response: oneshot::Sender<StoreResult<Option<MetadataRow>>>,
    },
    QueryEvents {
        query: EventQuery,
        response: oneshot::Sender<StoreResult<Page<EventRow>>>,
    },
    QueryMetadata {
        query: MetadataQuery,
        response: oneshot::Sender<StoreResult<Page<MetadataRow>>>,
    },
    Transact {
        request: TransactRequest,
        response: oneshot::Sender<StoreResult<TransactOutcome>>,
    },
}

// =============================================================================
// Actor
// =============================================================================

/// Owns the connection; runs on the store thread.
struct StoreActor {
    conn: Connection,
    names: Names,
    token_ttl: Duration,
    feed: broadcast::Sender<Vec<ChangeRecord>>,
}

enum Applied {
    Written,
    Skipped,
    Failed,
}

impl StoreActor {
    fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.blocking_recv() {
            self.handle(request);
        }
        debug!(table = %self.names.events, "sqlite store thread exiting");
    }

    fn handle(&mut self, request: Request) {
        // A dropped receiver means the caller stopped waiting; nothing to do.
        match request {
            Request::GetMetadata { pk, sk, response } => {
                let _ = response.send(self.get_metadata(&pk, &sk));
            }
            Request::QueryEvents { query, response } => {
                let _ = response.send(self.query_events(&query));
            }
            Request::QueryMetadata { query, response } => {
                let _ = response.send(self.query_metadata(&query));
            }
            Request::Transact { request, response } => {
                let _ = response.send(self.transact(request));
            }
        }
    }

    fn get_metadata(&self, pk: &str, sk: &str) -> StoreResult<Option<MetadataRow>> {
        let sql = format!(
            "SELECT pk, sk, revision FROM {} WHERE pk = ?1 AND sk = ?2",
            self.names.metadata
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![pk, sk], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .optional()?;

        Ok(row.map(|(pk, sk, revision)| MetadataRow {
            pk,
            sk,
            revision: revision.map(Revision::from_stored),
        }))
    }

    fn query_events(&self, query: &EventQuery) -> StoreResult<Page<EventRow>> {
        let column = match &query.partition {
            Partition::Key(_) => "key",
            Partition::Slice(_) => "slice",
            Partition::Category(_) => "category",
        };
        let partition = match &query.partition {
            Partition::Key(key) => key.clone(),
            Partition::Slice(slice) => slice.as_str().to_string(),
            Partition::Category(category) => category.clone(),
        };
        let (order, resume) = match query.direction {
            Direction::Forward => ("ASC", ">"),
            Direction::Backward => ("DESC", "<"),
        };

        let mut sql = format!(
            "SELECT {DOCUMENT_COLUMN} FROM {} WHERE {column} = :partition AND revision >= :start AND revision <= :end",
            self.names.events
        );
        let mut bindings: Vec<(String, SqlValue)> = vec![
            (":partition".to_string(), SqlValue::Text(partition)),
            (":start".to_string(), SqlValue::Text(query.start.as_str().to_string())),
            (":end".to_string(), SqlValue::Text(query.end.as_str().to_string())),
            (":limit".to_string(), SqlValue::Integer(query.page_size as i64)),
        ];

        if let Some(after) = &query.exclusive_start {
            sql.push_str(&format!(" AND revision {resume} :after"));
            bindings.push((":after".to_string(), SqlValue::Text(after.clone())));
        }

        if let Some(filter) = &query.filter {
            sql.push_str(&format!(" AND {}", filter.expression));
            for (name, path) in &filter.names {
                bindings.push((name.clone(), SqlValue::Text(path.clone())));
            }
            for (name, value) in &filter.values {
                bindings.push((name.clone(), sql_value(value)));
            }
        }

        sql.push_str(&format!(" ORDER BY revision {order} LIMIT :limit"));

        let params: Vec<(&str, &dyn ToSql)> = bindings
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let docs = stmt
            .query_map(params.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let items = docs
            .iter()
            .map(|doc| {
                serde_json::from_str::<EventRow>(doc)
                    .map_err(|e| StoreError::Corrupt(format!("event document: {e}")))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let last_evaluated = if items.len() == query.page_size {
            items.last().map(|row| row.revision.as_str().to_string())
        } else {
            None
        };

        Ok(Page {
            items,
            last_evaluated,
        })
    }

    fn query_metadata(&self, query: &MetadataQuery) -> StoreResult<Page<MetadataRow>> {
        let (order, resume) = match query.direction {
            Direction::Forward => ("ASC", ">"),
            Direction::Backward => ("DESC", "<"),
        };

        let mut sql = format!(
            "SELECT pk, sk, revision FROM {} WHERE pk = :pk AND sk >= :start AND sk <= :end",
            self.names.metadata
        );
        let limit = query.page_size as i64;
        let mut bindings: Vec<(&str, &dyn ToSql)> = vec![
            (":pk", &query.pk as &dyn ToSql),
            (":start", &query.start as &dyn ToSql),
            (":end", &query.end as &dyn ToSql),
            (":limit", &limit as &dyn ToSql),
        ];
        if let Some(after) = &query.exclusive_start {
            sql.push_str(&format!(" AND sk {resume} :after"));
            bindings.push((":after", after as &dyn ToSql));
        }
        sql.push_str(&format!(" ORDER BY sk {order} LIMIT :limit"));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let items = stmt
            .query_map(bindings.as_slice(), |row| {
                Ok(MetadataRow {
                    pk: row.get(0)?,
                    sk: row.get(1)?,
                    revision: row.get::<_, Option<String>>(2)?.map(Revision::from_stored),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let last_evaluated = if items.len() == query.page_size {
            items.last().map(|row| row.sk.clone())
        } else {
            None
        };

        Ok(Page {
            items,
            last_evaluated,
        })
    }

    fn transact(&mut self, request: TransactRequest) -> StoreResult<TransactOutcome> {
        let names = &self.names;
        let ttl_ms = self.token_ttl.as_millis() as i64;
        let tx = self.conn.transaction()?;

        if let Some(token) = &request.token {
            let now = system_clock_ms() as i64;
            tx.execute(
                &format!("DELETE FROM {} WHERE created_ms <= ?1", names.tokens),
                params![now - ttl_ms],
            )?;
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO {} (token, created_ms) VALUES (?1, ?2) ON CONFLICT(token) DO NOTHING",
                    names.tokens
                ),
                params![token, now],
            )?;
            if inserted == 0 {
                debug!(token = %token, "idempotency token already consumed");
                return Ok(TransactOutcome { writes: 0 });
            }
        }

        let mut writes = 0;
        let mut changes = Vec::new();
        for (index, op) in request.ops.iter().enumerate() {
            match apply(&tx, names, op)? {
                Applied::Written => writes += 1,
                Applied::Skipped => {}
                Applied::Failed => {
                    debug!(index, "transaction condition failed, rolling back");
                    return Err(StoreError::ConditionFailed { index });
                }
            }
            if let Put::Event(row) = &op.put {
                changes.push(ChangeRecord::from(row));
            }
        }

        tx.commit()?;

        if !changes.is_empty() {
            // No subscribers is not an error.
            let _ = self.feed.send(changes);
        }

        Ok(TransactOutcome { writes })
    }
}

fn apply(tx: &Transaction<'_>, names: &Names, op: &WriteOp) -> StoreResult<Applied> {
    match &op.put {
        Put::Event(row) => apply_event(tx, names, row, &op.condition),
        Put::Metadata(row) => apply_metadata(tx, names, row, &op.condition),
    }
}

fn apply_event(
    tx: &Transaction<'_>,
    names: &Names,
    row: &EventRow,
    condition: &Condition,
) -> StoreResult<Applied> {
    let doc = serde_json::to_string(row)
        .map_err(|e| StoreError::Corrupt(format!("event document: {e}")))?;
    let columns = format!(
        "{} (key, revision, slice, category, type, committed_at, correlation_id, {DOCUMENT_COLUMN}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        names.events
    );
    let slice = row.slice();
    let revision = row.revision.as_str();
    let values = params![
        row.key,
        revision,
        slice.as_str(),
        row.category,
        row.event_type,
        row.committed_at,
        row.correlation_id,
        doc,
    ];

    match condition {
        Condition::None => {
            tx.execute(&format!("INSERT OR REPLACE INTO {columns}"), values)?;
            Ok(Applied::Written)
        }
        Condition::NotExists | Condition::SkipIfExists => {
            let inserted =
                tx.execute(&format!("INSERT INTO {columns} ON CONFLICT DO NOTHING"), values)?;
            Ok(match (inserted, condition) {
                (0, Condition::SkipIfExists) => Applied::Skipped,
                (0, _) => Applied::Failed,
                _ => Applied::Written,
            })
        }
        // The revision is part of the primary key: only the row it names can match.
        Condition::RevisionEquals(expected) if expected != &row.revision => Ok(Applied::Failed),
        Condition::RevisionEquals(_) => {
            let updated = tx.execute(
                &format!(
                    "UPDATE {} SET category = ?3, type = ?4, committed_at = ?5, correlation_id = ?6, {DOCUMENT_COLUMN} = ?7 WHERE key = ?1 AND revision = ?2",
                    names.events
                ),
                params![
                    row.key,
                    row.revision.as_str(),
                    row.category,
                    row.event_type,
                    row.committed_at,
                    row.correlation_id,
                    doc,
                ],
            )?;
            Ok(if updated == 1 { Applied::Written } else { Applied::Failed })
        }
    }
}

fn apply_metadata(
    tx: &Transaction<'_>,
    names: &Names,
    row: &MetadataRow,
    condition: &Condition,
) -> StoreResult<Applied> {
    let revision = row.revision.as_ref().map(Revision::as_str);

    match condition {
        // An unconditional put never moves a stored revision backwards.
        Condition::None => {
            tx.execute(
                &format!(
                    "INSERT INTO {} (pk, sk, revision) VALUES (?1, ?2, ?3) ON CONFLICT(pk, sk) DO UPDATE SET revision = CASE WHEN revision IS NULL OR excluded.revision > revision THEN excluded.revision ELSE revision END",
                    names.metadata
                ),
                params![row.pk, row.sk, revision],
            )?;
            Ok(Applied::Written)
        }
        Condition::NotExists | Condition::SkipIfExists => {
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO {} (pk, sk, revision) VALUES (?1, ?2, ?3) ON CONFLICT(pk, sk) DO NOTHING",
                    names.metadata
                ),
                params![row.pk, row.sk, revision],
            )?;
            Ok(match (inserted, condition) {
                (0, Condition::SkipIfExists) => Applied::Skipped,
                (0, _) => Applied::Failed,
                _ => Applied::Written,
            })
        }
        Condition::RevisionEquals(expected) => {
            let updated = tx.execute(
                &format!(
                    "UPDATE {} SET revision = ?3 WHERE pk = ?1 AND sk = ?2 AND revision = ?4",
                    names.metadata
                ),
                params![row.pk, row.sk, revision, expected.as_str()],
            )?;
            Ok(if updated == 1 { Applied::Written } else { Applied::Failed })
        }
    }
}

/// Scalar filter value as an SQLite value. Booleans bind as 0/1, which is how
/// `json_extract` returns JSON booleans.
fn sql_value(value: &serde_json::Value) -> SqlValue {
    use serde_json::Value;

    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Async handle to a SQLite-backed store. Cheap to clone; the store thread
/// exits when the last handle is dropped.
#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<Request>,
    feed: broadcast::Sender<Vec<ChangeRecord>>,
}

impl SqliteStore {
    /// Opens (creating if necessary) the store described by `config`.
    pub fn open(config: &StoreConfig, options: SqliteOptions) -> Result<Self> {
        config.validate()?;

        let conn = match &options.path {
            Some(path) => open_file(path)?,
            None => Connection::open_in_memory().map_err(StoreError::from)?,
        };

        let names = Names::new(config);
        conn.execute_batch(&names.schema())
            .map_err(StoreError::from)?;
        debug!(store = %config.name, path = ?options.path, "sqlite schema ready");

        let (feed, _) = broadcast::channel(options.feed_capacity.max(1));
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

        let actor = StoreActor {
            conn,
            names,
            token_ttl: options.token_ttl,
            feed: feed.clone(),
        };

        std::thread::Builder::new()
            .name(format!("eventide-sqlite-{}", config.name))
            .spawn(move || actor.run(rx))
            .map_err(|e| Error::Config(format!("failed to spawn store thread: {e}")))?;

        Ok(Self { tx, feed })
    }

    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        Self::open(config, SqliteOptions::in_memory())
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> Request,
    ) -> StoreResult<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| StoreError::Closed)?;
        response_rx.await.map_err(|_| StoreError::Closed)?
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(StoreError::from)?;
    conn.execute_batch("PRAGMA journal_mode = WAL")
        .map_err(StoreError::from)?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")
        .map_err(StoreError::from)?;
    if let Err(e) = conn.busy_timeout(Duration::from_secs(5)) {
        warn!(error = %e, "could not set busy timeout");
    }
    Ok(conn)
}

#[async_trait]
impl BackingStore for SqliteStore {
    async fn get_metadata(&self, pk: &str, sk: &str) -> StoreResult<Option<MetadataRow>> {
        let (pk, sk) = (pk.to_string(), sk.to_string());
        self.call(|response| Request::GetMetadata { pk, sk, response })
            .await
    }

    async fn query_events(&self, query: EventQuery) -> StoreResult<Page<EventRow>> {
        self.call(|response| Request::QueryEvents { query, response })
            .await
    }

    async fn query_metadata(&self, query: MetadataQuery) -> StoreResult<Page<MetadataRow>> {
        self.call(|response| Request::QueryMetadata { query, response })
            .await
    }

    async fn transact_write(&self, request: TransactRequest) -> StoreResult<TransactOutcome> {
        self.call(|response| Request::Transact { request, response })
            .await
    }

    fn changes(&self) -> ChangeFeed {
        self.feed.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{compile, Filter};
    use crate::slice::Slice;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(&StoreConfig::new("test")).unwrap()
    }

    fn rev(s: &str) -> Revision {
        Revision::parse(s).unwrap()
    }

    fn event(key: &str, revision: &str, value: i64) -> EventRow {
        EventRow {
            key: key.to_string(),
            revision: rev(revision),
            event_type: "counted".to_string(),
            committed_at: "2024-10-28T12:00:00.000Z".to_string(),
            category: Some("counter".to_string()),
            correlation_id: None,
            data: json!({ "value": value }),
        }
    }

    fn put_event(row: EventRow) -> WriteOp {
        WriteOp {
            put: Put::Event(row),
            condition: Condition::NotExists,
        }
    }

    fn key_query(key: &str, page_size: usize) -> EventQuery {
        EventQuery {
            partition: Partition::Key(key.to_string()),
            start: Revision::min(),
            end: Revision::max(),
            direction: Direction::Forward,
            page_size,
            filter: None,
            exclusive_start: None,
        }
    }

    async fn seed(store: &SqliteStore, key: &str, n: i64) {
        let ops = (0..n)
            .map(|i| put_event(event(key, &format!("01JB8{i:021}"), i)))
            .collect();
        store
            .transact_write(TransactRequest { ops, token: None })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_query_events_pages_in_order() {
        let store = store();
        seed(&store, "counter/1", 5).await;

        let first = store.query_events(key_query("counter/1", 2)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.last_evaluated.as_deref(), Some(first.items[1].revision.as_str()));

        let mut query = key_query("counter/1", 2);
        query.exclusive_start = first.last_evaluated.clone();
        let second = store.query_events(query).await.unwrap();
        assert!(second.items[0].revision > first.items[1].revision);

        let all = store.query_events(key_query("counter/1", 10)).await.unwrap();
        assert_eq!(all.items.len(), 5);
        assert!(all.last_evaluated.is_none());
    }

    #[tokio::test]
    async fn test_query_events_backward_and_by_slice() {
        let store = store();
        seed(&store, "counter/1", 3).await;

        let mut query = key_query("counter/1", 10);
        query.direction = Direction::Backward;
        let page = store.query_events(query).await.unwrap();
        let values: Vec<_> = page.items.iter().map(|r| r.data["value"].clone()).collect();
        assert_eq!(values, vec![json!(2), json!(1), json!(0)]);

        let mut query = key_query("ignored", 10);
        query.partition = Partition::Slice(Slice::of(&rev("01JB8")));
        assert_eq!(store.query_events(query).await.unwrap().items.len(), 3);

        let mut query = key_query("ignored", 10);
        query.partition = Partition::Category("counter".to_string());
        assert_eq!(store.query_events(query).await.unwrap().items.len(), 3);
    }

    #[tokio::test]
    async fn test_query_events_applies_compiled_filter() {
        let store = store();
        seed(&store, "counter/1", 10).await;

        let mut query = key_query("counter/1", 100);
        query.filter = compile(&Filter::path(["data", "value"], Filter::lte(3)));
        assert_eq!(store.query_events(query).await.unwrap().items.len(), 4);

        let mut query = key_query("counter/1", 100);
        query.filter = compile(&Filter::field("type", Filter::prefix("count")));
        assert_eq!(store.query_events(query).await.unwrap().items.len(), 10);

        let mut query = key_query("counter/1", 100);
        query.filter = compile(&Filter::path(["data", "missing"], Filter::ne(1)));
        assert!(store.query_events(query).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_filters_match_nothing() {
        let store = store();
        seed(&store, "counter/1", 3).await;

        for filter in [
            Filter::path(["data", "va\"lue"], Filter::gte(0)),
            Filter::path(["data", "value"], Filter::eq(json!([0]))),
            Filter::path(["data", "value"], Filter::ne(json!({ "v": 0 }))),
        ] {
            let mut query = key_query("counter/1", 100);
            query.filter = compile(&filter);
            let page = store.query_events(query).await.unwrap();
            assert!(page.items.is_empty(), "{filter:?}");
        }
    }

    #[tokio::test]
    async fn test_conditions_on_metadata() {
        let store = store();
        let head = |r: &str, condition| WriteOp {
            put: Put::Metadata(MetadataRow::head("k", rev(r))),
            condition,
        };

        let ok = store
            .transact_write(TransactRequest {
                ops: vec![head("01", Condition::NotExists)],
                token: None,
            })
            .await
            .unwrap();
        assert_eq!(ok.writes, 1);

        let err = store
            .transact_write(TransactRequest {
                ops: vec![head("02", Condition::NotExists)],
                token: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { index: 0 }));

        let err = store
            .transact_write(TransactRequest {
                ops: vec![head("02", Condition::RevisionEquals(rev("05")))],
                token: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { index: 0 }));

        store
            .transact_write(TransactRequest {
                ops: vec![head("02", Condition::RevisionEquals(rev("01")))],
                token: None,
            })
            .await
            .unwrap();
        let row = store.get_metadata("k", "head").await.unwrap().unwrap();
        assert_eq!(row.revision, Some(rev("02")));
    }

    #[tokio::test]
    async fn test_unconditional_head_put_never_moves_backwards() {
        let store = store();
        for r in ["03", "01", "02"] {
            let outcome = store
                .transact_write(TransactRequest {
                    ops: vec![WriteOp {
                        put: Put::Metadata(MetadataRow::head("k", rev(r))),
                        condition: Condition::None,
                    }],
                    token: None,
                })
                .await
                .unwrap();
            assert_eq!(outcome.writes, 1);
        }
        let row = store.get_metadata("k", "head").await.unwrap().unwrap();
        assert_eq!(row.revision, Some(rev("03")));

        store
            .transact_write(TransactRequest {
                ops: vec![WriteOp {
                    put: Put::Metadata(MetadataRow::head("k", rev("04"))),
                    condition: Condition::None,
                }],
                token: None,
            })
            .await
            .unwrap();
        let row = store.get_metadata("k", "head").await.unwrap().unwrap();
        assert_eq!(row.revision, Some(rev("04")));
    }

    #[tokio::test]
    async fn test_failed_condition_rolls_back_everything() {
        let store = store();
        let ops = vec![
            put_event(event("counter/1", "01JB80", 0)),
            WriteOp {
                put: Put::Metadata(MetadataRow::head("counter/1", rev("01JB80"))),
                condition: Condition::RevisionEquals(rev("01JB7")),
            },
        ];
        let err = store
            .transact_write(TransactRequest { ops, token: None })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { index: 1 }));

        let page = store.query_events(key_query("counter/1", 10)).await.unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_skip_if_exists_does_not_fail() {
        let store = store();
        let slice = WriteOp {
            put: Put::Metadata(MetadataRow::slice(&Slice::of(&rev("01JB8")))),
            condition: Condition::SkipIfExists,
        };
        for expected in [1, 0] {
            let outcome = store
                .transact_write(TransactRequest {
                    ops: vec![slice.clone()],
                    token: None,
                })
                .await
                .unwrap();
            assert_eq!(outcome.writes, expected);
        }
    }

    #[tokio::test]
    async fn test_token_suppresses_replay() {
        let store = store();
        let request = TransactRequest {
            ops: vec![put_event(event("counter/1", "01JB80", 0))],
            token: Some("t-1".to_string()),
        };

        assert_eq!(store.transact_write(request.clone()).await.unwrap().writes, 1);
        assert_eq!(store.transact_write(request).await.unwrap().writes, 0);
    }

    #[tokio::test]
    async fn test_change_feed_sees_committed_events_only() {
        let store = store();
        let mut feed = store.changes();

        seed(&store, "counter/1", 2).await;
        let batch = feed.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key, "counter/1");

        let _ = store
            .transact_write(TransactRequest {
                ops: vec![put_event(event("counter/1", "01JB8000000000000000000000", 0))],
                token: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            feed.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = StoreConfig::new("test");
        config.events_table = "bad name".to_string();
        assert!(matches!(
            SqliteStore::open_in_memory(&config),
            Err(Error::Config(_))
        ));
    }
}
