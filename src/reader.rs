//! # Readers
//!
//! Every read is a lazy, finite [`EventStream`]. Nothing is fetched until the
//! stream is polled, and a page is requested only when the consumer has taken
//! every item of the previous one. Dropping the stream stops the reads.
//!
//! ```text
//!   read(key)              read_all()                    read_category(c)
//!      │                       │                               │
//!      ▼                       ▼                               ▼
//!  key partition     slice directory ("slice", *)       category index
//!  [start, end]        ├─ slice 01JB8 ─► slice index       [start, end]
//!                      ├─ slice 01JB9 ─► slice index
//!                      └─ ...
//! ```
//!
//! All readers normalize their [`ReadOptions`] first and return an empty
//! stream, without touching the store, when the range is empty. Page requests
//! never ask for more rows than the remaining limit.

use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::filter::{compile, CompiledFilter};
use crate::range::{InclusiveRange, ReadOptions};
use crate::revision::Revision;
use crate::slice::{Slice, SLICE_PARTITION};
use crate::store::{BackingStore, EventQuery, MetadataQuery, Partition, HEAD_SORT_KEY};
use crate::types::CommittedEvent;

/// Rows requested per page unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A lazy stream of committed events.
pub type EventStream<D> = BoxStream<'static, Result<CommittedEvent<D>>>;

/// The current head of `key`, or [`Revision::start`] if it was never written.
pub async fn head(store: &dyn BackingStore, key: &str) -> Result<Revision> {
    let row = store.get_metadata(key, HEAD_SORT_KEY).await?;
    Ok(row
        .and_then(|row| row.revision)
        .unwrap_or_else(Revision::start))
}

/// Events of one stream.
pub fn read<D>(
    store: Arc<dyn BackingStore>,
    key: &str,
    options: &ReadOptions,
    page_size: usize,
) -> EventStream<D>
where
    D: DeserializeOwned + Send + 'static,
{
    let filter = options.filter.as_ref().and_then(compile);
    scan(
        store,
        Partition::Key(key.to_string()),
        options.normalize(),
        filter,
        page_size,
    )
    .boxed()
}

/// Events of one category, across all of its streams.
pub fn read_category<D>(
    store: Arc<dyn BackingStore>,
    category: &str,
    options: &ReadOptions,
    page_size: usize,
) -> EventStream<D>
where
    D: DeserializeOwned + Send + 'static,
{
    let filter = options.filter.as_ref().and_then(compile);
    scan(
        store,
        Partition::Category(category.to_string()),
        options.normalize(),
        filter,
        page_size,
    )
    .boxed()
}

/// Events of the whole store, in revision order.
pub fn read_all<D>(
    store: Arc<dyn BackingStore>,
    options: &ReadOptions,
    page_size: usize,
) -> EventStream<D>
where
    D: DeserializeOwned + Send + 'static,
{
    let filter = options.filter.as_ref().and_then(compile);
    scan_slices(store, options.normalize(), filter, page_size).boxed()
}

/// The head of `key` together with its history up to that head.
///
/// The head is read first, so the history is consistent with it even if other
/// writers append in the meantime. An explicit `end` below the head is kept.
pub async fn read_for_append<D>(
    store: Arc<dyn BackingStore>,
    key: &str,
    options: &ReadOptions,
    page_size: usize,
) -> Result<(Revision, EventStream<D>)>
where
    D: DeserializeOwned + Send + 'static,
{
    let head = head(store.as_ref(), key).await?;
    if head.is_start() {
        return Ok((head, stream::empty().boxed()));
    }

    let mut range = options.normalize();
    if head < range.end {
        range.end = head.clone();
    }

    let filter = options.filter.as_ref().and_then(compile);
    let history = scan(
        store,
        Partition::Key(key.to_string()),
        range,
        filter,
        page_size,
    )
    .boxed();

    Ok((head, history))
}

/// The last event of `key`, if any.
pub async fn latest<D>(store: Arc<dyn BackingStore>, key: &str) -> Result<Option<CommittedEvent<D>>>
where
    D: DeserializeOwned + Send + 'static,
{
    let options = ReadOptions::new().backward().limit(1);
    let mut events = read::<D>(store, key, &options, 1);
    events.try_next().await
}

// =============================================================================
// Scans
// =============================================================================

/// Pages through one partition of the events table.
fn scan<D>(
    store: Arc<dyn BackingStore>,
    partition: Partition,
    range: InclusiveRange,
    filter: Option<CompiledFilter>,
    page_size: usize,
) -> impl Stream<Item = Result<CommittedEvent<D>>> + Send + 'static
where
    D: DeserializeOwned + Send + 'static,
{
    async_stream::stream! {
        if range.is_empty() {
            return;
        }

        let mut remaining = range.limit;
        let mut cursor: Option<String> = None;

        loop {
            let query = EventQuery {
                partition: partition.clone(),
                start: range.start.clone(),
                end: range.end.clone(),
                direction: range.direction,
                page_size: page_size.max(1).min(remaining),
                filter: filter.clone(),
                exclusive_start: cursor.take(),
            };

            let page = match store.query_events(query).await {
                Ok(page) => page,
                Err(e) => {
                    yield Err(Error::from(e));
                    return;
                }
            };

            for row in page.items {
                match CommittedEvent::<D>::from_row(row) {
                    Ok(event) => yield Ok(event),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
                remaining -= 1;
                if remaining == 0 {
                    return;
                }
            }

            match page.last_evaluated {
                Some(last) => cursor = Some(last),
                None => return,
            }
        }
    }
}

/// Pages through the slice directory, then through each listed slice.
fn scan_slices<D>(
    store: Arc<dyn BackingStore>,
    range: InclusiveRange,
    filter: Option<CompiledFilter>,
    page_size: usize,
) -> impl Stream<Item = Result<CommittedEvent<D>>> + Send + 'static
where
    D: DeserializeOwned + Send + 'static,
{
    async_stream::stream! {
        if range.is_empty() {
            return;
        }

        let page_size = page_size.max(1);
        let mut remaining = range.limit;
        let mut directory_cursor: Option<String> = None;

        loop {
            let directory = MetadataQuery {
                pk: SLICE_PARTITION.to_string(),
                start: Slice::of(&range.start).as_str().to_string(),
                end: Slice::of(&range.end).as_str().to_string(),
                direction: range.direction,
                page_size,
                exclusive_start: directory_cursor.take(),
            };

            let slices = match store.query_metadata(directory).await {
                Ok(page) => page,
                Err(e) => {
                    yield Err(Error::from(e));
                    return;
                }
            };

            for entry in slices.items {
                let slice = Slice::from_stored(entry.sk);
                let mut cursor: Option<String> = None;

                loop {
                    let query = EventQuery {
                        partition: Partition::Slice(slice.clone()),
                        start: range.start.clone(),
                        end: range.end.clone(),
                        direction: range.direction,
                        page_size: page_size.min(remaining),
                        filter: filter.clone(),
                        exclusive_start: cursor.take(),
                    };

                    let page = match store.query_events(query).await {
                        Ok(page) => page,
                        Err(e) => {
                            yield Err(Error::from(e));
                            return;
                        }
                    };

                    for row in page.items {
                        match CommittedEvent::<D>::from_row(row) {
                            Ok(event) => yield Ok(event),
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                        remaining -= 1;
                        if remaining == 0 {
                            return;
                        }
                    }

                    match page.last_evaluated {
                        Some(last) => cursor = Some(last),
                        None => break,
                    }
                }
            }

            match slices.last_evaluated {
                Some(last) => directory_cursor = Some(last),
                None => return,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
