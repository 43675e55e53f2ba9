//! # Subscriptions
//!
//! Subscribers never receive events through the bus; they receive a
//! notification and then read the store themselves. A [`Subscriber`] keeps
//! the last revision it has processed and turns each notification into a
//! catch-up read:
//!
//! ```text
//!   last seen = r3              notification(revision = r7)
//!        │                                │
//!        ▼                                ▼
//!   read_all( after r3 , up to r7 )  →  r4 r5 r6 r7  →  last seen = r7
//! ```
//!
//! Notifications may arrive late, twice, or out of order. A notification at or
//! below the last seen revision reads nothing, and a skipped notification is
//! covered by the next one, because every catch-up starts from the last seen
//! revision rather than from the notification.

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::api::EventStore;
use crate::bus::{BusMessage, BusSubscription};
use crate::error::Result;
use crate::filter::Filter;
use crate::notify::{Notification, DETAIL_TYPE_APPENDED};
use crate::range::ReadOptions;
use crate::reader::EventStream;
use crate::revision::Revision;
use crate::types::CommittedEvent;

/// Decodes an `appended` bus message. Other detail types yield `None`.
pub fn decode_notification(message: &BusMessage) -> Result<Option<Notification>> {
    if message.detail_type != DETAIL_TYPE_APPENDED {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(message.detail.clone())?))
}

/// Follows one store from a last-seen revision.
#[derive(Debug, Clone)]
pub struct Subscriber {
    store: EventStore,
    last_seen: Revision,
    filter: Option<Filter>,
}

impl Subscriber {
    /// Starts before the first event of the store.
    pub fn new(store: EventStore) -> Self {
        Self::from_revision(store, Revision::start())
    }

    /// Resumes after `last_seen`.
    pub fn from_revision(store: EventStore, last_seen: Revision) -> Self {
        Self {
            store,
            last_seen,
            filter: None,
        }
    }

    /// Only yields events matching `filter`. Progress still covers skipped
    /// events.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn last_seen(&self) -> &Revision {
        &self.last_seen
    }

    /// Records progress. Never moves backwards.
    pub fn advance(&mut self, revision: &Revision) {
        if revision > &self.last_seen {
            self.last_seen = revision.clone();
        }
    }

    /// Whether `notification` concerns this subscriber's store.
    pub fn is_for_store(&self, notification: &Notification) -> bool {
        notification.store_config.name == self.store.config().name
    }

    /// Events after the last seen revision, up to the notified one.
    pub fn catch_up<D>(&self, notification: &Notification) -> EventStream<D>
    where
        D: DeserializeOwned + Send + 'static,
    {
        let mut options = ReadOptions::new()
            .after(self.last_seen.clone())
            .to(notification.revision.clone());
        options.filter = self.filter.clone();
        self.store.read_all(&options)
    }

    /// Catches up on `notification`, handing each event to `apply` and
    /// advancing after each one. Returns the number of events applied.
    pub async fn handle<D, F>(&mut self, notification: &Notification, mut apply: F) -> Result<usize>
    where
        D: DeserializeOwned + Send + 'static,
        F: FnMut(&CommittedEvent<D>) -> Result<()>,
    {
        if !self.is_for_store(notification) {
            return Ok(0);
        }

        let mut applied = 0;
        let mut events = self.catch_up::<D>(notification);
        while let Some(event) = events.next().await {
            let event = event?;
            apply(&event)?;
            self.advance(&event.revision);
            applied += 1;
        }

        // Filtered-out events up to the watermark are done too.
        if self.filter.is_some() {
            self.advance(&notification.revision);
        }
        Ok(applied)
    }

    /// Streams every event announced on `bus` from the last seen revision on.
    ///
    /// The stream ends when the bus closes. A read error is yielded and the
    /// next notification retries from the last seen revision.
    pub fn follow<D>(
        mut self,
        mut bus: BusSubscription,
    ) -> impl Stream<Item = Result<CommittedEvent<D>>> + Send + 'static
    where
        D: DeserializeOwned + Send + 'static,
    {
        async_stream::stream! {
            while let Some(message) = bus.recv().await {
                let notification = match decode_notification(&message) {
                    Ok(Some(notification)) => notification,
                    Ok(None) => continue,
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                };
                if !self.is_for_store(&notification) {
                    continue;
                }

                let mut events = self.catch_up::<D>(&notification);
                let mut failed = false;
                while let Some(item) = events.next().await {
                    match &item {
                        Ok(event) => self.advance(&event.revision),
                        Err(_) => failed = true,
                    }
                    yield item;
                    if failed {
                        break;
                    }
                }
                if !failed && self.filter.is_some() {
                    self.advance(&notification.revision);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::types::{AppendOptions, PendingEvent};
    use serde_json::{json, Value};

    fn store() -> EventStore {
        EventStore::open_sqlite(StoreConfig::new("subs"), Default::default()).unwrap()
    }

    async fn append(store: &EventStore, value: i64) -> Revision {
        store
            .append(
                "counter/1",
                vec![PendingEvent::new("counted", json!({ "value": value }))],
                AppendOptions::default(),
            )
            .await
            .revision()
            .cloned()
            .unwrap()
    }

    fn notification(store: &EventStore, revision: &Revision) -> Notification {
        Notification {
            store_config: store.config().clone(),
            revision: revision.clone(),
            keys: vec!["counter/1".to_string()],
            categories: vec!["counter".to_string()],
            events: None,
        }
    }

    #[tokio::test]
    async fn test_catch_up_reads_between_last_seen_and_watermark() {
        let store = store();
        let r1 = append(&store, 1).await;
        let r2 = append(&store, 2).await;
        let _r3 = append(&store, 3).await;

        let mut subscriber = Subscriber::from_revision(store.clone(), r1);
        let mut seen = Vec::new();
        let applied = subscriber
            .handle::<Value, _>(&notification(&store, &r2), |e| {
                seen.push(e.data["value"].clone());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(seen, vec![json!(2)]);
        assert_eq!(subscriber.last_seen(), &r2);
    }

    #[tokio::test]
    async fn test_stale_notification_reads_nothing() {
        let store = store();
        let r1 = append(&store, 1).await;
        let r2 = append(&store, 2).await;

        let mut subscriber = Subscriber::from_revision(store.clone(), r2.clone());
        let applied = subscriber
            .handle::<Value, _>(&notification(&store, &r1), |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(subscriber.last_seen(), &r2);
    }

    #[tokio::test]
    async fn test_other_store_is_ignored() {
        let store = store();
        let r1 = append(&store, 1).await;
        let mut other = notification(&store, &r1);
        other.store_config = StoreConfig::new("elsewhere");

        let mut subscriber = Subscriber::new(store);
        let applied = subscriber
            .handle::<Value, _>(&other, |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(applied, 0);
        assert!(subscriber.last_seen().is_start());
    }

    #[test]
    fn test_decode_ignores_other_detail_types() {
        let message = BusMessage {
            source: "subs".to_string(),
            detail_type: "deleted".to_string(),
            detail: json!({}),
        };
        assert!(decode_notification(&message).unwrap().is_none());
    }
}
