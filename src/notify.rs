//! # Change-Feed Notifier
//!
//! The notifier turns committed batches from the store's change feed into
//! coarse notifications on the bus. A notification does not carry events; it
//! tells subscribers *that* something was appended and up to which revision,
//! so they can re-read the store from where they left off.
//!
//! ```text
//!   change feed batch                          notification
//!   ┌──────────────────────────┐               ┌────────────────────────────┐
//!   │ order/1  r2  order placed│               │ revision:   r5             │
//!   │ order/2  r5  order placed│  ──summarize──►│ keys:       order/1,order/2│
//!   │ order/1  r1  order placed│               │ categories: order          │
//!   └──────────────────────────┘               │ events:     [3 summaries]  │
//!                                              └────────────────────────────┘
//! ```
//!
//! The watermark is the *maximum* revision of the batch, whatever order the
//! records arrived in. Delivery is at-least-once: a subscriber may see a
//! revision it has already read and must treat notifications idempotently.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, EventBus};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::revision::Revision;
use crate::store::{ChangeFeed, ChangeRecord};

/// Detail type of every notification.
pub const DETAIL_TYPE_APPENDED: &str = "appended";

/// Batches larger than this are announced without per-event summaries.
pub const DEFAULT_MAX_ENUMERATED_EVENTS: usize = 100;

/// Key and type of one appended event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub key: String,
    #[serde(rename = "type")]
    pub event_type: String,
}

/// What a batch of appends changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub store_config: StoreConfig,
    /// Highest revision in the batch.
    pub revision: Revision,
    /// Distinct keys, sorted.
    pub keys: Vec<String>,
    /// Distinct categories, sorted.
    pub categories: Vec<String>,
    /// Per-event summaries in delivery order, for small batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventSummary>>,
}

/// Reduces a batch to a notification. `None` for an empty batch.
pub fn summarize(
    config: &StoreConfig,
    records: &[ChangeRecord],
    max_enumerated_events: usize,
) -> Option<Notification> {
    let revision = records.iter().map(|r| &r.revision).max()?.clone();

    let keys: BTreeSet<&str> = records.iter().map(|r| r.key.as_str()).collect();
    let categories: BTreeSet<&str> = records
        .iter()
        .filter_map(|r| r.category.as_deref())
        .collect();

    let events = (records.len() <= max_enumerated_events).then(|| {
        records
            .iter()
            .map(|r| EventSummary {
                key: r.key.clone(),
                event_type: r.event_type.clone(),
            })
            .collect()
    });

    Some(Notification {
        store_config: config.clone(),
        revision,
        keys: keys.into_iter().map(str::to_string).collect(),
        categories: categories.into_iter().map(str::to_string).collect(),
        events,
    })
}

/// Publishes one notification per committed batch.
pub struct Notifier {
    config: StoreConfig,
    bus: Arc<dyn EventBus>,
    max_enumerated_events: usize,
}

impl Notifier {
    pub fn new(config: StoreConfig, bus: Arc<dyn EventBus>) -> Self {
        Self {
            config,
            bus,
            max_enumerated_events: DEFAULT_MAX_ENUMERATED_EVENTS,
        }
    }

    pub fn with_max_enumerated_events(mut self, max: usize) -> Self {
        self.max_enumerated_events = max;
        self
    }

    /// Summarizes `records` and publishes the result, if any.
    pub async fn notify(&self, records: &[ChangeRecord]) -> Result<Option<Notification>> {
        let Some(notification) = summarize(&self.config, records, self.max_enumerated_events)
        else {
            return Ok(None);
        };

        let message = BusMessage {
            source: self.config.name.clone(),
            detail_type: DETAIL_TYPE_APPENDED.to_string(),
            detail: serde_json::to_value(&notification)?,
        };
        self.bus.publish(message).await?;

        debug!(
            store = %self.config.name,
            revision = %notification.revision,
            keys = notification.keys.len(),
            "published notification"
        );
        Ok(Some(notification))
    }

    /// Notifies for every batch on `feed` until the feed closes.
    pub async fn run(self, mut feed: ChangeFeed) {
        loop {
            match feed.recv().await {
                Ok(batch) => {
                    if let Err(e) = self.notify(&batch).await {
                        warn!(store = %self.config.name, error = %e, "notification failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(store = %self.config.name, skipped, "notifier lagged behind change feed");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(store = %self.config.name, "change feed closed, notifier stopping");
                    break;
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
    use crate::bus::BroadcastBus;
    use serde_json::json;

    fn record(key: &str, revision: &str, category: Option<&str>) -> ChangeRecord {
        ChangeRecord {
            key: key.to_string(),
            revision: Revision::parse(revision).unwrap(),
            category: category.map(str::to_string),
            event_type: "placed".to_string(),
        }
    }

    #[test]
    fn test_watermark_is_max_revision() {
        let records = [
            record("order/2", "02", Some("order")),
            record("order/1", "05", Some("order")),
            record("order/2", "01", Some("order")),
        ];
        let n = summarize(&StoreConfig::new("s"), &records, 100).unwrap();
        assert_eq!(n.revision.as_str(), "05");
        assert_eq!(n.keys, vec!["order/1", "order/2"]);
        assert_eq!(n.categories, vec!["order"]);

        let events = n.events.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].key, "order/2");
        assert_eq!(events[2].key, "order/2");
    }

    #[test]
    fn test_large_batches_are_not_enumerated() {
        let records: Vec<_> = (0..5)
            .map(|i| record(&format!("k/{i}"), &format!("0{i}"), None))
            .collect();
        let n = summarize(&StoreConfig::new("s"), &records, 4).unwrap();
        assert!(n.events.is_none());
        assert!(n.categories.is_empty());
        assert_eq!(n.keys.len(), 5);
    }

    #[test]
    fn test_empty_batch_yields_nothing() {
        assert!(summarize(&StoreConfig::new("s"), &[], 100).is_none());
    }

    #[test]
    fn test_wire_shape() {
        let n = summarize(&StoreConfig::new("s"), &[record("a/1", "01", Some("a"))], 100).unwrap();
        let wire = serde_json::to_value(&n).unwrap();
        assert_eq!(wire["storeConfig"]["eventsTable"], "s_events");
        assert_eq!(wire["revision"], "01");
        assert_eq!(wire["events"], json!([{ "key": "a/1", "type": "placed" }]));
    }

    #[tokio::test]
    async fn test_notify_publishes_on_bus() {
        let bus = Arc::new(BroadcastBus::default());
        let mut sub = bus.subscribe_source("s");
        let notifier = Notifier::new(StoreConfig::new("s"), bus.clone());

        assert!(notifier.notify(&[]).await.unwrap().is_none());
        notifier
            .notify(&[record("a/1", "01", Some("a"))])
            .await
            .unwrap()
            .unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.detail_type, DETAIL_TYPE_APPENDED);
        assert_eq!(message.detail["keys"], json!(["a/1"]));
    }
}
