//! # Event Bus
//!
//! Notifications leave the engine through an [`EventBus`]. A bus message has
//! a `Source` (the store name), a `DetailType` and a JSON `Detail`, so the
//! same notification can be forwarded to any pub/sub system that routes on
//! those fields.
//!
//! [`BroadcastBus`] is the in-process implementation: a `tokio::sync::broadcast`
//! channel where every subscriber receives a copy of every message, optionally
//! narrowed to one source.
//!
//! ## Backpressure
//!
//! The channel is bounded. A subscriber that falls more than `capacity`
//! messages behind skips the oldest ones; the lag is logged and the
//! subscription carries on. Notifications are hints to re-read the store, so
//! a skipped one is recovered by the next.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;

/// Default number of messages buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A routed message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BusMessage {
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
}

/// Somewhere notifications can be published.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<()>;
}

// =============================================================================
// Broadcast Bus
// =============================================================================

/// In-process bus backed by a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receives every message published from now on.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            source: None,
        }
    }

    /// Receives messages from `source` only.
    pub fn subscribe_source(&self, source: impl Into<String>) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            source: Some(source.into()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        if self.tx.send(message).is_err() {
            debug!("bus message dropped, no subscribers");
        }
        Ok(())
    }
}

/// One subscriber's view of a [`BroadcastBus`].
pub struct BusSubscription {
    rx: broadcast::Receiver<BusMessage>,
    source: Option<String>,
}

impl BusSubscription {
    /// The next matching message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if self.accepts(&message) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, message: &BusMessage) -> bool {
        self.source
            .as_deref()
            .map_or(true, |source| source == message.source)
    }

    /// Converts the subscription into a stream of matching messages.
    pub fn into_stream(mut self) -> impl Stream<Item = BusMessage> + Send + 'static {
        async_stream::stream! {
            while let Some(message) = self.recv().await {
                yield message;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
