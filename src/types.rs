//! # Domain Types for eventide
//!
//! Events enter the store as [`PendingEvent`]s and come back out as
//! [`CommittedEvent`]s. Payloads are generic: anything `Serialize` can be
//! appended, and reads decode into any `DeserializeOwned` type, with
//! [`serde_json::Value`] as the default. The `event_type` discriminator is
//! always explicit, so a reader can decode a stream of mixed payloads into an
//! enum or pick events apart by type.
//!
//! ## Keys and Categories
//!
//! A key names one stream. By convention it has the form `"<category>/<id>"`
//! (`"order/42"`); when an event carries no explicit category, the key's
//! prefix is used:
//!
//! ```text
//! "order/42"   → category "order"
//! "order"      → no category
//! "/42"        → no category
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::revision::Revision;
use crate::store::{EventRow, StoreError};

// =============================================================================
// Events
// =============================================================================

/// An event that has not been committed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEvent<D = Value> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: D,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl<D> PendingEvent<D> {
    pub fn new(event_type: impl Into<String>, data: D) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            correlation_id: None,
            category: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// An event as stored, with its position in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedEvent<D = Value> {
    pub key: String,
    pub revision: Revision,
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339 UTC timestamp with millisecond precision, shared by every event
    /// of one append.
    pub committed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub data: D,
}

impl<D: DeserializeOwned> CommittedEvent<D> {
    /// Decodes a stored row into a typed event.
    pub fn from_row(row: EventRow) -> Result<Self> {
        Ok(Self {
            data: serde_json::from_value(row.data)?,
            key: row.key,
            revision: row.revision,
            event_type: row.event_type,
            committed_at: row.committed_at,
            category: row.category,
            correlation_id: row.correlation_id,
        })
    }
}

/// The category implied by a `"<category>/<id>"` key.
pub fn category_of(key: &str) -> Option<&str> {
    match key.split_once('/') {
        Some((category, _)) if !category.is_empty() => Some(category),
        _ => None,
    }
}

// =============================================================================
// Append
// =============================================================================

/// Options of a single append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOptions {
    /// Head the stream must be at. [`Revision::end`] (the default) means no
    /// constraint; [`Revision::start`] means the stream must not exist yet.
    pub expected_revision: Revision,

    /// Client token making retries of this append a no-op.
    pub idempotency_key: Option<String>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, revision: Revision) -> Self {
        self.expected_revision = revision;
        self
    }

    pub fn idempotency_key(mut self, token: impl Into<String>) -> Self {
        self.idempotency_key = Some(token.into());
        self
    }
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            expected_revision: Revision::end(),
            idempotency_key: None,
        }
    }
}

/// Outcome of an append. Appends never return `Err`: every failure is one of
/// the aborted variants.
#[derive(Debug)]
pub enum AppendResult {
    /// Nothing was written: the batch was empty or the idempotency key had
    /// already been used.
    Unchanged,

    /// `count` events were written; `revision` is the new head.
    Appended { count: usize, revision: Revision },

    /// The stream head was not at `expected`.
    OptimisticConcurrency {
        expected: Revision,
        error: StoreError,
    },

    /// Any other failure. Whether anything was written is unknown only to the
    /// extent the store's transaction was; the engine does not retry.
    Unknown { error: Error },
}

impl AppendResult {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendResult::Appended { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            AppendResult::OptimisticConcurrency { .. } | AppendResult::Unknown { .. }
        )
    }

    /// The new head, if events were written.
    pub fn revision(&self) -> Option<&Revision> {
        match self {
            AppendResult::Appended { revision, .. } => Some(revision),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_of() {
        assert_eq!(category_of("order/42"), Some("order"));
        assert_eq!(category_of("order/42/lines"), Some("order"));
        assert_eq!(category_of("order"), None);
        assert_eq!(category_of("/42"), None);
    }

    #[test]
    fn test_pending_event_builder() {
        let event = PendingEvent::new("placed", json!({ "total": 3 }))
            .with_correlation_id("c-1")
            .with_category("sales");
        assert_eq!(event.event_type, "placed");
        assert_eq!(event.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(event.category.as_deref(), Some("sales"));
    }

    #[test]
    fn test_committed_event_decodes_typed_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Placed {
            total: u32,
        }

        let row = EventRow {
            key: "order/1".to_string(),
            revision: Revision::min(),
            event_type: "placed".to_string(),
            committed_at: "2024-10-28T12:00:00.000Z".to_string(),
            category: Some("order".to_string()),
            correlation_id: None,
            data: json!({ "total": 3 }),
        };

        let event: CommittedEvent<Placed> = CommittedEvent::from_row(row.clone()).unwrap();
        assert_eq!(event.data, Placed { total: 3 });
        assert_eq!(event.key, "order/1");

        let mismatched = CommittedEvent::<String>::from_row(row);
        assert!(matches!(mismatched, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_append_options_default_is_unconstrained() {
        let options = AppendOptions::default();
        assert!(options.expected_revision.is_end());
        assert!(options.idempotency_key.is_none());

        let options = AppendOptions::new()
            .expect(Revision::start())
            .idempotency_key("t-1");
        assert!(options.expected_revision.is_start());
        assert_eq!(options.idempotency_key.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_append_result_accessors() {
        let appended = AppendResult::Appended {
            count: 2,
            revision: Revision::min(),
        };
        assert!(appended.is_appended());
        assert_eq!(appended.revision(), Some(&Revision::min()));

        let conflict = AppendResult::OptimisticConcurrency {
            expected: Revision::start(),
            error: StoreError::ConditionFailed { index: 0 },
        };
        assert!(conflict.is_aborted());
        assert!(!AppendResult::Unchanged.is_aborted());
    }
}
