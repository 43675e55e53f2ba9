//! # Configuration
//!
//! Two pieces of configuration exist:
//!
//! - [`StoreConfig`] describes *which* store an [`EventStore`](crate::EventStore)
//!   talks to: its name and the names of its tables and indexes. It travels as
//!   camelCase JSON (it is embedded in every notification) and is validated
//!   when parsed.
//! - [`SqliteOptions`] tunes the SQLite backing store at runtime.
//!
//! ```json
//! {
//!   "name": "orders",
//!   "eventsTable": "orders_events",
//!   "metadataTable": "orders_metadata",
//!   "sliceIndex": "orders_slice",
//!   "categoryIndex": "orders_category"
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable holding a JSON [`StoreConfig`].
pub const CONFIG_ENV: &str = "EVENTIDE_STORE_CONFIG";

/// Default retention of idempotency tokens.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(600);

/// Default number of committed batches buffered per change-feed subscriber.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

// =============================================================================
// Store Descriptor
// =============================================================================

/// Names identifying one event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub name: String,
    pub events_table: String,
    pub metadata_table: String,
    pub slice_index: String,
    pub category_index: String,
}

impl StoreConfig {
    /// A descriptor whose table and index names are derived from `name`.
    ///
    /// `name` must itself be a valid identifier for the result to validate.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            events_table: format!("{name}_events"),
            metadata_table: format!("{name}_metadata"),
            slice_index: format!("{name}_slice"),
            category_index: format!("{name}_category"),
            name,
        }
    }

    /// Parses and validates a JSON descriptor.
    pub fn parse(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the descriptor from [`CONFIG_ENV`], if set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::parse(&json).map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(Error::Config(format!("{CONFIG_ENV}: {e}"))),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks that every name is present and that table and index names are
    /// plain identifiers.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("name must not be empty".to_string()));
        }

        let identifiers = [
            ("eventsTable", &self.events_table),
            ("metadataTable", &self.metadata_table),
            ("sliceIndex", &self.slice_index),
            ("categoryIndex", &self.category_index),
        ];
        for (field, value) in identifiers {
            if value.is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
            if !value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(Error::Config(format!(
                    "{field} '{value}' may only contain letters, digits and '_'"
                )));
            }
        }

        let mut distinct = identifiers.map(|(_, v)| v.as_str()).to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != identifiers.len() {
            return Err(Error::Config(
                "table and index names must be distinct".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// SQLite Options
// =============================================================================

/// Runtime settings of [`SqliteStore`](crate::sqlite::SqliteStore).
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Database file; `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// How long a consumed idempotency token keeps suppressing retries.
    pub token_ttl: Duration,

    /// Batches buffered per change-feed subscriber before it lags.
    pub feed_capacity: usize,
}

impl SqliteOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
