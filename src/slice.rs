//! # Slices
//!
//! The backing store orders rows only within a partition, and one partition
//! cannot hold an unbounded log. Every event row therefore also carries its
//! **slice**, the first [`SLICE_LEN`] symbols of its revision, and the slice
//! index partitions the events table by that value:
//!
//! ```text
//!   metadata table                      slice index of the events table
//!   pk="slice"  sk=01JB8   ───────►     slice=01JB8  revision=01JB8Y3K2M...
//!   pk="slice"  sk=01JB9   ───────►                  revision=01JB8Y3K2N...
//!   (sparse directory of                slice=01JB9  revision=01JB9004QT...
//!    non-empty slices)
//! ```
//!
//! A whole-store read walks the directory, then each slice partition, in
//! order. With a 48-bit millisecond timestamp in the first ten symbols, one
//! slice spans 32^5 ms (about nine hours).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::revision::{Revision, REVISION_LEN};

/// Number of leading revision symbols forming a slice.
pub const SLICE_LEN: usize = 5;

/// Partition key of the slice directory in the metadata table.
pub const SLICE_PARTITION: &str = "slice";

/// Coarse, ordered bucket of revisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slice(String);

impl Slice {
    /// The slice containing `revision`.
    pub fn of(revision: &Revision) -> Self {
        Self(revision.as_str().chars().take(SLICE_LEN).collect())
    }

    pub(crate) fn from_stored(s: String) -> Self {
        Self(s)
    }

    /// The smallest full-width revision in this slice.
    pub fn first_revision(&self) -> Revision {
        Revision::from_stored(pad(&self.0, '0'))
    }

    /// The largest full-width revision in this slice.
    pub fn last_revision(&self) -> Revision {
        Revision::from_stored(pad(&self.0, 'Z'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn pad(prefix: &str, fill: char) -> String {
    let mut s = String::with_capacity(REVISION_LEN);
    s.push_str(prefix);
    while s.len() < REVISION_LEN {
        s.push(fill);
    }
    s
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinct slices touched by a sequence of revisions, in first-seen order.
pub fn distinct_slices<'a>(revisions: impl IntoIterator<Item = &'a Revision>) -> Vec<Slice> {
    let mut slices: Vec<Slice> = Vec::new();
    for revision in revisions {
        let slice = Slice::of(revision);
        if !slices.contains(&slice) {
            slices.push(slice);
        }
    }
    slices
}

// =============================================================================
// Tests
// =============================================================================
