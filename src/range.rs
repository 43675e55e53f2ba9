//! # Read Ranges
//!
//! Callers describe what they want to read with [`ReadOptions`]: optional
//! bounds that may be exclusive, an optional limit, a direction and a filter.
//! Before any request reaches the store the options are normalized into an
//! [`InclusiveRange`] with concrete bounds:
//!
//! ```text
//! start: None | START   → MIN          end: None | END     → MAX
//!        END            → END  (empty)      START          → START (empty)
//!        r, exclusive   → next(r)           r, exclusive   → prev(r)
//!        r              → r                 r              → r
//! ```
//!
//! A range whose start sorts after its end is empty. Readers check
//! [`InclusiveRange::is_empty`] up front and return nothing without touching
//! the store.

use serde::{Deserialize, Serialize};

use crate::filter::Filter;
use crate::revision::Revision;

/// Order in which events are yielded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn is_forward(&self) -> bool {
        matches!(self, Direction::Forward)
    }
}

/// A partially specified read request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    pub start: Option<Revision>,
    pub start_exclusive: bool,
    pub end: Option<Revision>,
    pub end_exclusive: bool,
    pub limit: Option<usize>,
    pub direction: Option<Direction>,
    pub filter: Option<Filter>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads from `revision`, inclusive.
    pub fn from(mut self, revision: Revision) -> Self {
        self.start = Some(revision);
        self.start_exclusive = false;
        self
    }

    /// Reads from just after `revision`.
    pub fn after(mut self, revision: Revision) -> Self {
        self.start = Some(revision);
        self.start_exclusive = true;
        self
    }

    /// Reads up to `revision`, inclusive.
    pub fn to(mut self, revision: Revision) -> Self {
        self.end = Some(revision);
        self.end_exclusive = false;
        self
    }

    /// Reads up to just before `revision`.
    pub fn before(mut self, revision: Revision) -> Self {
        self.end = Some(revision);
        self.end_exclusive = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn backward(mut self) -> Self {
        self.direction = Some(Direction::Backward);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Normalizes the bounds, limit and direction.
    pub fn normalize(&self) -> InclusiveRange {
        let start = match &self.start {
            Some(r) if r.is_end() => Revision::end(),
            None => Revision::min(),
            Some(r) if r.is_start() => Revision::min(),
            Some(r) if self.start_exclusive => r.next(),
            Some(r) => r.clone(),
        };

        let end = match &self.end {
            Some(r) if r.is_start() => Revision::start(),
            None => Revision::max(),
            Some(r) if r.is_end() => Revision::max(),
            Some(r) if self.end_exclusive => r.prev(),
            Some(r) => r.clone(),
        };

        InclusiveRange {
            start,
            end,
            limit: self.limit.unwrap_or(usize::MAX),
            direction: self.direction.unwrap_or_default(),
        }
    }
}

/// A canonical range: both bounds inclusive and concrete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusiveRange {
    pub start: Revision,
    pub end: Revision,
    pub limit: usize,
    pub direction: Direction,
}

impl InclusiveRange {
    /// True when no event can fall in the range.
    pub fn is_empty(&self) -> bool {
        self.limit == 0 || self.start > self.end
    }

    pub fn contains(&self, revision: &Revision) -> bool {
        &self.start <= revision && revision <= &self.end
    }
}

impl From<InclusiveRange> for ReadOptions {
    fn from(range: InclusiveRange) -> Self {
        ReadOptions {
            start: Some(range.start),
            start_exclusive: false,
            end: Some(range.end),
            end_exclusive: false,
            limit: (range.limit != usize::MAX).then_some(range.limit),
            direction: Some(range.direction),
            filter: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
