//! # Revisions
//!
//! A [`Revision`] is the position of an event in the total order of the store.
//! It is a string over a fixed 32-symbol alphabet whose byte order matches the
//! symbol order, so comparing two revisions as strings compares them in time.
//!
//! ```text
//!  01JB8Y3K2M   R4V6T9QX0ZPD7HCE
//!  └───┬────┘   └──────┬───────┘
//!  48-bit ms     80 bits of entropy,
//!  timestamp     incremented within a millisecond
//!  └─┬─┘
//!  slice (first 5 symbols)
//! ```
//!
//! ## Sentinels
//!
//! Two short values sit outside the range of real revisions:
//!
//! - [`Revision::start`] (`"0"`) sorts before every generated revision. As an
//!   expected revision it means "the key must not exist yet".
//! - [`Revision::end`] (`"Z"`) sorts after every generated revision. As an
//!   expected revision it means "no constraint".
//!
//! [`Revision::min`] and [`Revision::max`] are the widest real bounds and are
//! what the range normalizer substitutes for omitted ends.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Alphabet
// =============================================================================

/// The 32 symbols, in ascending order. `I`, `L`, `O` and `U` are excluded.
pub const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Number of symbols in a generated revision.
pub const REVISION_LEN: usize = 26;

/// Number of leading symbols holding the millisecond timestamp.
const TIME_LEN: usize = 10;

/// Number of trailing symbols holding entropy.
const RANDOM_LEN: usize = REVISION_LEN - TIME_LEN;

const MAX_SYMBOL: u8 = 31;

fn symbol_index(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|&s| s == c).map(|i| i as u8)
}

fn to_indices(s: &str) -> Vec<u8> {
    // Revisions are validated on construction, so every byte is in the alphabet.
    s.bytes().map(|c| symbol_index(c).unwrap_or(0)).collect()
}

fn from_indices(indices: &[u8]) -> String {
    indices
        .iter()
        .map(|&i| ALPHABET[i as usize] as char)
        .collect()
}

/// Increments a base32 string lexicographically.
///
/// The least-significant symbol that is not the maximum is incremented and
/// every symbol to its right is reset to zero. When all symbols are the
/// maximum the result gains a leading `1`.
fn increment(s: &str) -> String {
    let mut indices = to_indices(s);

    for i in (0..indices.len()).rev() {
        if indices[i] < MAX_SYMBOL {
            indices[i] += 1;
            for j in indices.iter_mut().skip(i + 1) {
                *j = 0;
            }
            return from_indices(&indices);
        }
    }

    let mut carried = String::with_capacity(indices.len() + 1);
    carried.push('1');
    carried.extend(std::iter::repeat('0').take(indices.len()));
    carried
}

/// Decrements a base32 string lexicographically; the inverse of [`increment`].
///
/// The width is preserved, except for a short carry-out form (`1` followed
/// only by zeros, narrower than a full revision) whose leading symbol is
/// dropped. Full-width strings always keep their width. All-zero strings
/// saturate.
fn decrement(s: &str) -> String {
    let mut indices = to_indices(s);

    let carried_out = indices.len() > 1
        && indices.len() < REVISION_LEN
        && indices[0] == 1
        && indices[1..].iter().all(|&i| i == 0);
    if carried_out {
        return std::iter::repeat('Z').take(indices.len() - 1).collect();
    }

    for i in (0..indices.len()).rev() {
        if indices[i] > 0 {
            indices[i] -= 1;
            for j in indices.iter_mut().skip(i + 1) {
                *j = MAX_SYMBOL;
            }
            return from_indices(&indices);
        }
    }

    s.to_string()
}

// =============================================================================
// Revision
// =============================================================================

/// Total-order position of an event.
///
/// Cheap to compare, immutable once assigned. Construct with
/// [`Revision::parse`] when the string comes from outside, or obtain one from a
/// [`RevisionGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    /// Parses and validates a revision string.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || !s.bytes().all(|c| symbol_index(c).is_some()) {
            return Err(Error::InvalidRevision(s));
        }
        Ok(Self(s))
    }

    /// Wraps a string read back from the store, which only ever holds
    /// revisions this crate produced.
    pub(crate) fn from_stored(s: String) -> Self {
        Self(s)
    }

    /// Sentinel below every real revision.
    pub fn start() -> Self {
        Self("0".to_string())
    }

    /// Sentinel above every real revision.
    pub fn end() -> Self {
        Self("Z".to_string())
    }

    /// Smallest real revision.
    pub fn min() -> Self {
        Self("0".repeat(REVISION_LEN))
    }

    /// Largest real revision (the 48-bit timestamp caps the first symbol at 7).
    pub fn max() -> Self {
        let mut s = String::with_capacity(REVISION_LEN);
        s.push('7');
        s.push_str(&"Z".repeat(REVISION_LEN - 1));
        Self(s)
    }

    pub fn is_start(&self) -> bool {
        self.0 == "0"
    }

    pub fn is_end(&self) -> bool {
        self.0 == "Z"
    }

    /// The next revision in lexicographic order.
    pub fn next(&self) -> Self {
        Self(increment(&self.0))
    }

    /// The previous revision in lexicographic order.
    pub fn prev(&self) -> Self {
        Self(decrement(&self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Revision {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Revision {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Revision> for String {
    fn from(revision: Revision) -> Self {
        revision.0
    }
}

impl AsRef<str> for Revision {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Generation
// =============================================================================

/// Source of wall-clock milliseconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Milliseconds since the Unix epoch, from the system clock.
pub fn system_clock_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

struct GeneratorState {
    last_ms: u64,
    last: Option<Revision>,
}

/// Produces strictly increasing revisions.
///
/// A fresh millisecond gets a fresh random tail. Within the same millisecond,
/// or when the clock goes backwards, the previous revision is incremented
/// instead, so the sequence from one generator never repeats or regresses.
pub struct RevisionGenerator {
    clock: Clock,
    state: Mutex<GeneratorState>,
}

impl RevisionGenerator {
    pub fn new() -> Self {
        Self::with_clock(system_clock_ms)
    }

    /// Creates a generator reading time from `clock`.
    pub fn with_clock(clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                last: None,
            }),
        }
    }

    /// Current time according to this generator's clock.
    pub fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    /// Generates the next revision for a commit happening at `now_ms`.
    pub fn generate(&self, now_ms: u64) -> Revision {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let revision = match &state.last {
            Some(last) if now_ms <= state.last_ms => last.next(),
            _ => Revision(format!("{}{}", encode_time(now_ms), random_tail())),
        };

        state.last_ms = state.last_ms.max(now_ms);
        state.last = Some(revision.clone());
        revision
    }
}

impl Default for RevisionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RevisionGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevisionGenerator").finish_non_exhaustive()
    }
}

/// Big-endian base32 encoding of a millisecond timestamp, 10 symbols wide.
pub fn encode_time(mut ms: u64) -> String {
    let mut out = [b'0'; TIME_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(ms & 31) as usize];
        ms >>= 5;
    }
    out.iter().map(|&c| c as char).collect()
}

fn random_tail() -> String {
    let mut bits: u128 = rand::random();
    let mut out = [b'0'; RANDOM_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(bits & 31) as usize];
        bits >>= 5;
    }
    out.iter().map(|&c| c as char).collect()
}

// =============================================================================
// Tests
// =============================================================================
