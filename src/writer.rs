//! # Transactional Append Writer
//!
//! An append turns a batch of pending events into one all-or-nothing
//! transaction against the backing store:
//!
//! ```text
//! index 0   PUT metadata (key, "head") = last revision   ← concurrency check
//! index 1   PUT event (key, r1)              NotExists
//! ...       PUT event (key, rN)              NotExists
//! ...       PUT metadata ("slice", s)        SkipIfExists  (one per slice)
//!           + optional idempotency token
//! ```
//!
//! The head put carries the optimistic-concurrency condition derived from the
//! expected revision:
//!
//! | expected | condition on the head row |
//! |----------|---------------------------|
//! | `END`    | none (overwrite) |
//! | `START`  | must not exist |
//! | `r`      | must currently hold `r` |
//!
//! Because the head op is always first, a failed condition at index 0 is a
//! concurrency conflict; a failure anywhere else is not.
//!
//! ## Invariants
//!
//! - Revisions within a batch are strictly increasing and all share one
//!   `committed_at`.
//! - The head never moves except inside this transaction.
//! - Every slice an event lands in is registered by the same transaction that
//!   writes the event, so the slice directory never misses a non-empty slice.
//! - Nothing is retried.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::revision::{Revision, RevisionGenerator};
use crate::slice::distinct_slices;
use crate::store::{
    BackingStore, Condition, EventRow, MetadataRow, Put, StoreError, TransactRequest, WriteOp,
};
use crate::types::{category_of, AppendOptions, AppendResult, PendingEvent};

/// Index of the head op within an append transaction.
pub const HEAD_OP_INDEX: usize = 0;

/// A prepared append, ready to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendPlan {
    pub request: TransactRequest,
    pub count: usize,
    /// Revision of the last event, the new head.
    pub revision: Revision,
}

/// RFC 3339 UTC with millisecond precision.
pub fn format_committed_at(now_ms: u64) -> String {
    let at = DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_default();
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the transaction for an append. Returns `None` for an empty batch.
///
/// Payloads are serialized before any revision is generated, so a payload that
/// fails to serialize consumes nothing.
pub fn plan_append<D: Serialize>(
    generator: &RevisionGenerator,
    key: &str,
    events: Vec<PendingEvent<D>>,
    options: &AppendOptions,
) -> Result<Option<AppendPlan>> {
    if events.is_empty() {
        return Ok(None);
    }

    let payloads = events
        .iter()
        .map(|event| serde_json::to_value(&event.data))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let now_ms = generator.now_ms();
    let committed_at = format_committed_at(now_ms);
    let default_category = category_of(key);

    let rows: Vec<EventRow> = events
        .into_iter()
        .zip(payloads)
        .map(|(event, data)| EventRow {
            key: key.to_string(),
            revision: generator.generate(now_ms),
            event_type: event.event_type,
            committed_at: committed_at.clone(),
            category: event
                .category
                .or_else(|| default_category.map(str::to_string)),
            correlation_id: event.correlation_id,
            data,
        })
        .collect();

    let count = rows.len();
    let revision = match rows.last() {
        Some(row) => row.revision.clone(),
        None => return Ok(None),
    };

    let head_condition = if options.expected_revision.is_end() {
        Condition::None
    } else if options.expected_revision.is_start() {
        Condition::NotExists
    } else {
        Condition::RevisionEquals(options.expected_revision.clone())
    };

    let slices = distinct_slices(rows.iter().map(|row| &row.revision));

    let mut ops = Vec::with_capacity(1 + count + slices.len());
    ops.push(WriteOp {
        put: Put::Metadata(MetadataRow::head(key, revision.clone())),
        condition: head_condition,
    });
    ops.extend(rows.into_iter().map(|row| WriteOp {
        put: Put::Event(row),
        condition: Condition::NotExists,
    }));
    ops.extend(slices.iter().map(|slice| WriteOp {
        put: Put::Metadata(MetadataRow::slice(slice)),
        condition: Condition::SkipIfExists,
    }));

    Ok(Some(AppendPlan {
        request: TransactRequest {
            ops,
            token: options.idempotency_key.clone(),
        },
        count,
        revision,
    }))
}

/// Appends `events` to the stream `key`.
pub async fn append<D: Serialize>(
    store: &dyn BackingStore,
    generator: &RevisionGenerator,
    key: &str,
    events: Vec<PendingEvent<D>>,
    options: AppendOptions,
) -> AppendResult {
    let plan = match plan_append(generator, key, events, &options) {
        Ok(Some(plan)) => plan,
        Ok(None) => return AppendResult::Unchanged,
        Err(error) => {
            warn!(key, error = %error, "append aborted before submit");
            return AppendResult::Unknown { error };
        }
    };

    let tokened = plan.request.token.is_some();
    match store.transact_write(plan.request).await {
        Ok(outcome) if outcome.writes == 0 && tokened => {
            debug!(key, "append skipped, idempotency key already used");
            AppendResult::Unchanged
        }
        Ok(_) => {
            debug!(key, count = plan.count, revision = %plan.revision, "appended");
            AppendResult::Appended {
                count: plan.count,
                revision: plan.revision,
            }
        }
        Err(error @ StoreError::ConditionFailed { index: HEAD_OP_INDEX }) => {
            info!(key, expected = %options.expected_revision, "append conflict");
            AppendResult::OptimisticConcurrency {
                expected: options.expected_revision,
                error,
            }
        }
        Err(error) => {
            warn!(key, error = %error, "append failed");
            AppendResult::Unknown {
                error: Error::Store(error),
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
    use crate::slice::Slice;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn events(n: usize) -> Vec<PendingEvent> {
        (0..n)
            .map(|i| PendingEvent::new("counted", json!({ "value": i })))
            .collect()
    }

    fn plan(options: AppendOptions, n: usize) -> AppendPlan {
        let generator = RevisionGenerator::with_clock(|| 1_700_000_000_000);
        plan_append(&generator, "counter/1", events(n), &options)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_empty_batch_has_no_plan() {
        let generator = RevisionGenerator::new();
        let planned =
            plan_append::<Value>(&generator, "k", Vec::new(), &AppendOptions::default()).unwrap();
        assert!(planned.is_none());
    }

    #[test]
    fn test_head_op_comes_first_with_condition() {
        let cases = [
            (Revision::end(), Condition::None),
            (Revision::start(), Condition::NotExists),
            (
                Revision::min(),
                Condition::RevisionEquals(Revision::min()),
            ),
        ];

        for (expected, condition) in cases {
            let plan = plan(AppendOptions::new().expect(expected), 2);
            let head = &plan.request.ops[HEAD_OP_INDEX];
            assert_eq!(head.condition, condition);
            match &head.put {
                Put::Metadata(row) => {
                    assert_eq!(row.pk, "counter/1");
                    assert_eq!(row.revision.as_ref(), Some(&plan.revision));
                }
                other => panic!("expected head put, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_events_share_timestamp_and_increase() {
        let plan = plan(AppendOptions::default(), 3);
        let rows: Vec<&EventRow> = plan
            .request
            .ops
            .iter()
            .filter_map(|op| match &op.put {
                Put::Event(row) => {
                    assert_eq!(op.condition, Condition::NotExists);
                    Some(row)
                }
                _ => None,
            })
            .collect();

        assert_eq!(rows.len(), 3);
        assert_eq!(plan.count, 3);
        assert!(rows.windows(2).all(|w| w[0].revision < w[1].revision));
        assert!(rows.iter().all(|r| r.committed_at == "2023-11-14T22:13:20.000Z"));
        assert!(rows.iter().all(|r| r.category.as_deref() == Some("counter")));
        assert_eq!(rows[2].revision, plan.revision);
    }

    #[test]
    fn test_every_slice_of_the_batch_is_registered() {
        // One millisecond before a slice boundary: the batch may straddle it.
        let boundary = 2 * 32u64.pow(5);
        let clock = Arc::new(AtomicU64::new(boundary - 1));
        let c = Arc::clone(&clock);
        let generator = RevisionGenerator::with_clock(move || c.fetch_add(1, Ordering::SeqCst));

        let first = plan_append(&generator, "k", events(1), &AppendOptions::default())
            .unwrap()
            .unwrap();
        let second = plan_append(&generator, "k", events(1), &AppendOptions::default())
            .unwrap()
            .unwrap();
        assert_ne!(Slice::of(&first.revision), Slice::of(&second.revision));

        let slice_ops = |plan: &AppendPlan| -> Vec<String> {
            plan.request
                .ops
                .iter()
                .filter_map(|op| match &op.put {
                    Put::Metadata(row) if row.pk == "slice" => {
                        assert_eq!(op.condition, Condition::SkipIfExists);
                        Some(row.sk.clone())
                    }
                    _ => None,
                })
                .collect()
        };
        assert_eq!(slice_ops(&first), vec![Slice::of(&first.revision).to_string()]);
        assert_eq!(slice_ops(&second), vec![Slice::of(&second.revision).to_string()]);
    }

    #[test]
    fn test_explicit_category_wins() {
        let generator = RevisionGenerator::new();
        let events = vec![PendingEvent::new("x", json!(null)).with_category("audit")];
        let plan = plan_append(&generator, "counter/1", events, &AppendOptions::default())
            .unwrap()
            .unwrap();
        let category = plan.request.ops.iter().find_map(|op| match &op.put {
            Put::Event(row) => row.category.clone(),
            _ => None,
        });
        assert_eq!(category.as_deref(), Some("audit"));
    }

    #[test]
    fn test_token_is_attached() {
        let plan = plan(AppendOptions::new().idempotency_key("t-1"), 1);
        assert_eq!(plan.request.token.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_committed_at_format() {
        assert_eq!(format_committed_at(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_committed_at(1_234), "1970-01-01T00:00:01.234Z");
    }
}
