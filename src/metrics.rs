//! Read-only aggregation over the gate-decision log.
//!
//! Observability only: nothing here feeds back into admission control.
//! The HTTP surface records every decision as it happens; this module
//! turns the log into counts by outcome and by reason over a lookback
//! window.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ports::EngineError;
use crate::storage::Storage;

/// Default lookback when the caller does not specify one.
pub const DEFAULT_LOOKBACK_MINUTES: i64 = 60;

/// Aggregated view of recent gate decisions.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionSummary {
    /// Window the summary covers, ending at `as_of`.
    pub lookback_minutes: i64,

    /// Right edge of the window.
    pub as_of: DateTime<Utc>,

    /// Total decisions in the window.
    pub total: i64,

    /// Decision counts by outcome (ALLOWED, BLOCKED, DELAYED, APPROVED,
    /// QUEUED).
    pub by_outcome: BTreeMap<String, i64>,

    /// Counts of refused or deferred decisions by reason.
    pub by_reason: BTreeMap<String, i64>,
}

/// Summarize the decision log over the trailing window.
///
/// # Arguments
///
/// * `storage` - Database connection
/// * `lookback_minutes` - How far back to count
/// * `now` - Reference timestamp (typically current time)
pub async fn summarize_decisions(
    storage: &Storage,
    lookback_minutes: i64,
    now: DateTime<Utc>,
) -> Result<DecisionSummary, EngineError> {
    let counts = storage.decision_counts(lookback_minutes, now).await?;

    let mut total = 0;
    let mut by_outcome: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_reason: BTreeMap<String, i64> = BTreeMap::new();

    for row in counts {
        total += row.count;
        *by_outcome.entry(row.outcome).or_insert(0) += row.count;
        if let Some(reason) = row.reason {
            *by_reason.entry(reason).or_insert(0) += row.count;
        }
    }

    Ok(DecisionSummary {
        lookback_minutes,
        as_of: now,
        total,
        by_outcome,
        by_reason,
    })
}
