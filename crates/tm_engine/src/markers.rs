//! Valid-up-to markers per (variable, fingerprint) partition
//!
//! A marker `(T, inclusive)` says which datapoints of a partition are settled:
//! with `inclusive` everything at or before `T`, otherwise everything strictly
//! before `T`. Markers live only in memory and are rebuilt lazily after a restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tm_store::{Cutoff, Fingerprint, VariableId};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ValidUpTo {
    pub timestamp: DateTime<Utc>,
    pub inclusive: bool,
}

impl ValidUpTo {
    /// State of a partition nobody has analyzed yet
    #[must_use]
    pub fn epoch() -> Self {
        Self::pending_from(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Everything up to and including `timestamp` is settled
    #[must_use]
    pub fn settled(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            inclusive: true,
        }
    }

    /// Everything from `timestamp` onward needs analysis
    #[must_use]
    pub fn pending_from(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            inclusive: false,
        }
    }

    /// Range of timestamps not yet settled
    #[must_use]
    pub fn pending(&self) -> Cutoff {
        Cutoff {
            at: self.timestamp,
            include_at: !self.inclusive,
        }
    }

    #[must_use]
    pub fn is_pending(&self, ts: DateTime<Utc>) -> bool {
        self.pending().admits(ts)
    }
}

/// Key of one partition; the fingerprint is held in its canonical text form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub variable_id: VariableId,
    pub fingerprint: String,
}

impl PartitionKey {
    #[must_use]
    pub fn new(variable_id: VariableId, fingerprint: &Fingerprint) -> Self {
        Self {
            variable_id,
            fingerprint: fingerprint.key(),
        }
    }
}

/// Concurrent marker map. Every update is a compare-and-update on the
/// entry under its shard lock.
#[derive(Debug, Clone, Default)]
pub struct MarkerTable {
    entries: Arc<DashMap<PartitionKey, ValidUpTo>>,
}

impl MarkerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &PartitionKey) -> Option<ValidUpTo> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// A datapoint arrived at `ts`. If the partition has no marker, or `ts`
    /// falls inside its settled range, the marker drops to `(ts, exclusive)`.
    /// Returns the marker in force afterwards.
    pub fn invalidate(&self, key: PartitionKey, ts: DateTime<Utc>) -> ValidUpTo {
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| ValidUpTo::pending_from(ts));
        if !entry.is_pending(ts) {
            trace!(from = ?*entry, to = %ts, "Marker invalidated");
            *entry = ValidUpTo::pending_from(ts);
        }
        *entry
    }

    /// Install `marker` unless the partition already has one
    pub fn seed(&self, key: PartitionKey, marker: ValidUpTo) -> ValidUpTo {
        *self.entries.entry(key).or_insert(marker)
    }

    /// Move the marker from `expected` to `next`. Succeeds only when the entry
    /// still equals `expected` and `next` does not lie below it.
    pub fn advance(&self, key: &PartitionKey, expected: ValidUpTo, next: ValidUpTo) -> bool {
        if next < expected {
            return false;
        }
        match self.entries.get_mut(key) {
            Some(mut entry) if *entry == expected => {
                *entry = next;
                true
            }
            _ => false,
        }
    }

    /// Forget every marker of the given variables
    pub fn clear_variables(&self, variable_ids: &[VariableId]) {
        self.entries
            .retain(|key, _| !variable_ids.contains(&key.variable_id));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
