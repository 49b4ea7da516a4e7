//! Incremental change detection over (variable, fingerprint) partitions
//!
//! A pass picks the earliest datapoint the partition marker has not settled,
//! discards provisional changes the new data invalidates, runs every
//! configured model over the window since the last change and then settles
//! that timestamp. [`Detector::drain`] repeats passes until nothing is pending.
//! Each pass is its own transaction.

use crate::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::markers::{MarkerTable, PartitionKey, ValidUpTo};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tm_detect::{ModelRegistry, SeriesPoint};
use tm_store::{
    Change, Fingerprint, LogCategory, LogLevel, NewChange, NewDiagnostic, TmStore, Tx, Variable,
    VariableId,
};
use tracing::{debug, info, instrument, warn};

/// Result of one detection pass
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Nothing pending in the partition
    Idle,
    Analyzed {
        from: ValidUpTo,
        timestamp: DateTime<Utc>,
        changes: Vec<Change>,
        /// False when a concurrent invalidation moved the marker first
        advanced: bool,
    },
}

/// Totals of a drained partition
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainSummary {
    pub passes: usize,
    pub changes: Vec<Change>,
    pub valid_up_to: Option<ValidUpTo>,
}

#[derive(Clone)]
pub struct Detector {
    store: TmStore,
    registry: Arc<ModelRegistry>,
    markers: MarkerTable,
    sink: Arc<dyn EventSink>,
}

impl Detector {
    pub fn new(
        store: TmStore,
        registry: Arc<ModelRegistry>,
        markers: MarkerTable,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            registry,
            markers,
            sink,
        }
    }

    #[must_use]
    pub fn markers(&self) -> &MarkerTable {
        &self.markers
    }

    #[must_use]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Record that a datapoint landed at `timestamp` in the partition
    pub fn on_new_datapoint(&self, key: PartitionKey, timestamp: DateTime<Utc>) -> ValidUpTo {
        self.markers.invalidate(key, timestamp)
    }

    /// Marker for a partition that has none yet: settled up to the latest
    /// confirmed change, or nothing settled at all
    fn seed_marker(
        &self,
        tx: &Tx<'_>,
        key: &PartitionKey,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
    ) -> Result<ValidUpTo, EngineError> {
        if let Some(marker) = self.markers.get(key) {
            return Ok(marker);
        }
        let seed = tx
            .latest_confirmed_change(variable_id, fingerprint)?
            .map_or_else(ValidUpTo::epoch, |change| ValidUpTo::settled(change.timestamp));
        debug!(variable_id, ?seed, "Seeding marker");
        Ok(self.markers.seed(key.clone(), seed))
    }

    /// Run one detection pass over a partition
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the unit of work fails. Model
    /// configuration problems are logged as diagnostics and skipped.
    #[instrument(skip(self, fingerprint), fields(fingerprint = %fingerprint))]
    pub fn run_pass(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
        notify: bool,
    ) -> Result<PassOutcome, EngineError> {
        let key = PartitionKey::new(variable_id, fingerprint);
        let sink = Arc::clone(&self.sink);

        let analyzed = self.store.transaction(|tx| -> Result<_, EngineError> {
            let Some(variable) = tx.get_variable(variable_id)? else {
                debug!("Variable gone, nothing to analyze");
                return Ok(None);
            };
            let marker = self.seed_marker(tx, &key, variable_id, fingerprint)?;

            let Some(next) = tx.next_datapoint_timestamp(variable_id, fingerprint, marker.pending())?
            else {
                return Ok(None);
            };

            let dropped = tx.delete_unconfirmed_changes_from(variable_id, fingerprint, marker.pending())?;
            if dropped > 0 {
                debug!(dropped, "Discarded invalidated changes");
            }

            let lower = tx
                .latest_change_before(variable_id, fingerprint, next)?
                .map_or(DateTime::<Utc>::UNIX_EPOCH, |change| change.timestamp);
            let window: Vec<SeriesPoint> = tx
                .datapoints_between(variable_id, fingerprint, lower, next)?
                .into_iter()
                .map(|dp| SeriesPoint {
                    dataset_id: dp.dataset_id,
                    timestamp: dp.timestamp,
                    value: dp.value,
                })
                .collect();

            let changes = self.detect(tx, &variable, fingerprint, &window)?;
            if !changes.is_empty() {
                let events = self.change_events(tx, &variable, &changes, notify)?;
                tx.after_commit(move || {
                    for event in &events {
                        sink.publish(event);
                    }
                });
            }
            Ok(Some((marker, next, changes)))
        })?;

        let Some((from, timestamp, changes)) = analyzed else {
            return Ok(PassOutcome::Idle);
        };
        let advanced = self
            .markers
            .advance(&key, from, ValidUpTo::settled(timestamp));
        if !advanced {
            debug!(%timestamp, "Marker moved during pass, not advancing");
        }
        Ok(PassOutcome::Analyzed {
            from,
            timestamp,
            changes,
            advanced,
        })
    }

    /// Run every detection config of `variable` over `window` and persist the
    /// candidates as unconfirmed changes
    fn detect(
        &self,
        tx: &Tx<'_>,
        variable: &Variable,
        fingerprint: &Fingerprint,
        window: &[SeriesPoint],
    ) -> Result<Vec<Change>, EngineError> {
        let Some(newest) = window.first() else {
            return Ok(Vec::new());
        };
        let mut created = Vec::new();

        for detection in &variable.detection {
            let candidates = match self.registry.analyze(&detection.model, &detection.config, window) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(variable_id = variable.id, model = %detection.model, error = %e, "Skipping detection config");
                    tx.log_diagnostic(&NewDiagnostic {
                        test_id: variable.test_id,
                        dataset_id: Some(newest.dataset_id),
                        level: LogLevel::Error,
                        category: LogCategory::ChangeDetection,
                        message: format!("Variable {}: {e}", variable.name),
                    })?;
                    continue;
                }
            };

            for candidate in candidates {
                if tx.has_confirmed_change(variable.id, fingerprint, candidate.dataset_id)? {
                    debug!(dataset_id = candidate.dataset_id, "Change already confirmed");
                    continue;
                }
                let change = tx.insert_change(&NewChange {
                    variable_id: variable.id,
                    dataset_id: candidate.dataset_id,
                    timestamp: candidate.timestamp,
                    description: candidate.description,
                    confirmed: false,
                    fingerprint: fingerprint.clone(),
                })?;
                info!(
                    change_id = change.id,
                    variable = %variable.name,
                    dataset_id = change.dataset_id,
                    "Change detected"
                );
                created.push(change);
            }
        }
        Ok(created)
    }

    fn change_events(
        &self,
        tx: &Tx<'_>,
        variable: &Variable,
        changes: &[Change],
        notify: bool,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        let test_name = tx
            .get_test(variable.test_id)?
            .map(|t| t.name)
            .unwrap_or_default();
        let mut events = Vec::with_capacity(changes.len());
        for change in changes {
            let Some(dataset) = tx.dataset_info(change.dataset_id)? else {
                continue;
            };
            events.push(EngineEvent::ChangeCreated {
                change: change.clone(),
                test_name: test_name.clone(),
                dataset,
                notify,
            });
        }
        Ok(events)
    }

    /// Run passes until the partition has nothing pending
    ///
    /// # Errors
    ///
    /// Stops at the first failing pass. Passes committed before it stay committed.
    pub fn drain(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
        notify: bool,
    ) -> Result<DrainSummary, EngineError> {
        let key = PartitionKey::new(variable_id, fingerprint);
        let mut summary = DrainSummary::default();
        while let PassOutcome::Analyzed { changes, .. } = self.run_pass(variable_id, fingerprint, notify)? {
            summary.passes += 1;
            summary.changes.extend(changes);
        }
        summary.valid_up_to = self.markers.get(&key);
        debug!(
            variable_id,
            passes = summary.passes,
            changes = summary.changes.len(),
            "Partition drained"
        );
        Ok(summary)
    }
}
