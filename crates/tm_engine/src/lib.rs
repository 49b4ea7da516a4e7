//! tm_engine - Incremental change detection and recalculation for Tidemark
//!
//! This crate provides:
//! - DataPoint emission from resolved variable values
//! - Valid-up-to markers and incremental detection passes
//! - Per-test sequential lanes over a bounded worker pool
//! - Single-flight recalculation with observable progress
//! - The missing-data watchdog

pub mod detector;
pub mod emitter;
pub mod events;
pub mod lanes;
pub mod markers;
pub mod recalc;
pub mod resolve;
pub mod watchdog;

pub use detector::{Detector, DrainSummary, PassOutcome};
pub use emitter::{DatasetEmission, EmitOptions, Emitter, MissingValue};
pub use events::{EngineEvent, EventSink, FanoutSink, LogSink, MemorySink};
pub use lanes::LaneDispatcher;
pub use markers::{MarkerTable, PartitionKey, ValidUpTo};
pub use recalc::{
    RecalculationRequest, RecalculationStart, RecalculationState, RecalculationStatus,
    RecalculationTracker,
};
pub use resolve::{
    LabelValueResolver, NoScriptEvaluator, Resolution, ResolveError, ScriptEvaluator,
    ScriptOutcome, ValueResolver,
};
pub use watchdog::Watchdog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tm_config::TmConfig;
use tm_detect::{ModelError, ModelRegistry};
use tm_store::{
    Change, ChangeId, DatasetId, DatasetInfo, Fingerprint, RuleId, StoreError, TestId, TmStore,
    VariableId,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Upstream notification that a dataset's label values were (re)computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelsUpdated {
    pub test_id: TestId,
    pub dataset_id: DatasetId,
    pub is_recalculation: bool,
    /// Requeues so far while the dataset was not visible
    #[serde(default)]
    pub attempt: u32,
}

impl LabelsUpdated {
    #[must_use]
    pub fn new(test_id: TestId, dataset_id: DatasetId) -> Self {
        Self {
            test_id,
            dataset_id,
            is_recalculation: false,
            attempt: 0,
        }
    }
}

/// One dataset after emission and rule checks
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDataset {
    pub dataset: DatasetInfo,
    pub emission: DatasetEmission,
    pub rules_matched: Vec<RuleId>,
}

impl ProcessedDataset {
    fn events(&self, notify: bool) -> Vec<EngineEvent> {
        let mut events: Vec<EngineEvent> = self
            .emission
            .datapoints
            .iter()
            .map(|dp| EngineEvent::DataPointCreated {
                variable_id: dp.variable_id,
                dataset_id: dp.dataset_id,
                timestamp: dp.timestamp,
                value: dp.value,
            })
            .collect();
        if !self.emission.missing.is_empty() {
            events.push(EngineEvent::MissingValues {
                dataset: self.dataset,
                variable_names: self.emission.missing_names(),
                notify,
            });
        }
        events.push(EngineEvent::DatasetProcessed {
            dataset: self.dataset,
            notify,
        });
        events
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LabelsOutcome {
    /// The dataset is not visible to this reader yet
    NotVisible,
    Processed(ProcessedDataset),
}

/// How detection follows a committed dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detection {
    /// Queue drains on the test's lane
    Scheduled,
    /// The caller drains before moving on
    Inline,
}

struct Inner {
    store: TmStore,
    config: TmConfig,
    emitter: Emitter,
    detector: Detector,
    watchdog: Watchdog,
    lanes: LaneDispatcher,
    recalculations: RecalculationTracker,
    sink: Arc<dyn EventSink>,
    handle: Handle,
}

/// Engine facade. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub struct EngineBuilder {
    store: Option<TmStore>,
    config: Option<TmConfig>,
    registry: Option<ModelRegistry>,
    resolver: Option<Arc<dyn ValueResolver>>,
    evaluator: Option<Arc<dyn ScriptEvaluator>>,
    sink: Option<Arc<dyn EventSink>>,
    recalculations: Option<RecalculationTracker>,
    handle: Option<Handle>,
}

impl EngineBuilder {
    #[must_use]
    pub fn store(mut self, store: TmStore) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn config(mut self, config: TmConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ValueResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Evaluator for rule conditions, and for calculations when no resolver is set
    #[must_use]
    pub fn evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share a tracker with the caller, e.g. to observe progress mid-run
    #[must_use]
    pub fn recalculations(mut self, tracker: RecalculationTracker) -> Self {
        self.recalculations = Some(tracker);
        self
    }

    #[must_use]
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Runtime`] outside a tokio runtime when no handle
    /// was given, and [`EngineError::Store`] if the configured database cannot
    /// be opened.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config.unwrap_or_default();
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| EngineError::Runtime(e.to_string()))?,
        };
        let store = match self.store {
            Some(store) => store,
            None => TmStore::open(&config.global.db_path)?,
        };
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(NoScriptEvaluator));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(LabelValueResolver::new(Arc::clone(&evaluator))));
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink::info()));
        let registry = Arc::new(self.registry.unwrap_or_else(ModelRegistry::with_builtin));

        let detector = Detector::new(
            store.clone(),
            registry,
            MarkerTable::new(),
            Arc::clone(&sink),
        );
        let watchdog = Watchdog::new(store.clone(), evaluator, Arc::clone(&sink));
        let lanes = LaneDispatcher::new(handle.clone(), config.engine.workers);

        info!(
            db = store.db_path(),
            workers = config.engine.workers,
            models = ?detector.registry().ids(),
            "Engine ready"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                store,
                emitter: Emitter::new(resolver),
                detector,
                watchdog,
                lanes,
                recalculations: self.recalculations.unwrap_or_default(),
                sink,
                handle,
                config,
            }),
        })
    }
}

impl Engine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    #[must_use]
    pub fn store(&self) -> &TmStore {
        &self.inner.store
    }

    #[must_use]
    pub fn config(&self) -> &TmConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.inner.sink)
    }

    /// Current marker of a partition, if one is held
    #[must_use]
    pub fn marker(&self, variable_id: VariableId, fingerprint: &Fingerprint) -> Option<ValidUpTo> {
        self.inner
            .detector
            .markers()
            .get(&PartitionKey::new(variable_id, fingerprint))
    }

    // =========================================================================
    // Upstream events
    // =========================================================================

    /// Queue a labels event on its test's lane. Datasets that are not visible
    /// yet are requeued after a delay, a bounded number of times.
    pub fn labels_updated(&self, event: LabelsUpdated) {
        let engine = self.clone();
        self.inner
            .lanes
            .submit(event.test_id, move || engine.handle_labels_updated(event));
    }

    fn handle_labels_updated(&self, event: LabelsUpdated) {
        match self.process_labels_updated(event.dataset_id, event.is_recalculation) {
            Ok(LabelsOutcome::Processed(_)) => {}
            Ok(LabelsOutcome::NotVisible) => self.requeue_labels_updated(event),
            Err(e) => error!(
                dataset_id = event.dataset_id,
                error = %e,
                "Processing labels update failed"
            ),
        }
    }

    fn requeue_labels_updated(&self, event: LabelsUpdated) {
        let settings = &self.inner.config.engine;
        if event.attempt >= settings.visibility_retry_attempts {
            warn!(
                dataset_id = event.dataset_id,
                attempts = event.attempt + 1,
                "Dataset never became visible, dropping labels update"
            );
            return;
        }
        debug!(
            dataset_id = event.dataset_id,
            attempt = event.attempt + 1,
            "Dataset not visible yet, retrying"
        );
        let retry = LabelsUpdated {
            attempt: event.attempt + 1,
            ..event
        };
        let engine = self.clone();
        self.inner.lanes.submit_after(
            event.test_id,
            settings.visibility_retry_delay(),
            move || engine.handle_labels_updated(retry),
        );
    }

    /// Emit datapoints and rule results for one dataset in a single unit of
    /// work, then schedule detection for every touched partition
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the unit of work fails.
    pub fn process_labels_updated(
        &self,
        dataset_id: DatasetId,
        is_recalculation: bool,
    ) -> Result<LabelsOutcome, EngineError> {
        let options = EmitOptions {
            notify: !is_recalculation,
            debug: false,
        };
        Ok(
            match self.process_dataset(dataset_id, options, Detection::Scheduled)? {
                Some(processed) => LabelsOutcome::Processed(processed),
                None => LabelsOutcome::NotVisible,
            },
        )
    }

    fn process_dataset(
        &self,
        dataset_id: DatasetId,
        options: EmitOptions,
        detection: Detection,
    ) -> Result<Option<ProcessedDataset>, EngineError> {
        let engine = self.clone();
        self.inner
            .store
            .transaction(|tx| -> Result<_, EngineError> {
                let Some(dataset) = tx.get_dataset(dataset_id)? else {
                    return Ok(None);
                };
                let test = tx
                    .get_test(dataset.test_id)?
                    .ok_or_else(|| EngineError::NotFound(format!("test {}", dataset.test_id)))?;

                let emission = self.inner.emitter.emit_dataset(tx, &dataset, &test, options)?;
                let rules_matched = self.inner.watchdog.check_dataset(tx, &dataset)?;
                let processed = ProcessedDataset {
                    dataset: dataset.info(),
                    emission,
                    rules_matched,
                };

                let committed = processed.clone();
                tx.after_commit(move || engine.dataset_committed(&committed, options.notify, detection));
                Ok(Some(processed))
            })
    }

    fn dataset_committed(&self, processed: &ProcessedDataset, notify: bool, detection: Detection) {
        for (key, timestamp) in processed.emission.partitions() {
            self.inner.detector.on_new_datapoint(key, timestamp);
        }
        if detection == Detection::Scheduled {
            for (variable_id, fingerprint) in processed.emission.drain_targets() {
                self.schedule_drain(processed.dataset.test_id, variable_id, fingerprint, notify);
            }
        }
        for event in processed.events(notify) {
            self.inner.sink.publish(&event);
        }
    }

    fn schedule_drain(
        &self,
        test_id: TestId,
        variable_id: VariableId,
        fingerprint: Fingerprint,
        notify: bool,
    ) {
        let detector = self.inner.detector.clone();
        self.inner.lanes.submit(test_id, move || {
            if let Err(e) = detector.drain(variable_id, &fingerprint, notify) {
                error!(variable_id, error = %e, "Detection failed");
            }
        });
    }

    // =========================================================================
    // Recalculation
    // =========================================================================

    /// Start a recalculation on the test's lane unless one is still running
    pub fn recalculate(&self, request: RecalculationRequest) -> RecalculationStart {
        let Some(state) = self.inner.recalculations.try_begin(request.test_id) else {
            info!(test_id = request.test_id, "Recalculation already running");
            return RecalculationStart::AlreadyRunning;
        };
        info!(
            test_id = request.test_id,
            from = ?request.from,
            to = ?request.to,
            "Recalculation queued"
        );
        let engine = self.clone();
        self.inner.lanes.submit(request.test_id, move || {
            let run = panic::catch_unwind(AssertUnwindSafe(|| {
                engine.run_recalculation(request, &state);
            }));
            if run.is_err() || !state.is_done() {
                error!(test_id = request.test_id, "Recalculation aborted before finishing");
                state.fail("recalculation aborted");
            }
            engine.expire_later(request.test_id, state);
        });
        RecalculationStart::Started
    }

    #[instrument(skip(self, state), fields(test_id = request.test_id))]
    fn run_recalculation(&self, request: RecalculationRequest, state: &RecalculationState) {
        let prepared = self
            .inner
            .store
            .transaction(|tx| -> Result<_, EngineError> {
                tx.get_test(request.test_id)?
                    .ok_or_else(|| EngineError::NotFound(format!("test {}", request.test_id)))?;
                let datasets = tx.list_dataset_ids(request.test_id, request.from, request.to)?;
                let variables: Vec<VariableId> = tx
                    .list_variables(request.test_id)?
                    .iter()
                    .map(|v| v.id)
                    .collect();
                tx.delete_datapoints_for_datasets(&datasets)?;
                tx.delete_unconfirmed_changes_for_datasets(&datasets)?;
                Ok((datasets, variables))
            });
        let (datasets, variables) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "Recalculation aborted");
                state.fail(e.to_string());
                return;
            }
        };

        self.inner.detector.markers().clear_variables(&variables);
        state.set_total(datasets.len());
        let options = EmitOptions {
            notify: request.notify,
            debug: request.debug,
        };

        for dataset_id in datasets {
            match self.recalculate_dataset(dataset_id, options) {
                Ok(true) => {}
                Ok(false) => state.record_without_value(dataset_id),
                Err(e) => {
                    warn!(dataset_id, error = %e, "Dataset recalculation failed");
                    state.record_error();
                }
            }
            state.dataset_finished();
        }

        state.finish();
        let status = state.snapshot();
        info!(
            datasets = status.total,
            errors = status.errors,
            without_value = status.datasets_without_value.len(),
            "Recalculation finished"
        );
    }

    /// Returns whether every variable produced a value
    fn recalculate_dataset(&self, dataset_id: DatasetId, options: EmitOptions) -> Result<bool, EngineError> {
        let processed = self
            .process_dataset(dataset_id, options, Detection::Inline)?
            .ok_or_else(|| EngineError::NotFound(format!("dataset {dataset_id}")))?;
        for (variable_id, fingerprint) in processed.emission.drain_targets() {
            self.inner
                .detector
                .drain(variable_id, &fingerprint, options.notify)?;
        }
        Ok(processed.emission.missing.is_empty())
    }

    fn expire_later(&self, test_id: TestId, state: Arc<RecalculationState>) {
        let tracker = self.inner.recalculations.clone();
        let grace = self.inner.config.recalculation.grace_period();
        self.inner.handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if tracker.expire(test_id, &state) {
                debug!(test_id, "Recalculation status expired");
            }
        });
    }

    #[must_use]
    pub fn recalculation_status(&self, test_id: TestId) -> RecalculationStatus {
        self.inner.recalculations.status(test_id)
    }

    // =========================================================================
    // Queries and curation
    // =========================================================================

    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the query fails.
    pub fn list_changes(
        &self,
        variable_id: VariableId,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<Vec<Change>, EngineError> {
        Ok(self
            .inner
            .store
            .transaction(|tx| tx.list_changes(variable_id, fingerprint))?)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the query fails.
    pub fn last_datapoint_timestamps(
        &self,
        fingerprint: Option<&Fingerprint>,
        variable_ids: &[VariableId],
    ) -> Result<Vec<(VariableId, DateTime<Utc>)>, EngineError> {
        Ok(self
            .inner
            .store
            .transaction(|tx| tx.last_datapoint_timestamps(fingerprint, variable_ids))?)
    }

    /// Drain one partition on its test's lane and wait for the result
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown variable, or the error
    /// of the failing pass.
    pub async fn run_detection(
        &self,
        variable_id: VariableId,
        fingerprint: Fingerprint,
        notify: bool,
    ) -> Result<DrainSummary, EngineError> {
        let variable = self
            .inner
            .store
            .transaction(|tx| tx.get_variable(variable_id))?
            .ok_or_else(|| EngineError::NotFound(format!("variable {variable_id}")))?;

        let (done, result) = oneshot::channel();
        let detector = self.inner.detector.clone();
        self.inner.lanes.submit(variable.test_id, move || {
            let _ = done.send(detector.drain(variable_id, &fingerprint, notify));
        });
        result
            .await
            .map_err(|_| EngineError::Runtime("detection job dropped".to_string()))?
    }

    /// Delete a variable with its datapoints and changes, and forget its markers
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the delete fails.
    pub fn delete_variable(&self, variable_id: VariableId) -> Result<bool, EngineError> {
        let deleted = self
            .inner
            .store
            .transaction(|tx| tx.delete_variables(&[variable_id]))?;
        self.inner.detector.markers().clear_variables(&[variable_id]);
        Ok(deleted > 0)
    }

    /// Mark a change as accepted (or no longer accepted) by a human
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the update fails.
    pub fn confirm_change(&self, change_id: ChangeId, confirmed: bool) -> Result<bool, EngineError> {
        let updated = self
            .inner
            .store
            .transaction(|tx| tx.set_change_confirmed(change_id, confirmed))?;
        if updated {
            info!(change_id, confirmed, "Change curated");
        }
        Ok(updated)
    }

    // =========================================================================
    // Watchdog and lanes
    // =========================================================================

    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the scan fails.
    pub fn watchdog_tick(&self, now: DateTime<Utc>) -> Result<Vec<RuleId>, EngineError> {
        self.inner.watchdog.tick(now)
    }

    /// Start the periodic watchdog, unless disabled in configuration
    #[must_use]
    pub fn start_watchdog(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.watchdog.enabled {
            debug!("Watchdog disabled");
            return None;
        }
        let period = self.inner.config.watchdog_interval();
        info!(interval_secs = period.as_secs(), "Starting missing-data watchdog");
        Some(self.inner.watchdog.clone().spawn(&self.inner.handle, period))
    }

    /// Wait until the test's lane has no queued, running or delayed work
    pub async fn flush(&self, test_id: TestId) {
        self.inner.lanes.flush(test_id).await;
    }
}
