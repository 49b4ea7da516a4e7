//! Recalculation progress tracking, single-flight per test

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tm_store::{DatasetId, TestId};

/// Parameters of one recalculation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecalculationRequest {
    pub test_id: TestId,
    pub notify: bool,
    pub debug: bool,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RecalculationRequest {
    #[must_use]
    pub fn new(test_id: TestId) -> Self {
        Self {
            test_id,
            notify: false,
            debug: false,
            from: None,
            to: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalculationStart {
    Started,
    /// A run for the same test is still in progress; nothing was scheduled
    AlreadyRunning,
}

/// Snapshot of a run, as returned to pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecalculationStatus {
    pub done: bool,
    pub progress: u32,
    pub total: usize,
    pub finished: usize,
    pub errors: u32,
    pub datasets_without_value: Vec<DatasetId>,
    pub error: Option<String>,
}

impl RecalculationStatus {
    /// Status reported when no run is tracked
    #[must_use]
    pub fn idle() -> Self {
        Self {
            done: true,
            progress: 100,
            total: 0,
            finished: 0,
            errors: 0,
            datasets_without_value: Vec::new(),
            error: None,
        }
    }
}

/// Live state of one run
#[derive(Debug, Default)]
pub struct RecalculationState {
    done: AtomicBool,
    total: AtomicUsize,
    finished: AtomicUsize,
    errors: AtomicU32,
    without_value: Mutex<BTreeSet<DatasetId>>,
    error: Mutex<Option<String>>,
}

impl RecalculationState {
    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn dataset_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_without_value(&self, dataset_id: DatasetId) {
        self.without_value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dataset_id);
    }

    /// Abort with a terminal error
    pub fn fail(&self, message: impl Into<String>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
        self.finish();
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn snapshot(&self) -> RecalculationStatus {
        let done = self.is_done();
        let total = self.total.load(Ordering::SeqCst);
        let finished = self.finished.load(Ordering::SeqCst);
        let progress = if total == 0 {
            if done { 100 } else { 0 }
        } else {
            u32::try_from(finished.min(total) * 100 / total).unwrap_or(100)
        };
        RecalculationStatus {
            done,
            progress,
            total,
            finished,
            errors: self.errors.load(Ordering::SeqCst),
            datasets_without_value: self
                .without_value
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .collect(),
            error: self
                .error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// At most one live run per test
#[derive(Debug, Clone, Default)]
pub struct RecalculationTracker {
    states: Arc<DashMap<TestId, Arc<RecalculationState>>>,
}

impl RecalculationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh state unless a run is still going. Returns `None` when
    /// the test already has an unfinished run.
    pub fn try_begin(&self, test_id: TestId) -> Option<Arc<RecalculationState>> {
        match self.states.entry(test_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_done() {
                    return None;
                }
                let state = Arc::new(RecalculationState::default());
                entry.insert(Arc::clone(&state));
                Some(state)
            }
            Entry::Vacant(entry) => {
                let state = Arc::new(RecalculationState::default());
                entry.insert(Arc::clone(&state));
                Some(state)
            }
        }
    }

    #[must_use]
    pub fn status(&self, test_id: TestId) -> RecalculationStatus {
        self.states
            .get(&test_id)
            .map_or_else(RecalculationStatus::idle, |state| state.snapshot())
    }

    #[must_use]
    pub fn is_running(&self, test_id: TestId) -> bool {
        self.states
            .get(&test_id)
            .is_some_and(|state| !state.is_done())
    }

    /// Drop the state of a finished run, unless a newer run replaced it
    pub fn expire(&self, test_id: TestId, state: &Arc<RecalculationState>) -> bool {
        self.states
            .remove_if(&test_id, |_, current| Arc::ptr_eq(current, state))
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_state_reports_done() {
        let tracker = RecalculationTracker::new();
        let status = tracker.status(1);
        assert!(status.done);
        assert_eq!(status.progress, 100);
        assert!(!tracker.is_running(1));
    }

    #[test]
    fn test_single_flight() {
        let tracker = RecalculationTracker::new();
        let first = tracker.try_begin(1).unwrap();
        assert!(tracker.try_begin(1).is_none());
        assert!(tracker.try_begin(2).is_some());

        first.finish();
        let second = tracker.try_begin(1).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_expire_keeps_newer_run() {
        let tracker = RecalculationTracker::new();
        let first = tracker.try_begin(1).unwrap();
        first.finish();
        let second = tracker.try_begin(1).unwrap();
        assert!(!tracker.expire(1, &first));
        assert!(tracker.is_running(1));
        second.finish();
        assert!(tracker.expire(1, &second));
        assert_eq!(tracker.status(1), RecalculationStatus::idle());
    }

    #[test]
    fn test_progress_and_counters() {
        let state = RecalculationState::default();
        assert_eq!(state.snapshot().progress, 0);
        state.set_total(4);
        state.dataset_finished();
        state.record_without_value(9);
        state.record_without_value(9);
        state.record_error();
        let status = state.snapshot();
        assert_eq!(status.progress, 25);
        assert_eq!(status.errors, 1);
        assert_eq!(status.datasets_without_value, vec![9]);
        assert!(!status.done);

        state.fail("boom");
        let status = state.snapshot();
        assert!(status.done);
        assert_eq!(status.error.as_deref(), Some("boom"));
    }
}
