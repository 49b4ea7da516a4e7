//! Missing-data watchdog
//!
//! Datasets that satisfy a rule's condition leave a result row behind. The
//! periodic tick flags every rule whose newest result is older than its
//! staleness window and that has not been notified within that window.

use crate::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::resolve::{ScriptEvaluator, shape_labels};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tm_store::{
    Dataset, LogCategory, LogLevel, MissingDataRule, NewDiagnostic, RuleId, RuleStaleness,
    TmStore, Tx,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Watchdog {
    store: TmStore,
    evaluator: Arc<dyn ScriptEvaluator>,
    sink: Arc<dyn EventSink>,
}

/// Whether a rule's staleness window has elapsed at `now`
#[must_use]
pub fn is_stale(entry: &RuleStaleness, now: DateTime<Utc>) -> bool {
    let rule = &entry.rule;
    if rule.max_staleness_ms <= 0 {
        return false;
    }
    let Some(last_result) = entry.last_result else {
        return false;
    };
    let horizon = now - ChronoDuration::milliseconds(rule.max_staleness_ms);
    last_result < horizon && rule.last_notification.is_none_or(|at| at < horizon)
}

impl Watchdog {
    pub fn new(store: TmStore, evaluator: Arc<dyn ScriptEvaluator>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            evaluator,
            sink,
        }
    }

    /// Re-record rule results for `dataset`. Returns the rules that matched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if a read or write fails. Condition
    /// failures are logged as diagnostics and count as "does not apply".
    pub fn check_dataset(&self, tx: &Tx<'_>, dataset: &Dataset) -> Result<Vec<RuleId>, EngineError> {
        tx.delete_rule_results_for_dataset(dataset.id)?;
        let mut matched = Vec::new();
        for rule in tx.list_missing_data_rules(dataset.test_id)? {
            if self.applies(tx, &rule, dataset)? {
                tx.record_rule_result(rule.id, dataset.id, dataset.start)?;
                matched.push(rule.id);
            }
        }
        if !matched.is_empty() {
            debug!(dataset_id = dataset.id, rules = ?matched, "Missing-data rules matched");
        }
        Ok(matched)
    }

    fn applies(&self, tx: &Tx<'_>, rule: &MissingDataRule, dataset: &Dataset) -> Result<bool, EngineError> {
        let condition = match rule.condition.as_deref().map(str::trim) {
            Some(script) if !script.is_empty() => script,
            _ => return Ok(true),
        };

        let values = tx.label_values(dataset.id, &rule.labels)?;
        let input = shape_labels(&rule.labels, &values).unwrap_or(Value::Null);
        let problem = match self.evaluator.evaluate(condition, &input) {
            Ok(outcome) => match outcome.result {
                Value::Bool(holds) => return Ok(holds),
                other => format!("Condition of rule {} returned {other}, expected a boolean", rule.name),
            },
            Err(e) => format!("Condition of rule {} failed: {e}", rule.name),
        };

        warn!(rule_id = rule.id, dataset_id = dataset.id, %problem, "Rule condition rejected");
        tx.log_diagnostic(&NewDiagnostic {
            test_id: dataset.test_id,
            dataset_id: Some(dataset.id),
            level: LogLevel::Error,
            category: LogCategory::MissingData,
            message: problem,
        })?;
        Ok(false)
    }

    /// Notify every stale rule once. Returns the ids of notified rules.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the unit of work fails.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RuleId>, EngineError> {
        let sink = Arc::clone(&self.sink);
        self.store.transaction(|tx| -> Result<_, EngineError> {
            let mut events = Vec::new();
            for entry in tx.rule_staleness()? {
                if !is_stale(&entry, now) {
                    continue;
                }
                let (rule, Some(last_result)) = (entry.rule, entry.last_result) else {
                    continue;
                };
                // Lost the race to another tick
                if !tx.mark_rule_notified(rule.id, rule.last_notification, now)? {
                    continue;
                }
                info!(rule_id = rule.id, rule = %rule.name, %last_result, "Missing data");
                events.push(EngineEvent::MissingDataStale {
                    rule_id: rule.id,
                    rule_name: rule.name,
                    test_id: rule.test_id,
                    last_result,
                    max_staleness_ms: rule.max_staleness_ms,
                });
            }

            let notified = events
                .iter()
                .filter_map(|e| match e {
                    EngineEvent::MissingDataStale { rule_id, .. } => Some(*rule_id),
                    _ => None,
                })
                .collect();
            tx.after_commit(move || {
                for event in &events {
                    sink.publish(event);
                }
            });
            Ok(notified)
        })
    }

    /// Tick every `period` on `handle` until the task is aborted
    pub fn spawn(self, handle: &Handle, period: Duration) -> JoinHandle<()> {
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let watchdog = self.clone();
                match tokio::task::spawn_blocking(move || watchdog.tick(Utc::now())).await {
                    Ok(Ok(notified)) if !notified.is_empty() => {
                        debug!(count = notified.len(), "Watchdog tick notified rules");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Watchdog tick failed"),
                    Err(e) => error!(error = %e, "Watchdog task panicked"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::resolve::{ResolveError, ScriptOutcome};
    use serde_json::json;
    use tm_store::{NewDataset, NewMissingDataRule, NewTest};

    /// Treats the script text as the answer: "true", "false", or anything else
    /// as a non-boolean
    struct Literal;

    impl ScriptEvaluator for Literal {
        fn evaluate(&self, script: &str, _input: &Value) -> Result<ScriptOutcome, ResolveError> {
            let result = match script {
                "true" => json!(true),
                "false" => json!(false),
                "throw" => return Err(ResolveError::Script("boom".to_string())),
                other => json!(other),
            };
            Ok(ScriptOutcome {
                result,
                output: Vec::new(),
            })
        }
    }

    fn rule(last_result: Option<i64>, last_notification: Option<i64>, max: i64) -> RuleStaleness {
        RuleStaleness {
            rule: MissingDataRule {
                id: 1,
                test_id: 1,
                name: "r".to_string(),
                labels: Vec::new(),
                condition: None,
                max_staleness_ms: max,
                last_notification: last_notification.map(tm_store::from_millis),
            },
            last_result: last_result.map(tm_store::from_millis),
        }
    }

    #[test]
    fn test_is_stale() {
        let now = tm_store::from_millis(10_000);
        assert!(is_stale(&rule(Some(8_000), None, 1_000), now));
        assert!(!is_stale(&rule(Some(9_500), None, 1_000), now));
        assert!(!is_stale(&rule(None, None, 1_000), now));
        assert!(!is_stale(&rule(Some(0), None, 0), now));
        assert!(!is_stale(&rule(Some(8_000), Some(9_500), 1_000), now));
        assert!(is_stale(&rule(Some(8_000), Some(8_500), 1_000), now));
    }

    #[test]
    fn test_check_dataset_conditions() {
        let store = TmStore::open_memory().unwrap();
        let watchdog = Watchdog::new(store.clone(), Arc::new(Literal), Arc::new(MemorySink::new()));

        let (matched, logs) = store
            .transaction(|tx| -> Result<_, EngineError> {
                let test = tx.insert_test(&NewTest::default())?;
                let mut ids = Vec::new();
                for condition in [None, Some("true"), Some("false"), Some("42"), Some("throw"), Some("  ")] {
                    let rule = tx.insert_missing_data_rule(&NewMissingDataRule {
                        test_id: test.id,
                        name: format!("{condition:?}"),
                        labels: vec!["arch".to_string()],
                        condition: condition.map(str::to_string),
                        max_staleness_ms: 1_000,
                    })?;
                    ids.push(rule.id);
                }
                let dataset = tx.insert_dataset(&NewDataset {
                    test_id: test.id,
                    run_id: 1,
                    ordinal: 0,
                    start: Utc::now(),
                    description: None,
                })?;
                let matched = watchdog.check_dataset(tx, &dataset)?;
                assert_eq!(matched, vec![ids[0], ids[1], ids[5]]);
                // Re-checking replaces rather than duplicates results
                watchdog.check_dataset(tx, &dataset)?;
                assert_eq!(tx.list_rule_results(ids[0])?.len(), 1);
                let logs = tx.list_diagnostics(test.id, Some(LogCategory::MissingData), 10)?;
                Ok((matched, logs))
            })
            .unwrap();

        assert_eq!(matched.len(), 3);
        assert_eq!(logs.len(), 4);
    }
}
