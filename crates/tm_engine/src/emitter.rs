//! DataPoint emitter: resolved variable values to persisted datapoints

use crate::EngineError;
use crate::markers::PartitionKey;
use crate::resolve::{ResolveError, ValueResolver};
use serde_json::Value;
use std::sync::Arc;
use tm_store::{
    DataPoint, Dataset, DatasetId, Fingerprint, LogCategory, LogLevel, NewDataPoint,
    NewDiagnostic, Test, Tx, Variable, VariableId,
};
use tracing::{debug, instrument, warn};

/// A variable that produced no usable number for a dataset
#[derive(Debug, Clone, PartialEq)]
pub struct MissingValue {
    pub variable_id: VariableId,
    pub variable_name: String,
    pub dataset_id: DatasetId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Created(DataPoint),
    Missing(MissingValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitOptions {
    pub notify: bool,
    /// Persist a debug diagnostic for every emitted value
    pub debug: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            notify: true,
            debug: false,
        }
    }
}

/// Everything emitted for one dataset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetEmission {
    pub fingerprint: Fingerprint,
    pub datapoints: Vec<DataPoint>,
    pub missing: Vec<MissingValue>,
    /// Datapoints this emission superseded
    pub replaced: Vec<DataPoint>,
}

impl DatasetEmission {
    /// Partitions touched by this emission, old and new, with the timestamp
    /// that invalidates them
    #[must_use]
    pub fn partitions(&self) -> Vec<(PartitionKey, chrono::DateTime<chrono::Utc>)> {
        self.replaced
            .iter()
            .chain(&self.datapoints)
            .map(|dp| (PartitionKey::new(dp.variable_id, &dp.fingerprint), dp.timestamp))
            .collect()
    }

    /// Each touched partition once, in first-seen order
    #[must_use]
    pub fn drain_targets(&self) -> Vec<(VariableId, Fingerprint)> {
        let mut targets: Vec<(VariableId, Fingerprint)> = Vec::new();
        for dp in self.replaced.iter().chain(&self.datapoints) {
            if !targets
                .iter()
                .any(|(id, fp)| *id == dp.variable_id && *fp == dp.fingerprint)
            {
                targets.push((dp.variable_id, dp.fingerprint.clone()));
            }
        }
        targets
    }

    #[must_use]
    pub fn missing_names(&self) -> Vec<String> {
        self.missing
            .iter()
            .map(|m| m.variable_name.clone())
            .collect()
    }
}

/// Numeric coercion: numbers pass through, strings are parsed, anything else
/// is missing.
///
/// # Errors
///
/// Returns the reason the value has no numeric reading.
pub fn coerce(value: &Value) -> Result<f64, String> {
    let number = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("number {n} is not representable"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("cannot parse {s:?} as a number"))?,
        Value::Null => return Err("no value".to_string()),
        other => return Err(format!("expected a number, got {other}")),
    };
    if number.is_finite() {
        Ok(number)
    } else {
        Err(format!("value {number} is not finite"))
    }
}

#[derive(Clone)]
pub struct Emitter {
    resolver: Arc<dyn ValueResolver>,
}

impl Emitter {
    pub fn new(resolver: Arc<dyn ValueResolver>) -> Self {
        Self { resolver }
    }

    /// Coerce `value` and store it as the datapoint of `variable` for `dataset`
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if persisting fails. Coercion failures
    /// are not errors; they come back as [`Emission::Missing`].
    pub fn emit(
        &self,
        tx: &Tx<'_>,
        dataset: &Dataset,
        variable: &Variable,
        value: &Value,
        fingerprint: &Fingerprint,
    ) -> Result<Emission, EngineError> {
        match coerce(value) {
            Ok(number) => {
                let datapoint = tx.insert_datapoint(&NewDataPoint {
                    variable_id: variable.id,
                    dataset_id: dataset.id,
                    timestamp: dataset.start,
                    value: number,
                    fingerprint: fingerprint.clone(),
                })?;
                Ok(Emission::Created(datapoint))
            }
            Err(reason) => Ok(Emission::Missing(self.missing(tx, dataset, variable, reason)?)),
        }
    }

    fn missing(
        &self,
        tx: &Tx<'_>,
        dataset: &Dataset,
        variable: &Variable,
        reason: String,
    ) -> Result<MissingValue, EngineError> {
        let message = format!("Variable {} has no value: {reason}", variable.name);
        warn!(dataset_id = dataset.id, variable_id = variable.id, %reason, "Missing value");
        tx.log_diagnostic(&NewDiagnostic {
            test_id: dataset.test_id,
            dataset_id: Some(dataset.id),
            level: LogLevel::Warning,
            category: LogCategory::Calculation,
            message,
        })?;
        Ok(MissingValue {
            variable_id: variable.id,
            variable_name: variable.name.clone(),
            dataset_id: dataset.id,
            reason,
        })
    }

    /// Replace the datapoints of `dataset` with freshly resolved values for
    /// every variable of `test`
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on persistence failures. Resolution and
    /// script failures are recorded as missing values.
    #[instrument(skip_all, fields(dataset_id = dataset.id, test_id = test.id))]
    pub fn emit_dataset(
        &self,
        tx: &Tx<'_>,
        dataset: &Dataset,
        test: &Test,
        options: EmitOptions,
    ) -> Result<DatasetEmission, EngineError> {
        let replaced = tx.datapoints_for_dataset(dataset.id)?;
        tx.delete_datapoints_for_dataset(dataset.id)?;
        let dropped = tx.delete_unconfirmed_changes_for_datasets(&[dataset.id])?;
        if !replaced.is_empty() || dropped > 0 {
            debug!(replaced = replaced.len(), dropped, "Superseding previous emission");
        }

        let fingerprint = match self.resolver.fingerprint(tx, dataset, test) {
            Ok(fp) => fp,
            Err(ResolveError::Store(e)) => return Err(e.into()),
            Err(e) => {
                tx.log_diagnostic(&NewDiagnostic {
                    test_id: test.id,
                    dataset_id: Some(dataset.id),
                    level: LogLevel::Error,
                    category: LogCategory::Calculation,
                    message: format!("Cannot compute fingerprint: {e}"),
                })?;
                Fingerprint::none()
            }
        };

        let mut emission = DatasetEmission {
            fingerprint: fingerprint.clone(),
            replaced,
            ..DatasetEmission::default()
        };

        for variable in tx.list_variables(test.id)? {
            let resolution = match self.resolver.resolve(tx, dataset, &variable) {
                Ok(resolution) => resolution,
                Err(ResolveError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    let missing = self.missing(tx, dataset, &variable, e.to_string())?;
                    emission.missing.push(missing);
                    continue;
                }
            };

            if options.debug {
                let mut message = format!("Variable {} resolved to {}", variable.name, resolution.value);
                for line in &resolution.output {
                    message.push_str("\n  ");
                    message.push_str(line);
                }
                tx.log_diagnostic(&NewDiagnostic {
                    test_id: test.id,
                    dataset_id: Some(dataset.id),
                    level: LogLevel::Debug,
                    category: LogCategory::Calculation,
                    message,
                })?;
            }

            match self.emit(tx, dataset, &variable, &resolution.value, &fingerprint)? {
                Emission::Created(datapoint) => emission.datapoints.push(datapoint),
                Emission::Missing(missing) => emission.missing.push(missing),
            }
        }

        debug!(
            datapoints = emission.datapoints.len(),
            missing = emission.missing.len(),
            "Dataset emitted"
        );
        Ok(emission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::LabelValueResolver;
    use chrono::Utc;
    use serde_json::json;
    use tm_store::{NewDataset, NewTest, NewVariable, StoreError, TmStore};

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(&json!(3)), Ok(3.0));
        assert_eq!(coerce(&json!(2.5)), Ok(2.5));
        assert_eq!(coerce(&json!(" 7.25 ")), Ok(7.25));
        assert!(coerce(&json!("fast")).is_err());
        assert!(coerce(&Value::Null).is_err());
        assert!(coerce(&json!({"a": 1})).is_err());
        assert!(coerce(&json!([1])).is_err());
        assert!(coerce(&json!(true)).is_err());
        assert!(coerce(&json!("NaN")).is_err());
    }

    #[test]
    fn test_emit_dataset_collects_missing() {
        let store = TmStore::open_memory().unwrap();
        let emitter = Emitter::new(Arc::new(LabelValueResolver::default()));

        let (emission, stored, logs) = store
            .transaction(|tx| -> Result<_, EngineError> {
                let test = tx.insert_test(&NewTest {
                    name: "t".to_string(),
                    fingerprint_labels: vec!["arch".to_string()],
                })?;
                let dataset = tx.insert_dataset(&NewDataset {
                    test_id: test.id,
                    run_id: 1,
                    ordinal: 0,
                    start: Utc::now(),
                    description: None,
                })?;
                tx.set_label_value(dataset.id, "score", &json!("12.5"))?;
                tx.set_label_value(dataset.id, "name", &json!("fast"))?;
                tx.set_label_value(dataset.id, "arch", &json!("x86"))?;
                let score = tx.insert_variable(&NewVariable {
                    test_id: test.id,
                    name: "score".to_string(),
                    labels: vec!["score".to_string()],
                    ..NewVariable::default()
                })?;
                tx.insert_variable(&NewVariable {
                    test_id: test.id,
                    name: "name".to_string(),
                    labels: vec!["name".to_string()],
                    ..NewVariable::default()
                })?;
                tx.insert_variable(&NewVariable {
                    test_id: test.id,
                    name: "scripted".to_string(),
                    labels: vec!["score".to_string()],
                    calculation: Some("v => v".to_string()),
                    ..NewVariable::default()
                })?;

                let emission = emitter.emit_dataset(tx, &dataset, &test, EmitOptions::default())?;
                let stored = tx.list_datapoints(score.id, None)?;
                let logs = tx.list_diagnostics(test.id, Some(LogCategory::Calculation), 10)?;
                Ok((emission, stored, logs))
            })
            .unwrap();

        assert_eq!(emission.datapoints.len(), 1);
        assert_eq!(emission.fingerprint, Fingerprint::new(json!("x86")));
        assert_eq!(emission.missing_names(), vec!["name", "scripted"]);
        assert_eq!(stored.len(), 1);
        assert!((stored[0].value - 12.5).abs() < f64::EPSILON);
        assert_eq!(logs.len(), 2);
    }

    #[test]
    fn test_emit_dataset_replaces_previous_values() {
        let store = TmStore::open_memory().unwrap();
        let emitter = Emitter::new(Arc::new(LabelValueResolver::default()));

        let points = store
            .transaction(|tx| -> Result<_, EngineError> {
                let test = tx.insert_test(&NewTest::default())?;
                let dataset = tx.insert_dataset(&NewDataset {
                    test_id: test.id,
                    run_id: 1,
                    ordinal: 0,
                    start: Utc::now(),
                    description: None,
                })?;
                let variable = tx.insert_variable(&NewVariable {
                    test_id: test.id,
                    name: "v".to_string(),
                    labels: vec!["v".to_string()],
                    ..NewVariable::default()
                })?;
                tx.set_label_value(dataset.id, "v", &json!(1))?;
                emitter.emit_dataset(tx, &dataset, &test, EmitOptions::default())?;
                tx.set_label_value(dataset.id, "v", &json!(2))?;
                let options = EmitOptions {
                    notify: false,
                    debug: true,
                };
                emitter.emit_dataset(tx, &dataset, &test, options)?;
                let debug_logs = tx.list_diagnostics(test.id, None, 10)?;
                assert_eq!(debug_logs.len(), 1);
                assert_eq!(debug_logs[0].level, LogLevel::Debug);
                Ok::<_, EngineError>(tx.list_datapoints(variable.id, None)?)
            })
            .unwrap();

        assert_eq!(points.len(), 1);
        assert!((points[0].value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_store_errors_convert() {
        let err: EngineError = StoreError::LockPoisoned.into();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
