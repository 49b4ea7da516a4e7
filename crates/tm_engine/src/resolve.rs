//! Value resolution and script evaluation collaborators
//!
//! Label extraction and sandboxed scripting live outside the engine. These
//! traits are the narrow contracts it consumes, plus built-ins that read
//! stored label values directly.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tm_store::{Dataset, Fingerprint, StoreError, Test, Tx, Variable};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

/// Result of one script evaluation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptOutcome {
    pub result: Value,
    /// Anything the script printed while running
    pub output: Vec<String>,
}

/// Sandboxed evaluation of calculation functions and rule conditions
pub trait ScriptEvaluator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ResolveError::Script`] when the script throws or cannot run.
    fn evaluate(&self, script: &str, input: &Value) -> Result<ScriptOutcome, ResolveError>;
}

/// Evaluator for deployments without a script sandbox; every script fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScriptEvaluator;

impl ScriptEvaluator for NoScriptEvaluator {
    fn evaluate(&self, _script: &str, _input: &Value) -> Result<ScriptOutcome, ResolveError> {
        Err(ResolveError::Script(
            "no script evaluator configured".to_string(),
        ))
    }
}

/// A resolved variable value with any captured script output
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    pub value: Value,
    pub output: Vec<String>,
}

impl From<Value> for Resolution {
    fn from(value: Value) -> Self {
        Self {
            value,
            output: Vec::new(),
        }
    }
}

/// Upstream value extraction for one dataset
pub trait ValueResolver: Send + Sync {
    /// Raw value of `variable` for `dataset`, before numeric coercion
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when extraction or the calculation script fails.
    fn resolve(
        &self,
        tx: &Tx<'_>,
        dataset: &Dataset,
        variable: &Variable,
    ) -> Result<Resolution, ResolveError>;

    /// Partition key of `dataset`
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when label lookup fails.
    fn fingerprint(
        &self,
        tx: &Tx<'_>,
        dataset: &Dataset,
        test: &Test,
    ) -> Result<Fingerprint, ResolveError>;
}

/// Shape label values for consumption: one label yields its value (null when
/// absent), several labels yield an object keyed by label name, and no labels
/// yield `None`.
#[must_use]
pub fn shape_labels(names: &[String], values: &BTreeMap<String, Value>) -> Option<Value> {
    match names {
        [] => None,
        [single] => Some(values.get(single).cloned().unwrap_or(Value::Null)),
        many => {
            let object: Map<String, Value> = many
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        values.get(name).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect();
            Some(Value::Object(object))
        }
    }
}

/// Resolver over stored label values, applying calculation scripts through
/// a [`ScriptEvaluator`]
#[derive(Clone)]
pub struct LabelValueResolver {
    evaluator: Arc<dyn ScriptEvaluator>,
}

impl LabelValueResolver {
    pub fn new(evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl Default for LabelValueResolver {
    fn default() -> Self {
        Self::new(Arc::new(NoScriptEvaluator))
    }
}

impl ValueResolver for LabelValueResolver {
    fn resolve(
        &self,
        tx: &Tx<'_>,
        dataset: &Dataset,
        variable: &Variable,
    ) -> Result<Resolution, ResolveError> {
        let values = tx.label_values(dataset.id, &variable.labels)?;
        let Some(input) = shape_labels(&variable.labels, &values) else {
            return Ok(Value::Null.into());
        };

        match variable.calculation.as_deref().map(str::trim) {
            Some(script) if !script.is_empty() => {
                let outcome = self.evaluator.evaluate(script, &input)?;
                Ok(Resolution {
                    value: outcome.result,
                    output: outcome.output,
                })
            }
            _ => Ok(input.into()),
        }
    }

    fn fingerprint(
        &self,
        tx: &Tx<'_>,
        dataset: &Dataset,
        test: &Test,
    ) -> Result<Fingerprint, ResolveError> {
        if test.fingerprint_labels.is_empty() {
            return Ok(Fingerprint::none());
        }
        let values = tx.label_values(dataset.id, &test.fingerprint_labels)?;
        Ok(shape_labels(&test.fingerprint_labels, &values)
            .map(Fingerprint::new)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tm_store::{NewDataset, NewTest, NewVariable, TmStore};

    /// Doubles numeric input and echoes it to output
    struct Doubler;

    impl ScriptEvaluator for Doubler {
        fn evaluate(&self, _script: &str, input: &Value) -> Result<ScriptOutcome, ResolveError> {
            let n = input
                .as_f64()
                .ok_or_else(|| ResolveError::Script("not a number".to_string()))?;
            Ok(ScriptOutcome {
                result: json!(n * 2.0),
                output: vec![format!("input={n}")],
            })
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_shape_labels() {
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), json!(1));
        assert_eq!(shape_labels(&[], &values), None);
        assert_eq!(shape_labels(&names(&["a"]), &values), Some(json!(1)));
        assert_eq!(shape_labels(&names(&["b"]), &values), Some(Value::Null));
        assert_eq!(
            shape_labels(&names(&["a", "b"]), &values),
            Some(json!({"a": 1, "b": null}))
        );
    }

    #[test]
    fn test_no_script_evaluator_fails() {
        let err = NoScriptEvaluator.evaluate("x", &Value::Null).unwrap_err();
        assert!(matches!(err, ResolveError::Script(_)));
    }

    #[test]
    fn test_label_resolver_with_calculation_and_fingerprint() {
        let store = TmStore::open_memory().unwrap();
        let resolver = LabelValueResolver::new(Arc::new(Doubler));

        let (plain, calculated, fingerprint) = store
            .transaction(|tx| -> Result<_, ResolveError> {
                let test = tx.insert_test(&NewTest {
                    name: "t".to_string(),
                    fingerprint_labels: names(&["arch", "os"]),
                })?;
                let dataset = tx.insert_dataset(&NewDataset {
                    test_id: test.id,
                    run_id: 1,
                    ordinal: 0,
                    start: Utc::now(),
                    description: None,
                })?;
                tx.set_label_value(dataset.id, "score", &json!(21))?;
                tx.set_label_value(dataset.id, "arch", &json!("arm"))?;
                tx.set_label_value(dataset.id, "os", &json!("linux"))?;

                let plain = tx.insert_variable(&NewVariable {
                    test_id: test.id,
                    name: "plain".to_string(),
                    labels: names(&["score"]),
                    ..NewVariable::default()
                })?;
                let calculated = tx.insert_variable(&NewVariable {
                    test_id: test.id,
                    name: "calculated".to_string(),
                    labels: names(&["score"]),
                    calculation: Some("value => value * 2".to_string()),
                    ..NewVariable::default()
                })?;

                Ok((
                    resolver.resolve(tx, &dataset, &plain)?,
                    resolver.resolve(tx, &dataset, &calculated)?,
                    resolver.fingerprint(tx, &dataset, &test)?,
                ))
            })
            .unwrap();

        assert_eq!(plain.value, json!(21));
        assert_eq!(calculated.value, json!(42.0));
        assert_eq!(calculated.output, vec!["input=21".to_string()]);
        assert_eq!(
            fingerprint,
            Fingerprint::new(json!({"os": "linux", "arch": "arm"}))
        );
    }
}
