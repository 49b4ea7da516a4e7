//! Relative difference against recent history

use crate::{ChangeCandidate, ChangeDetectionModel, ModelError, SeriesPoint, mean, median};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::trace;

pub const ID: &str = "relativeDifference";

/// How the previous points are aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    Mean,
    Median,
}

impl Filter {
    fn as_str(self) -> &'static str {
        match self {
            Filter::Mean => "mean",
            Filter::Median => "median",
        }
    }

    fn apply(self, values: &[f64]) -> Option<f64> {
        match self {
            Filter::Mean => mean(values),
            Filter::Median => median(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelativeDifferenceConfig {
    /// Number of previous points aggregated for comparison
    pub window: usize,
    /// Fraction the newest value may deviate before it counts as a change
    pub threshold: f64,
    /// Previous points required before any verdict
    pub min_previous: usize,
    pub filter: Filter,
}

impl Default for RelativeDifferenceConfig {
    fn default() -> Self {
        Self {
            window: 1,
            threshold: 0.2,
            min_previous: 5,
            filter: Filter::Mean,
        }
    }
}

impl RelativeDifferenceConfig {
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] for unparsable or out-of-range values.
    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| ModelError::invalid(ID, e.to_string()))?;
        if config.window == 0 {
            return Err(ModelError::invalid(ID, "window must be at least 1"));
        }
        if !config.threshold.is_finite() || config.threshold < 0.0 {
            return Err(ModelError::invalid(
                ID,
                format!("threshold must be a non-negative number, got {}", config.threshold),
            ));
        }
        Ok(config)
    }
}

/// Compares the newest value with the mean or median of the `window`
/// points before it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelativeDifference;

impl ChangeDetectionModel for RelativeDifference {
    fn id(&self) -> &'static str {
        ID
    }

    fn config(&self) -> Value {
        let defaults = RelativeDifferenceConfig::default();
        json!({
            "window": defaults.window,
            "threshold": defaults.threshold,
            "minPrevious": defaults.min_previous,
            "filter": defaults.filter.as_str(),
        })
    }

    fn analyze(
        &self,
        window: &[SeriesPoint],
        config: &Value,
        on_change: &mut dyn FnMut(ChangeCandidate),
    ) -> Result<(), ModelError> {
        let config = RelativeDifferenceConfig::from_value(config)?;

        let Some((newest, previous)) = window.split_first() else {
            return Ok(());
        };
        if previous.is_empty() || previous.len() < config.min_previous {
            trace!(
                previous = previous.len(),
                min_previous = config.min_previous,
                "Not enough history"
            );
            return Ok(());
        }

        let compared: Vec<f64> = previous
            .iter()
            .take(config.window)
            .map(|p| p.value)
            .collect();
        let Some(baseline) = config.filter.apply(&compared) else {
            return Ok(());
        };
        if baseline == 0.0 {
            trace!("Baseline is zero, relative difference undefined");
            return Ok(());
        }

        let ratio = (newest.value - baseline) / baseline.abs();
        if ratio.abs() > config.threshold {
            let direction = if ratio > 0.0 { "higher" } else { "lower" };
            on_change(ChangeCandidate::at(
                newest,
                format!(
                    "Datapoint {} is {:.2}% {direction} than the {} {} of the previous {} value{}",
                    newest.value,
                    ratio.abs() * 100.0,
                    config.filter.as_str(),
                    baseline,
                    compared.len(),
                    if compared.len() == 1 { "" } else { "s" },
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::window;

    fn run(values: &[f64], config: Value) -> Vec<ChangeCandidate> {
        let mut found = Vec::new();
        RelativeDifference
            .analyze(&window(values), &config, &mut |c| found.push(c))
            .unwrap();
        found
    }

    fn config(window: usize, threshold: f64, min_previous: usize, filter: &str) -> Value {
        json!({
            "window": window,
            "threshold": threshold,
            "minPrevious": min_previous,
            "filter": filter,
        })
    }

    #[test]
    fn test_detects_jump() {
        let found = run(&[10.0, 10.0, 10.0, 10.0, 20.0], config(1, 0.1, 1, "mean"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].dataset_id, 5);
        assert!(found[0].description.contains("100.00% higher"));
    }

    #[test]
    fn test_detects_drop() {
        let found = run(&[10.0, 10.0, 5.0], config(2, 0.1, 1, "mean"));
        assert_eq!(found.len(), 1);
        assert!(found[0].description.contains("lower"));
    }

    #[test]
    fn test_within_threshold() {
        assert!(run(&[10.0, 10.5], config(1, 0.1, 1, "mean")).is_empty());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        assert!(run(&[10.0, 12.0], config(1, 0.2, 1, "mean")).is_empty());
    }

    #[test]
    fn test_requires_min_previous() {
        assert!(run(&[10.0, 10.0, 50.0], config(1, 0.1, 3, "mean")).is_empty());
        assert!(run(&[50.0], config(1, 0.1, 0, "mean")).is_empty());
    }

    #[test]
    fn test_median_ignores_outlier() {
        // mean of [10, 10, 100] is 40, median is 10
        let values = [10.0, 10.0, 100.0, 11.0];
        assert!(run(&values, config(3, 0.2, 1, "median")).is_empty());
        assert_eq!(run(&values, config(3, 0.2, 1, "mean")).len(), 1);
    }

    #[test]
    fn test_zero_baseline_is_skipped() {
        assert!(run(&[0.0, 5.0], config(1, 0.1, 1, "mean")).is_empty());
    }

    #[test]
    fn test_invalid_config() {
        let err = RelativeDifference
            .analyze(&window(&[1.0, 2.0]), &json!({"window": 0, "threshold": 0.1, "minPrevious": 1, "filter": "mean"}), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig { .. }));

        let err = RelativeDifference
            .analyze(&window(&[1.0, 2.0]), &json!({"window": 1, "threshold": 0.1, "minPrevious": 1, "filter": "mode"}), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig { .. }));
    }

    #[test]
    fn test_defaults_roundtrip_through_config() {
        let parsed = RelativeDifferenceConfig::from_value(&RelativeDifference.config()).unwrap();
        assert_eq!(parsed, RelativeDifferenceConfig::default());
    }
}
