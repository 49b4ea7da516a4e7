//! Absolute lower/upper bounds on the newest value

use crate::{ChangeCandidate, ChangeDetectionModel, ModelError, SeriesPoint};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ID: &str = "fixedThreshold";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub value: f64,
    pub enabled: bool,
    /// An inclusive bound accepts a value exactly at the bound
    pub inclusive: bool,
}

impl Default for Bound {
    fn default() -> Self {
        Self {
            value: 0.0,
            enabled: false,
            inclusive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FixedThresholdConfig {
    pub min: Bound,
    pub max: Bound,
}

impl FixedThresholdConfig {
    fn below_min(&self, value: f64) -> bool {
        self.min.enabled
            && if self.min.inclusive {
                value < self.min.value
            } else {
                value <= self.min.value
            }
    }

    fn above_max(&self, value: f64) -> bool {
        self.max.enabled
            && if self.max.inclusive {
                value > self.max.value
            } else {
                value >= self.max.value
            }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedThreshold;

impl ChangeDetectionModel for FixedThreshold {
    fn id(&self) -> &'static str {
        ID
    }

    fn config(&self) -> Value {
        serde_json::to_value(FixedThresholdConfig::default()).unwrap_or(Value::Null)
    }

    fn analyze(
        &self,
        window: &[SeriesPoint],
        config: &Value,
        on_change: &mut dyn FnMut(ChangeCandidate),
    ) -> Result<(), ModelError> {
        let config: FixedThresholdConfig = serde_json::from_value(config.clone())
            .map_err(|e| ModelError::invalid(ID, e.to_string()))?;
        let Some(newest) = window.first() else {
            return Ok(());
        };

        if config.below_min(newest.value) {
            on_change(ChangeCandidate::at(
                newest,
                format!(
                    "Datapoint {} is below the minimum of {}",
                    newest.value, config.min.value
                ),
            ));
        } else if config.above_max(newest.value) {
            on_change(ChangeCandidate::at(
                newest,
                format!(
                    "Datapoint {} is above the maximum of {}",
                    newest.value, config.max.value
                ),
            ));
        }
        Ok(())
    }
}
