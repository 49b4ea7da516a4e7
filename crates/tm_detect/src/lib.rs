//! `tm_detect` - pluggable change detection models
//!
//! A model receives a window of points, newest first, plus a JSON
//! configuration, and reports zero or more candidate changes. Models are
//! looked up by string id through a [`ModelRegistry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod fixed_threshold;
pub mod relative_difference;

pub use fixed_threshold::FixedThreshold;
pub use relative_difference::RelativeDifference;

/// Model errors. Both are configuration problems, never fatal to a pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Unknown detection model: {0}")]
    UnknownModel(String),

    #[error("Invalid configuration for {model}: {reason}")]
    InvalidConfig { model: String, reason: String },
}

impl ModelError {
    pub fn invalid(model: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            model: model.to_string(),
            reason: reason.into(),
        }
    }
}

/// One observation handed to a model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub dataset_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A change a model wants recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeCandidate {
    pub dataset_id: i64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

impl ChangeCandidate {
    #[must_use]
    pub fn at(point: &SeriesPoint, description: impl Into<String>) -> Self {
        Self {
            dataset_id: point.dataset_id,
            timestamp: point.timestamp,
            description: description.into(),
        }
    }
}

/// Strategy interface for change detection
pub trait ChangeDetectionModel: Send + Sync {
    /// Registry identifier, e.g. `relativeDifference`
    fn id(&self) -> &'static str;

    /// Default configuration. Keys missing from a user config are backfilled from here.
    fn config(&self) -> Value;

    /// Analyze `window` (newest first) and report candidates through `on_change`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] when `config` cannot be interpreted.
    fn analyze(
        &self,
        window: &[SeriesPoint],
        config: &Value,
        on_change: &mut dyn FnMut(ChangeCandidate),
    ) -> Result<(), ModelError>;
}

/// Maps model ids to strategies
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn ChangeDetectionModel>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.ids())
            .finish()
    }
}

impl ModelRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in model
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RelativeDifference));
        registry.register(Arc::new(FixedThreshold));
        registry
    }

    /// Add or replace a model under its own id
    pub fn register(&mut self, model: Arc<dyn ChangeDetectionModel>) {
        debug!(model = model.id(), "Registering detection model");
        self.models.insert(model.id().to_string(), model);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn ChangeDetectionModel>> {
        self.models.get(id).cloned()
    }

    /// Registered ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a model and merge `user` over its defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::UnknownModel`] for an unregistered id and
    /// [`ModelError::InvalidConfig`] when `user` is neither null nor an object.
    pub fn resolve(
        &self,
        id: &str,
        user: &Value,
    ) -> Result<(Arc<dyn ChangeDetectionModel>, Value), ModelError> {
        let model = self
            .get(id)
            .ok_or_else(|| ModelError::UnknownModel(id.to_string()))?;
        let config = effective_config(id, &model.config(), user)?;
        Ok((model, config))
    }

    /// Resolve `id` and run it over `window` with the effective configuration
    ///
    /// # Errors
    ///
    /// Propagates [`ModelRegistry::resolve`] and model errors.
    pub fn analyze(
        &self,
        id: &str,
        user: &Value,
        window: &[SeriesPoint],
    ) -> Result<Vec<ChangeCandidate>, ModelError> {
        let (model, config) = self.resolve(id, user)?;
        let mut found = Vec::new();
        model.analyze(window, &config, &mut |candidate| found.push(candidate))?;
        Ok(found)
    }
}

/// Backfill `user` with `defaults`, recursing into nested objects
///
/// # Errors
///
/// Returns [`ModelError::InvalidConfig`] when `user` is neither null nor an object.
pub fn effective_config(model: &str, defaults: &Value, user: &Value) -> Result<Value, ModelError> {
    match user {
        Value::Null => Ok(defaults.clone()),
        Value::Object(overrides) => Ok(merge(defaults, overrides)),
        other => Err(ModelError::invalid(
            model,
            format!("expected an object, got {other}"),
        )),
    }
}

fn merge(defaults: &Value, overrides: &Map<String, Value>) -> Value {
    let mut merged = match defaults {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in overrides {
        let combined = match (merged.get(key), value) {
            (Some(base @ Value::Object(_)), Value::Object(nested)) => merge(base, nested),
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    Value::Object(merged)
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) * 0.5)
    }
}
