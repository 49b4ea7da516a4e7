//! Events produced by the engine and the sinks that receive them

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tm_store::{Change, DatasetId, DatasetInfo, RuleId, TestId, VariableId};

/// Everything the engine announces to downstream consumers
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DataPointCreated {
        variable_id: VariableId,
        dataset_id: DatasetId,
        timestamp: DateTime<Utc>,
        value: f64,
    },
    ChangeCreated {
        change: Change,
        test_name: String,
        dataset: DatasetInfo,
        notify: bool,
    },
    MissingValues {
        dataset: DatasetInfo,
        variable_names: Vec<String>,
        notify: bool,
    },
    DatasetProcessed {
        dataset: DatasetInfo,
        notify: bool,
    },
    MissingDataStale {
        rule_id: RuleId,
        rule_name: String,
        test_id: TestId,
        last_result: DateTime<Utc>,
        max_staleness_ms: i64,
    },
}

impl EngineEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::DataPointCreated { .. } => "data_point_created",
            EngineEvent::ChangeCreated { .. } => "change_created",
            EngineEvent::MissingValues { .. } => "missing_values",
            EngineEvent::DatasetProcessed { .. } => "dataset_processed",
            EngineEvent::MissingDataStale { .. } => "missing_data_stale",
        }
    }
}

/// Delivery seam for engine events
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    fn publish(&self, event: &EngineEvent);
}

/// Sink that writes events to tracing
pub struct LogSink {
    level: tracing::Level,
}

impl LogSink {
    pub fn new(level: tracing::Level) -> Self {
        Self { level }
    }

    pub fn info() -> Self {
        Self::new(tracing::Level::INFO)
    }

    pub fn debug() -> Self {
        Self::new(tracing::Level::DEBUG)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::info()
    }
}

impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&self, event: &EngineEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match self.level {
            tracing::Level::ERROR | tracing::Level::WARN => {
                tracing::warn!(kind = event.kind(), event = %payload, "Engine event");
            }
            tracing::Level::INFO => {
                tracing::info!(kind = event.kind(), event = %payload, "Engine event");
            }
            _ => {
                tracing::debug!(kind = event.kind(), event = %payload, "Engine event");
            }
        }
    }
}

/// In-memory sink for testing
#[derive(Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind, see [`EngineEvent::kind`]
    pub fn of_kind(&self, kind: &str) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn publish(&self, event: &EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Publishes every event to each registered sink in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }
}

impl EventSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn publish(&self, event: &EngineEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}
