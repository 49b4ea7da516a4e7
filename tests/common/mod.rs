#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, Once};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tm_config::TmConfig;
use tm_engine::{Engine, EngineBuilder, EngineError, LabelsUpdated, MemorySink, RecalculationStatus};
use tm_store::{
    Dataset, DetectionConfig, NewDataset, NewTest, NewVariable, Test, TmStore, Variable,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Initialize tracing once for integration tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(filter)
            .init();
    });
}

/// Generate a unique temporary DuckDB path for a test.
pub fn temp_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("tm_{test_name}_{nanos}.duckdb"))
}

/// Build a default config with a test-scoped DB path.
pub fn temp_config(test_name: &str) -> TmConfig {
    let mut config = TmConfig::default();
    config.global.db_path = temp_db_path(test_name);
    config
}

/// Config with short timers so retries and expiry fit in a test
pub fn fast_config() -> TmConfig {
    let mut config = TmConfig::default();
    config.engine.workers = 4;
    config.engine.visibility_retry_attempts = 20;
    config.engine.visibility_retry_delay_ms = 50;
    config.recalculation.grace_period_secs = 30;
    config
}

/// Engine builder over an in-memory store publishing into `sink`
pub fn engine_builder(sink: &MemorySink) -> EngineBuilder {
    Engine::builder()
        .store(TmStore::open_memory().expect("in-memory store"))
        .config(fast_config())
        .sink(Arc::new(sink.clone()))
}

pub fn memory_engine(sink: &MemorySink) -> Engine {
    init_tracing();
    engine_builder(sink).build().expect("engine")
}

/// Seconds after the epoch
pub fn t(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(seconds)
}

pub fn relative_difference(window: usize, threshold: f64, min_previous: usize) -> DetectionConfig {
    DetectionConfig {
        model: "relativeDifference".to_string(),
        config: json!({
            "window": window,
            "threshold": threshold,
            "minPrevious": min_previous,
        }),
    }
}

pub fn create_test(engine: &Engine, name: &str, fingerprint_labels: &[&str]) -> Test {
    engine
        .store()
        .transaction(|tx| {
            tx.insert_test(&NewTest {
                name: name.to_string(),
                fingerprint_labels: fingerprint_labels.iter().map(|s| (*s).to_string()).collect(),
            })
        })
        .expect("insert test")
}

/// Variable reading the single label `label`
pub fn create_variable(
    engine: &Engine,
    test_id: i64,
    label: &str,
    detection: Vec<DetectionConfig>,
) -> Variable {
    engine
        .store()
        .transaction(|tx| {
            tx.insert_variable(&NewVariable {
                test_id,
                name: label.to_string(),
                labels: vec![label.to_string()],
                detection,
                ..NewVariable::default()
            })
        })
        .expect("insert variable")
}

/// Store a dataset and its labels without processing it
pub fn store_dataset(engine: &Engine, test_id: i64, start: DateTime<Utc>, labels: &Value) -> Dataset {
    engine
        .store()
        .transaction(|tx| -> Result<_, EngineError> {
            let dataset = tx.insert_dataset(&NewDataset {
                test_id,
                run_id: 0,
                ordinal: 0,
                start,
                description: None,
            })?;
            if let Value::Object(map) = labels {
                for (name, value) in map {
                    tx.set_label_value(dataset.id, name, value)?;
                }
            }
            Ok(dataset)
        })
        .expect("insert dataset")
}

/// Store a dataset, announce it and wait for the test's lane to settle
pub async fn ingest(engine: &Engine, test_id: i64, start: DateTime<Utc>, labels: Value) -> Dataset {
    let dataset = store_dataset(engine, test_id, start, &labels);
    engine.labels_updated(LabelsUpdated::new(test_id, dataset.id));
    engine.flush(test_id).await;
    dataset
}

/// Poll until the recalculation of `test_id` reports done
pub async fn wait_for_recalculation(engine: &Engine, test_id: i64) -> RecalculationStatus {
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let status = engine.recalculation_status(test_id);
        if status.done {
            engine.flush(test_id).await;
            return status;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "recalculation did not finish: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// One-shot latch that blocks worker threads until opened
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (open, signal) = &*self.state;
        *open.lock().unwrap() = true;
        signal.notify_all();
    }

    pub fn wait(&self) {
        let (open, signal) = &*self.state;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = signal.wait(guard).unwrap();
        }
    }
}
