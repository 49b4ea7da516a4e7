//! Persisted entity types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt::Write as _;

pub type TestId = i64;
pub type DatasetId = i64;
pub type VariableId = i64;
pub type ChangeId = i64;
pub type RuleId = i64;

/// Milliseconds since the Unix epoch, the storage representation of every timestamp
#[must_use]
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_millis`]; out-of-range values clamp to the epoch
#[must_use]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Partition key derived from a dataset's labels.
///
/// Two fingerprints are equal when their JSON values are structurally equal.
/// The absence of a fingerprint is its own partition, distinct from every value.
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    value: Option<Value>,
}

impl Fingerprint {
    #[must_use]
    pub fn none() -> Self {
        Self { value: None }
    }

    /// JSON `null` is treated as "no fingerprint"
    #[must_use]
    pub fn new(value: Value) -> Self {
        if value.is_null() {
            Self::none()
        } else {
            Self { value: Some(value) }
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.value.is_none()
    }

    /// Canonical text used as the storage and comparison key.
    ///
    /// Object keys are written sorted, so structurally equal values share a key.
    /// No fingerprint maps to the empty string, which is never valid JSON.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.value {
            None => String::new(),
            Some(value) => {
                let mut out = String::new();
                write_canonical(value, &mut out);
                out
            }
        }
    }

    /// Rebuild a fingerprint from its storage key
    ///
    /// # Errors
    ///
    /// Returns an error if a non-empty key is not valid JSON.
    pub fn from_key(key: &str) -> Result<Self, serde_json::Error> {
        if key.is_empty() {
            return Ok(Self::none());
        }
        Ok(Self::new(serde_json::from_str(key)?))
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Fingerprint {}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            None => f.write_str("<none>"),
            Some(_) => f.write_str(&self.key()),
        }
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.map(Self::new).unwrap_or_default())
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars have a single serde_json rendering
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Lower edge of a time range: everything after `at`, and `at` itself when `include_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoff {
    pub at: DateTime<Utc>,
    pub include_at: bool,
}

impl Cutoff {
    #[must_use]
    pub fn admits(&self, ts: DateTime<Utc>) -> bool {
        ts > self.at || (self.include_at && ts == self.at)
    }
}

/// A test, the unit of tenancy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Test {
    pub id: TestId,
    pub name: String,
    pub fingerprint_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTest {
    pub name: String,
    pub fingerprint_labels: Vec<String>,
}

/// One structured result set belonging to a test
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub id: DatasetId,
    pub test_id: TestId,
    pub run_id: i64,
    pub ordinal: i32,
    pub start: DateTime<Utc>,
    pub description: Option<String>,
}

impl Dataset {
    #[must_use]
    pub fn info(&self) -> DatasetInfo {
        DatasetInfo {
            id: self.id,
            test_id: self.test_id,
            run_id: self.run_id,
            ordinal: self.ordinal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataset {
    pub test_id: TestId,
    pub run_id: i64,
    pub ordinal: i32,
    pub start: DateTime<Utc>,
    pub description: Option<String>,
}

/// Identity of a dataset as carried by events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DatasetInfo {
    pub id: DatasetId,
    pub test_id: TestId,
    pub run_id: i64,
    pub ordinal: i32,
}

/// A detection model selection plus its (possibly partial) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionConfig {
    pub model: String,
    #[serde(default)]
    pub config: Value,
}

/// A named numeric series derived from each dataset of a test
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    pub id: VariableId,
    pub test_id: TestId,
    pub name: String,
    pub group: Option<String>,
    pub labels: Vec<String>,
    pub calculation: Option<String>,
    pub detection: Vec<DetectionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewVariable {
    pub test_id: TestId,
    pub name: String,
    pub group: Option<String>,
    pub labels: Vec<String>,
    pub calculation: Option<String>,
    pub detection: Vec<DetectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    pub id: i64,
    pub variable_id: VariableId,
    pub dataset_id: DatasetId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone)]
pub struct NewDataPoint {
    pub variable_id: VariableId,
    pub dataset_id: DatasetId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub fingerprint: Fingerprint,
}

/// A detected discontinuity. Unconfirmed changes are provisional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    pub id: ChangeId,
    pub variable_id: VariableId,
    pub dataset_id: DatasetId,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub confirmed: bool,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone)]
pub struct NewChange {
    pub variable_id: VariableId,
    pub dataset_id: DatasetId,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub confirmed: bool,
    pub fingerprint: Fingerprint,
}

/// Staleness SLA over datasets matching a label condition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissingDataRule {
    pub id: RuleId,
    pub test_id: TestId,
    pub name: String,
    pub labels: Vec<String>,
    pub condition: Option<String>,
    pub max_staleness_ms: i64,
    pub last_notification: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMissingDataRule {
    pub test_id: TestId,
    pub name: String,
    pub labels: Vec<String>,
    pub condition: Option<String>,
    pub max_staleness_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissingDataRuleResult {
    pub rule_id: RuleId,
    pub dataset_id: DatasetId,
    pub timestamp: DateTime<Utc>,
}

/// A rule joined with the timestamp of its most recent result
#[derive(Debug, Clone)]
pub struct RuleStaleness {
    pub rule: MissingDataRule,
    pub last_result: Option<DateTime<Utc>>,
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Which subsystem a diagnostic belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Calculation,
    ChangeDetection,
    MissingData,
}

impl LogCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Calculation => "calculation",
            LogCategory::ChangeDetection => "change_detection",
            LogCategory::MissingData => "missing_data",
        }
    }
}

impl std::str::FromStr for LogCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "calculation" => Ok(LogCategory::Calculation),
            "change_detection" => Ok(LogCategory::ChangeDetection),
            "missing_data" => Ok(LogCategory::MissingData),
            other => Err(format!("unknown log category: {other}")),
        }
    }
}

/// Persisted diagnostic scoped to a test and optionally a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticLog {
    pub id: i64,
    pub test_id: TestId,
    pub dataset_id: Option<DatasetId>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDiagnostic {
    pub test_id: TestId,
    pub dataset_id: Option<DatasetId>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
}
