//! tm_cli - CLI commands for Tidemark
//!
//! This crate provides:
//! - clap-based command definitions
//! - Catalog management (tests, variables, missing-data rules)
//! - Dataset ingestion through the engine
//! - Recalculation with progress polling
//! - Watchdog runs and diagnostic log queries

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tm_config::TmConfig;
use tm_engine::{Engine, LabelsOutcome, LogSink, RecalculationRequest, RecalculationStart};
use tm_store::{
    DetectionConfig, Fingerprint, LogCategory, NewDataset, NewMissingDataRule, NewTest,
    NewVariable, TmStore,
};
use tracing::{debug, info};

/// CLI errors
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] tm_config::ConfigError),

    #[error("Store error: {0}")]
    StoreError(#[from] tm_store::StoreError),

    #[error("Engine error: {0}")]
    EngineError(#[from] tm_engine::EngineError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// One compact JSON line per record
    Text,
}

/// Main CLI application
#[derive(Parser, Debug)]
#[command(name = "tm")]
#[command(
    author,
    version,
    about = "Tidemark - incremental change detection for test result series"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format for commands
    #[arg(long, global = true, default_value = "json")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Test (tenant) management
    Test {
        #[command(subcommand)]
        command: TestCommands,
    },

    /// Variable management
    Variable {
        #[command(subcommand)]
        command: VariableCommands,
    },

    /// Missing-data rule management
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },

    /// Dataset ingestion
    Dataset {
        #[command(subcommand)]
        command: DatasetCommands,
    },

    /// List detected changes of a variable
    Changes {
        /// Variable id
        #[arg(long)]
        variable: i64,

        /// Restrict to one fingerprint (JSON)
        #[arg(long)]
        fingerprint: Option<String>,
    },

    /// Confirm a detected change
    Confirm {
        /// Change id
        change_id: i64,

        /// Withdraw a previous confirmation
        #[arg(long)]
        undo: bool,
    },

    /// Recalculate every dataset of a test
    Recalc {
        /// Test id
        #[arg(long)]
        test: i64,

        /// Raise notifications for detected changes
        #[arg(long)]
        notify: bool,

        /// Log every computed value as a debug diagnostic
        #[arg(long)]
        debug: bool,

        /// Only datasets starting at or after this time (RFC 3339)
        #[arg(long)]
        from: Option<String>,

        /// Only datasets starting at or before this time (RFC 3339)
        #[arg(long)]
        to: Option<String>,
    },

    /// Show variables and latest datapoints of a test
    Status {
        /// Test id
        #[arg(long)]
        test: i64,
    },

    /// Run the missing-data watchdog
    Watchdog {
        /// Run a single scan and exit
        #[arg(long)]
        once: bool,
    },

    /// Show diagnostic log entries
    Logs {
        /// Test id
        #[arg(long)]
        test: i64,

        /// Filter by category (calculation, change_detection, missing_data)
        #[arg(long)]
        category: Option<String>,

        /// Maximum entries
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum TestCommands {
    /// Create a test
    Add {
        name: String,

        /// Label that partitions the test's series (repeatable)
        #[arg(long = "fingerprint-label")]
        fingerprint_labels: Vec<String>,
    },

    /// List tests
    List,
}

#[derive(Subcommand, Debug)]
pub enum VariableCommands {
    /// Create a variable
    Add {
        /// Test id
        #[arg(long)]
        test: i64,

        name: String,

        /// Label the value is read from (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Calculation script applied to the label values
        #[arg(long)]
        calculation: Option<String>,

        #[arg(long)]
        group: Option<String>,

        /// Detection config as MODEL or MODEL=JSON (repeatable)
        #[arg(long = "detection")]
        detection: Vec<String>,
    },

    /// List variables of a test
    List {
        #[arg(long)]
        test: i64,
    },

    /// Delete a variable with its datapoints and changes
    Delete { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum RuleCommands {
    /// Create a missing-data rule
    Add {
        /// Test id
        #[arg(long)]
        test: i64,

        name: String,

        /// Label passed to the condition (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Boolean condition script; omitted means every dataset counts
        #[arg(long)]
        condition: Option<String>,

        /// Staleness window in milliseconds
        #[arg(long)]
        max_staleness_ms: i64,
    },

    /// List rules of a test
    List {
        #[arg(long)]
        test: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum DatasetCommands {
    /// Store a dataset with its label values and process it
    Ingest {
        /// Test id
        #[arg(long)]
        test: i64,

        /// JSON file holding an object of label name to value
        #[arg(long)]
        labels: PathBuf,

        /// Dataset start time (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<String>,

        #[arg(long, default_value = "0")]
        run_id: i64,

        #[arg(long, default_value = "0")]
        ordinal: i32,
    },

    /// Delete a dataset
    Delete { id: i64 },
}

impl Cli {
    /// Run the CLI command
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] if configuration, storage or the engine fails.
    pub async fn run(self) -> Result<(), CliError> {
        let format = self.format;
        let engine = open_engine(self.config.as_deref())?;
        let store = engine.store().clone();

        match self.command {
            Commands::Test { command } => match command {
                TestCommands::Add {
                    name,
                    fingerprint_labels,
                } => {
                    let test = store.transaction(|tx| {
                        tx.insert_test(&NewTest {
                            name,
                            fingerprint_labels,
                        })
                    })?;
                    print_output(&test, format);
                }
                TestCommands::List => {
                    let tests = store.transaction(|tx| tx.list_tests())?;
                    print_output(&tests, format);
                }
            },

            Commands::Variable { command } => match command {
                VariableCommands::Add {
                    test,
                    name,
                    labels,
                    calculation,
                    group,
                    detection,
                } => {
                    let detection = detection
                        .iter()
                        .map(|arg| parse_detection(arg))
                        .collect::<Result<Vec<_>, _>>()?;
                    let variable = store.transaction(|tx| {
                        tx.insert_variable(&NewVariable {
                            test_id: test,
                            name,
                            group,
                            labels,
                            calculation,
                            detection,
                        })
                    })?;
                    print_output(&variable, format);
                }
                VariableCommands::List { test } => {
                    let variables = store.transaction(|tx| tx.list_variables(test))?;
                    print_output(&variables, format);
                }
                VariableCommands::Delete { id } => {
                    let deleted = engine.delete_variable(id)?;
                    print_output(&json!({ "variable_id": id, "deleted": deleted }), format);
                }
            },

            Commands::Rule { command } => match command {
                RuleCommands::Add {
                    test,
                    name,
                    labels,
                    condition,
                    max_staleness_ms,
                } => {
                    let rule = store.transaction(|tx| {
                        tx.insert_missing_data_rule(&NewMissingDataRule {
                            test_id: test,
                            name,
                            labels,
                            condition,
                            max_staleness_ms,
                        })
                    })?;
                    print_output(&rule, format);
                }
                RuleCommands::List { test } => {
                    let rules = store.transaction(|tx| tx.list_missing_data_rules(test))?;
                    print_output(&rules, format);
                }
            },

            Commands::Dataset { command } => match command {
                DatasetCommands::Ingest {
                    test,
                    labels,
                    start,
                    run_id,
                    ordinal,
                } => {
                    let values = read_labels(&labels)?;
                    let start = start.as_deref().map(parse_rfc3339).transpose()?;
                    let dataset = store.transaction(|tx| -> Result<_, CliError> {
                        if tx.get_test(test)?.is_none() {
                            return Err(CliError::CommandFailed(format!("Unknown test {test}")));
                        }
                        let dataset = tx.insert_dataset(&NewDataset {
                            test_id: test,
                            run_id,
                            ordinal,
                            start: start.unwrap_or_else(Utc::now),
                            description: None,
                        })?;
                        for (name, value) in &values {
                            tx.set_label_value(dataset.id, name, value)?;
                        }
                        Ok(dataset)
                    })?;
                    info!(dataset_id = dataset.id, labels = values.len(), "Dataset stored");

                    let outcome = engine.process_labels_updated(dataset.id, false)?;
                    engine.flush(test).await;
                    let LabelsOutcome::Processed(processed) = outcome else {
                        return Err(CliError::CommandFailed(format!(
                            "Dataset {} is not visible",
                            dataset.id
                        )));
                    };
                    print_output(
                        &json!({
                            "dataset": processed.dataset,
                            "fingerprint": processed.emission.fingerprint,
                            "datapoints": processed.emission.datapoints,
                            "missing": processed.emission.missing_names(),
                            "rules_matched": processed.rules_matched,
                        }),
                        format,
                    );
                }
                DatasetCommands::Delete { id } => {
                    let deleted = store.transaction(|tx| tx.delete_dataset(id))?;
                    print_output(&json!({ "dataset_id": id, "deleted": deleted }), format);
                }
            },

            Commands::Changes {
                variable,
                fingerprint,
            } => {
                let fingerprint = fingerprint
                    .as_deref()
                    .map(serde_json::from_str::<Value>)
                    .transpose()?
                    .map(Fingerprint::new);
                let changes = engine.list_changes(variable, fingerprint.as_ref())?;
                print_output(&changes, format);
            }

            Commands::Confirm { change_id, undo } => {
                let updated = engine.confirm_change(change_id, !undo)?;
                if !updated {
                    return Err(CliError::CommandFailed(format!("Unknown change {change_id}")));
                }
                print_output(
                    &json!({ "change_id": change_id, "confirmed": !undo }),
                    format,
                );
            }

            Commands::Recalc {
                test,
                notify,
                debug,
                from,
                to,
            } => {
                let request = RecalculationRequest {
                    test_id: test,
                    notify,
                    debug,
                    from: from.as_deref().map(parse_rfc3339).transpose()?,
                    to: to.as_deref().map(parse_rfc3339).transpose()?,
                };
                if engine.recalculate(request) == RecalculationStart::AlreadyRunning {
                    return Err(CliError::CommandFailed(format!(
                        "Recalculation of test {test} is already running"
                    )));
                }
                let mut last = None;
                loop {
                    let status = engine.recalculation_status(test);
                    if last != Some(status.progress) {
                        debug!(progress = status.progress, "Recalculation progress");
                        last = Some(status.progress);
                    }
                    if status.done {
                        print_output(&status, format);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                engine.flush(test).await;
            }

            Commands::Status { test } => {
                let (test_row, variables) = store.transaction(|tx| -> Result<_, CliError> {
                    let test_row = tx
                        .get_test(test)?
                        .ok_or_else(|| CliError::CommandFailed(format!("Unknown test {test}")))?;
                    Ok((test_row, tx.list_variables(test)?))
                })?;
                let ids: Vec<i64> = variables.iter().map(|v| v.id).collect();
                let latest = engine.last_datapoint_timestamps(None, &ids)?;
                let variables: Vec<Value> = variables
                    .iter()
                    .map(|v| {
                        let last = latest
                            .iter()
                            .find(|(id, _)| *id == v.id)
                            .map(|(_, ts)| *ts);
                        json!({
                            "id": v.id,
                            "name": v.name,
                            "models": v.detection.iter().map(|d| d.model.as_str()).collect::<Vec<_>>(),
                            "last_datapoint": last,
                        })
                    })
                    .collect();
                print_output(
                    &json!({
                        "test": test_row,
                        "variables": variables,
                        "recalculation": engine.recalculation_status(test),
                    }),
                    format,
                );
            }

            Commands::Watchdog { once } => {
                if once {
                    let notified = engine.watchdog_tick(Utc::now())?;
                    print_output(&json!({ "notified": notified }), format);
                } else {
                    let Some(task) = engine.start_watchdog() else {
                        return Err(CliError::CommandFailed(
                            "Watchdog is disabled in configuration".to_string(),
                        ));
                    };
                    tokio::signal::ctrl_c().await?;
                    info!("Stopping watchdog");
                    task.abort();
                }
            }

            Commands::Logs {
                test,
                category,
                limit,
            } => {
                let category = category
                    .as_deref()
                    .map(str::parse::<LogCategory>)
                    .transpose()
                    .map_err(|e| CliError::CommandFailed(format!("Invalid category: {e}")))?;
                let logs = store.transaction(|tx| tx.list_diagnostics(test, category, limit))?;
                print_output(&logs, format);
            }
        }
        Ok(())
    }
}

fn load_config(config_path: Option<&Path>) -> Result<TmConfig, CliError> {
    let config = match config_path {
        Some(path) => TmConfig::load_with_env(path)?,
        None => TmConfig::discover_with_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn open_engine(config_path: Option<&Path>) -> Result<Engine, CliError> {
    let config = load_config(config_path)?;
    let store = TmStore::open(&config.global.db_path)?;
    Ok(Engine::builder()
        .store(store)
        .config(config)
        .sink(Arc::new(LogSink::info()))
        .build()?)
}

/// Parse `MODEL` or `MODEL=JSON` into a detection config
fn parse_detection(arg: &str) -> Result<DetectionConfig, CliError> {
    let (model, config) = match arg.split_once('=') {
        Some((model, raw)) => (model, serde_json::from_str(raw)?),
        None => (arg, Value::Null),
    };
    let model = model.trim();
    if model.is_empty() {
        return Err(CliError::CommandFailed(format!(
            "Invalid detection '{arg}': missing model"
        )));
    }
    Ok(DetectionConfig {
        model: model.to_string(),
        config,
    })
}

fn read_labels(path: &Path) -> Result<serde_json::Map<String, Value>, CliError> {
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str(&content)? {
        Value::Object(map) => Ok(map),
        other => Err(CliError::CommandFailed(format!(
            "Labels file must hold a JSON object, got {other}"
        ))),
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, CliError> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|err| CliError::CommandFailed(format!("Invalid timestamp: {err}")))?;
    Ok(parsed.with_timezone(&Utc))
}

fn print_output<T: Serialize>(value: &T, format: OutputFormat) {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value),
        OutputFormat::Text => match serde_json::to_value(value) {
            Ok(Value::Array(items)) => items
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()
                .map(|lines| lines.join("\n")),
            Ok(other) => serde_json::to_string(&other),
            Err(e) => Err(e),
        },
    }
    .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {e}"}}"#));
    println!("{rendered}");
}
