//! Schema definitions and constants

/// Table names
pub mod tables {
    pub const TESTS: &str = "tests";
    pub const DATASETS: &str = "datasets";
    pub const LABEL_VALUES: &str = "label_values";
    pub const VARIABLES: &str = "variables";
    pub const DATAPOINTS: &str = "datapoints";
    pub const CHANGES: &str = "changes";
    pub const MISSING_DATA_RULES: &str = "missing_data_rules";
    pub const MISSING_DATA_RULE_RESULTS: &str = "missing_data_rule_results";
    pub const DIAGNOSTIC_LOGS: &str = "diagnostic_logs";

    /// Every table created by the migrations, in creation order
    pub const ALL: &[&str] = &[
        TESTS,
        DATASETS,
        LABEL_VALUES,
        VARIABLES,
        DATAPOINTS,
        CHANGES,
        MISSING_DATA_RULES,
        MISSING_DATA_RULE_RESULTS,
        DIAGNOSTIC_LOGS,
    ];
}

/// Id sequences, one per table with a surrogate key
pub mod sequences {
    pub const TESTS: &str = "seq_tests";
    pub const DATASETS: &str = "seq_datasets";
    pub const VARIABLES: &str = "seq_variables";
    pub const DATAPOINTS: &str = "seq_datapoints";
    pub const CHANGES: &str = "seq_changes";
    pub const MISSING_DATA_RULES: &str = "seq_missing_data_rules";
    pub const DIAGNOSTIC_LOGS: &str = "seq_diagnostic_logs";
}
