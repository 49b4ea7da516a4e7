//! Tests, datasets, label values and variables

use crate::schema::sequences;
use crate::{
    Dataset, DatasetId, DatasetInfo, NewDataset, NewTest, NewVariable, StoreError, Test, TestId,
    Tx, Variable, VariableId, from_millis, id_list, json_column, optional, to_millis,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

const DATASET_COLUMNS: &str = "id, test_id, run_id, ordinal, start_ms, description";
const VARIABLE_COLUMNS: &str =
    "id, test_id, name, var_group, labels_json, calculation, detection_json";

fn map_test(row: &duckdb::Row<'_>) -> duckdb::Result<Test> {
    Ok(Test {
        id: row.get(0)?,
        name: row.get(1)?,
        fingerprint_labels: json_column(row, 2)?,
    })
}

fn map_dataset(row: &duckdb::Row<'_>) -> duckdb::Result<Dataset> {
    Ok(Dataset {
        id: row.get(0)?,
        test_id: row.get(1)?,
        run_id: row.get(2)?,
        ordinal: row.get(3)?,
        start: from_millis(row.get(4)?),
        description: row.get(5)?,
    })
}

fn map_variable(row: &duckdb::Row<'_>) -> duckdb::Result<Variable> {
    Ok(Variable {
        id: row.get(0)?,
        test_id: row.get(1)?,
        name: row.get(2)?,
        group: row.get(3)?,
        labels: json_column(row, 4)?,
        calculation: row.get(5)?,
        detection: json_column(row, 6)?,
    })
}

impl Tx<'_> {
    // =========================================================================
    // Tests
    // =========================================================================

    /// Create a test
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if id allocation or the insert fails.
    pub fn insert_test(&self, new: &NewTest) -> Result<Test, StoreError> {
        let id = self.next_id(sequences::TESTS)?;
        let labels_json = serde_json::to_string(&new.fingerprint_labels)?;
        self.conn.execute(
            "INSERT INTO tests (id, name, fingerprint_labels_json) VALUES (?, ?, ?)",
            duckdb::params![id, new.name, labels_json],
        )?;
        Ok(Test {
            id,
            name: new.name.clone(),
            fingerprint_labels: new.fingerprint_labels.clone(),
        })
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn get_test(&self, id: TestId) -> Result<Option<Test>, StoreError> {
        optional(self.conn.query_row(
            "SELECT id, name, fingerprint_labels_json FROM tests WHERE id = ?",
            [id],
            map_test,
        ))
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn list_tests(&self) -> Result<Vec<Test>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, fingerprint_labels_json FROM tests ORDER BY id")?;
        let rows = stmt.query_map([], map_test)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // =========================================================================
    // Datasets
    // =========================================================================

    /// # Errors
    ///
    /// Returns [`StoreError`] if id allocation or the insert fails.
    pub fn insert_dataset(&self, new: &NewDataset) -> Result<Dataset, StoreError> {
        let id = self.next_id(sequences::DATASETS)?;
        self.conn.execute(
            "INSERT INTO datasets (id, test_id, run_id, ordinal, start_ms, description) \
             VALUES (?, ?, ?, ?, ?, ?)",
            duckdb::params![
                id,
                new.test_id,
                new.run_id,
                new.ordinal,
                to_millis(new.start),
                new.description
            ],
        )?;
        Ok(Dataset {
            id,
            test_id: new.test_id,
            run_id: new.run_id,
            ordinal: new.ordinal,
            start: new.start,
            description: new.description.clone(),
        })
    }

    /// Read a dataset. Returns `None` when it is not visible to this unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn get_dataset(&self, id: DatasetId) -> Result<Option<Dataset>, StoreError> {
        optional(self.conn.query_row(
            &format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = ?"),
            [id],
            map_dataset,
        ))
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn dataset_info(&self, id: DatasetId) -> Result<Option<DatasetInfo>, StoreError> {
        Ok(self.get_dataset(id)?.map(|d| d.info()))
    }

    /// Ids of a test's datasets ordered by start time, optionally bounded
    /// (inclusive) on both ends
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn list_dataset_ids(
        &self,
        test_id: TestId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<DatasetId>, StoreError> {
        let from_ms = from.map_or(i64::MIN, to_millis);
        let to_ms = to.map_or(i64::MAX, to_millis);
        let mut stmt = self.conn.prepare(
            "SELECT id FROM datasets WHERE test_id = ? AND start_ms >= ? AND start_ms <= ? \
             ORDER BY start_ms, id",
        )?;
        let rows = stmt.query_map(duckdb::params![test_id, from_ms, to_ms], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Delete a dataset together with its labels, series rows and rule results.
    /// Confirmed changes are removed too since they reference the dataset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any delete fails.
    pub fn delete_dataset(&self, id: DatasetId) -> Result<bool, StoreError> {
        for table in [
            "label_values",
            "datapoints",
            "changes",
            "missing_data_rule_results",
        ] {
            self.conn
                .execute(&format!("DELETE FROM {table} WHERE dataset_id = ?"), [id])?;
        }
        let deleted = self
            .conn
            .execute("DELETE FROM datasets WHERE id = ?", [id])?;
        debug!(dataset_id = id, deleted, "Dataset deleted");
        Ok(deleted > 0)
    }

    // =========================================================================
    // Label values
    // =========================================================================

    /// Set (or replace) one label value on a dataset
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization or the write fails.
    pub fn set_label_value(
        &self,
        dataset_id: DatasetId,
        name: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let value_json = serde_json::to_string(value)?;
        self.conn.execute(
            "DELETE FROM label_values WHERE dataset_id = ? AND name = ?",
            duckdb::params![dataset_id, name],
        )?;
        self.conn.execute(
            "INSERT INTO label_values (dataset_id, name, value_json) VALUES (?, ?, ?)",
            duckdb::params![dataset_id, name, value_json],
        )?;
        Ok(())
    }

    /// Label values of a dataset. An empty `names` slice selects every label.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a stored value is not JSON.
    pub fn label_values(
        &self,
        dataset_id: DatasetId,
        names: &[String],
    ) -> Result<BTreeMap<String, Value>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value_json FROM label_values WHERE dataset_id = ?")?;
        let rows = stmt.query_map([dataset_id], |row| {
            Ok((row.get::<_, String>(0)?, json_column::<Value>(row, 1)?))
        })?;

        let mut values = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            if names.is_empty() || names.iter().any(|n| *n == name) {
                values.insert(name, value);
            }
        }
        Ok(values)
    }

    // =========================================================================
    // Variables
    // =========================================================================

    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization, id allocation or the insert fails.
    pub fn insert_variable(&self, new: &NewVariable) -> Result<Variable, StoreError> {
        let id = self.next_id(sequences::VARIABLES)?;
        let labels_json = serde_json::to_string(&new.labels)?;
        let detection_json = serde_json::to_string(&new.detection)?;
        self.conn.execute(
            "INSERT INTO variables \
             (id, test_id, name, var_group, labels_json, calculation, detection_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                id,
                new.test_id,
                new.name,
                new.group,
                labels_json,
                new.calculation,
                detection_json
            ],
        )?;
        Ok(Variable {
            id,
            test_id: new.test_id,
            name: new.name.clone(),
            group: new.group.clone(),
            labels: new.labels.clone(),
            calculation: new.calculation.clone(),
            detection: new.detection.clone(),
        })
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn get_variable(&self, id: VariableId) -> Result<Option<Variable>, StoreError> {
        optional(self.conn.query_row(
            &format!("SELECT {VARIABLE_COLUMNS} FROM variables WHERE id = ?"),
            [id],
            map_variable,
        ))
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn list_variables(&self, test_id: TestId) -> Result<Vec<Variable>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VARIABLE_COLUMNS} FROM variables WHERE test_id = ? ORDER BY id"
        ))?;
        let rows = stmt.query_map([test_id], map_variable)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Delete variables with their series and changes
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any delete fails.
    pub fn delete_variables(&self, ids: &[VariableId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let list = id_list(ids);
        self.conn.execute(
            &format!("DELETE FROM datapoints WHERE variable_id IN ({list})"),
            [],
        )?;
        self.conn.execute(
            &format!("DELETE FROM changes WHERE variable_id IN ({list})"),
            [],
        )?;
        let deleted = self
            .conn
            .execute(&format!("DELETE FROM variables WHERE id IN ({list})"), [])?;
        Ok(deleted)
    }
}
