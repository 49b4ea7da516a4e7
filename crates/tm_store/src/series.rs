//! Datapoints and changes, partitioned by (variable, fingerprint)

use crate::schema::sequences;
use crate::{
    Change, ChangeId, Cutoff, DataPoint, DatasetId, Fingerprint, NewChange, NewDataPoint,
    StoreError, Tx, VariableId, fingerprint_column, from_millis, id_list, optional, to_millis,
};
use chrono::{DateTime, Utc};

const DATAPOINT_COLUMNS: &str = "id, variable_id, dataset_id, ts_ms, value_num, fingerprint";
const CHANGE_COLUMNS: &str =
    "id, variable_id, dataset_id, ts_ms, description, confirmed, fingerprint";

fn map_datapoint(row: &duckdb::Row<'_>) -> duckdb::Result<DataPoint> {
    Ok(DataPoint {
        id: row.get(0)?,
        variable_id: row.get(1)?,
        dataset_id: row.get(2)?,
        timestamp: from_millis(row.get(3)?),
        value: row.get(4)?,
        fingerprint: fingerprint_column(row, 5)?,
    })
}

fn map_change(row: &duckdb::Row<'_>) -> duckdb::Result<Change> {
    Ok(Change {
        id: row.get(0)?,
        variable_id: row.get(1)?,
        dataset_id: row.get(2)?,
        timestamp: from_millis(row.get(3)?),
        description: row.get(4)?,
        confirmed: row.get(5)?,
        fingerprint: fingerprint_column(row, 6)?,
    })
}

impl Tx<'_> {
    // =========================================================================
    // Datapoints
    // =========================================================================

    /// Store a datapoint, replacing any previous value of the variable for the
    /// same dataset
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if id allocation or a write fails.
    pub fn insert_datapoint(&self, new: &NewDataPoint) -> Result<DataPoint, StoreError> {
        self.conn.execute(
            "DELETE FROM datapoints WHERE variable_id = ? AND dataset_id = ?",
            duckdb::params![new.variable_id, new.dataset_id],
        )?;
        let id = self.next_id(sequences::DATAPOINTS)?;
        self.conn.execute(
            "INSERT INTO datapoints (id, variable_id, dataset_id, fingerprint, ts_ms, value_num) \
             VALUES (?, ?, ?, ?, ?, ?)",
            duckdb::params![
                id,
                new.variable_id,
                new.dataset_id,
                new.fingerprint.key(),
                to_millis(new.timestamp),
                new.value
            ],
        )?;
        Ok(DataPoint {
            id,
            variable_id: new.variable_id,
            dataset_id: new.dataset_id,
            timestamp: new.timestamp,
            value: new.value,
            fingerprint: new.fingerprint.clone(),
        })
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    pub fn delete_datapoints_for_dataset(&self, dataset_id: DatasetId) -> Result<usize, StoreError> {
        self.delete_datapoints_for_datasets(&[dataset_id])
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    pub fn delete_datapoints_for_datasets(&self, ids: &[DatasetId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.conn.execute(
            &format!("DELETE FROM datapoints WHERE dataset_id IN ({})", id_list(ids)),
            [],
        )?;
        Ok(deleted)
    }

    /// Earliest datapoint timestamp of a partition admitted by `cutoff`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn next_datapoint_timestamp(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
        cutoff: Cutoff,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let at = to_millis(cutoff.at);
        let ts: Option<i64> = self.conn.query_row(
            "SELECT MIN(ts_ms) FROM datapoints \
             WHERE variable_id = ? AND fingerprint = ? AND (ts_ms > ? OR (ts_ms = ? AND ?))",
            duckdb::params![variable_id, fingerprint.key(), at, at, cutoff.include_at],
            |row| row.get(0),
        )?;
        Ok(ts.map(from_millis))
    }

    /// Datapoints of a partition with `from <= ts <= to`, newest first.
    /// Ties on timestamp order by dataset id, newest dataset first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn datapoints_between(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DATAPOINT_COLUMNS} FROM datapoints \
             WHERE variable_id = ? AND fingerprint = ? AND ts_ms >= ? AND ts_ms <= ? \
             ORDER BY ts_ms DESC, dataset_id DESC"
        ))?;
        let rows = stmt.query_map(
            duckdb::params![
                variable_id,
                fingerprint.key(),
                to_millis(from),
                to_millis(to)
            ],
            map_datapoint,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every datapoint emitted for one dataset, across variables
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn datapoints_for_dataset(&self, dataset_id: DatasetId) -> Result<Vec<DataPoint>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DATAPOINT_COLUMNS} FROM datapoints WHERE dataset_id = ? \
             ORDER BY variable_id"
        ))?;
        let rows = stmt.query_map([dataset_id], map_datapoint)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Datapoints of a variable in timestamp order, optionally restricted to
    /// one fingerprint
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn list_datapoints(
        &self,
        variable_id: VariableId,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<Vec<DataPoint>, StoreError> {
        let key = fingerprint.map(Fingerprint::key);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DATAPOINT_COLUMNS} FROM datapoints WHERE variable_id = ? \
             AND fingerprint = COALESCE(?, fingerprint) ORDER BY ts_ms, dataset_id"
        ))?;
        let rows = stmt.query_map(duckdb::params![variable_id, key], map_datapoint)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Latest datapoint timestamp per variable, optionally within one fingerprint.
    /// Variables without datapoints are omitted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn last_datapoint_timestamps(
        &self,
        fingerprint: Option<&Fingerprint>,
        variable_ids: &[VariableId],
    ) -> Result<Vec<(VariableId, DateTime<Utc>)>, StoreError> {
        if variable_ids.is_empty() {
            return Ok(Vec::new());
        }
        let key = fingerprint.map(Fingerprint::key);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT variable_id, MAX(ts_ms) FROM datapoints \
             WHERE variable_id IN ({}) AND fingerprint = COALESCE(?, fingerprint) \
             GROUP BY variable_id ORDER BY variable_id",
            id_list(variable_ids)
        ))?;
        let rows = stmt.query_map([key], |row| {
            Ok((row.get::<_, i64>(0)?, from_millis(row.get(1)?)))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // =========================================================================
    // Changes
    // =========================================================================

    /// # Errors
    ///
    /// Returns [`StoreError`] if id allocation or the insert fails.
    pub fn insert_change(&self, new: &NewChange) -> Result<Change, StoreError> {
        let id = self.next_id(sequences::CHANGES)?;
        self.conn.execute(
            "INSERT INTO changes \
             (id, variable_id, dataset_id, fingerprint, ts_ms, description, confirmed) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                id,
                new.variable_id,
                new.dataset_id,
                new.fingerprint.key(),
                to_millis(new.timestamp),
                new.description,
                new.confirmed
            ],
        )?;
        Ok(Change {
            id,
            variable_id: new.variable_id,
            dataset_id: new.dataset_id,
            timestamp: new.timestamp,
            description: new.description.clone(),
            confirmed: new.confirmed,
            fingerprint: new.fingerprint.clone(),
        })
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn get_change(&self, id: ChangeId) -> Result<Option<Change>, StoreError> {
        optional(self.conn.query_row(
            &format!("SELECT {CHANGE_COLUMNS} FROM changes WHERE id = ?"),
            [id],
            map_change,
        ))
    }

    /// Confirm or unconfirm a change. Returns `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub fn set_change_confirmed(&self, id: ChangeId, confirmed: bool) -> Result<bool, StoreError> {
        let updated = self.conn.execute(
            "UPDATE changes SET confirmed = ? WHERE id = ?",
            duckdb::params![confirmed, id],
        )?;
        Ok(updated > 0)
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    pub fn delete_unconfirmed_changes_for_datasets(
        &self,
        ids: &[DatasetId],
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.conn.execute(
            &format!(
                "DELETE FROM changes WHERE confirmed = FALSE AND dataset_id IN ({})",
                id_list(ids)
            ),
            [],
        )?;
        Ok(deleted)
    }

    /// Drop the unconfirmed changes of a partition admitted by `cutoff`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    pub fn delete_unconfirmed_changes_from(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
        cutoff: Cutoff,
    ) -> Result<usize, StoreError> {
        let at = to_millis(cutoff.at);
        let deleted = self.conn.execute(
            "DELETE FROM changes WHERE confirmed = FALSE \
             AND variable_id = ? AND fingerprint = ? AND (ts_ms > ? OR (ts_ms = ? AND ?))",
            duckdb::params![variable_id, fingerprint.key(), at, at, cutoff.include_at],
        )?;
        Ok(deleted)
    }

    /// Most recent change of a partition strictly before `before`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn latest_change_before(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
        before: DateTime<Utc>,
    ) -> Result<Option<Change>, StoreError> {
        optional(self.conn.query_row(
            &format!(
                "SELECT {CHANGE_COLUMNS} FROM changes \
                 WHERE variable_id = ? AND fingerprint = ? AND ts_ms < ? \
                 ORDER BY ts_ms DESC, id DESC LIMIT 1"
            ),
            duckdb::params![variable_id, fingerprint.key(), to_millis(before)],
            map_change,
        ))
    }

    /// Most recent confirmed change of a partition
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn latest_confirmed_change(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Change>, StoreError> {
        optional(self.conn.query_row(
            &format!(
                "SELECT {CHANGE_COLUMNS} FROM changes \
                 WHERE variable_id = ? AND fingerprint = ? AND confirmed = TRUE \
                 ORDER BY ts_ms DESC, id DESC LIMIT 1"
            ),
            duckdb::params![variable_id, fingerprint.key()],
            map_change,
        ))
    }

    /// Whether a partition already holds a confirmed change for `dataset_id`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn has_confirmed_change(
        &self,
        variable_id: VariableId,
        fingerprint: &Fingerprint,
        dataset_id: DatasetId,
    ) -> Result<bool, StoreError> {
        let found = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM changes \
             WHERE variable_id = ? AND fingerprint = ? AND dataset_id = ? AND confirmed = TRUE)",
            duckdb::params![variable_id, fingerprint.key(), dataset_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// Changes of a variable in timestamp order, optionally within one fingerprint
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn list_changes(
        &self,
        variable_id: VariableId,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<Vec<Change>, StoreError> {
        let key = fingerprint.map(Fingerprint::key);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes WHERE variable_id = ? \
             AND fingerprint = COALESCE(?, fingerprint) ORDER BY ts_ms, id"
        ))?;
        let rows = stmt.query_map(duckdb::params![variable_id, key], map_change)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        store: TmStore,
        variable_id: VariableId,
        datasets: Vec<DatasetId>,
    }

    fn t(n: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(n)
    }

    fn fixture(n: usize) -> Fixture {
        let store = TmStore::open_memory().unwrap();
        let (variable_id, datasets) = store
            .transaction(|tx| -> Result<_, StoreError> {
                let test = tx.insert_test(&NewTest::default())?;
                let variable = tx.insert_variable(&NewVariable {
                    test_id: test.id,
                    name: "v".to_string(),
                    ..NewVariable::default()
                })?;
                let mut datasets = Vec::new();
                for i in 0..n {
                    let ds = tx.insert_dataset(&NewDataset {
                        test_id: test.id,
                        run_id: i as i64,
                        ordinal: 0,
                        start: t(i as i64),
                        description: None,
                    })?;
                    datasets.push(ds.id);
                }
                Ok((variable.id, datasets))
            })
            .unwrap();
        Fixture {
            store,
            variable_id,
            datasets,
        }
    }

    fn point(f: &Fixture, idx: usize, minute: i64, value: f64, fp: &Fingerprint) -> NewDataPoint {
        NewDataPoint {
            variable_id: f.variable_id,
            dataset_id: f.datasets[idx],
            timestamp: t(minute),
            value,
            fingerprint: fp.clone(),
        }
    }

    #[test]
    fn test_insert_datapoint_replaces_per_dataset() {
        let f = fixture(1);
        let fp = Fingerprint::none();
        let points = f
            .store
            .transaction(|tx| -> Result<_, StoreError> {
                tx.insert_datapoint(&point(&f, 0, 0, 1.0, &fp))?;
                tx.insert_datapoint(&point(&f, 0, 0, 2.0, &fp))?;
                tx.list_datapoints(f.variable_id, None)
            })
            .unwrap();
        assert_eq!(points.len(), 1);
        assert!((points[0].value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_next_timestamp_respects_cutoff_inclusivity() {
        let f = fixture(3);
        let fp = Fingerprint::none();
        f.store
            .transaction(|tx| -> Result<_, StoreError> {
                for i in 0..3 {
                    tx.insert_datapoint(&point(&f, i, i as i64, 1.0, &fp))?;
                }
                Ok(())
            })
            .unwrap();

        let (exclusive, inclusive, past_end) = f
            .store
            .transaction(|tx| -> Result<_, StoreError> {
                Ok((
                    tx.next_datapoint_timestamp(
                        f.variable_id,
                        &fp,
                        Cutoff {
                            at: t(1),
                            include_at: false,
                        },
                    )?,
                    tx.next_datapoint_timestamp(
                        f.variable_id,
                        &fp,
                        Cutoff {
                            at: t(1),
                            include_at: true,
                        },
                    )?,
                    tx.next_datapoint_timestamp(
                        f.variable_id,
                        &fp,
                        Cutoff {
                            at: t(2),
                            include_at: false,
                        },
                    )?,
                ))
            })
            .unwrap();
        assert_eq!(exclusive, Some(t(2)));
        assert_eq!(inclusive, Some(t(1)));
        assert_eq!(past_end, None);
    }

    #[test]
    fn test_partitions_are_isolated() {
        let f = fixture(2);
        let a = Fingerprint::new(json!({"arch": "arm"}));
        let b = Fingerprint::new(json!({"arch": "x86"}));
        let (in_a, in_b, all) = f
            .store
            .transaction(|tx| -> Result<_, StoreError> {
                tx.insert_datapoint(&point(&f, 0, 0, 1.0, &a))?;
                tx.insert_datapoint(&point(&f, 1, 1, 2.0, &b))?;
                Ok((
                    tx.datapoints_between(f.variable_id, &a, t(0), t(5))?,
                    tx.datapoints_between(f.variable_id, &b, t(0), t(5))?,
                    tx.list_datapoints(f.variable_id, None)?,
                ))
            })
            .unwrap();
        assert_eq!(in_a.len(), 1);
        assert_eq!(in_a[0].fingerprint, a);
        assert_eq!(in_b.len(), 1);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_datapoints_between_newest_first_with_tie_break() {
        let f = fixture(3);
        let fp = Fingerprint::none();
        let window = f
            .store
            .transaction(|tx| -> Result<_, StoreError> {
                tx.insert_datapoint(&point(&f, 0, 0, 1.0, &fp))?;
                tx.insert_datapoint(&point(&f, 1, 1, 2.0, &fp))?;
                tx.insert_datapoint(&point(&f, 2, 1, 3.0, &fp))?;
                tx.datapoints_between(f.variable_id, &fp, t(0), t(1))
            })
            .unwrap();
        let datasets: Vec<_> = window.iter().map(|p| p.dataset_id).collect();
        assert_eq!(datasets, vec![f.datasets[2], f.datasets[1], f.datasets[0]]);
    }

    #[test]
    fn test_change_queries() {
        let f = fixture(3);
        let fp = Fingerprint::none();
        let change = |idx: usize, minute: i64| NewChange {
            variable_id: f.variable_id,
            dataset_id: f.datasets[idx],
            timestamp: t(minute),
            description: format!("change at {minute}"),
            confirmed: false,
            fingerprint: Fingerprint::none(),
        };

        let (before, confirmed, remaining) = f
            .store
            .transaction(|tx| -> Result<_, StoreError> {
                let first = tx.insert_change(&change(0, 0))?;
                tx.insert_change(&change(1, 1))?;
                tx.insert_change(&change(2, 2))?;
                assert!(tx.set_change_confirmed(first.id, true)?);

                let before = tx.latest_change_before(f.variable_id, &fp, t(2))?;
                let confirmed = tx.latest_confirmed_change(f.variable_id, &fp)?;
                let deleted = tx.delete_unconfirmed_changes_from(
                    f.variable_id,
                    &fp,
                    Cutoff {
                        at: t(0),
                        include_at: true,
                    },
                )?;
                assert_eq!(deleted, 2);
                Ok((before, confirmed, tx.list_changes(f.variable_id, None)?))
            })
            .unwrap();

        assert_eq!(before.map(|c| c.timestamp), Some(t(1)));
        assert_eq!(confirmed.map(|c| c.timestamp), Some(t(0)));
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].confirmed);
    }

    #[test]
    fn test_dataset_scoped_queries() {
        let f = fixture(2);
        let fp = Fingerprint::new(json!("arm"));
        let (points, confirmed, other, unconfirmed) = f
            .store
            .transaction(|tx| -> Result<_, StoreError> {
                tx.insert_datapoint(&point(&f, 0, 0, 1.0, &fp))?;
                tx.insert_datapoint(&point(&f, 1, 1, 2.0, &fp))?;
                let change = tx.insert_change(&NewChange {
                    variable_id: f.variable_id,
                    dataset_id: f.datasets[1],
                    timestamp: t(1),
                    description: "step".to_string(),
                    confirmed: false,
                    fingerprint: fp.clone(),
                })?;
                let unconfirmed = tx.has_confirmed_change(f.variable_id, &fp, f.datasets[1])?;
                tx.set_change_confirmed(change.id, true)?;
                Ok((
                    tx.datapoints_for_dataset(f.datasets[1])?,
                    tx.has_confirmed_change(f.variable_id, &fp, f.datasets[1])?,
                    tx.has_confirmed_change(f.variable_id, &Fingerprint::none(), f.datasets[1])?,
                    unconfirmed,
                ))
            })
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, t(1));
        assert!(confirmed);
        assert!(!other);
        assert!(!unconfirmed);
    }

    #[test]
    fn test_last_datapoint_timestamps() {
        let f = fixture(2);
        let fp = Fingerprint::none();
        let last = f
            .store
            .transaction(|tx| -> Result<_, StoreError> {
                tx.insert_datapoint(&point(&f, 0, 3, 1.0, &fp))?;
                tx.insert_datapoint(&point(&f, 1, 7, 1.0, &fp))?;
                tx.last_datapoint_timestamps(Some(&fp), &[f.variable_id, 9999])
            })
            .unwrap();
        assert_eq!(last, vec![(f.variable_id, t(7))]);
    }
}
