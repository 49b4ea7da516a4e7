//! Missing-data rules and their per-dataset results

use crate::schema::sequences;
use crate::{
    DatasetId, MissingDataRule, MissingDataRuleResult, NewMissingDataRule, RuleId, RuleStaleness,
    StoreError, TestId, Tx, from_millis, json_column, optional, to_millis,
};
use chrono::{DateTime, Utc};

const RULE_COLUMNS: &str = "r.id, r.test_id, r.name, r.labels_json, r.condition_script, \
     r.max_staleness_ms, r.last_notification_ms";

fn map_rule(row: &duckdb::Row<'_>) -> duckdb::Result<MissingDataRule> {
    Ok(MissingDataRule {
        id: row.get(0)?,
        test_id: row.get(1)?,
        name: row.get(2)?,
        labels: json_column(row, 3)?,
        condition: row.get(4)?,
        max_staleness_ms: row.get(5)?,
        last_notification: row.get::<_, Option<i64>>(6)?.map(from_millis),
    })
}

impl Tx<'_> {
    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization, id allocation or the insert fails.
    pub fn insert_missing_data_rule(
        &self,
        new: &NewMissingDataRule,
    ) -> Result<MissingDataRule, StoreError> {
        let id = self.next_id(sequences::MISSING_DATA_RULES)?;
        let labels_json = serde_json::to_string(&new.labels)?;
        self.conn.execute(
            "INSERT INTO missing_data_rules \
             (id, test_id, name, labels_json, condition_script, max_staleness_ms) \
             VALUES (?, ?, ?, ?, ?, ?)",
            duckdb::params![
                id,
                new.test_id,
                new.name,
                labels_json,
                new.condition,
                new.max_staleness_ms
            ],
        )?;
        Ok(MissingDataRule {
            id,
            test_id: new.test_id,
            name: new.name.clone(),
            labels: new.labels.clone(),
            condition: new.condition.clone(),
            max_staleness_ms: new.max_staleness_ms,
            last_notification: None,
        })
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn get_missing_data_rule(&self, id: RuleId) -> Result<Option<MissingDataRule>, StoreError> {
        optional(self.conn.query_row(
            &format!("SELECT {RULE_COLUMNS} FROM missing_data_rules r WHERE r.id = ?"),
            [id],
            map_rule,
        ))
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn list_missing_data_rules(
        &self,
        test_id: TestId,
    ) -> Result<Vec<MissingDataRule>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM missing_data_rules r WHERE r.test_id = ? ORDER BY r.id"
        ))?;
        let rows = stmt.query_map([test_id], map_rule)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Record that `dataset_id` satisfied `rule_id`, replacing an earlier result
    /// for the same pair
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a write fails.
    pub fn record_rule_result(
        &self,
        rule_id: RuleId,
        dataset_id: DatasetId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM missing_data_rule_results WHERE rule_id = ? AND dataset_id = ?",
            duckdb::params![rule_id, dataset_id],
        )?;
        self.conn.execute(
            "INSERT INTO missing_data_rule_results (rule_id, dataset_id, ts_ms) VALUES (?, ?, ?)",
            duckdb::params![rule_id, dataset_id, to_millis(timestamp)],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    pub fn delete_rule_results_for_dataset(&self, dataset_id: DatasetId) -> Result<usize, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM missing_data_rule_results WHERE dataset_id = ?",
            [dataset_id],
        )?;
        Ok(deleted)
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn list_rule_results(
        &self,
        rule_id: RuleId,
    ) -> Result<Vec<MissingDataRuleResult>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, dataset_id, ts_ms FROM missing_data_rule_results \
             WHERE rule_id = ? ORDER BY ts_ms, dataset_id",
        )?;
        let rows = stmt.query_map([rule_id], |row| {
            Ok(MissingDataRuleResult {
                rule_id: row.get(0)?,
                dataset_id: row.get(1)?,
                timestamp: from_millis(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every rule with the timestamp of its most recent result
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn rule_staleness(&self) -> Result<Vec<RuleStaleness>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS}, MAX(res.ts_ms) FROM missing_data_rules r \
             LEFT JOIN missing_data_rule_results res ON res.rule_id = r.id \
             GROUP BY r.id, r.test_id, r.name, r.labels_json, r.condition_script, \
             r.max_staleness_ms, r.last_notification_ms \
             ORDER BY r.id"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(RuleStaleness {
                rule: map_rule(row)?,
                last_result: row.get::<_, Option<i64>>(7)?.map(from_millis),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Stamp a rule as notified at `now`, but only if its last notification is
    /// still `expected`. Returns whether this caller won the update.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub fn mark_rule_notified(
        &self,
        rule_id: RuleId,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let expected_ms = expected.map_or(-1, to_millis);
        let updated = self.conn.execute(
            "UPDATE missing_data_rules SET last_notification_ms = ? \
             WHERE id = ? AND COALESCE(last_notification_ms, -1) = ?",
            duckdb::params![to_millis(now), rule_id, expected_ms],
        )?;
        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t(n: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(n)
    }

    fn setup(store: &TmStore) -> (MissingDataRule, Vec<DatasetId>) {
        store
            .transaction(|tx| -> Result<_, StoreError> {
                let test = tx.insert_test(&NewTest::default())?;
                let rule = tx.insert_missing_data_rule(&NewMissingDataRule {
                    test_id: test.id,
                    name: "nightly".to_string(),
                    max_staleness_ms: 60_000,
                    ..NewMissingDataRule::default()
                })?;
                let mut datasets = Vec::new();
                for i in 0..2 {
                    datasets.push(
                        tx.insert_dataset(&NewDataset {
                            test_id: test.id,
                            run_id: i,
                            ordinal: 0,
                            start: t(i),
                            description: None,
                        })?
                        .id,
                    );
                }
                Ok((rule, datasets))
            })
            .unwrap()
    }

    #[test]
    fn test_staleness_reports_latest_result() {
        let store = TmStore::open_memory().unwrap();
        let (rule, datasets) = setup(&store);

        let before = store.transaction(|tx| tx.rule_staleness()).unwrap();
        assert_eq!(before.len(), 1);
        assert!(before[0].last_result.is_none());

        store
            .transaction(|tx| -> Result<_, StoreError> {
                tx.record_rule_result(rule.id, datasets[0], t(0))?;
                tx.record_rule_result(rule.id, datasets[1], t(5))?;
                tx.record_rule_result(rule.id, datasets[1], t(5))
            })
            .unwrap();

        let after = store.transaction(|tx| tx.rule_staleness()).unwrap();
        assert_eq!(after[0].last_result, Some(t(5)));
        assert_eq!(after[0].rule, rule);
        let results = store.transaction(|tx| tx.list_rule_results(rule.id)).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_mark_rule_notified_is_compare_and_set() {
        let store = TmStore::open_memory().unwrap();
        let (rule, _) = setup(&store);

        let first = store
            .transaction(|tx| tx.mark_rule_notified(rule.id, None, t(10)))
            .unwrap();
        let stale_retry = store
            .transaction(|tx| tx.mark_rule_notified(rule.id, None, t(11)))
            .unwrap();
        let chained = store
            .transaction(|tx| tx.mark_rule_notified(rule.id, Some(t(10)), t(12)))
            .unwrap();

        assert!(first);
        assert!(!stale_retry);
        assert!(chained);
        let loaded = store
            .transaction(|tx| tx.get_missing_data_rule(rule.id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_notification, Some(t(12)));
    }

    #[test]
    fn test_delete_rule_results_for_dataset() {
        let store = TmStore::open_memory().unwrap();
        let (rule, datasets) = setup(&store);
        let deleted = store
            .transaction(|tx| -> Result<_, StoreError> {
                tx.record_rule_result(rule.id, datasets[0], t(0))?;
                tx.delete_rule_results_for_dataset(datasets[0])
            })
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
