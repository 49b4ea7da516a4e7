//! Persisted diagnostics scoped to a test and dataset

use crate::schema::sequences;
use crate::{DiagnosticLog, LogCategory, NewDiagnostic, StoreError, TestId, Tx, from_millis, to_millis};
use chrono::Utc;

impl Tx<'_> {
    /// # Errors
    ///
    /// Returns [`StoreError`] if id allocation or the insert fails.
    pub fn log_diagnostic(&self, entry: &NewDiagnostic) -> Result<(), StoreError> {
        let id = self.next_id(sequences::DIAGNOSTIC_LOGS)?;
        self.conn.execute(
            "INSERT INTO diagnostic_logs (id, test_id, dataset_id, level, category, message, ts_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                id,
                entry.test_id,
                entry.dataset_id,
                entry.level.as_str(),
                entry.category.as_str(),
                entry.message,
                to_millis(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Diagnostics of a test, newest first
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a stored level/category is unknown.
    pub fn list_diagnostics(
        &self,
        test_id: TestId,
        category: Option<LogCategory>,
        limit: usize,
    ) -> Result<Vec<DiagnosticLog>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, test_id, dataset_id, level, category, message, ts_ms FROM diagnostic_logs \
             WHERE test_id = ? AND category = COALESCE(?, category) \
             ORDER BY ts_ms DESC, id DESC LIMIT {}",
            limit.clamp(1, 10_000)
        ))?;
        let rows = stmt.query_map(
            duckdb::params![test_id, category.map(|c| c.as_str())],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

        let mut logs = Vec::new();
        for row in rows {
            let (id, test_id, dataset_id, level, category, message, ts_ms) = row?;
            logs.push(DiagnosticLog {
                id,
                test_id,
                dataset_id,
                level: level.parse().map_err(StoreError::QueryError)?,
                category: category.parse().map_err(StoreError::QueryError)?,
                message,
                timestamp: from_millis(ts_ms),
            });
        }
        Ok(logs)
    }
}
