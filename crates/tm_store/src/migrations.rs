//! Database migrations for tm_store

use crate::StoreError;
use duckdb::Connection;
use tracing::{debug, info};

/// Migration definition
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: include_str!("migrations/001_initial_schema.sql"),
    },
    Migration {
        version: 2,
        name: "missing_data",
        sql: include_str!("migrations/002_missing_data.sql"),
    },
];

/// Highest schema version known to this build
#[must_use]
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Run all pending migrations
///
/// # Errors
///
/// Returns [`StoreError::MigrationError`] naming the migration that failed, or a
/// database error if the bookkeeping table cannot be read or written.
pub fn run_all(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT current_timestamp
        );
    ",
    )?;

    let current_version = current_version(conn)?;

    info!(current_version, "Checking migrations");

    for migration in MIGRATIONS {
        if i64::from(migration.version) <= current_version {
            continue;
        }
        info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );

        conn.execute_batch(migration.sql).map_err(|e| {
            StoreError::MigrationError(format!(
                "Failed to apply migration {}: {}",
                migration.name, e
            ))
        })?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?, ?)",
            duckdb::params![i64::from(migration.version), migration.name],
        )?;

        debug!(version = migration.version, "Migration applied");
    }

    Ok(())
}

/// Version of the newest applied migration, 0 for a fresh database
///
/// # Errors
///
/// Returns a database error if `_migrations` cannot be queried.
pub fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
