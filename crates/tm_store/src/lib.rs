//! `tm_store` - `DuckDB` storage layer for Tidemark
//!
//! This crate provides:
//! - `DuckDB` connection management
//! - Schema migrations
//! - A unit-of-work [`Tx`] with after-commit hooks
//! - Typed queries for tests, datasets, series, changes, rules and diagnostics

use duckdb::Connection;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

mod catalog;
mod diagnostics;
pub mod migrations;
pub mod model;
mod rules;
pub mod schema;
mod series;

pub use model::*;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] duckdb::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Unit of work panicked: {0}")]
    Panicked(String),
}

type AfterCommit = Box<dyn FnOnce() + Send>;

/// Main storage handle
#[derive(Clone)]
pub struct TmStore {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl TmStore {
    /// Open or create database at path
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if directory creation, database opening, pragma setup, or
    /// migration execution fails.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!(path = %path.display(), "Opening DuckDB database");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            r"
            PRAGMA threads=4;
            PRAGMA memory_limit='512MB';
        ",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_string_lossy().to_string(),
        };

        store.run_migrations()?;

        Ok(store)
    }

    /// Open in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if in-memory database setup or migrations fail.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        };

        store.run_migrations()?;

        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        migrations::run_all(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    #[must_use]
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Run `f` as one unit of work.
    ///
    /// The closure's writes commit together when it returns `Ok` and roll back
    /// when it returns `Err`. Hooks registered with [`Tx::after_commit`] run
    /// only after a successful commit, once the connection lock is released, in
    /// registration order. A rolled-back unit of work drops its hooks unrun.
    ///
    /// A panic inside `f` rolls back like an error and surfaces as
    /// [`StoreError::Panicked`]; the connection stays usable.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a [`StoreError`] if the transaction
    /// cannot be opened or committed, or if `f` panicked.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let (value, hooks) = {
            let conn = self.lock()?;
            conn.execute_batch("BEGIN TRANSACTION")
                .map_err(StoreError::from)?;

            let mut tx = Tx {
                conn: &conn,
                after_commit: Vec::new(),
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut tx)));
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(payload) => {
                    rollback(&conn);
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "Unit of work panicked, rolled back");
                    return Err(StoreError::Panicked(message).into());
                }
            };

            match outcome {
                Ok(value) => {
                    let hooks = std::mem::take(&mut tx.after_commit);
                    if let Err(e) = conn.execute_batch("COMMIT") {
                        rollback(&conn);
                        return Err(StoreError::from(e).into());
                    }
                    (value, hooks)
                }
                Err(e) => {
                    rollback(&conn);
                    return Err(e);
                }
            }
        };

        for hook in hooks {
            hook();
        }
        Ok(value)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(error = %e, "Rollback failed");
    }
}

/// An open unit of work. Every query method lives on this type.
pub struct Tx<'c> {
    conn: &'c Connection,
    after_commit: Vec<AfterCommit>,
}

impl Tx<'_> {
    /// Defer `f` until this unit of work has committed
    pub fn after_commit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.after_commit.push(Box::new(f));
    }

    fn next_id(&self, sequence: &str) -> Result<i64, StoreError> {
        let id = self
            .conn
            .query_row(&format!("SELECT nextval('{sequence}')"), [], |row| {
                row.get(0)
            })?;
        Ok(id)
    }
}

/// Map "no rows" to `None`
fn optional<T>(result: Result<T, duckdb::Error>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Decode a JSON text column inside a row mapper
fn json_column<T: DeserializeOwned>(row: &duckdb::Row<'_>, idx: usize) -> duckdb::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, Box::new(e))
    })
}

fn fingerprint_column(row: &duckdb::Row<'_>, idx: usize) -> duckdb::Result<Fingerprint> {
    let text: String = row.get(idx)?;
    Fingerprint::from_key(&text).map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, Box::new(e))
    })
}

/// Render ids for an `IN (...)` list. Ids are integers, so no escaping applies.
fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
