use crate::retry::with_retries;
use crate::{ControlError, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Attempts made for a write transaction that hits `SQLITE_BUSY`.
pub const WRITE_ATTEMPTS: u32 = 5;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the control-plane state database.
#[derive(Clone)]
pub struct StateDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl StateDatabase {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ControlError::Internal("state database lock poisoned".to_string()))
    }

    /// Run read-only queries against the connection.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction. The write lock is taken up front, so every
    /// row read inside `f` is protected from concurrent writers until commit. Busy and locked
    /// errors are retried with backoff; the closure may therefore run more than once.
    pub fn write<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        with_retries(WRITE_ATTEMPTS, ControlError::is_retryable, || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

pub(crate) fn not_found<T>(
    res: rusqlite::Result<T>,
    missing: impl FnOnce() -> ControlError,
) -> Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(missing()),
        Err(e) => Err(ControlError::Database(e)),
    }
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod db_tests;
