use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("refusing to use table name {0:?}")]
    InvalidTable(String),
}

/// A table-per-counter measurement store with explicit commits.
pub trait MeasurementStore {
    fn ensure_table(&mut self, table: &str) -> Result<(), StoreError>;

    fn insert(
        &mut self,
        table: &str,
        timestamp: i64,
        value: f64,
        unit: &str,
    ) -> Result<(), StoreError>;

    /// Makes pending inserts durable. A commit with nothing pending is a no-op.
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// SQLite backed store. Inserts open a transaction lazily so that a batch of
/// inserts costs one commit.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE <table> (
///     timestamp INTEGER NOT NULL,
///     value REAL NOT NULL,
///     unit TEXT NOT NULL
/// );
/// ```
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn checked_table(table: &str) -> Result<&str, StoreError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(table)
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

impl MeasurementStore for SqliteStore {
    fn ensure_table(&mut self, table: &str) -> Result<(), StoreError> {
        let table = checked_table(table)?;
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    timestamp INTEGER NOT NULL,
                    value REAL NOT NULL,
                    unit TEXT NOT NULL
                )"
            ),
            [],
        )?;
        Ok(())
    }

    fn insert(
        &mut self,
        table: &str,
        timestamp: i64,
        value: f64,
        unit: &str,
    ) -> Result<(), StoreError> {
        let table = checked_table(table)?;
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        let mut stmt = self.conn.prepare_cached(&format!(
            "INSERT INTO {table} (timestamp, value, unit) VALUES (?1, ?2, ?3)"
        ))?;
        stmt.execute(params![timestamp, value, unit])?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}
