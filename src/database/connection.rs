//! SQLite connections

use rusqlite::params_from_iter;
use std::path::Path;
use std::time::Duration;

use super::value::{QueryResult, SqlValue};
use crate::error::{Error, Result};

/// What the service needs from a SQL engine
pub trait Connection: Send {
    /// Run any statement. `readonly` reports whether it could have written.
    fn query(&mut self, statement: &str, parameters: &[SqlValue]) -> Result<(QueryResult, bool)>;

    /// Fold the write-ahead log into the database file
    fn checkpoint(&mut self) -> Result<()>;
}

/// rusqlite-backed connection in WAL mode with automatic checkpoints off
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA wal_autocheckpoint = 0;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(Self { conn })
    }
}

impl Connection for SqliteConnection {
    fn query(&mut self, statement: &str, parameters: &[SqlValue]) -> Result<(QueryResult, bool)> {
        let mut stmt = self.conn.prepare(statement)?;
        let readonly = stmt.readonly();
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = Vec::new();
        if columns.is_empty() {
            stmt.execute(params_from_iter(parameters.iter()))?;
        } else {
            let mut result = stmt.query(params_from_iter(parameters.iter()))?;
            while let Some(row) = result.next()? {
                let mut values = Vec::with_capacity(columns.len());
                for index in 0..columns.len() {
                    values.push(SqlValue::from(row.get_ref(index)?));
                }
                rows.push(values);
            }
        }
        drop(stmt);

        let result = QueryResult {
            columns,
            rows,
            changes: if readonly { 0 } else { self.conn.changes() as u64 },
            last_insert_rowid: self.conn.last_insert_rowid(),
        };
        Ok((result, readonly))
    }

    fn checkpoint(&mut self) -> Result<()> {
        let (busy, _log, _checkpointed): (i64, i64, i64) = self.conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if busy != 0 {
            return Err(Error::Checkpoint("database busy".into()));
        }
        Ok(())
    }
}
