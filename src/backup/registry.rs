//! Backup registry
//!
//! Rows in the node's system database describing every backup taken.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;

use super::Backup;
use crate::error::Result;
use crate::snapshot::RestorePoint;
use crate::storage::BranchKey;

/// Backup rows backed by SQLite
pub struct BackupRegistry {
    conn: Mutex<Connection>,
}

impl BackupRegistry {
    /// Create or open the registry in the system database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS backups (
                database_id TEXT NOT NULL,
                branch_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                page_count INTEGER NOT NULL,
                page_size INTEGER NOT NULL,
                size INTEGER NOT NULL,
                object_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (database_id, branch_id, timestamp)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn insert(&self, backup: &Backup) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO backups
                (database_id, branch_id, timestamp, page_count, page_size, size, object_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                backup.database_id,
                backup.branch_id,
                backup.restore_point.timestamp,
                backup.restore_point.page_count as i64,
                backup.page_size as i64,
                backup.size as i64,
                backup.key,
                backup.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, key: &BranchKey, timestamp: i64) -> Result<Option<Backup>> {
        let conn = self.conn.lock().await;
        let backup = conn
            .query_row(
                r#"
                SELECT database_id, branch_id, timestamp, page_count, page_size, size, object_key, created_at
                FROM backups WHERE database_id = ?1 AND branch_id = ?2 AND timestamp = ?3
                "#,
                params![key.database_id, key.branch_id, timestamp],
                backup_from_row,
            )
            .optional()?;
        Ok(backup)
    }

    /// Backups of one branch, oldest first
    pub async fn list(&self, key: &BranchKey) -> Result<Vec<Backup>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT database_id, branch_id, timestamp, page_count, page_size, size, object_key, created_at
            FROM backups WHERE database_id = ?1 AND branch_id = ?2
            ORDER BY timestamp
            "#,
        )?;
        let rows = stmt.query_map(params![key.database_id, key.branch_id], backup_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Returns false when no row matched
    pub async fn delete(&self, key: &BranchKey, timestamp: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM backups WHERE database_id = ?1 AND branch_id = ?2 AND timestamp = ?3",
            params![key.database_id, key.branch_id, timestamp],
        )?;
        Ok(removed > 0)
    }
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<Backup> {
    let created_at: String = row.get(7)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Backup {
        database_id: row.get(0)?,
        branch_id: row.get(1)?,
        restore_point: RestorePoint {
            timestamp: row.get(2)?,
            page_count: row.get::<_, i64>(3)? as u64,
        },
        page_size: row.get::<_, i64>(4)? as u32,
        size: row.get::<_, i64>(5)? as u64,
        key: row.get(6)?,
        created_at,
    })
}
