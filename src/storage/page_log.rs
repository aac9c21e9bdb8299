//! Page version index
//!
//! Per-branch SQLite index mapping `(page_number, timestamp)` to the hash of
//! the page image captured at that checkpoint. Only pages that changed since
//! their previous version get a new row.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use super::page_store::PageStore;
use crate::error::{Error, Result};

/// Page size used when the database header is unavailable
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// One page as of some timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageVersion {
    /// 1-based page number
    pub page_number: u64,
    pub timestamp: i64,
    pub hash: String,
}

/// Outcome of capturing a database file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub page_count: u64,
    pub page_size: u32,
    /// Pages that differed from their previous version
    pub changed: u64,
}

/// Page size stored in a SQLite header (bytes 16..18, big endian, 1 = 65536)
pub fn header_page_size(header: &[u8]) -> Option<u32> {
    if header.len() < 100 || !header.starts_with(b"SQLite format 3\0") {
        return None;
    }
    match u16::from_be_bytes([header[16], header[17]]) {
        1 => Some(65536),
        n if n >= 512 && n.is_power_of_two() => Some(n as u32),
        _ => None,
    }
}

/// Page version index for one branch
pub struct PageLog {
    conn: Connection,
    /// Latest hash per page, mirrors the table
    latest: HashMap<u64, String>,
}

impl PageLog {
    /// Create or open the index
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS page_versions (
                page_number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY (page_number, timestamp)
            );

            CREATE TABLE IF NOT EXISTS page_log_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;

        let latest = {
            let mut stmt = conn.prepare(
                r#"
                SELECT page_number, hash FROM page_versions p
                WHERE timestamp = (
                    SELECT MAX(timestamp) FROM page_versions WHERE page_number = p.page_number
                )
                "#,
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)))?;
            rows.collect::<std::result::Result<HashMap<u64, String>, _>>()?
        };

        Ok(Self { conn, latest })
    }

    /// Page size recorded by the last capture
    pub fn page_size(&self) -> Result<u32> {
        let size: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM page_log_meta WHERE key = 'page_size'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(size.map(|s| s as u32).unwrap_or(DEFAULT_PAGE_SIZE))
    }

    /// Record every page of `database` that changed, stamped with `timestamp`
    pub fn capture(&mut self, store: &PageStore, database: &Path, timestamp: i64) -> Result<Capture> {
        let data = match std::fs::read(database) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let page_size = header_page_size(&data).unwrap_or(self.page_size()?);
        let page_count = (data.len() / page_size as usize) as u64;

        let tx = self.conn.transaction()?;
        let mut changed = Vec::new();
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO page_versions (page_number, timestamp, hash) VALUES (?1, ?2, ?3)",
            )?;
            for (index, page) in data.chunks_exact(page_size as usize).enumerate() {
                let page_number = index as u64 + 1;
                let hash = PageStore::hash(page);
                if self.latest.get(&page_number) == Some(&hash) {
                    continue;
                }
                store.put(page)?;
                insert.execute(params![page_number as i64, timestamp, hash])?;
                changed.push((page_number, hash));
            }
            tx.execute(
                r#"
                INSERT INTO page_log_meta (key, value) VALUES ('page_size', ?1)
                ON CONFLICT(key) DO UPDATE SET value = ?1
                "#,
                params![page_size as i64],
            )?;
        }
        tx.commit()?;

        let changed_count = changed.len() as u64;
        self.latest.extend(changed);

        tracing::debug!(
            "Captured {} pages ({} changed) at {}",
            page_count,
            changed_count,
            timestamp
        );

        Ok(Capture {
            page_count,
            page_size,
            changed: changed_count,
        })
    }

    /// Resolve pages `1..=page_count` as of `timestamp`
    pub fn versions_at(&self, timestamp: i64, page_count: u64) -> Result<Vec<PageVersion>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, hash FROM page_versions
            WHERE page_number = ?1 AND timestamp <= ?2
            ORDER BY timestamp DESC LIMIT 1
            "#,
        )?;

        let mut versions = Vec::with_capacity(page_count as usize);
        for page_number in 1..=page_count {
            let found: Option<(i64, String)> = stmt
                .query_row(params![page_number as i64, timestamp], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;
            let (version_ts, hash) = found.ok_or(Error::PageMissing {
                page: page_number,
                timestamp,
            })?;
            versions.push(PageVersion {
                page_number,
                timestamp: version_ts,
                hash,
            });
        }
        Ok(versions)
    }
}

/// Write the resolved pages into `out` in order
pub fn write_pages<W: std::io::Write>(
    store: &PageStore,
    versions: &[PageVersion],
    out: &mut W,
) -> Result<u64> {
    let mut written = 0u64;
    for version in versions {
        let page = store.get(&version.hash)?;
        out.write_all(&page)?;
        written += page.len() as u64;
    }
    Ok(written)
}
