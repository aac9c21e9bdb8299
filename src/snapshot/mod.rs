//! Snapshot Logger
//!
//! Per-branch append-only log of restore points grouped into snapshots.
//!
//! File layout: a 12-byte header (`LBRPLOG\0` + version u32 LE) followed by
//! 28-byte records `[snapshot_ts i64][timestamp i64][page_count i64][crc32 u32]`,
//! all little endian. The checksum covers the first 24 bytes of a record. A
//! torn or corrupt tail is cut off when the log is opened.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"LBRPLOG\0";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 12;
const RECORD_SIZE: usize = 28;

/// A point a branch can be restored to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePoint {
    /// Unix milliseconds
    pub timestamp: i64,
    /// Database size in pages at that instant
    pub page_count: u64,
}

/// A run of restore points starting at `timestamp`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: i64,
    pub restore_points: Vec<RestorePoint>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.restore_points.is_empty()
    }

    /// Most recent restore point in this snapshot
    pub fn latest(&self) -> Option<&RestorePoint> {
        self.restore_points.last()
    }
}

struct Record {
    snapshot_ts: i64,
    point: RestorePoint,
}

impl Record {
    fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..8].copy_from_slice(&self.snapshot_ts.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.point.timestamp.to_le_bytes());
        bytes[16..24].copy_from_slice(&(self.point.page_count as i64).to_le_bytes());
        let checksum = crc32fast::hash(&bytes[0..24]);
        bytes[24..28].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let field = |range: std::ops::Range<usize>| -> Option<[u8; 8]> { bytes.get(range)?.try_into().ok() };

        let checksum = u32::from_le_bytes(bytes.get(24..28)?.try_into().ok()?);
        if crc32fast::hash(bytes.get(0..24)?) != checksum {
            return None;
        }

        Some(Self {
            snapshot_ts: i64::from_le_bytes(field(0..8)?),
            point: RestorePoint {
                timestamp: i64::from_le_bytes(field(8..16)?),
                page_count: i64::from_le_bytes(field(16..24)?) as u64,
            },
        })
    }
}

struct LogState {
    file: File,
    /// End of the last valid record; appends start here
    len: u64,
    snapshots: Vec<Snapshot>,
}

impl LogState {
    fn last_timestamp(&self) -> Option<i64> {
        self.snapshots
            .last()
            .and_then(|s| s.latest())
            .map(|p| p.timestamp)
    }

    fn push(&mut self, record: Record) {
        match self.snapshots.last_mut() {
            Some(snapshot) if snapshot.timestamp == record.snapshot_ts => {
                snapshot.restore_points.push(record.point);
            }
            _ => self.snapshots.push(Snapshot {
                timestamp: record.snapshot_ts,
                restore_points: vec![record.point],
            }),
        }
    }
}

/// Restore point log for one branch
pub struct SnapshotLogger {
    path: PathBuf,
    /// Start a new snapshot after this many milliseconds
    compaction_interval_ms: i64,
    state: RwLock<LogState>,
}

impl SnapshotLogger {
    /// Create or open the log at `path`
    pub fn open(path: &Path, compaction_interval_ms: i64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut state = LogState {
            file,
            len: HEADER_SIZE as u64,
            snapshots: Vec::new(),
        };

        if contents.len() < HEADER_SIZE {
            let mut header = [0u8; HEADER_SIZE];
            header[0..8].copy_from_slice(MAGIC);
            header[8..12].copy_from_slice(&VERSION.to_le_bytes());
            state.file.set_len(0)?;
            state.file.rewind()?;
            state.file.write_all(&header)?;
            state.file.sync_data()?;
        } else {
            if &contents[0..8] != MAGIC {
                return Err(Error::Storage(format!("{:?} is not a restore point log", path)));
            }
            let version = u32::from_le_bytes([contents[8], contents[9], contents[10], contents[11]]);
            if version != VERSION {
                return Err(Error::Storage(format!(
                    "unsupported restore point log version {}",
                    version
                )));
            }

            let mut valid = HEADER_SIZE;
            for chunk in contents[HEADER_SIZE..].chunks(RECORD_SIZE) {
                let Some(record) = Record::from_bytes(chunk) else {
                    break;
                };
                if state.last_timestamp().map(|t| record.point.timestamp <= t).unwrap_or(false) {
                    break;
                }
                state.push(record);
                valid += RECORD_SIZE;
            }

            state.len = valid as u64;
            if valid < contents.len() {
                tracing::warn!(
                    "Ignoring {} trailing bytes in {:?}",
                    contents.len() - valid,
                    path
                );
                state.file.set_len(valid as u64)?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            compaction_interval_ms,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a restore point; `timestamp` must exceed every recorded one
    pub async fn record_restore_point(&self, timestamp: i64, page_count: u64) -> Result<RestorePoint> {
        let mut state = self.state.write().await;

        if let Some(last) = state.last_timestamp() {
            if timestamp <= last {
                return Err(Error::RestorePointOutOfOrder { timestamp, last });
            }
        }

        let snapshot_ts = match state.snapshots.last() {
            Some(current) if timestamp - current.timestamp < self.compaction_interval_ms => {
                current.timestamp
            }
            _ => timestamp,
        };

        let record = Record {
            snapshot_ts,
            point: RestorePoint {
                timestamp,
                page_count,
            },
        };

        let end = state.len;
        if let Err(e) = append_at(&mut state.file, end, &record.to_bytes()) {
            if let Err(truncate) = state.file.set_len(end) {
                tracing::warn!("Could not cut torn record from {:?}: {}", self.path, truncate);
            }
            return Err(e.into());
        }
        state.len = end + RECORD_SIZE as u64;

        let point = record.point;
        state.push(record);
        Ok(point)
    }

    /// All snapshots, oldest first
    pub async fn get_snapshots(&self) -> Vec<Snapshot> {
        self.state.read().await.snapshots.clone()
    }

    /// Snapshot starting at `timestamp`
    pub async fn get_snapshot(&self, timestamp: i64) -> Option<Snapshot> {
        let state = self.state.read().await;
        state
            .snapshots
            .iter()
            .find(|s| s.timestamp == timestamp)
            .cloned()
    }

    /// Restore point recorded exactly at `timestamp`
    pub async fn get_restore_point(&self, timestamp: i64) -> Option<RestorePoint> {
        let state = self.state.read().await;
        state
            .snapshots
            .iter()
            .flat_map(|s| s.restore_points.iter())
            .find(|p| p.timestamp == timestamp)
            .copied()
    }

    pub async fn latest_restore_point(&self) -> Option<RestorePoint> {
        let state = self.state.read().await;
        state.snapshots.last().and_then(|s| s.latest()).copied()
    }

    pub async fn last_timestamp(&self) -> Option<i64> {
        self.state.read().await.last_timestamp()
    }
}

fn append_at(file: &mut File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshots_roll_over() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SnapshotLogger::open(&dir.path().join("restore_points.log"), 1000).unwrap();

        logger.record_restore_point(1_000, 2).await.unwrap();
        logger.record_restore_point(1_500, 3).await.unwrap();
        logger.record_restore_point(2_000, 3).await.unwrap();
        logger.record_restore_point(2_100, 4).await.unwrap();

        let snapshots = logger.get_snapshots().await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].timestamp, 1_000);
        assert_eq!(snapshots[0].restore_points.len(), 2);
        assert_eq!(snapshots[1].timestamp, 2_000);

        assert!(logger.get_snapshot(2_000).await.is_some());
        assert!(logger.get_snapshot(1_500).await.is_none());
        assert_eq!(logger.get_restore_point(1_500).await.unwrap().page_count, 3);
        assert!(logger.get_restore_point(1_501).await.is_none());
        assert_eq!(logger.last_timestamp().await, Some(2_100));
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SnapshotLogger::open(&dir.path().join("restore_points.log"), 1000).unwrap();

        logger.record_restore_point(10, 1).await.unwrap();
        assert!(matches!(
            logger.record_restore_point(10, 1).await,
            Err(Error::RestorePointOutOfOrder { timestamp: 10, last: 10 })
        ));
        assert!(logger.record_restore_point(9, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_and_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_points.log");

        {
            let logger = SnapshotLogger::open(&path, 1000).unwrap();
            logger.record_restore_point(100, 1).await.unwrap();
            logger.record_restore_point(200, 2).await.unwrap();
        }

        // Simulate a crash halfway through a record
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB; 13]).unwrap();
        }

        let logger = SnapshotLogger::open(&path, 1000).unwrap();
        assert_eq!(logger.last_timestamp().await, Some(200));

        logger.record_restore_point(300, 3).await.unwrap();
        drop(logger);

        let logger = SnapshotLogger::open(&path, 1000).unwrap();
        let points: Vec<i64> = logger
            .get_snapshots()
            .await
            .iter()
            .flat_map(|s| s.restore_points.iter().map(|p| p.timestamp))
            .collect();
        assert_eq!(points, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_torn_header_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_points.log");
        std::fs::write(&path, &MAGIC[..5]).unwrap();

        {
            let logger = SnapshotLogger::open(&path, 1000).unwrap();
            logger.record_restore_point(100, 1).await.unwrap();
        }

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[0..8], MAGIC);
        assert_eq!(contents.len(), HEADER_SIZE + RECORD_SIZE);

        let logger = SnapshotLogger::open(&path, 1000).unwrap();
        assert_eq!(logger.last_timestamp().await, Some(100));
    }

    #[tokio::test]
    async fn test_append_overwrites_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_points.log");
        let logger = SnapshotLogger::open(&path, 1000).unwrap();
        logger.record_restore_point(100, 1).await.unwrap();

        // Half a record left behind by a failed append
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xCD; 13]).unwrap();
        }

        logger.record_restore_point(200, 2).await.unwrap();
        logger.record_restore_point(300, 3).await.unwrap();
        drop(logger);

        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            HEADER_SIZE + 3 * RECORD_SIZE
        );
        let logger = SnapshotLogger::open(&path, 1000).unwrap();
        let points: Vec<i64> = logger
            .get_snapshots()
            .await
            .iter()
            .flat_map(|s| s.restore_points.iter().map(|p| p.timestamp))
            .collect();
        assert_eq!(points, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_failed_append_keeps_log_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_points.log");
        let logger = SnapshotLogger::open(&path, 1000).unwrap();
        logger.record_restore_point(100, 1).await.unwrap();

        let writable = {
            let mut state = logger.state.write().await;
            let read_only = File::open(&path).unwrap();
            std::mem::replace(&mut state.file, read_only)
        };
        assert!(matches!(
            logger.record_restore_point(200, 2).await,
            Err(Error::Io(_))
        ));
        assert_eq!(logger.last_timestamp().await, Some(100));

        logger.state.write().await.file = writable;
        logger.record_restore_point(300, 3).await.unwrap();
        drop(logger);

        let logger = SnapshotLogger::open(&path, 1000).unwrap();
        let points: Vec<i64> = logger
            .get_snapshots()
            .await
            .iter()
            .flat_map(|s| s.restore_points.iter().map(|p| p.timestamp))
            .collect();
        assert_eq!(points, vec![100, 300]);
    }

    #[tokio::test]
    async fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_points.log");
        std::fs::write(&path, b"definitely not a log file").unwrap();
        assert!(SnapshotLogger::open(&path, 1000).is_err());
    }
}
