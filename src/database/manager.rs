//! Database Manager
//!
//! Owns every branch on this node: its files, its connection, its page
//! version index and its restore point log. Writes are checkpointed as soon
//! as they commit, and each checkpoint becomes a restore point.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::connection::{Connection, SqliteConnection};
use super::value::QueryResult;
use super::{Checkpointer, QueryExecutor};
use crate::config::LitebaseConfig;
use crate::error::{Error, Result};
use crate::messenger::QueryRequest;
use crate::snapshot::{RestorePoint, SnapshotLogger};
use crate::storage::{BranchFileSystem, BranchKey, PageLog, PageStore};

/// Mutable per-branch state, guarded by the branch lock
pub struct BranchState {
    connection: Option<Box<dyn Connection>>,
    page_log: PageLog,
}

/// Everything belonging to one branch
pub struct BranchResources {
    files: BranchFileSystem,
    snapshot_logger: Arc<SnapshotLogger>,
    state: Arc<Mutex<BranchState>>,
}

impl BranchResources {
    pub fn files(&self) -> &BranchFileSystem {
        &self.files
    }

    pub fn snapshot_logger(&self) -> &Arc<SnapshotLogger> {
        &self.snapshot_logger
    }
}

/// Holds a branch offline; the connection reopens on next use after drop
pub struct OfflineGuard {
    key: BranchKey,
    _state: OwnedMutexGuard<BranchState>,
}

impl Drop for OfflineGuard {
    fn drop(&mut self) {
        tracing::debug!("Branch {} back online", self.key);
    }
}

/// Manager of every branch on this node
pub struct DatabaseManager {
    databases_dir: PathBuf,
    compaction_interval_ms: i64,
    page_store: Arc<PageStore>,
    branches: RwLock<HashMap<BranchKey, Arc<BranchResources>>>,
}

impl DatabaseManager {
    pub fn new(config: &LitebaseConfig, page_store: Arc<PageStore>) -> Result<Self> {
        let databases_dir = config.databases_dir();
        std::fs::create_dir_all(&databases_dir)?;

        Ok(Self {
            databases_dir,
            compaction_interval_ms: config.compaction_interval_ms(),
            page_store,
            branches: RwLock::new(HashMap::new()),
        })
    }

    pub fn page_store(&self) -> &Arc<PageStore> {
        &self.page_store
    }

    /// File layout of a branch, whether or not it exists
    pub fn files(&self, key: &BranchKey) -> BranchFileSystem {
        BranchFileSystem::new(&self.databases_dir, key.clone())
    }

    fn load(&self, files: BranchFileSystem) -> Result<Arc<BranchResources>> {
        let page_log = PageLog::open(&files.page_log_path())?;
        let snapshot_logger = Arc::new(SnapshotLogger::open(
            &files.restore_log_path(),
            self.compaction_interval_ms,
        )?);

        Ok(Arc::new(BranchResources {
            files,
            snapshot_logger,
            state: Arc::new(Mutex::new(BranchState {
                connection: None,
                page_log,
            })),
        }))
    }

    /// Create a branch and record its first restore point
    pub async fn create_branch(&self, key: &BranchKey) -> Result<Arc<BranchResources>> {
        let files = self.files(key);
        if files.exists() {
            return self.branch(key).await;
        }

        files.create()?;
        let resources = {
            let mut branches = self.branches.write().await;
            let resources = self.load(files)?;
            branches.insert(key.clone(), resources.clone());
            resources
        };

        tracing::info!("Created branch {}", key);
        self.checkpoint_branch(&resources).await?;
        Ok(resources)
    }

    /// Resources of an existing branch
    pub async fn branch(&self, key: &BranchKey) -> Result<Arc<BranchResources>> {
        if let Some(resources) = self.branches.read().await.get(key) {
            return Ok(resources.clone());
        }

        let mut branches = self.branches.write().await;
        if let Some(resources) = branches.get(key) {
            return Ok(resources.clone());
        }

        let files = self.files(key);
        if !files.exists() {
            return Err(Error::BranchNotFound(key.to_string()));
        }

        let resources = self.load(files)?;
        branches.insert(key.clone(), resources.clone());
        Ok(resources)
    }

    /// Restore point log of an existing branch
    pub async fn snapshot_logger(&self, key: &BranchKey) -> Result<Arc<SnapshotLogger>> {
        Ok(self.branch(key).await?.snapshot_logger.clone())
    }

    /// Run one statement; writes are checkpointed before returning
    pub async fn execute(
        &self,
        key: &BranchKey,
        statement: &str,
        parameters: &[super::SqlValue],
    ) -> Result<QueryResult> {
        let resources = self.branch(key).await?;
        let mut state = resources.state.clone().lock_owned().await;

        let connection = open_connection(&mut state, &resources.files)?;
        let (result, readonly) = connection.query(statement, parameters)?;

        if !readonly {
            self.checkpoint_locked(&resources, &mut state).await?;
        }
        Ok(result)
    }

    async fn checkpoint_branch(&self, resources: &BranchResources) -> Result<RestorePoint> {
        let mut state = resources.state.clone().lock_owned().await;
        self.checkpoint_locked(resources, &mut state).await
    }

    async fn checkpoint_locked(
        &self,
        resources: &BranchResources,
        state: &mut BranchState,
    ) -> Result<RestorePoint> {
        let connection = open_connection(state, &resources.files)?;
        connection.checkpoint()?;

        let now = chrono::Utc::now().timestamp_millis();
        let timestamp = match resources.snapshot_logger.last_timestamp().await {
            Some(last) if now <= last => last + 1,
            _ => now,
        };

        let capture = state
            .page_log
            .capture(&self.page_store, &resources.files.database_path(), timestamp)?;

        let point = resources
            .snapshot_logger
            .record_restore_point(timestamp, capture.page_count)
            .await?;

        tracing::debug!(
            "Checkpointed {} at {} ({} pages, {} changed)",
            resources.files.key(),
            timestamp,
            capture.page_count,
            capture.changed
        );
        Ok(point)
    }

    /// Close the branch connection and hold the branch lock until the guard
    /// is dropped
    pub async fn take_offline(&self, key: &BranchKey) -> Result<OfflineGuard> {
        let resources = self.branch(key).await?;
        let mut state = resources.state.clone().lock_owned().await;
        state.connection = None;
        tracing::debug!("Branch {} offline", key);
        Ok(OfflineGuard {
            key: key.clone(),
            _state: state,
        })
    }
}

fn open_connection<'a>(
    state: &'a mut BranchState,
    files: &BranchFileSystem,
) -> Result<&'a mut Box<dyn Connection>> {
    if state.connection.is_none() {
        state.connection = Some(Box::new(SqliteConnection::open(&files.database_path())?));
    }
    state
        .connection
        .as_mut()
        .ok_or_else(|| Error::Internal("connection unavailable".into()))
}

#[async_trait]
impl Checkpointer for DatabaseManager {
    async fn checkpoint(&self, key: &BranchKey) -> Result<RestorePoint> {
        let resources = self.branch(key).await?;
        self.checkpoint_branch(&resources).await
    }
}

#[async_trait]
impl QueryExecutor for DatabaseManager {
    async fn execute_query(&self, request: &QueryRequest) -> Result<QueryResult> {
        let key = BranchKey::new(&request.database_id, &request.branch_id)?;
        self.execute(&key, &request.statement, &request.parameters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqlValue;

    async fn manager(dir: &std::path::Path) -> DatabaseManager {
        let config = LitebaseConfig::standalone("127.0.0.1:0", dir.to_path_buf());
        let store = Arc::new(PageStore::new(config.pages_dir(), true).unwrap());
        DatabaseManager::new(&config, store).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_branch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let key = BranchKey::new("app", "main").unwrap();
        assert!(matches!(
            manager.execute(&key, "SELECT 1", &[]).await,
            Err(Error::BranchNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_record_restore_points() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let key = BranchKey::new("app", "main").unwrap();
        let branch = manager.create_branch(&key).await.unwrap();
        assert!(branch.snapshot_logger().latest_restore_point().await.is_some());

        manager
            .execute(&key, "CREATE TABLE t (x INTEGER)", &[])
            .await
            .unwrap();
        manager
            .execute(&key, "INSERT INTO t VALUES (?1)", &[SqlValue::Integer(1)])
            .await
            .unwrap();
        let before = branch.snapshot_logger().last_timestamp().await;

        let select = manager.execute(&key, "SELECT x FROM t", &[]).await.unwrap();
        assert_eq!(select.rows, vec![vec![SqlValue::Integer(1)]]);
        assert_eq!(branch.snapshot_logger().last_timestamp().await, before);

        let points: usize = branch
            .snapshot_logger()
            .get_snapshots()
            .await
            .iter()
            .map(|s| s.restore_points.len())
            .sum();
        assert_eq!(points, 3);

        let latest = branch.snapshot_logger().latest_restore_point().await.unwrap();
        assert_eq!(latest.page_count, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_timestamps_increase() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let key = BranchKey::new("app", "main").unwrap();
        manager.create_branch(&key).await.unwrap();

        let a = manager.checkpoint(&key).await.unwrap();
        let b = manager.checkpoint(&key).await.unwrap();
        let c = manager.checkpoint(&key).await.unwrap();
        assert!(a.timestamp < b.timestamp && b.timestamp < c.timestamp);
    }

    #[tokio::test]
    async fn test_offline_guard_blocks_branch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path()).await);
        let key = BranchKey::new("app", "main").unwrap();
        manager.create_branch(&key).await.unwrap();

        let guard = manager.take_offline(&key).await.unwrap();
        let pending = {
            let manager = manager.clone();
            let key = key.clone();
            tokio::spawn(async move { manager.execute(&key, "SELECT 1", &[]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        drop(guard);
        assert!(pending.await.unwrap().is_ok());
    }
}
