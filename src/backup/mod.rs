//! Backup Engine
//!
//! A backup is a page-consistent copy of a branch at one restore point. The
//! pages come from the page log rather than the live database file, so a
//! write racing the backup can never tear it.

mod artifact;
mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use artifact::BackupPages;
pub use registry::BackupRegistry;

use crate::database::Checkpointer;
use crate::error::{Error, Result};
use crate::snapshot::{RestorePoint, SnapshotLogger};
use crate::storage::{page_log, BranchFileSystem, BranchKey, ObjectStore, PageLog, PageStore};

/// A stored backup of one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub database_id: String,
    pub branch_id: String,
    pub restore_point: RestorePoint,
    pub page_size: u32,
    /// Artifact size in bytes
    pub size: u64,
    /// Object store key of the artifact
    pub key: String,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    pub fn object_key(branch: &BranchKey, timestamp: i64) -> String {
        format!(
            "backups/{}/{}/{}.backup",
            branch.database_id, branch.branch_id, timestamp
        )
    }

    pub fn branch_key(&self) -> Result<BranchKey> {
        BranchKey::new(&self.database_id, &self.branch_id)
    }
}

/// Takes, lists and removes backups
pub struct BackupEngine {
    page_store: Arc<PageStore>,
    object_store: Arc<dyn ObjectStore>,
    registry: BackupRegistry,
}

impl BackupEngine {
    pub fn new(
        page_store: Arc<PageStore>,
        object_store: Arc<dyn ObjectStore>,
        registry: BackupRegistry,
    ) -> Self {
        Self {
            page_store,
            object_store,
            registry,
        }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    /// Checkpoint the branch and store its pages as of the new restore point
    pub async fn run(
        &self,
        key: &BranchKey,
        snapshot_logger: &SnapshotLogger,
        files: &BranchFileSystem,
        checkpointer: &dyn Checkpointer,
    ) -> Result<Backup> {
        let checkpoint = checkpointer.checkpoint(key).await?;
        let restore_point = snapshot_logger
            .get_restore_point(checkpoint.timestamp)
            .await
            .ok_or(Error::RestorePointNotFound)?;

        let page_store = self.page_store.clone();
        let page_log_path = files.page_log_path();
        let (page_size, pages) = tokio::task::spawn_blocking(move || -> Result<(u32, Vec<u8>)> {
            let log = PageLog::open(&page_log_path)?;
            let versions = log.versions_at(restore_point.timestamp, restore_point.page_count)?;
            let mut pages = Vec::new();
            page_log::write_pages(&page_store, &versions, &mut pages)?;
            Ok((log.page_size()?, pages))
        })
        .await
        .map_err(|e| Error::Internal(format!("backup task failed: {}", e)))??;

        let data = BackupPages {
            restore_point,
            page_size,
            pages,
        }
        .encode()?;

        let backup = Backup {
            database_id: key.database_id.clone(),
            branch_id: key.branch_id.clone(),
            restore_point,
            page_size,
            size: data.len() as u64,
            key: Backup::object_key(key, restore_point.timestamp),
            created_at: Utc::now(),
        };

        self.object_store.put(&backup.key, data).await?;
        if let Err(e) = self.registry.insert(&backup).await {
            if let Err(cleanup) = self.object_store.delete(&backup.key).await {
                tracing::warn!("Could not remove unregistered backup {}: {}", backup.key, cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            "Backed up {} at {} ({} pages, {} bytes)",
            key,
            restore_point.timestamp,
            restore_point.page_count,
            backup.size
        );
        Ok(backup)
    }

    pub async fn get_backup(&self, key: &BranchKey, timestamp: i64) -> Result<Backup> {
        self.registry
            .get(key, timestamp)
            .await?
            .ok_or(Error::BackupNotFound)
    }

    pub async fn list(&self, key: &BranchKey) -> Result<Vec<Backup>> {
        self.registry.list(key).await
    }

    /// Remove the registry row and the stored artifact
    pub async fn delete(&self, key: &BranchKey, timestamp: i64) -> Result<()> {
        let backup = self.get_backup(key, timestamp).await?;
        if !self.registry.delete(key, timestamp).await? {
            return Err(Error::BackupNotFound);
        }
        if !self.object_store.delete(&backup.key).await? {
            tracing::warn!("Backup object {} was already gone", backup.key);
        }
        tracing::info!("Deleted backup {} at {}", key, timestamp);
        Ok(())
    }

    /// Fetch and verify the pages of a backup
    pub async fn load(&self, backup: &Backup) -> Result<BackupPages> {
        let data = self
            .object_store
            .get(&backup.key)
            .await?
            .ok_or(Error::BackupNotFound)?;
        let pages = BackupPages::decode(&data)?;
        if pages.restore_point != backup.restore_point {
            return Err(Error::BackupCorrupted(format!(
                "artifact {} holds restore point {}",
                backup.key, pages.restore_point.timestamp
            )));
        }
        Ok(pages)
    }
}
