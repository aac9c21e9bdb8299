//! Restore Engine
//!
//! Rebuilds a branch database from the page versions of a restore point,
//! possibly taken from another branch or database, or from a backup. The
//! new file is staged next to the target and renamed into place.

mod runner;

use futures::FutureExt;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use runner::{DeadlineRunner, ExclusiveRunner, RestoreRunner};

use crate::backup::BackupPages;
use crate::database::Checkpointer;
use crate::error::{Error, Result};
use crate::snapshot::{RestorePoint, SnapshotLogger};
use crate::storage::{page_log, BranchFileSystem, BranchKey, PageLog, PageStore, PageVersion};

/// Where the restored pages come from
enum Pages {
    Versions(Vec<PageVersion>),
    Raw(Vec<u8>),
}

/// Restores branches from restore points and backups
pub struct RestoreEngine {
    page_store: Arc<PageStore>,
}

impl RestoreEngine {
    pub fn new(page_store: Arc<PageStore>) -> Self {
        Self { page_store }
    }

    /// Replace `target` with the state `source` had at `timestamp`
    #[allow(clippy::too_many_arguments)]
    pub async fn restore_from_timestamp(
        &self,
        source: &BranchKey,
        target: &BranchKey,
        timestamp: i64,
        snapshot_logger: &SnapshotLogger,
        source_fs: &BranchFileSystem,
        target_fs: &BranchFileSystem,
        checkpointer: &dyn Checkpointer,
        runner: &dyn RestoreRunner,
    ) -> Result<RestorePoint> {
        if !target_fs.exists() {
            return Err(Error::BranchNotFound(target.to_string()));
        }

        let restore_point = snapshot_logger
            .get_restore_point(timestamp)
            .await
            .ok_or(Error::RestorePointNotFound)?;

        let page_log_path = source_fs.page_log_path();
        let versions = tokio::task::spawn_blocking(move || {
            PageLog::open(&page_log_path)?
                .versions_at(restore_point.timestamp, restore_point.page_count)
        })
        .await
        .map_err(|e| Error::Internal(format!("restore task failed: {}", e)))??;

        tracing::info!(
            "Restoring {} from {} as of {} ({} pages)",
            target,
            source,
            timestamp,
            restore_point.page_count
        );

        self.replace(target, target_fs, Pages::Versions(versions), checkpointer, runner)
            .await
    }

    /// Replace `target` with the pages held in a backup
    pub async fn restore_from_backup(
        &self,
        backup: BackupPages,
        target: &BranchKey,
        target_fs: &BranchFileSystem,
        checkpointer: &dyn Checkpointer,
        runner: &dyn RestoreRunner,
    ) -> Result<RestorePoint> {
        if !target_fs.exists() {
            return Err(Error::BranchNotFound(target.to_string()));
        }

        tracing::info!(
            "Restoring {} from backup at {}",
            target,
            backup.restore_point.timestamp
        );
        self.replace(target, target_fs, Pages::Raw(backup.pages), checkpointer, runner)
            .await
    }

    async fn replace(
        &self,
        target: &BranchKey,
        target_fs: &BranchFileSystem,
        pages: Pages,
        checkpointer: &dyn Checkpointer,
        runner: &dyn RestoreRunner,
    ) -> Result<RestorePoint> {
        let runs = Arc::new(AtomicUsize::new(0));
        let work = {
            let runs = runs.clone();
            let page_store = self.page_store.clone();
            let files = target_fs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::task::spawn_blocking(move || swap_database(&page_store, &files, pages))
                    .await
                    .map_err(|e| Error::Internal(format!("restore task failed: {}", e)))?
            }
            .boxed()
        };

        runner.run(work).await?;
        match runs.load(Ordering::SeqCst) {
            1 => {}
            n => {
                return Err(Error::Internal(format!(
                    "restore work ran {} times instead of once",
                    n
                )))
            }
        }

        checkpointer.checkpoint(target).await
    }
}

fn swap_database(page_store: &PageStore, files: &BranchFileSystem, pages: Pages) -> Result<()> {
    let staging = files.staging_path();
    {
        let mut out = BufWriter::new(std::fs::File::create(&staging)?);
        match &pages {
            Pages::Versions(versions) => {
                page_log::write_pages(page_store, versions, &mut out)?;
            }
            Pages::Raw(data) => out.write_all(data)?,
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }

    for sidecar in files.sidecar_paths() {
        match std::fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    std::fs::rename(&staging, files.database_path())?;
    Ok(())
}
