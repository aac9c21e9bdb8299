//! Restore runners
//!
//! A runner decides under which conditions the file mutation of a restore
//! happens: under a deadline, or with the target branch held offline.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use crate::database::DatabaseManager;
use crate::error::{Error, Result};
use crate::storage::BranchKey;

#[async_trait]
pub trait RestoreRunner: Send + Sync {
    /// Drive `work` to completion exactly once
    async fn run(&self, work: BoxFuture<'static, Result<()>>) -> Result<()>;
}

/// Fails with `Timeout` when the work outlives the deadline
pub struct DeadlineRunner {
    pub deadline: Duration,
}

#[async_trait]
impl RestoreRunner for DeadlineRunner {
    async fn run(&self, work: BoxFuture<'static, Result<()>>) -> Result<()> {
        tokio::time::timeout(self.deadline, work)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// Takes the target branch offline for the duration of the work
///
/// The work runs on its own task which owns the offline guard, so the branch
/// stays offline until the file swap has finished even when the deadline
/// fires or the caller goes away.
pub struct ExclusiveRunner {
    manager: Arc<DatabaseManager>,
    target: BranchKey,
    deadline: Duration,
}

impl ExclusiveRunner {
    pub fn new(manager: Arc<DatabaseManager>, target: BranchKey, deadline: Duration) -> Self {
        Self {
            manager,
            target,
            deadline,
        }
    }
}

#[async_trait]
impl RestoreRunner for ExclusiveRunner {
    async fn run(&self, work: BoxFuture<'static, Result<()>>) -> Result<()> {
        let offline = self.manager.take_offline(&self.target).await?;
        let task = tokio::spawn(async move {
            let result = work.await;
            drop(offline);
            result
        });

        match tokio::time::timeout(self.deadline, task).await {
            Ok(joined) => {
                joined.map_err(|e| Error::Internal(format!("restore task failed: {}", e)))?
            }
            Err(_) => {
                tracing::warn!(
                    "Restore of {} outlived {:?}; branch stays offline until it finishes",
                    self.target,
                    self.deadline
                );
                Err(Error::Timeout)
            }
        }
    }
}
