//! Branch databases
//!
//! SQLite connections, SQL values and the manager that owns every branch on
//! this node.

pub mod connection;
mod manager;
pub mod value;

use async_trait::async_trait;

pub use connection::{Connection, SqliteConnection};
pub use manager::{BranchResources, DatabaseManager, OfflineGuard};
pub use value::{QueryResult, SqlValue};

use crate::error::Result;
use crate::messenger::QueryRequest;
use crate::snapshot::RestorePoint;
use crate::storage::BranchKey;

/// Runs statements against the branch named in the request
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute_query(&self, request: &QueryRequest) -> Result<QueryResult>;
}

/// Forces a checkpoint and records the resulting restore point
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self, key: &BranchKey) -> Result<RestorePoint>;
}
