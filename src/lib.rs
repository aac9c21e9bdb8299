//! Litebase - Clustered SQLite with point-in-time restore
//!
//! One node of a cluster is elected primary and executes every write; the
//! others forward writes to it. Each write is checkpointed into a versioned
//! page store, so any branch can be backed up or restored to any recorded
//! restore point.
//!
//! # Architecture
//!
//! - `cluster`: membership, node identity and primary election
//! - `messenger`: persistent framed channels between nodes
//! - `database`: branch connections and checkpoints
//! - `storage`: page store, page version index and object store
//! - `snapshot`: per-branch restore point log
//! - `backup` / `restore`: page-consistent backups and restores
//! - `api`: HTTP routes, middleware and the forwarding gateway

pub mod api;
pub mod backup;
pub mod cluster;
pub mod config;
pub mod database;
pub mod error;
pub mod messenger;
pub mod node;
pub mod restore;
pub mod snapshot;
pub mod storage;

pub use config::LitebaseConfig;
pub use error::{Error, Result};
pub use node::LitebaseNode;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{Cluster, ElectionCoordinator, Membership, NodeRole};
    pub use crate::config::LitebaseConfig;
    pub use crate::database::{DatabaseManager, QueryResult, SqlValue};
    pub use crate::error::{Error, Result};
    pub use crate::node::LitebaseNode;
    pub use crate::snapshot::{RestorePoint, Snapshot, SnapshotLogger};
    pub use crate::storage::BranchKey;
}
