//! Storage
//!
//! On-disk layout of database branches plus the tiered page storage that
//! versions every branch at page granularity:
//!
//! ```text
//! <data_dir>/
//!   databases/<database>/<branch>/database.db
//!   databases/<database>/<branch>/pages.db           page version index
//!   databases/<database>/<branch>/restore_points.log
//!   pages/<2 hex>/<62 hex>                            page blobs
//!   objects/backups/<database>/<branch>/<ts>.backup
//!   system.db
//! ```

pub mod object_store;
pub mod page_log;
pub mod page_store;

pub use object_store::{LocalObjectStore, ObjectStore};
pub use page_log::{PageLog, PageVersion};
pub use page_store::PageStore;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 64;

/// Identifies a database branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchKey {
    pub database_id: String,
    pub branch_id: String,
}

impl BranchKey {
    /// Build a key, rejecting identifiers that are unsafe as path segments
    pub fn new(database_id: impl Into<String>, branch_id: impl Into<String>) -> Result<Self> {
        let key = Self {
            database_id: database_id.into(),
            branch_id: branch_id.into(),
        };
        validate_id("database_id", &key.database_id)?;
        validate_id("branch_id", &key.branch_id)?;
        Ok(key)
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database_id, self.branch_id)
    }
}

fn validate_id(field: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(Error::validation(
            field,
            format!("must be between 1 and {} characters", MAX_ID_LEN),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(
            field,
            "may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Files belonging to one branch
#[derive(Debug, Clone)]
pub struct BranchFileSystem {
    key: BranchKey,
    root: PathBuf,
}

impl BranchFileSystem {
    pub fn new(databases_dir: &Path, key: BranchKey) -> Self {
        let root = databases_dir.join(&key.database_id).join(&key.branch_id);
        Self { key, root }
    }

    pub fn key(&self) -> &BranchKey {
        &self.key
    }

    /// Branch directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Live SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.root.join("database.db")
    }

    /// Page version index
    pub fn page_log_path(&self) -> PathBuf {
        self.root.join("pages.db")
    }

    /// Restore point log
    pub fn restore_log_path(&self) -> PathBuf {
        self.root.join("restore_points.log")
    }

    /// Staging file used while replacing the database
    pub fn staging_path(&self) -> PathBuf {
        self.root.join("database.db.restore")
    }

    /// SQLite sidecar files that must go when the database is replaced
    pub fn sidecar_paths(&self) -> [PathBuf; 2] {
        [
            self.root.join("database.db-wal"),
            self.root.join("database.db-shm"),
        ]
    }

    /// True once the branch has been created
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the branch directory
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
