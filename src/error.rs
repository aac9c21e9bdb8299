//! Litebase Error Types

use thiserror::Error;

/// Result type alias for Litebase operations
pub type Result<T> = std::result::Result<T, Error>;

/// Litebase error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Request errors
    #[error("{0}")]
    BadRequest(String),

    #[error("{field} {message}")]
    Validation { field: String, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unsupported media type: expected {0}")]
    UnsupportedMediaType(&'static str),

    // Not found family
    #[error("backup not found")]
    BackupNotFound,

    #[error("snapshot not found")]
    SnapshotNotFound,

    #[error("restore point not found")]
    RestorePointNotFound,

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    // Cluster errors
    #[error("no primary available")]
    NoPrimary,

    #[error("not primary: current primary is {0}")]
    NotPrimary(String),

    // Messaging errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Page {page} missing from page store at {timestamp}")]
    PageMissing { page: u64, timestamp: i64 },

    #[error("restore point {timestamp} is not after {last}")]
    RestorePointOutOfOrder { timestamp: i64, last: i64 },

    #[error("Checkpoint failed: {0}")]
    Checkpoint(String),

    #[error("Backup artifact corrupted: {0}")]
    BackupCorrupted(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Validation failure on a single field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BackupNotFound
                | Error::SnapshotNotFound
                | Error::RestorePointNotFound
                | Error::BranchNotFound(_)
                | Error::NodeNotFound(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(format!("SQLite error: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(format!("invalid JSON: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_family() {
        assert!(Error::BackupNotFound.is_not_found());
        assert!(Error::RestorePointNotFound.is_not_found());
        assert!(!Error::NoPrimary.is_not_found());
        assert_eq!(Error::BackupNotFound.to_string(), "backup not found");
    }

    #[test]
    fn test_validation_display() {
        let e = Error::validation("timestamp", "must be a positive integer");
        assert_eq!(e.to_string(), "timestamp must be a positive integer");
    }
}
