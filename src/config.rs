//! Litebase Configuration
//!
//! This module provides configuration structures for a Litebase node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Litebase configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LitebaseConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Snapshot/restore point configuration
    #[serde(default)]
    pub snapshots: SnapshotConfig,

    /// Request authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (generated when empty)
    #[serde(default)]
    pub id: String,

    /// Address to bind the HTTP server to
    pub bind_address: String,

    /// Data directory for databases, page store and registry
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Shared key used to encrypt node identity headers
    pub shared_key: String,

    /// List of peer node addresses
    #[serde(default)]
    pub peers: Vec<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Time without a primary heartbeat before an election, in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Election broadcast window in milliseconds
    #[serde(default = "default_election_window_ms")]
    pub election_window_ms: u64,

    /// Attempts with a fresh seed when nobody answers
    #[serde(default = "default_election_attempts")]
    pub election_attempts: u32,

    /// Maximum random delay before starting an election, in milliseconds
    #[serde(default = "default_election_jitter_ms")]
    pub election_jitter_ms: u64,

    /// Peer message timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Allowed values of the Host header (empty = any)
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Route deadline in milliseconds for non-streaming routes
    #[serde(default = "default_route_timeout_ms")]
    pub route_timeout_ms: u64,

    /// Timeout for buffered requests forwarded to the primary, in milliseconds
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for durable objects (backups); defaults to `<data_dir>/objects`
    #[serde(default)]
    pub object_dir: Option<PathBuf>,

    /// Compress page blobs with LZ4
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Start a new snapshot after this many seconds
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
}

/// Request authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Bearer tokens; no tokens disables authentication
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// A bearer token and the actions it may perform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    /// Allowed actions, e.g. "backup:create"; "*" allows everything
    #[serde(default = "default_actions")]
    pub actions: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_heartbeat_timeout_ms() -> u64 {
    2000
}

fn default_election_window_ms() -> u64 {
    3000
}

fn default_election_attempts() -> u32 {
    3
}

fn default_election_jitter_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_route_timeout_ms() -> u64 {
    30_000
}

fn default_forward_timeout_ms() -> u64 {
    30_000
}

fn default_compaction_interval_secs() -> u64 {
    86_400
}

fn default_true() -> bool {
    true
}

fn default_actions() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/litebase")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            route_timeout_ms: default_route_timeout_ms(),
            forward_timeout_ms: default_forward_timeout_ms(),
            cors_enabled: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            object_dir: None,
            compression: true,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            compaction_interval_secs: default_compaction_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterConfig {
    /// Cluster settings for a standalone node
    pub fn standalone(shared_key: impl Into<String>) -> Self {
        Self {
            shared_key: shared_key.into(),
            peers: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            election_window_ms: default_election_window_ms(),
            election_attempts: default_election_attempts(),
            election_jitter_ms: default_election_jitter_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl LitebaseConfig {
    /// Configuration for a single node rooted at `data_dir`
    pub fn standalone(bind_address: &str, data_dir: PathBuf) -> Self {
        Self {
            node: NodeConfig {
                id: uuid::Uuid::new_v4().to_string(),
                bind_address: bind_address.to_string(),
                data_dir,
                advertise_address: None,
            },
            cluster: ClusterConfig::standalone("litebase-development-key"),
            api: ApiConfig::default(),
            storage: StorageConfig::default(),
            snapshots: SnapshotConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let mut config: LitebaseConfig = toml::from_str(content)?;
        if config.node.id.is_empty() {
            config.node.id = uuid::Uuid::new_v4().to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.shared_key.len() < 16 {
            return Err(crate::Error::Config(
                "cluster.shared_key must be at least 16 characters".into(),
            ));
        }

        if self.cluster.heartbeat_timeout_ms <= self.cluster.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "cluster.heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }

        if self.cluster.election_attempts == 0 {
            return Err(crate::Error::Config("cluster.election_attempts must be at least 1".into()));
        }

        if self.snapshots.compaction_interval_secs == 0 {
            return Err(crate::Error::Config(
                "snapshots.compaction_interval_secs must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Directory holding one subdirectory per database branch
    pub fn databases_dir(&self) -> PathBuf {
        self.node.data_dir.join("databases")
    }

    /// Directory holding content-addressed page blobs
    pub fn pages_dir(&self) -> PathBuf {
        self.node.data_dir.join("pages")
    }

    /// Directory holding durable objects
    pub fn object_dir(&self) -> PathBuf {
        self.storage
            .object_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("objects"))
    }

    /// Path of the system registry database
    pub fn system_db_path(&self) -> PathBuf {
        self.node.data_dir.join("system.db")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get heartbeat timeout as Duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_timeout_ms)
    }

    /// Get election window as Duration
    pub fn election_window(&self) -> Duration {
        Duration::from_millis(self.cluster.election_window_ms)
    }

    /// Get peer request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    /// Get route deadline as Duration
    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.api.route_timeout_ms)
    }

    /// Deadline for the file swap of an HTTP restore
    ///
    /// Ends a quarter ahead of the route deadline so the restore reports its
    /// own timeout and the target checkpoint still fits.
    pub fn restore_timeout(&self) -> Duration {
        let route = self.route_timeout();
        route - route / 4
    }

    /// Get forwarding timeout as Duration
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.api.forward_timeout_ms)
    }

    /// Snapshot compaction interval in milliseconds
    pub fn compaction_interval_ms(&self) -> i64 {
        (self.snapshots.compaction_interval_secs as i64).saturating_mul(1000)
    }
}
