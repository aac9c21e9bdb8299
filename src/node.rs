//! Node bootstrap
//!
//! Wires storage, databases, the cluster and the HTTP API together in the
//! order they depend on each other, and tears them down in reverse.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiServer, AppState};
use crate::backup::{BackupEngine, BackupRegistry};
use crate::cluster::Cluster;
use crate::config::LitebaseConfig;
use crate::database::{DatabaseManager, QueryExecutor};
use crate::error::{Error, Result};
use crate::restore::RestoreEngine;
use crate::storage::{LocalObjectStore, ObjectStore, PageStore};

/// A running node
pub struct LitebaseNode {
    state: Arc<AppState>,
    shutdown: CancellationToken,
    server: JoinHandle<Result<()>>,
}

impl LitebaseNode {
    /// Build every component without starting anything
    pub fn build(config: LitebaseConfig) -> Result<Arc<AppState>> {
        config.validate()?;
        std::fs::create_dir_all(config.data_dir())?;

        let page_store = Arc::new(PageStore::new(config.pages_dir(), config.storage.compression)?);
        let databases = Arc::new(DatabaseManager::new(&config, page_store.clone())?);
        let object_store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.object_dir())?);
        let registry = BackupRegistry::open(&config.system_db_path())?;
        let backups = Arc::new(BackupEngine::new(page_store.clone(), object_store, registry));
        let restores = Arc::new(RestoreEngine::new(page_store));

        let executor: Arc<dyn QueryExecutor> = databases.clone();
        let cluster = Cluster::new(config, Some(executor));

        Ok(AppState::new(cluster, databases, backups, restores))
    }

    /// Serve the API on `listener`, then join the cluster.
    ///
    /// When the configured bind port is 0 and no advertise address is set,
    /// the node advertises the address it actually bound.
    pub async fn start(mut config: LitebaseConfig, listener: TcpListener) -> Result<Self> {
        if config.node.advertise_address.is_none() && config.node.bind_address.ends_with(":0") {
            config.node.advertise_address = Some(listener.local_addr()?.to_string());
        }

        let state = Self::build(config)?;
        let shutdown = CancellationToken::new();

        let server = {
            let api = ApiServer::new(state.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { api.serve(listener, shutdown).await })
        };

        if let Err(e) = state.cluster.start().await {
            shutdown.cancel();
            return Err(e);
        }

        tracing::info!(
            "Node {} ready at {}",
            state.cluster.node_id(),
            state.cluster.address()
        );
        Ok(Self {
            state,
            shutdown,
            server,
        })
    }

    /// Bind `node.bind_address` and start
    pub async fn bind(config: LitebaseConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.node.bind_address).await?;
        Self::start(config, listener).await
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.state.cluster
    }

    pub fn databases(&self) -> &Arc<DatabaseManager> {
        &self.state.databases
    }

    pub fn address(&self) -> &str {
        self.state.cluster.address()
    }

    /// Leave the cluster and stop serving
    pub async fn shutdown(self) -> Result<()> {
        let result = self.state.cluster.shutdown().await;
        self.shutdown.cancel();
        match self.server.await {
            Ok(served) => served?,
            Err(e) => return Err(Error::Internal(format!("API task failed: {}", e))),
        }
        result
    }
}
