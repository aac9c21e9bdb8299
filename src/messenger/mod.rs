//! Node Messenger
//!
//! Persistent, framed, bidirectional channels between nodes carried over
//! long-lived streamed HTTP requests.

pub mod codec;
pub mod connection;
pub mod message;
mod server;

pub use codec::{BufferPool, Decoded, MessageCodec};
pub use connection::{ConnectionSettings, PeerConnection, CONNECTION_PATH, PRIMARY_PATH};
pub use message::{
    ClusterEvent, MessageType, NodeMessage, QueryFailure, QueryFailureKind, QueryRequest,
    QueryResponse,
};
pub use server::MessageHandler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cluster::identity::NodeIdentity;
use crate::error::{Error, Result};

const POOL_CAPACITY: usize = 32;

/// Messenger owning every outbound connection of this node
pub struct NodeMessenger {
    settings: ConnectionSettings,
    /// Peer request timeout
    request_timeout: Duration,
    /// Control connections: address -> connection
    peers: RwLock<HashMap<String, Arc<PeerConnection>>>,
    /// Data path to the current primary
    primary: RwLock<Option<Arc<PeerConnection>>>,
    /// Inbound connections: address -> connected at (unix ms)
    inbound: RwLock<HashMap<String, i64>>,
    cancel: CancellationToken,
}

impl NodeMessenger {
    /// Create a messenger; its connections end when `cancel` fires
    pub fn new(
        local_id: impl Into<String>,
        identity: NodeIdentity,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings: ConnectionSettings {
                local_id: local_id.into(),
                identity,
                client: reqwest::Client::new(),
                pool: BufferPool::new(POOL_CAPACITY),
            },
            request_timeout,
            peers: RwLock::new(HashMap::new()),
            primary: RwLock::new(None),
            inbound: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Shared encode buffers
    pub fn pool(&self) -> Arc<BufferPool> {
        self.settings.pool.clone()
    }

    /// Get or open the control connection to `address`
    async fn connection(&self, address: &str) -> Arc<PeerConnection> {
        if let Some(conn) = self.peers.read().await.get(address) {
            if !conn.is_closed() {
                return conn.clone();
            }
        }

        let mut peers = self.peers.write().await;
        if let Some(conn) = peers.get(address) {
            if !conn.is_closed() {
                return conn.clone();
            }
        }

        tracing::debug!("Opening connection to {}", address);
        let conn = Arc::new(PeerConnection::open(
            address,
            CONNECTION_PATH,
            self.settings.clone(),
            self.cancel.child_token(),
        ));
        peers.insert(address.to_string(), conn.clone());
        conn
    }

    /// Send a message to a peer and wait for its answer
    pub async fn send(&self, address: &str, message: NodeMessage) -> Result<NodeMessage> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let conn = self.connection(address).await;
        match timeout(self.request_timeout, conn.request(message)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.forget(address, &conn).await;
                Err(e)
            }
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send a message to every address concurrently (best effort)
    pub async fn broadcast(
        &self,
        addresses: &[String],
        message: NodeMessage,
    ) -> Vec<(String, Result<NodeMessage>)> {
        let sends = addresses.iter().map(|address| {
            let message = message.clone();
            async move { (address.clone(), self.send(address, message).await) }
        });
        futures::future::join_all(sends).await
    }

    /// Run a query on the primary over the data-path connection
    pub async fn query_primary(&self, primary: &str, query: QueryRequest) -> Result<QueryResponse> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let conn = {
            let mut slot = self.primary.write().await;
            match slot.as_ref() {
                Some(conn) if conn.address() == primary && !conn.is_closed() => conn.clone(),
                _ => {
                    tracing::debug!("Opening primary connection to {}", primary);
                    let conn = Arc::new(PeerConnection::open(
                        primary,
                        PRIMARY_PATH,
                        self.settings.clone(),
                        self.cancel.child_token(),
                    ));
                    *slot = Some(conn.clone());
                    conn
                }
            }
        };

        let response = match timeout(self.request_timeout, conn.request(NodeMessage::Query(query))).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let mut slot = self.primary.write().await;
                if slot.as_ref().map(|c| Arc::ptr_eq(c, &conn)).unwrap_or(false) {
                    *slot = None;
                }
                return Err(e);
            }
            Err(_) => return Err(Error::ConnectionTimeout(primary.to_string())),
        };

        match response {
            NodeMessage::QueryResponse(response) => Ok(response),
            NodeMessage::Error { message } => Err(Error::Network(message)),
            other => Err(Error::Network(format!(
                "unexpected {} from primary {}",
                other.type_name(),
                primary
            ))),
        }
    }

    /// Drop a connection if it is still the one in the table
    async fn forget(&self, address: &str, conn: &Arc<PeerConnection>) {
        let mut peers = self.peers.write().await;
        if peers.get(address).map(|c| Arc::ptr_eq(c, conn)).unwrap_or(false) {
            peers.remove(address);
        }
    }

    /// Close connections to a node that left
    pub async fn disconnect(&self, address: &str) {
        self.peers.write().await.remove(address);
        let mut slot = self.primary.write().await;
        if slot.as_ref().map(|c| c.address() == address).unwrap_or(false) {
            *slot = None;
        }
    }

    pub(crate) async fn register_inbound(&self, address: &str) {
        self.inbound
            .write()
            .await
            .insert(address.to_string(), chrono::Utc::now().timestamp_millis());
    }

    pub(crate) async fn unregister_inbound(&self, address: &str) {
        self.inbound.write().await.remove(address);
    }

    /// Addresses with an open outbound control connection
    pub async fn outbound_connections(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let mut addresses: Vec<String> = peers
            .iter()
            .filter(|(_, c)| !c.is_closed())
            .map(|(a, _)| a.clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Addresses currently connected to us
    pub async fn inbound_connections(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.inbound.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.peers.write().await.clear();
        *self.primary.write().await = None;
    }
}
